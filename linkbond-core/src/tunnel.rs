// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-tunnel state: addressing, handshake status, sequence tracking,
//! send queues and the retransmit cache.

use crate::{
    packet::Packet,
    recovery::{RttEstimator, SeqWindow},
    retransmit::{RetransmitCache, PKTBUFSIZE},
    time::Timestamp,
};
use core::time::Duration;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// How frequently tunnels are checked
pub const IO_TIMEOUT: Duration = Duration::from_millis(250);

/// Maximum reconnect backoff
pub const IO_TIMEOUT_MAXIMUM: Duration = Duration::from_secs(60);

/// Backoff multiplier applied after every failed connection attempt
pub const IO_TIMEOUT_INCREMENT: u32 = 2;

/// Handshake status of a tunnel.
///
/// The ordering matters: anything at `AuthOk` or beyond may carry data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    #[default]
    Disconnected,
    AuthSent,
    AuthOk,
    Lossy,
}

impl State {
    /// The tunnel is authenticated and may carry data, possibly degraded
    #[inline]
    pub fn is_up(self) -> bool {
        self >= State::AuthOk
    }

    /// The tunnel is authenticated and healthy
    #[inline]
    pub fn is_auth_ok(self) -> bool {
        self == State::AuthOk
    }
}

/// Static parameters of one configured path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfig {
    pub name: String,
    pub server_mode: bool,
    pub bind_addr: Option<String>,
    pub bind_port: Option<u16>,
    pub bind_dev: Option<String>,
    pub bind_fib: u32,
    pub dest_addr: Option<String>,
    pub dest_port: Option<u16>,
    /// Configured link capacity in kbit/s; 0 enables automatic adjustment
    pub bandwidth_max: u64,
    /// Loss percentage at which the link is declared lossy
    pub loss_tolerence: u32,
    /// Bytes per second this link may consume; 0 = unlimited
    pub quota: u64,
    /// Initial tolerated reordering depth
    pub reorder_length: u32,
    /// Keepalive timeout in seconds
    pub timeout: u32,
    pub fallback_only: bool,
}

impl TunnelConfig {
    /// Tunnel id shared with the peer: the configured port number
    pub fn id(&self) -> i32 {
        let port = if self.server_mode {
            self.bind_port
        } else {
            self.dest_port
        };
        port.unwrap_or(0) as i32
    }
}

pub struct Tunnel {
    pub(crate) config: TunnelConfig,
    pub(crate) id: i32,
    pub(crate) state: State,
    /// Learned or resolved peer address
    pub(crate) peer: Option<SocketAddr>,
    /// Set by the driver while a socket is open for this tunnel
    pub(crate) socket_ready: bool,

    pub(crate) flow_id: u32,
    /// Next outbound tun sequence
    pub(crate) tun_seq: u64,
    pub(crate) window: SeqWindow,
    pub(crate) rtt: RttEstimator,
    pub(crate) cache: RetransmitCache,

    /// Timestamp received from the peer, echoed back once
    pub(crate) saved_timestamp: Option<u16>,
    pub(crate) saved_timestamp_received_at: u64,

    /// Loss the peer reports seeing on this tunnel, percent
    pub(crate) sent_loss: f64,
    /// Loss we observed on this tunnel over the last window, percent
    pub(crate) loss_av: f64,

    /// Scheduler share and its round-robin accumulator
    pub(crate) weight: f64,
    pub(crate) wrr_credit: f64,

    /// All bandwidth figures in kbit/s
    pub(crate) bandwidth_max: f64,
    pub(crate) bandwidth: f64,
    pub(crate) bandwidth_measured: f64,
    /// Peer-reported measured bandwidth
    pub(crate) bandwidth_out: f64,
    /// Payload bytes received in the current measuring window
    pub(crate) bm_data: u64,

    /// Remaining quota allowance in bytes
    pub(crate) permitted: i64,

    pub(crate) sbuf: std::collections::VecDeque<Packet>,
    pub(crate) hpsbuf: std::collections::VecDeque<Packet>,

    pub(crate) last_activity: Timestamp,
    pub(crate) last_keepalive_ack: Timestamp,
    pub(crate) last_keepalive_ack_sent: Timestamp,
    pub(crate) next_keepalive: Timestamp,

    pub(crate) sent_packets: u64,
    pub(crate) sent_bytes: u64,
    pub(crate) recv_packets: u64,
    pub(crate) recv_bytes: u64,
    pub(crate) disconnects: u32,
    pub(crate) conn_attempts: u32,
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        let mut bandwidth_max = config.bandwidth_max as f64;
        if bandwidth_max == 0.0 {
            debug!(tunnel = %config.name, "enabling automatic bandwidth adjustment");
            // faster lines will grow from here, slower ones will drop
            bandwidth_max = 10_000.0;
        }
        let id = config.id();
        let window = SeqWindow::new(config.reorder_length);
        Self {
            id,
            state: State::Disconnected,
            peer: None,
            socket_ready: false,
            flow_id: rand::random(),
            tun_seq: 0,
            window,
            rtt: RttEstimator::default(),
            cache: RetransmitCache::default(),
            saved_timestamp: None,
            saved_timestamp_received_at: 0,
            sent_loss: 0.0,
            loss_av: 0.0,
            weight: 1.0,
            wrr_credit: 0.0,
            bandwidth_max,
            bandwidth: bandwidth_max,
            bandwidth_measured: 0.0,
            bandwidth_out: 0.0,
            bm_data: 0,
            permitted: 0,
            sbuf: Default::default(),
            hpsbuf: Default::default(),
            last_activity: Timestamp::default(),
            last_keepalive_ack: Timestamp::default(),
            last_keepalive_ack_sent: Timestamp::default(),
            next_keepalive: Timestamp::default(),
            sent_packets: 0,
            sent_bytes: 0,
            recv_packets: 0,
            recv_bytes: 0,
            disconnects: 0,
            conn_attempts: 0,
            config,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    #[inline]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the driver currently has a socket open for this tunnel
    #[inline]
    pub fn socket_ready(&self) -> bool {
        self.socket_ready
    }

    #[inline]
    pub fn is_fallback_only(&self) -> bool {
        self.config.fallback_only
    }

    #[inline]
    pub fn weight(&self) -> f64 {
        self.weight
    }

    #[inline]
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Loss we observed on this tunnel over the last window, percent
    #[inline]
    pub fn loss_av(&self) -> f64 {
        self.loss_av
    }

    /// Loss the peer reports seeing on this tunnel, percent
    #[inline]
    pub fn sent_loss(&self) -> f64 {
        self.sent_loss
    }

    #[inline]
    pub fn sent_packets(&self) -> u64 {
        self.sent_packets
    }

    /// Peer-reported measured bandwidth, kbit/s
    #[inline]
    pub fn bandwidth_out(&self) -> f64 {
        self.bandwidth_out
    }

    #[inline]
    pub fn permitted(&self) -> i64 {
        self.permitted
    }

    pub fn set_permitted(&mut self, permitted: i64) {
        self.permitted = permitted;
    }

    /// Frames waiting to go out on this tunnel
    #[inline]
    pub fn has_transmit(&self) -> bool {
        !self.hpsbuf.is_empty() || !self.sbuf.is_empty()
    }

    pub(crate) fn touch(&mut self, now: Timestamp) {
        self.last_activity = now;
    }

    pub(crate) fn push_sbuf(&mut self, packet: Packet) {
        if self.sbuf.len() >= PKTBUFSIZE {
            warn!(tunnel = %self.config.name, "send buffer: overflow");
            self.sbuf.pop_front();
        }
        self.sbuf.push_back(packet);
    }

    pub(crate) fn push_hpsbuf(&mut self, packet: Packet) {
        if self.hpsbuf.len() >= PKTBUFSIZE {
            warn!(tunnel = %self.config.name, "high priority buffer: overflow");
            self.hpsbuf.pop_front();
        }
        self.hpsbuf.push_back(packet);
    }

    /// Charges `wire_len` bytes against the quota allowance. The constant
    /// covers UDP-over-Ethernet overhead.
    pub(crate) fn charge_quota(&mut self, wire_len: usize) {
        if self.config.quota == 0 {
            return;
        }
        let cost = wire_len as i64 + 46;
        self.permitted = if self.permitted > cost {
            self.permitted - cost
        } else {
            0
        };
    }

    /// Whether the scheduler may still place traffic on this tunnel
    pub(crate) fn quota_ok(&self) -> bool {
        self.config.quota == 0
            || self.permitted as f64 > self.bandwidth_max * 125.0 * crate::bandwidth::AVTIME_SECS
    }

    /// Entering AuthOK: restart the per-link averages and windows
    pub(crate) fn mark_up(&mut self, now: Timestamp) {
        self.state = State::AuthOk;
        self.next_keepalive = now + IO_TIMEOUT;
        self.last_activity = now;
        self.last_keepalive_ack = now;
        self.last_keepalive_ack_sent = now;
        self.rtt.reset_up();
        self.loss_av = 0.0;
        self.bm_data = 0;
    }

    /// Entering Disconnected: drop per-link state that is no longer valid
    pub(crate) fn mark_down(&mut self) {
        self.state = State::Disconnected;
        self.disconnects += 1;
        self.socket_ready = false;
        self.rtt.reset_down();
        self.loss_av = 100.0;
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketKind;

    fn config() -> TunnelConfig {
        TunnelConfig {
            name: "adsl1".into(),
            server_mode: false,
            bind_addr: None,
            bind_port: None,
            bind_dev: None,
            bind_fib: 0,
            dest_addr: Some("198.51.100.7".into()),
            dest_port: Some(5080),
            bandwidth_max: 10_000,
            loss_tolerence: 50,
            quota: 0,
            reorder_length: 1,
            timeout: 60,
            fallback_only: false,
        }
    }

    fn control(now: Timestamp) -> Packet {
        Packet::control(PacketKind::Keepalive, vec![], now)
    }

    #[test]
    fn id_follows_the_configured_port() {
        let client = Tunnel::new(config());
        assert_eq!(client.id(), 5080);

        let mut server_config = config();
        server_config.server_mode = true;
        server_config.bind_port = Some(5081);
        let server = Tunnel::new(server_config);
        assert_eq!(server.id(), 5081);
    }

    #[test]
    fn state_ordering() {
        assert!(State::AuthOk.is_up());
        assert!(State::Lossy.is_up());
        assert!(!State::AuthSent.is_up());
        assert!(!State::Disconnected.is_up());
        assert!(State::AuthOk.is_auth_ok());
        assert!(!State::Lossy.is_auth_ok());
    }

    #[test]
    fn zero_bandwidth_enables_auto_adjustment() {
        let mut cfg = config();
        cfg.bandwidth_max = 0;
        let tunnel = Tunnel::new(cfg);
        assert_eq!(tunnel.bandwidth_max, 10_000.0);
        assert_eq!(tunnel.bandwidth, 10_000.0);
    }

    #[test]
    fn quota_charging_floors_at_zero() {
        let mut cfg = config();
        cfg.quota = 1_000;
        let mut tunnel = Tunnel::new(cfg);
        tunnel.permitted = 100;
        tunnel.charge_quota(40); // 40 + 46 = 86
        assert_eq!(tunnel.permitted, 14);
        tunnel.charge_quota(40);
        assert_eq!(tunnel.permitted, 0);
        assert!(tunnel.permitted >= 0);
    }

    #[test]
    fn unlimited_quota_is_never_charged() {
        let mut tunnel = Tunnel::new(config());
        tunnel.permitted = 0;
        tunnel.charge_quota(1000);
        assert_eq!(tunnel.permitted, 0);
        assert!(tunnel.quota_ok());
    }

    #[test]
    fn quota_exhaustion_threshold() {
        let mut cfg = config();
        cfg.quota = 1_000;
        cfg.bandwidth_max = 8;
        let mut tunnel = Tunnel::new(cfg);
        // threshold = bandwidth_max * 125 * 3 = 3000 bytes
        tunnel.permitted = 3_001;
        assert!(tunnel.quota_ok());
        tunnel.permitted = 3_000;
        assert!(!tunnel.quota_ok());
    }

    #[test]
    fn queue_overflow_drops_the_oldest() {
        let mut tunnel = Tunnel::new(config());
        let now = Timestamp::default();
        for _ in 0..PKTBUFSIZE {
            tunnel.push_hpsbuf(control(now));
        }
        assert_eq!(tunnel.hpsbuf.len(), PKTBUFSIZE);
        tunnel.push_hpsbuf(control(now));
        assert_eq!(tunnel.hpsbuf.len(), PKTBUFSIZE);
    }

    #[test]
    fn up_down_cycle_resets_link_state() {
        let mut tunnel = Tunnel::new(config());
        let now = Timestamp::from_duration(Duration::from_secs(5));

        tunnel.mark_up(now);
        assert_eq!(tunnel.state(), State::AuthOk);
        assert_eq!(tunnel.next_keepalive, now + IO_TIMEOUT);
        assert_eq!(tunnel.loss_av, 0.0);

        tunnel.cache.insert(
            0,
            Packet {
                kind: PacketKind::Data,
                reorder: true,
                stream_seq: 1,
                timestamp: now,
                data: vec![1],
            },
        );
        tunnel.mark_down();
        assert_eq!(tunnel.state(), State::Disconnected);
        assert_eq!(tunnel.disconnects, 1);
        assert_eq!(tunnel.loss_av, 100.0);
        assert!(tunnel.cache.get(0).is_none());
        assert!(!tunnel.socket_ready);
    }
}
