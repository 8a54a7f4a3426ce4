// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The datapath core.
//!
//! [`Core`] owns the tunnel list, the global stream sequence, the reorder
//! buffer and the fallback state, and implements every protocol reaction:
//! handshake, keepalive, loss bookkeeping, selective repeat and the
//! egress/ingress paths. It performs no I/O itself; the driver feeds it
//! datagrams, tun packets and timer ticks, and collects frames, delivered
//! packets and [`Event`]s back out of it.

use crate::{
    bandwidth::{self, GlobalBandwidth},
    crypto::Key,
    packet::{
        self,
        resend::ResendRequest,
        wire::{self, Header, TIMESTAMP_NONE},
        Packet, PacketKind, MAX_PAYLOAD,
    },
    recovery::{pack_loss, unpack_loss},
    reorder::ReorderBuffer,
    retransmit::PKTBUFSIZE,
    scheduler,
    time::{wire16_diff, Timestamp},
    tunnel::{State, Tunnel, TunnelConfig, IO_TIMEOUT},
};
use core::time::Duration;
use std::{collections::VecDeque, net::SocketAddr};
use tracing::{debug, info, warn};

/// Reactions the driver must carry out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The tunnel authenticated; run the per-link up script
    LinkUp { tunnel: usize },
    /// The tunnel disconnected; close its socket and run the down script
    LinkDown { tunnel: usize },
    /// The first link is up; bring up the tun interface
    InterfaceUp,
    /// The last link went down; tear the tun interface down
    InterfaceDown,
    /// (Re)create the tunnel's socket and resolve its peer
    Reconnect { tunnel: usize },
}

#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Pre-shared secret protecting every frame
    pub secret: String,
    /// Skip sealing of DATA payloads (control traffic stays protected)
    pub cleartext_data: bool,
    /// Restore TCP ordering across tunnels
    pub reorder: bool,
}

pub struct Core {
    key: Key,
    cleartext_data: bool,
    tunnels: Vec<Tunnel>,
    /// Global stream sequence; advanced only for ordered packets
    data_seq: u64,
    /// Resend requests currently outstanding, in packets
    out_resends: u64,
    reorder: ReorderBuffer,
    global: GlobalBandwidth,
    fallback_mode: bool,
    /// Tunnels currently at AuthOK or better
    connected: usize,
    /// The tun interface scripts have run
    initialized: bool,
    /// Packets ready to be written to the tun device
    tun_out: VecDeque<Packet>,
    events: VecDeque<Event>,
}

impl Core {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            key: Key::new(config.secret.as_bytes()),
            cleartext_data: config.cleartext_data,
            tunnels: Vec::new(),
            data_seq: 0,
            out_resends: 0,
            reorder: ReorderBuffer::new(config.reorder),
            global: GlobalBandwidth::default(),
            fallback_mode: false,
            connected: 0,
            initialized: false,
            tun_out: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn add_tunnel(&mut self, config: TunnelConfig) -> usize {
        info!(tunnel = %config.name, server = config.server_mode, "adding tunnel");
        self.tunnels.push(Tunnel::new(config));
        self.tunnels.len() - 1
    }

    #[inline]
    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    #[inline]
    pub fn tunnel(&self, index: usize) -> &Tunnel {
        &self.tunnels[index]
    }

    #[inline]
    pub fn fallback_mode(&self) -> bool {
        self.fallback_mode
    }

    #[inline]
    pub fn reorder(&self) -> &ReorderBuffer {
        &self.reorder
    }

    /// Presets a tunnel's quota allowance (the `--permitted` flag)
    pub fn preset_permitted(&mut self, name: &str, value: i64) -> bool {
        match self.tunnels.iter_mut().find(|t| t.name() == name) {
            Some(t) => {
                t.set_permitted(value);
                true
            }
            None => false,
        }
    }

    /// Next event the driver has to act on
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Next packet to write to the tun device
    pub fn pop_tun_packet(&mut self) -> Option<Packet> {
        self.tun_out.pop_front()
    }

    #[inline]
    pub fn has_transmit(&self, index: usize) -> bool {
        self.tunnels[index].has_transmit()
    }

    /// Deadline at which held reorder entries cross the cut-off
    pub fn reorder_deadline(&self) -> Option<Timestamp> {
        self.reorder.next_deadline(self.out_resends)
    }

    // === egress ==========================================================

    /// Takes one IP packet from the tun device, classifies it and queues it
    /// on the scheduled tunnel. Returns the chosen tunnel, or `None` when
    /// the packet had to be dropped.
    pub fn ingest_local(&mut self, ip_packet: &[u8], now: Timestamp) -> Option<usize> {
        if ip_packet.is_empty() || ip_packet.len() > MAX_PAYLOAD {
            warn!(len = ip_packet.len(), "dropping unroutable tun packet");
            return None;
        }
        self.global.accumulate(ip_packet.len());

        let index = match scheduler::choose(&mut self.tunnels, self.fallback_mode) {
            Some(index) => index,
            None => {
                debug!("no usable tunnel, dropping packet");
                return None;
            }
        };

        let reorder = packet::requires_ordering(ip_packet);
        let stream_seq = if reorder {
            let seq = self.data_seq;
            self.data_seq = self.data_seq.wrapping_add(1);
            seq
        } else {
            0
        };

        self.tunnels[index].push_sbuf(Packet {
            kind: PacketKind::Data,
            reorder,
            stream_seq,
            timestamp: now,
            data: ip_packet.to_vec(),
        });
        Some(index)
    }

    /// Encodes the next queued frame for a tunnel into `out`.
    ///
    /// High-priority traffic drains first. Every frame is remembered in the
    /// retransmit cache under its tun sequence before it hits the wire.
    pub fn poll_transmit(
        &mut self,
        index: usize,
        now: Timestamp,
        out: &mut [u8],
    ) -> Option<usize> {
        let t = &mut self.tunnels[index];
        let pkt = t.hpsbuf.pop_front().or_else(|| t.sbuf.pop_front())?;

        let tun_seq = t.tun_seq;
        t.tun_seq += 1;
        t.cache.insert(tun_seq, pkt.clone());

        let now_ms = now.as_millis();
        let timestamp_reply = match t.saved_timestamp.take() {
            Some(saved) if now_ms.saturating_sub(t.saved_timestamp_received_at) < 1000 => {
                // advance the echo by how long we held it
                saved.wrapping_add((now_ms - t.saved_timestamp_received_at) as u16)
            }
            _ => TIMESTAMP_NONE,
        };

        let mut header = Header {
            len: 0,
            kind: pkt.kind,
            reorder: pkt.reorder,
            sent_loss: pack_loss(t.loss_av, t.config.loss_tolerence),
            timestamp: now_ms as u16,
            timestamp_reply,
            flow_id: t.flow_id,
            tun_seq,
            stream_seq: pkt.stream_seq,
        };

        match wire::encode_frame(&mut header, &pkt.data, &self.key, self.cleartext_data, out) {
            Ok(len) => {
                t.sent_packets += 1;
                t.sent_bytes += len as u64;
                t.charge_quota(len);
                debug!(
                    tunnel = %t.name(),
                    len,
                    kind = ?pkt.kind,
                    tun_seq,
                    stream_seq = pkt.stream_seq,
                    "frame out"
                );
                Some(len)
            }
            Err(err) => {
                warn!(tunnel = %t.name(), %err, "frame encoding failed");
                None
            }
        }
    }

    // === ingress =========================================================

    /// Processes one received datagram for a tunnel
    pub fn handle_datagram(
        &mut self,
        index: usize,
        datagram: &mut [u8],
        from: SocketAddr,
        now: Timestamp,
    ) {
        let wire_len = datagram.len();
        let (header, payload) =
            match wire::decode_frame(datagram, &self.key, self.cleartext_data) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(tunnel = %self.tunnels[index].name(), %err, "dropping invalid frame");
                    return;
                }
            };
        let payload = payload.to_vec();

        let runs = {
            let t = &mut self.tunnels[index];
            t.recv_packets += 1;
            t.recv_bytes += wire_len as u64;
            t.bm_data += payload.len() as u64;
            t.charge_quota(wire_len);

            // use the tun sequence to account loss, whatever the frame type
            let runs = t.window.on_sequence(header.tun_seq);
            t.sent_loss = unpack_loss(header.sent_loss, t.config.loss_tolerence);

            if header.timestamp != TIMESTAMP_NONE {
                t.saved_timestamp = Some(header.timestamp);
                t.saved_timestamp_received_at = now.as_millis();
            }
            if header.timestamp_reply != TIMESTAMP_NONE {
                let sample = wire16_diff(now.wire16(), header.timestamp_reply) as f64;
                // large values mean the peer was stalled; losses in the
                // window skew the holding delay, so only trust a clean one
                if sample < 5000.0 && t.window.is_pristine() {
                    t.rtt.on_sample(sample);
                }
            }

            // the peer address may only move while it cannot be spoofed
            if t.peer != Some(from) {
                if self.cleartext_data && t.state.is_up() {
                    warn!(tunnel = %t.name(), %from, "rejected non authenticated connection");
                    return;
                }
                info!(tunnel = %t.name(), %from, "new connection");
                t.peer = Some(from);
            }

            debug!(
                tunnel = %t.name(),
                len = wire_len,
                kind = ?header.kind,
                tun_seq = header.tun_seq,
                stream_seq = header.stream_seq,
                "frame in"
            );
            runs
        };

        for run in runs {
            self.request_resend(index, run.start, run.len as i32, now);
        }

        match header.kind {
            PacketKind::Data | PacketKind::DataResend => {
                if self.tunnels[index].state.is_up() {
                    self.tunnels[index].touch(now);
                    let pkt = Packet {
                        kind: header.kind,
                        reorder: header.reorder,
                        stream_seq: header.stream_seq,
                        timestamp: now,
                        data: payload,
                    };
                    if self
                        .reorder
                        .insert(pkt, now, self.out_resends, &mut self.tun_out)
                    {
                        self.out_resends = 0;
                    }
                } else {
                    debug!(
                        tunnel = %self.tunnels[index].name(),
                        "ignoring non authenticated packet"
                    );
                }
            }
            PacketKind::Keepalive => {
                if self.tunnels[index].state.is_up() {
                    self.on_keepalive(index, &payload, now);
                }
            }
            PacketKind::Disconnect => {
                if self.tunnels[index].state.is_up() {
                    info!(tunnel = %self.tunnels[index].name(), "disconnect received");
                    self.status_down(index, now);
                }
            }
            PacketKind::Auth | PacketKind::AuthOk => self.on_auth(index, &payload, now),
            PacketKind::Resend => {
                if self.tunnels[index].state.is_up() {
                    match ResendRequest::parse(&payload) {
                        Ok(request) => self.service_resend(request, now),
                        Err(err) => {
                            warn!(tunnel = %self.tunnels[index].name(), %err, "bad resend request")
                        }
                    }
                }
            }
        }
    }

    fn on_keepalive(&mut self, index: usize, payload: &[u8], now: Timestamp) {
        let echo = {
            let t = &mut self.tunnels[index];
            debug!(tunnel = %t.name(), "keepalive received");
            t.touch(now);
            t.last_keepalive_ack = now;

            if let Some(bw) = parse_ascii_u64(payload) {
                if bw > 0 {
                    t.bandwidth_out = bw as f64;
                }
            }

            // avoid flooding the network if multiple keepalives are queued
            if t.last_keepalive_ack_sent + IO_TIMEOUT < now {
                t.last_keepalive_ack_sent = now;
                true
            } else {
                false
            }
        };
        if echo {
            self.queue_keepalive(index, now);
        }
    }

    fn on_auth(&mut self, index: usize, payload: &[u8], now: Timestamp) {
        // either side may bootstrap our quota accounting
        if payload.len() > 2 {
            if let Some(permitted) = parse_ascii_i64(&payload[2..]) {
                let t = &mut self.tunnels[index];
                if permitted > t.permitted {
                    t.permitted = permitted;
                }
            }
        }

        if self.tunnels[index].config.server_mode {
            // reply and mark up before anything is sent on the link
            if self.tunnels[index].state != State::AuthSent {
                self.status_up(index, now);
                let t = &mut self.tunnels[index];
                let mut data = b"OK".to_vec();
                if t.config.quota > 0 {
                    data.extend_from_slice(t.permitted.to_string().as_bytes());
                    data.push(0);
                }
                t.push_hpsbuf(Packet::control(PacketKind::AuthOk, data, now));
                info!(tunnel = %t.name(), "authenticated");
            }
        } else if self.tunnels[index].state == State::AuthSent {
            info!(tunnel = %self.tunnels[index].name(), "authenticated");
            self.status_up(index, now);
        }
    }

    // === selective repeat ================================================

    /// Asks the peer, over a healthy tunnel, to resend `len` frames lost on
    /// `loss_index`
    fn request_resend(&mut self, loss_index: usize, seq_start: u64, len: i32, now: Timestamp) {
        let best = match scheduler::best_quick(&self.tunnels, Some(loss_index)) {
            Some(best) => best,
            None => {
                debug!("no suitable tunnel to request resend");
                return;
            }
        };
        let request = ResendRequest {
            seq_start,
            tun_id: self.tunnels[loss_index].id(),
            len,
        };
        debug!(
            via = %self.tunnels[best].name(),
            lost_on = %self.tunnels[loss_index].name(),
            seq_start,
            len,
            "requesting resend"
        );
        self.tunnels[best].push_hpsbuf(Packet::control(
            PacketKind::Resend,
            request.to_payload(),
            now,
        ));
        self.out_resends += len.max(0) as u64;
    }

    /// Services a peer's resend request out of the retransmit cache
    fn service_resend(&mut self, request: ResendRequest, now: Timestamp) {
        let loss_index = match self.tunnels.iter().position(|t| t.id() == request.tun_id) {
            Some(index) => index,
            None => {
                debug!(tun_id = request.tun_id, "resend for unknown tunnel");
                return;
            }
        };
        // the peer observed loss there even if it never told us
        if self.tunnels[loss_index].sent_loss == 0.0 {
            self.tunnels[loss_index].sent_loss = 1.0;
        }

        for offset in 0..request.len.max(0) {
            let seq = request.seq_start.wrapping_add(offset as u64);
            let replay = match self.tunnels[loss_index].cache.get(seq) {
                Some(pkt) if pkt.reorder => {
                    let mut replay = pkt.clone();
                    replay.kind = PacketKind::DataResend;
                    replay
                }
                Some(pkt) => {
                    debug!(seq, kind = ?pkt.kind, "refusing to resend unordered frame");
                    continue;
                }
                None => {
                    debug!(seq, "unable to resend, slot recycled");
                    continue;
                }
            };
            match scheduler::best_quick(&self.tunnels, Some(loss_index)) {
                Some(best) => {
                    debug!(
                        via = %self.tunnels[best].name(),
                        seq,
                        stream_seq = replay.stream_seq,
                        "resending"
                    );
                    self.tunnels[best].push_hpsbuf(replay);
                }
                None => debug!(seq, "no suitable tunnel to resend on"),
            }
        }
    }

    // === status transitions ==============================================

    fn update_status(&mut self) {
        self.connected = self.tunnels.iter().filter(|t| t.state.is_up()).count();
        self.fallback_mode = scheduler::fallback_mode(&self.tunnels);
    }

    fn status_up(&mut self, index: usize, now: Timestamp) {
        self.tunnels[index].mark_up(now);
        self.update_status();
        scheduler::reset_wrr(&mut self.tunnels);
        self.events.push_back(Event::LinkUp { tunnel: index });
        if self.connected > 0 && !self.initialized {
            self.initialized = true;
            self.events.push_back(Event::InterfaceUp);
        }
    }

    /// Tears a tunnel down, salvaging in-flight traffic
    pub fn status_down(&mut self, index: usize, now: Timestamp) {
        let old_state = self.tunnels[index].state;
        self.tunnels[index].mark_down();
        scheduler::recalc_weights(&mut self.tunnels, self.global.bandwidth);

        // control traffic survives on the next best tunnel
        let queued: Vec<Packet> = self.tunnels[index].hpsbuf.drain(..).collect();
        for pkt in queued {
            match scheduler::best_quick(&self.tunnels, Some(index)) {
                Some(best) => self.tunnels[best].push_hpsbuf(pkt),
                None => break,
            }
        }
        self.tunnels[index].hpsbuf.clear();
        self.tunnels[index].sbuf.clear();

        // ask for everything that might still be in flight toward us
        let seq_last = self.tunnels[index].window.seq_last();
        self.request_resend(index, seq_last, PKTBUFSIZE as i32, now);

        self.update_status();
        if old_state.is_up() {
            self.events.push_back(Event::LinkDown { tunnel: index });
            scheduler::reset_wrr(&mut self.tunnels);
            if self.connected == 0 && self.initialized {
                self.initialized = false;
                self.events.push_back(Event::InterfaceDown);
                self.reorder.reset();
                self.out_resends = 0;
            }
        }
    }

    /// The driver opened (or reopened) the tunnel's socket
    pub fn connected(&mut self, index: usize, peer: Option<SocketAddr>, now: Timestamp) {
        let t = &mut self.tunnels[index];
        t.socket_ready = true;
        t.conn_attempts = 0;
        if peer.is_some() {
            t.peer = peer;
        }
        t.touch(now);
    }

    /// A hard socket error surfaced; the tunnel restarts
    pub fn socket_error(&mut self, index: usize, now: Timestamp) {
        warn!(tunnel = %self.tunnels[index].name(), "socket error");
        if self.tunnels[index].state.is_up() {
            self.status_down(index, now);
        } else {
            self.tunnels[index].socket_ready = false;
        }
    }

    // === timers ==========================================================

    /// Per-tunnel check, fired every [`IO_TIMEOUT`] (subject to reconnect
    /// backoff while down)
    pub fn on_tunnel_tick(&mut self, index: usize, now: Timestamp) {
        self.check_lossy(index, now);

        let timeout = {
            let t = &self.tunnels[index];
            if t.state.is_up() && t.config.timeout > 0 {
                let deadline = t.last_keepalive_ack
                    + Duration::from_secs(t.config.timeout as u64)
                    + IO_TIMEOUT
                    + t.rtt.srtt_av_duration() * 2;
                t.last_keepalive_ack != Timestamp::default() && deadline < now
            } else {
                false
            }
        };
        if timeout {
            info!(tunnel = %self.tunnels[index].name(), "timeout");
            self.status_down(index, now);
        } else if self.tunnels[index].state.is_up()
            && self.tunnels[index].config.timeout > 0
            && now > self.tunnels[index].next_keepalive
        {
            self.queue_keepalive(index, now);
        }

        if self.tunnels[index].state < State::AuthOk {
            self.tick_connect(index, now);
        }
    }

    fn check_lossy(&mut self, index: usize, now: Timestamp) {
        let (stale, loss, state, tolerence) = {
            let t = &self.tunnels[index];
            let stale = t.last_keepalive_ack != Timestamp::default()
                && t.last_keepalive_ack + IO_TIMEOUT * 2 + t.rtt.srtt_av_duration() * 2 < now;
            (
                stale,
                t.sent_loss,
                t.state,
                t.config.loss_tolerence as f64,
            )
        };

        let mut changed = false;
        if state == State::AuthOk && stale {
            info!(tunnel = %self.tunnels[index].name(), "keepalive reached threshold");
            self.tunnels[index].state = State::Lossy;
            // fear the worst and ask for everything still in flight
            let seq_last = self.tunnels[index].window.seq_last();
            self.request_resend(index, seq_last, PKTBUFSIZE as i32, now);
            changed = true;
        } else if state == State::AuthOk && loss >= tolerence {
            info!(
                tunnel = %self.tunnels[index].name(),
                loss,
                tolerence,
                "packet loss reached threshold"
            );
            self.tunnels[index].state = State::Lossy;
            changed = true;
        } else if state == State::Lossy && !stale && loss < tolerence {
            info!(tunnel = %self.tunnels[index].name(), "packet loss acceptable again");
            self.tunnels[index].state = State::AuthOk;
            changed = true;
        }

        if changed {
            self.update_status();
            scheduler::reset_wrr(&mut self.tunnels);
        }
    }

    fn tick_connect(&mut self, index: usize, now: Timestamp) {
        let server_mode = self.tunnels[index].config.server_mode;
        if !self.tunnels[index].socket_ready {
            self.tunnels[index].conn_attempts += 1;
            self.events.push_back(Event::Reconnect { tunnel: index });
            return;
        }
        if server_mode {
            return;
        }

        // client side sends (or repeats) the challenge
        let t = &mut self.tunnels[index];
        let mut data = b"AU".to_vec();
        if t.config.quota > 0 {
            data.extend_from_slice(t.permitted.to_string().as_bytes());
            data.push(0);
        }
        t.push_hpsbuf(Packet::control(PacketKind::Auth, data, now));
        t.state = State::AuthSent;
        debug!(tunnel = %t.name(), "challenge sent");
    }

    fn queue_keepalive(&mut self, index: usize, now: Timestamp) {
        let t = &mut self.tunnels[index];
        debug!(tunnel = %t.name(), "sending keepalive");
        let mut data = (t.bandwidth_measured as u64).to_string().into_bytes();
        data.push(0);
        t.push_hpsbuf(Packet::control(PacketKind::Keepalive, data, now));
        t.next_keepalive = now + IO_TIMEOUT;
    }

    /// Global controller tick; closes the measuring window once per
    /// [`bandwidth::AVTIME`]
    pub fn on_bandwidth_tick(&mut self, now: Timestamp) {
        let elapsed = match self.global.tick(now) {
            Some(elapsed) => elapsed,
            None => return,
        };
        for t in self.tunnels.iter_mut() {
            bandwidth::adjust_tunnel(t, elapsed);
        }
        scheduler::recalc_weights(&mut self.tunnels, self.global.bandwidth);
    }

    /// Refreshes the reorder drain parameters, once per second
    pub fn on_reorder_tick(&mut self, now: Timestamp) {
        let mut sum = 0.0;
        let mut count = 0u32;
        for t in &self.tunnels {
            // fallback links don't take part in the drain pacing
            if t.state.is_auth_ok() && !t.config.fallback_only && t.rtt.srtt_av() > 0.0 {
                sum += t.rtt.srtt_av();
                count += 1;
            }
        }
        let mean = if count > 0 { sum / count as f64 } else { 0.0 };
        self.reorder.tick(now, mean);
    }

    /// Releases whatever the reorder policy allows toward the tun device
    pub fn drain_reorder(&mut self, now: Timestamp) {
        if self.reorder.is_empty() {
            return;
        }
        if self.reorder.drain(now, self.out_resends, &mut self.tun_out) {
            self.out_resends = 0;
        }
    }

    // === lifecycle =======================================================

    /// Applies a reloaded configuration. Matching tunnels keep their state;
    /// changed endpoints force a reconnect; vanished tunnels are dropped.
    /// Returns true when anything changed.
    pub fn reload(&mut self, configs: Vec<TunnelConfig>, now: Timestamp) -> bool {
        let mut changed = false;

        for config in &configs {
            match self.tunnels.iter().position(|t| t.name() == config.name) {
                Some(index) => {
                    if self.tunnels[index].config == *config {
                        continue;
                    }
                    let endpoints_changed = {
                        let c = &self.tunnels[index].config;
                        c.server_mode != config.server_mode
                            || c.bind_addr != config.bind_addr
                            || c.bind_port != config.bind_port
                            || c.bind_dev != config.bind_dev
                            || c.bind_fib != config.bind_fib
                            || c.dest_addr != config.dest_addr
                            || c.dest_port != config.dest_port
                    };
                    if endpoints_changed {
                        if self.tunnels[index].state.is_up() {
                            self.status_down(index, now);
                        }
                        self.tunnels[index].peer = None;
                        self.tunnels[index].socket_ready = false;
                    }
                    let t = &mut self.tunnels[index];
                    t.config = config.clone();
                    t.id = config.id();
                    if config.bandwidth_max > 0 {
                        t.bandwidth_max = config.bandwidth_max as f64;
                        t.bandwidth = t.bandwidth.min(t.bandwidth_max);
                    }
                    changed = true;
                }
                None => {
                    self.add_tunnel(config.clone());
                    changed = true;
                }
            }
        }

        let mut index = 0;
        while index < self.tunnels.len() {
            if configs.iter().any(|c| c.name == self.tunnels[index].name()) {
                index += 1;
                continue;
            }
            if self.tunnels[index].state.is_up() {
                self.status_down(index, now);
            }
            info!(tunnel = %self.tunnels[index].name(), "dropping tunnel");
            self.tunnels.remove(index);
            changed = true;
        }

        if changed {
            self.update_status();
            scheduler::reset_wrr(&mut self.tunnels);
        }
        changed
    }

    /// Queues a DISCONNECT on every authenticated tunnel; the driver
    /// flushes them and exits the loop
    pub fn shutdown(&mut self, now: Timestamp) {
        for index in 0..self.tunnels.len() {
            if self.tunnels[index].state.is_up() {
                debug!(tunnel = %self.tunnels[index].name(), "sending disconnect");
                self.tunnels[index].push_hpsbuf(Packet::control(
                    PacketKind::Disconnect,
                    Vec::new(),
                    now,
                ));
            }
        }
    }
}

/// Leading ASCII decimal, ignoring anything after the digits
fn parse_ascii_u64(data: &[u8]) -> Option<u64> {
    let digits: &[u8] = match data.iter().position(|b| !b.is_ascii_digit()) {
        Some(0) => return None,
        Some(end) => &data[..end],
        None if data.is_empty() => return None,
        None => data,
    };
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn parse_ascii_i64(data: &[u8]) -> Option<i64> {
    let negative = data.first() == Some(&b'-');
    let rest = if negative { &data[1..] } else { data };
    let value = parse_ascii_u64(rest)? as i64;
    Some(if negative { -value } else { value })
}
