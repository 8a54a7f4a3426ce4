// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The event loop.
//!
//! One current-thread reactor drives the tun device, every tunnel socket,
//! the periodic timers and the signal handlers; all datapath state lives in
//! the [`Core`] and is only touched from this loop.

use crate::{config::Config, script::ScriptRunner, socket, tun::TunDevice};
use linkbond_core::{
    bandwidth::AVTIME,
    packet::{MAX_PAYLOAD, MAX_WIRE_LEN},
    time::{Clock, StdClock, Timestamp},
    tunnel::{IO_TIMEOUT, IO_TIMEOUT_INCREMENT, IO_TIMEOUT_MAXIMUM},
    Core, Event,
};
use std::{collections::HashMap, future::Future, io, path::PathBuf, pin::Pin, time::Duration};
use tokio::{
    net::UdpSocket,
    signal::unix::{signal, SignalKind},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

/// Reorder drain parameters refresh cadence
const REORDER_TICK: Duration = Duration::from_secs(1);

/// Per-tunnel driver state, parallel to the core's tunnel list
struct Link {
    socket: Option<UdpSocket>,
    /// An encoded frame that hit a full socket buffer; retried next pass
    pending: Option<Vec<u8>>,
    /// Tick period, grows with reconnect backoff
    period: Duration,
    tick_at: Instant,
}

impl Link {
    fn new() -> Self {
        Self {
            socket: None,
            pending: None,
            period: IO_TIMEOUT,
            tick_at: Instant::now(),
        }
    }
}

enum Wake {
    Tun(usize),
    Socket(usize),
    Timer,
    Reload,
    Quit,
}

pub struct Daemon {
    core: Core,
    clock: StdClock,
    tun: TunDevice,
    scripts: ScriptRunner,
    config_path: PathBuf,
    links: Vec<Link>,
    bandwidth_at: Instant,
    reorder_at: Instant,
}

pub async fn run(
    config_path: PathBuf,
    config: Config,
    permitted: Vec<(String, i64)>,
    user: Option<String>,
) -> io::Result<()> {
    let tun = TunDevice::open(&config.general.interface)?;
    info!(interface = %tun.name(), "created interface");

    // the tun device was the last thing needing privileges
    if let Some(user) = user {
        crate::drop_privileges(&user)?;
    }

    let mtu = config.general.mtu.unwrap_or(MAX_PAYLOAD as u32) as usize;
    let scripts = ScriptRunner::new(&config.general, tun.name(), mtu);

    let mut core = Core::new(config.core_config());
    for tunnel in config.tunnel_configs() {
        core.add_tunnel(tunnel);
    }
    for (name, value) in permitted {
        if !core.preset_permitted(&name, value) {
            warn!(tunnel = %name, "--permitted preset for unknown tunnel");
        }
    }

    let links = (0..core.tunnels().len()).map(|_| Link::new()).collect();
    let mut daemon = Daemon {
        core,
        clock: StdClock::default(),
        tun,
        scripts,
        config_path,
        links,
        bandwidth_at: Instant::now() + AVTIME,
        reorder_at: Instant::now() + REORDER_TICK,
    };

    daemon.scripts.set_running_state();
    daemon.run_loop().await
}

impl Daemon {
    async fn run_loop(&mut self) -> io::Result<()> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;

        let mut tun_buf = [0u8; MAX_PAYLOAD];

        loop {
            self.process_events().await;
            self.flush_tun().await;
            self.flush_sockets();

            let deadline = self.next_deadline();
            let wake = tokio::select! {
                result = self.tun.recv(&mut tun_buf) => Wake::Tun(result?),
                index = recv_ready(&self.links) => Wake::Socket(index),
                _ = sleep_until(deadline) => Wake::Timer,
                _ = sighup.recv() => Wake::Reload,
                _ = sigint.recv() => Wake::Quit,
                _ = sigterm.recv() => Wake::Quit,
                _ = sigquit.recv() => Wake::Quit,
            };

            match wake {
                Wake::Tun(len) => {
                    let now = self.clock.get_time();
                    if let Some(index) = self.core.ingest_local(&tun_buf[..len], now) {
                        self.flush_link(index);
                    }
                }
                Wake::Socket(index) => self.recv_datagrams(index),
                Wake::Timer => self.fire_timers(),
                Wake::Reload => self.reload().await,
                Wake::Quit => {
                    info!("killed by signal SIGTERM, SIGQUIT or SIGINT");
                    self.core.shutdown(self.clock.get_time());
                    self.flush_sockets();
                    return Ok(());
                }
            }
        }
    }

    /// Carries out the reactions the core queued up
    async fn process_events(&mut self) {
        while let Some(event) = self.core.poll_event() {
            match event {
                Event::Reconnect { tunnel } => self.reconnect(tunnel).await,
                Event::LinkUp { tunnel } => {
                    let name = self.core.tunnel(tunnel).name().to_string();
                    info!(tunnel = %name, "link up");
                    self.scripts.run("rtun_up", Some(&name));
                }
                Event::LinkDown { tunnel } => {
                    let name = self.core.tunnel(tunnel).name().to_string();
                    info!(tunnel = %name, "link down");
                    self.links[tunnel].socket = None;
                    self.links[tunnel].pending = None;
                    self.scripts.run("rtun_down", Some(&name));
                }
                Event::InterfaceUp => {
                    info!("interface up");
                    self.scripts.run("tuntap_up", None);
                }
                Event::InterfaceDown => {
                    info!("interface down");
                    self.scripts.run("tuntap_down", None);
                }
            }
        }
    }

    async fn reconnect(&mut self, index: usize) {
        let config = self.core.tunnel(index).config().clone();
        match socket::open(&config).await {
            Ok((socket, peer)) => {
                self.links[index].socket = Some(socket);
                self.links[index].pending = None;
                self.links[index].period = IO_TIMEOUT;
                self.core.connected(index, peer, self.clock.get_time());
            }
            Err(err) => {
                warn!(tunnel = %config.name, %err, "connection failed, check DNS?");
                let period = self.links[index].period * IO_TIMEOUT_INCREMENT;
                self.links[index].period = period.min(IO_TIMEOUT_MAXIMUM);
            }
        }
    }

    /// Drains one ready socket into the core
    fn recv_datagrams(&mut self, index: usize) {
        let now = self.clock.get_time();
        let mut buf = [0u8; 2048];
        loop {
            let result = match &self.links[index].socket {
                Some(socket) => socket.try_recv_from(&mut buf),
                None => return,
            };
            match result {
                Ok((len, from)) => {
                    self.core.handle_datagram(index, &mut buf[..len], from, now);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(tunnel = %self.core.tunnel(index).name(), %err, "read error");
                    self.links[index].socket = None;
                    self.links[index].pending = None;
                    self.core.socket_error(index, now);
                    return;
                }
            }
        }
    }

    fn flush_sockets(&mut self) {
        for index in 0..self.links.len() {
            self.flush_link(index);
        }
    }

    /// Pushes queued frames out of a tunnel until its queues or the socket
    /// buffer run dry
    fn flush_link(&mut self, index: usize) {
        let now = self.clock.get_time();
        loop {
            if self.links[index].socket.is_none() {
                return;
            }
            if self.links[index].pending.is_none() {
                let mut frame = [0u8; MAX_WIRE_LEN];
                match self.core.poll_transmit(index, now, &mut frame) {
                    Some(len) => self.links[index].pending = Some(frame[..len].to_vec()),
                    None => return,
                }
            }
            let peer = match self.core.tunnel(index).peer() {
                Some(peer) => peer,
                None => {
                    // nowhere to send until the peer introduces itself
                    self.links[index].pending = None;
                    return;
                }
            };
            let result = {
                let socket = self.links[index].socket.as_ref().expect("socket checked");
                let frame = self.links[index].pending.as_ref().expect("frame queued");
                socket.try_send_to(frame, peer)
            };
            match result {
                Ok(_) => self.links[index].pending = None,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // keep the frame, the next pass retries
                    return;
                }
                Err(err) => {
                    warn!(tunnel = %self.core.tunnel(index).name(), %err, "write error");
                    self.links[index].socket = None;
                    self.links[index].pending = None;
                    self.core.socket_error(index, now);
                    return;
                }
            }
        }
    }

    /// Releases reorder output into the tun device
    async fn flush_tun(&mut self) {
        let now = self.clock.get_time();
        self.core.drain_reorder(now);
        while let Some(pkt) = self.core.pop_tun_packet() {
            if let Err(err) = self.tun.send(&pkt.data).await {
                warn!(%err, "tun write error");
                return;
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.bandwidth_at.min(self.reorder_at);
        for link in &self.links {
            deadline = deadline.min(link.tick_at);
        }
        if let Some(at) = self.core.reorder_deadline() {
            deadline = deadline.min(self.instant_at(at));
        }
        deadline
    }

    fn instant_at(&self, at: Timestamp) -> Instant {
        Instant::now() + at.saturating_duration_since(self.clock.get_time())
    }

    fn fire_timers(&mut self) {
        let now_instant = Instant::now();
        let now = self.clock.get_time();

        for index in 0..self.links.len() {
            if self.links[index].tick_at <= now_instant {
                let period = self.links[index].period;
                self.links[index].tick_at = now_instant + period;
                self.core.on_tunnel_tick(index, now);
            }
        }
        if self.bandwidth_at <= now_instant {
            self.bandwidth_at = now_instant + AVTIME;
            self.core.on_bandwidth_tick(now);
        }
        if self.reorder_at <= now_instant {
            self.reorder_at = now_instant + REORDER_TICK;
            self.core.on_reorder_tick(now);
        }
    }

    async fn reload(&mut self) {
        info!("reload (SIGHUP)");
        self.scripts.reload_resolver();
        let config = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(err) => {
                warn!(%err, "reload failed, keeping previous config");
                return;
            }
        };

        let now = self.clock.get_time();
        let names: Vec<String> = self
            .core
            .tunnels()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        if self.core.reload(config.tunnel_configs(), now) {
            // re-home driver state by tunnel name; links the core restarted
            // get a fresh slot and reconnect on their next tick
            let mut old: HashMap<String, Link> =
                names.into_iter().zip(self.links.drain(..)).collect();
            self.links = self
                .core
                .tunnels()
                .iter()
                .map(|t| match old.remove(t.name()) {
                    Some(link) if t.socket_ready() => link,
                    _ => Link::new(),
                })
                .collect();
        } else {
            debug!("configuration unchanged");
        }

        let mtu = config.general.mtu.unwrap_or(MAX_PAYLOAD as u32) as usize;
        self.scripts = ScriptRunner::new(&config.general, self.tun.name(), mtu);
    }
}

/// Resolves once any open socket is readable
async fn recv_ready(links: &[Link]) -> usize {
    let mut ready: Vec<Pin<Box<dyn Future<Output = usize> + '_>>> = Vec::new();
    for (index, link) in links.iter().enumerate() {
        if let Some(socket) = &link.socket {
            ready.push(Box::pin(async move {
                // readiness only; errors surface on the recv itself
                let _ = socket.readable().await;
                index
            }));
        }
    }
    if ready.is_empty() {
        return std::future::pending().await;
    }
    let (index, _, _) = futures::future::select_all(ready).await;
    index
}
