// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! UDP socket setup for tunnels.

use linkbond_core::TunnelConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{info, warn};

/// Opens the socket for a tunnel: resolves the remote for clients, binds
/// the local address/port/device, and returns the socket together with the
/// peer address (clients only; servers learn it from the first
/// authenticated frame).
pub async fn open(config: &TunnelConfig) -> io::Result<(UdpSocket, Option<SocketAddr>)> {
    let peer = if config.server_mode {
        None
    } else {
        let host = config
            .dest_addr
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing remotehost"))?;
        let port = config
            .dest_port
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing remoteport"))?;
        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "name resolved to nothing"))?;
        Some(addr)
    };

    let bind_addr = resolve_bind(config, peer).await?;

    let domain = Domain::for_address(bind_addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    if let Some(device) = &config.bind_dev {
        if let Err(err) = socket.bind_device(Some(device.as_bytes())) {
            warn!(tunnel = %config.name, device, %err, "failed to bind on interface");
        }
    }
    // routing-table selection goes through the fwmark on Linux
    if config.bind_fib > 0 {
        socket.set_mark(config.bind_fib)?;
    }

    socket.bind(&bind_addr.into())?;

    info!(
        tunnel = %config.name,
        bind = %bind_addr,
        device = config.bind_dev.as_deref().unwrap_or("any"),
        "bound"
    );

    let socket = UdpSocket::from_std(socket.into())?;
    Ok((socket, peer))
}

async fn resolve_bind(config: &TunnelConfig, peer: Option<SocketAddr>) -> io::Result<SocketAddr> {
    let port = config.bind_port.unwrap_or(0);
    if let Some(addr) = config.bind_addr.as_deref() {
        let resolved = lookup_host((addr, port)).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "bind address resolved to nothing")
        })?;
        return Ok(resolved);
    }
    // match the peer's family, default to IPv4 wildcard
    let addr = match peer {
        Some(SocketAddr::V6(_)) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        _ => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
    };
    Ok(addr)
}
