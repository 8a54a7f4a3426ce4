// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Internal packet representation and wire constants.

use crate::time::Timestamp;

pub mod resend;
pub mod wire;

/// Frame protocol version
pub const PROTOCOL_VERSION: u8 = 2;

/// Fixed wire header size in bytes
pub const HEADER_LEN: usize = 28;

pub const DEFAULT_MTU: usize = 1500;
pub const IP4_UDP_OVERHEAD: usize = 28;

/// Largest IP packet the tun device may hand us, and the MTU it is
/// configured with: the path MTU less our header and the outer IPv4/UDP
/// encapsulation.
pub const MAX_PAYLOAD: usize = DEFAULT_MTU - HEADER_LEN - IP4_UDP_OVERHEAD;

/// Largest datagram we ever emit
pub const MAX_WIRE_LEN: usize = HEADER_LEN + MAX_PAYLOAD + crate::crypto::TAG_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Auth = 0,
    AuthOk = 1,
    Keepalive = 2,
    Data = 3,
    DataResend = 4,
    Disconnect = 5,
    Resend = 6,
}

impl PacketKind {
    /// Returns true for frames carrying LAN payload
    #[inline]
    pub fn is_data(self) -> bool {
        matches!(self, Self::Data | Self::DataResend)
    }

    #[inline]
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Auth,
            1 => Self::AuthOk,
            2 => Self::Keepalive,
            3 => Self::Data,
            4 => Self::DataResend,
            5 => Self::Disconnect,
            6 => Self::Resend,
            _ => return None,
        })
    }
}

/// A queued packet.
///
/// `stream_seq` is only meaningful when `reorder` is set; packets outside the
/// ordered stream carry 0 and bypass the reorder buffer on the receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub reorder: bool,
    pub stream_seq: u64,
    /// Enqueue time on the sender, arrival time on the receiver
    pub timestamp: Timestamp,
    pub data: Vec<u8>,
}

impl Packet {
    /// A control frame (handshake, keepalive, resend request, disconnect)
    pub fn control(kind: PacketKind, data: Vec<u8>, now: Timestamp) -> Self {
        debug_assert!(!kind.is_data());
        Self {
            kind,
            reorder: false,
            stream_seq: 0,
            timestamp: now,
            data,
        }
    }
}

/// Classifies an IP packet read from the tun device: TCP enters the ordered
/// stream, everything else is delivered as it arrives.
///
/// The protocol field lives at offset 9 of the IPv4 header.
#[inline]
pub fn requires_ordering(ip_packet: &[u8]) -> bool {
    ip_packet.get(9) == Some(&6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let mut ip = [0u8; 20];
        ip[9] = 6;
        assert!(requires_ordering(&ip));
        ip[9] = 17;
        assert!(!requires_ordering(&ip));
        assert!(!requires_ordering(&[0u8; 4]));
    }

    #[test]
    fn kind_round_trip() {
        for value in 0..=6u8 {
            let kind = PacketKind::from_wire(value).unwrap();
            assert_eq!(kind as u8, value);
        }
        assert_eq!(PacketKind::from_wire(7), None);
        assert_eq!(PacketKind::from_wire(63), None);
    }
}
