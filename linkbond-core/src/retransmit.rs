// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded ring of recently transmitted frames.
//!
//! Every outbound frame is remembered at `tun_seq % PKTBUFSIZE` together
//! with its exact sequence number; a slot answers a lookup only while its
//! tag still matches, so a recycled slot reads as a miss rather than as a
//! stale frame.

use crate::packet::Packet;

/// Number of retransmit slots per tunnel
pub const PKTBUFSIZE: usize = 4096;

struct Slot {
    tun_seq: u64,
    packet: Packet,
}

pub struct RetransmitCache {
    slots: Box<[Option<Slot>]>,
}

impl Default for RetransmitCache {
    fn default() -> Self {
        let mut slots = Vec::with_capacity(PKTBUFSIZE);
        slots.resize_with(PKTBUFSIZE, || None);
        Self {
            slots: slots.into_boxed_slice(),
        }
    }
}

impl RetransmitCache {
    /// Remembers an outbound frame, recycling whatever occupied the slot
    pub fn insert(&mut self, tun_seq: u64, packet: Packet) {
        let slot = &mut self.slots[tun_seq as usize % PKTBUFSIZE];
        if let Some(previous) = slot {
            debug_assert!(previous.tun_seq < tun_seq, "sequence must not regress");
        }
        *slot = Some(Slot { tun_seq, packet });
    }

    /// Looks up a frame by exact tun sequence number
    pub fn get(&self, tun_seq: u64) -> Option<&Packet> {
        self.slots[tun_seq as usize % PKTBUFSIZE]
            .as_ref()
            .filter(|slot| slot.tun_seq == tun_seq)
            .map(|slot| &slot.packet)
    }

    /// Drops every cached frame; used when a tunnel goes down
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}
