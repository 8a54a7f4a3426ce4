// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Global reorder buffer.
//!
//! A single buffer restores the ordered stream across every tunnel, keyed by
//! the global stream sequence. Packets in order are delivered just in time;
//! packets ahead of a hole are held until the hole fills, ages past the
//! cut-off, or the buffer outgrows its target length, at which point the
//! stream is released over the hole and the gap is accounted as loss.

use crate::{
    packet::{Packet, PacketKind},
    retransmit::PKTBUFSIZE,
    time::Timestamp,
};
use core::time::Duration;
use std::collections::VecDeque;
use tracing::debug;

/// Base cut-off age for held packets; doubled while resends are outstanding
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Hard cap on the buffer's target length
pub const MAX_TARGET_LEN: usize = 5 * PKTBUFSIZE;

/// Reorder parameter fallback when no tunnel reports a usable average RTT
const DEFAULT_MAX_SRTT_MS: f64 = 800.0;

/// Sampling window for the arrival rate
const ARRIVAL_WINDOW: Duration = Duration::from_secs(1);

/// `a < b` in modular (wrapping) sequence arithmetic
#[inline]
fn seq_before(a: u64, b: u64) -> bool {
    (b.wrapping_sub(a) as i64) > 0
}

#[derive(Debug)]
pub struct ReorderBuffer {
    /// Lowest stream sequence that may still be buffered
    min_seqn: u64,
    initialized: bool,
    enabled: bool,
    /// Held packets, descending by stream sequence; the back is the oldest
    list: VecDeque<Packet>,
    list_size_max: usize,
    loss: u64,
    delivered: u64,
    max_srtt_ms: f64,
    arrival_rate: f64,
    arrival_count: u64,
    arrival_window_start: Option<Timestamp>,
}

impl ReorderBuffer {
    pub fn new(enabled: bool) -> Self {
        Self {
            min_seqn: 0,
            initialized: false,
            enabled,
            list: VecDeque::new(),
            list_size_max: 0,
            loss: 0,
            delivered: 0,
            max_srtt_ms: DEFAULT_MAX_SRTT_MS,
            arrival_rate: 0.0,
            arrival_count: 0,
            arrival_window_start: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[inline]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    #[inline]
    pub fn loss(&self) -> u64 {
        self.loss
    }

    /// Largest buffer depth since the last reset
    #[inline]
    pub fn len_high_watermark(&self) -> usize {
        self.list_size_max
    }

    /// Clears all held packets and forgets the stream position; the next
    /// good packet reseeds `min_seqn`. Invoked when the last tunnel leaves
    /// AuthOK.
    pub fn reset(&mut self) {
        self.list.clear();
        self.list_size_max = 0;
        self.initialized = false;
    }

    /// Refreshes the drain parameters; called once per second.
    ///
    /// `max_srtt_ms` is the mean `srtt_av` across non-fallback AuthOK
    /// tunnels; a non-positive value falls back to a conservative default.
    pub fn tick(&mut self, now: Timestamp, max_srtt_ms: f64) {
        self.max_srtt_ms = if max_srtt_ms > 0.0 {
            max_srtt_ms
        } else {
            DEFAULT_MAX_SRTT_MS
        };

        match self.arrival_window_start {
            None => self.arrival_window_start = Some(now),
            Some(start) => {
                let elapsed = (now - start).as_secs_f64();
                if elapsed >= ARRIVAL_WINDOW.as_secs_f64() {
                    self.arrival_rate = self.arrival_count as f64 / elapsed;
                    self.arrival_count = 0;
                    self.arrival_window_start = Some(now);
                }
            }
        }
    }

    /// Buffer length above which draining is forced.
    ///
    /// Until an arrival rate has been measured there is no size pressure.
    fn target_len(&self) -> usize {
        if self.arrival_rate <= 0.0 {
            return MAX_TARGET_LEN;
        }
        let target = (self.arrival_rate * 1000.0) / (self.max_srtt_ms * 2.2);
        (target as usize).min(MAX_TARGET_LEN)
    }

    /// Inserts a decoded DATA or DATA_RESEND packet.
    ///
    /// Packets released to the tun device are pushed onto `out` in delivery
    /// order. Returns true when the buffer emptied (the caller may clear its
    /// outstanding-resend counter).
    pub fn insert(
        &mut self,
        pkt: Packet,
        now: Timestamp,
        out_resends: u64,
        out: &mut VecDeque<Packet>,
    ) -> bool {
        self.arrival_count += 1;

        if pkt.kind == PacketKind::DataResend {
            if seq_before(pkt.stream_seq, self.min_seqn) {
                debug!(stream_seq = pkt.stream_seq, "dropping stale resend");
                return self.list.is_empty();
            }
        } else if !self.enabled
            || !pkt.reorder
            || pkt.stream_seq == 0
            || pkt.stream_seq == self.min_seqn
        {
            if pkt.stream_seq == self.min_seqn {
                self.min_seqn = pkt.stream_seq.wrapping_add(1);
            }
            self.delivered += 1;
            out.push_back(pkt);
            if !self.list.is_empty() {
                return self.drain(now, out_resends, out);
            }
            return true;
        }

        if !self.initialized
            || ((self.min_seqn.wrapping_sub(pkt.stream_seq) as i64) > 1000 && pkt.stream_seq < 1000)
        {
            debug!(stream_seq = pkt.stream_seq, "seeding stream sequence");
            self.min_seqn = pkt.stream_seq;
            self.initialized = true;
        }

        if seq_before(pkt.stream_seq, self.min_seqn) {
            debug!(
                stream_seq = pkt.stream_seq,
                min_seqn = self.min_seqn,
                "dropping packet behind the stream"
            );
            self.loss += 1;
            if !self.list.is_empty() {
                return self.drain(now, out_resends, out);
            }
            return true;
        }

        // ordered insert, newest first
        let mut index = self.list.len();
        for (i, held) in self.list.iter().enumerate() {
            if held.stream_seq == pkt.stream_seq {
                debug!(stream_seq = pkt.stream_seq, "dropping duplicate");
                return self.drain(now, out_resends, out);
            }
            if seq_before(held.stream_seq, pkt.stream_seq) {
                index = i;
                break;
            }
        }
        self.list.insert(index, pkt);
        self.list_size_max = self.list_size_max.max(self.list.len());

        self.drain(now, out_resends, out)
    }

    /// Releases everything the policy allows. Returns true when the buffer
    /// is empty afterwards.
    pub fn drain(
        &mut self,
        now: Timestamp,
        out_resends: u64,
        out: &mut VecDeque<Packet>,
    ) -> bool {
        let cut = now - DRAIN_TIMEOUT * if out_resends > 0 { 2 } else { 1 };
        let target_len = self.target_len();

        while let Some(tail) = self.list.back() {
            let in_order = !seq_before(self.min_seqn, tail.stream_seq);
            if !(in_order || tail.timestamp < cut || self.list.len() > target_len) {
                break;
            }
            let tail = self.list.pop_back().expect("tail exists");

            if tail.stream_seq == self.min_seqn {
                self.min_seqn = tail.stream_seq.wrapping_add(1);
                self.delivered += 1;
                out.push_back(tail);
            } else if seq_before(self.min_seqn, tail.stream_seq) {
                // released over a hole: everything in between is lost
                let gap = tail.stream_seq.wrapping_sub(self.min_seqn);
                debug!(
                    gap,
                    from = self.min_seqn,
                    released = tail.stream_seq,
                    "cut-off reached"
                );
                self.loss += gap;
                self.min_seqn = tail.stream_seq.wrapping_add(1);
                self.delivered += 1;
                out.push_back(tail);
                break;
            } else {
                self.loss += 1;
                break;
            }
        }

        self.list.is_empty()
    }

    /// Deadline at which the oldest held packet crosses the cut-off
    pub fn next_deadline(&self, out_resends: u64) -> Option<Timestamp> {
        self.list
            .back()
            .map(|tail| tail.timestamp + DRAIN_TIMEOUT * if out_resends > 0 { 2 } else { 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(stream_seq: u64, now: Timestamp) -> Packet {
        Packet {
            kind: PacketKind::Data,
            reorder: true,
            stream_seq,
            timestamp: now,
            data: stream_seq.to_be_bytes().to_vec(),
        }
    }

    fn resend(stream_seq: u64, now: Timestamp) -> Packet {
        Packet {
            kind: PacketKind::DataResend,
            ..data(stream_seq, now)
        }
    }

    fn udp(now: Timestamp) -> Packet {
        Packet {
            kind: PacketKind::Data,
            reorder: false,
            stream_seq: 0,
            timestamp: now,
            data: vec![17],
        }
    }

    fn now() -> Timestamp {
        Timestamp::from_duration(Duration::from_secs(10))
    }

    fn seqs(out: &VecDeque<Packet>) -> Vec<u64> {
        out.iter().map(|p| p.stream_seq).collect()
    }

    #[test]
    fn in_order_stream_is_passed_through() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        for seq in 1..=100 {
            buffer.insert(data(seq, now()), now(), 0, &mut out);
        }
        assert_eq!(seqs(&out), (1..=100).collect::<Vec<_>>());
        assert_eq!(buffer.delivered(), 100);
        assert_eq!(buffer.loss(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn unordered_packets_bypass() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        buffer.insert(udp(now()), now(), 0, &mut out);
        buffer.insert(udp(now()), now(), 0, &mut out);
        assert_eq!(out.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn hole_is_held_then_filled_in_order() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        buffer.insert(data(1, now()), now(), 0, &mut out);
        // 2 is missing; 3, 4, 5 wait
        buffer.insert(data(3, now()), now(), 0, &mut out);
        buffer.insert(data(5, now()), now(), 0, &mut out);
        buffer.insert(data(4, now()), now(), 0, &mut out);
        assert_eq!(seqs(&out), vec![1]);
        assert_eq!(buffer.len(), 3);

        // the replay fills the hole and the whole run flushes
        buffer.insert(resend(2, now()), now(), 0, &mut out);
        assert_eq!(seqs(&out), vec![1, 2, 3, 4, 5]);
        assert_eq!(buffer.loss(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn cut_off_releases_over_the_hole() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        let t0 = now();
        buffer.insert(data(1, t0), t0, 0, &mut out);
        buffer.insert(data(4, t0), t0, 0, &mut out);
        assert_eq!(seqs(&out), vec![1]);

        // before the cut-off nothing moves
        buffer.drain(t0 + Duration::from_millis(100), 0, &mut out);
        assert_eq!(out.len(), 1);

        // past the cut-off the held packet is released, the gap is loss
        buffer.drain(t0 + Duration::from_millis(300), 0, &mut out);
        assert_eq!(seqs(&out), vec![1, 4]);
        assert_eq!(buffer.loss(), 2);
        assert_eq!(buffer.delivered(), 2);

        // 5 is now in order
        buffer.insert(data(5, t0), t0, 0, &mut out);
        assert_eq!(seqs(&out), vec![1, 4, 5]);
    }

    #[test]
    fn outstanding_resends_double_the_cut() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        let t0 = now();
        buffer.insert(data(1, t0), t0, 0, &mut out);
        buffer.insert(data(3, t0), t0, 1, &mut out);

        // 300ms is past the single cut but within the doubled one
        buffer.drain(t0 + Duration::from_millis(300), 1, &mut out);
        assert_eq!(out.len(), 1);
        buffer.drain(t0 + Duration::from_millis(600), 1, &mut out);
        assert_eq!(seqs(&out), vec![1, 3]);
    }

    #[test]
    fn stale_and_duplicate_packets_are_absorbed() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        for seq in 1..=5 {
            buffer.insert(data(seq, now()), now(), 0, &mut out);
        }
        let delivered = buffer.delivered();

        // a stale resend is a no-op
        buffer.insert(resend(2, now()), now(), 0, &mut out);
        assert_eq!(buffer.delivered(), delivered);
        assert_eq!(buffer.loss(), 0);

        // a stale regular packet counts as reorder loss
        buffer.insert(data(3, now()), now(), 0, &mut out);
        assert_eq!(buffer.loss(), 1);

        // duplicates of a held packet are dropped
        buffer.insert(data(8, now()), now(), 0, &mut out);
        buffer.insert(data(8, now()), now(), 0, &mut out);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn restart_heuristic_reseeds() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        buffer.insert(data(5000, now()), now(), 0, &mut out);
        assert_eq!(seqs(&out), vec![5000]);

        // the peer restarted its stream far below us
        buffer.insert(data(3, now()), now(), 0, &mut out);
        buffer.insert(data(4, now()), now(), 0, &mut out);
        assert_eq!(seqs(&out), vec![5000, 3, 4]);
    }

    #[test]
    fn sequence_wrap_is_transparent() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        buffer.insert(data(u64::MAX - 1, now()), now(), 0, &mut out);
        buffer.insert(data(u64::MAX, now()), now(), 0, &mut out);
        // 0 follows u64::MAX in modular order; it must not reseed or drop
        buffer.insert(data(0, now()), now(), 0, &mut out);
        buffer.insert(data(1, now()), now(), 0, &mut out);
        assert_eq!(seqs(&out), vec![u64::MAX - 1, u64::MAX, 0, 1]);
        assert_eq!(buffer.loss(), 0);
    }

    #[test]
    fn size_pressure_uses_measured_arrival_rate() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        let t0 = now();

        // measure ~1000 pkt/s over a one second window
        buffer.tick(t0, 100.0);
        for seq in 1..=1000u64 {
            buffer.insert(data(seq, t0), t0, 0, &mut out);
        }
        buffer.tick(t0 + Duration::from_secs(1), 100.0);
        // target = 1000 * 1000 / (100 * 2.2)
        assert_eq!(buffer.target_len(), 4545);

        // a slower link (larger srtt) tolerates a shorter queue
        for seq in 1001..=2000u64 {
            buffer.insert(data(seq, t0), t0, 0, &mut out);
        }
        buffer.tick(t0 + Duration::from_secs(2), 0.0);
        assert_eq!(buffer.target_len(), 568);
    }

    #[test]
    fn disabled_buffer_delivers_everything_immediately() {
        let mut buffer = ReorderBuffer::new(false);
        let mut out = VecDeque::new();
        buffer.insert(data(5, now()), now(), 0, &mut out);
        buffer.insert(data(3, now()), now(), 0, &mut out);
        assert_eq!(seqs(&out), vec![5, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn delivered_plus_loss_accounts_for_every_sequence() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        let t0 = now();
        // 1..=20 with 7 and 13 missing
        for seq in (1..=20u64).filter(|s| *s != 7 && *s != 13) {
            buffer.insert(data(seq, t0), t0, 0, &mut out);
        }
        // the drain releases one cut-off run per invocation, as the event
        // loop would on successive checks
        for _ in 0..10 {
            if buffer.drain(t0 + Duration::from_secs(1), 0, &mut out) {
                break;
            }
        }
        assert!(buffer.is_empty());
        assert_eq!(buffer.delivered() + buffer.loss(), 20);
    }

    #[test]
    fn reset_forgets_the_stream_position() {
        let mut buffer = ReorderBuffer::new(true);
        let mut out = VecDeque::new();
        for seq in 1..=10 {
            buffer.insert(data(seq, now()), now(), 0, &mut out);
        }
        buffer.insert(data(12, now()), now(), 0, &mut out);
        assert!(!buffer.is_empty());

        buffer.reset();
        assert!(buffer.is_empty());

        // the next packet reseeds min_seqn wherever the stream now is
        out.clear();
        buffer.insert(data(500, now()), now(), 0, &mut out);
        buffer.insert(data(501, now()), now(), 0, &mut out);
        assert_eq!(seqs(&out), vec![500, 501]);
    }
}
