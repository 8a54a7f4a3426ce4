// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-tunnel receive sequence vector.
//!
//! A 64 bit bitmap tracks the most recent tun sequence numbers seen on a
//! tunnel: bit 0 is `seq_last`, bit `n` is `seq_last - n`. Advancing the
//! window shifts the vector; any zero bit pushed past the tolerated
//! reordering depth is a confirmed hole and is reported as a loss run so a
//! single RESEND can cover the whole gap.

use core::mem;

/// Width of the tracked window: `seq_last` plus the 63 preceding sequences
const WINDOW_WIDTH: u64 = mem::size_of::<u64>() as u64 * 8;

/// Upper bound for the tolerated reordering depth
pub const MAX_REORDER_LENGTH: u32 = (WINDOW_WIDTH - 1) as u32;

/// A contiguous run of confirmed-lost tun sequence numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LossRun {
    pub start: u64,
    pub len: u32,
}

#[derive(Clone, Debug)]
pub struct SeqWindow {
    /// Highest tun sequence seen, the right edge of the window
    seq_last: u64,
    /// Bitmap of the window; all-ones means no outstanding hole
    seq_vect: u64,
    /// Currently tolerated reordering depth
    reorder_length: u32,
    /// Configured floor for `reorder_length`
    reorder_length_preset: u32,
    /// Largest depth observed since the last reset
    reorder_length_max: u32,
    /// Possible packets observed in the current averaging window
    loss_cnt: u64,
    /// Confirmed losses in the current averaging window
    loss_event: u64,
}

impl SeqWindow {
    pub fn new(reorder_length_preset: u32) -> Self {
        let preset = reorder_length_preset.min(MAX_REORDER_LENGTH);
        Self {
            seq_last: 0,
            seq_vect: u64::MAX,
            reorder_length: preset,
            reorder_length_preset: preset,
            reorder_length_max: 0,
            loss_cnt: 0,
            loss_event: 0,
        }
    }

    #[inline]
    pub fn seq_last(&self) -> u64 {
        self.seq_last
    }

    #[inline]
    pub fn reorder_length(&self) -> u32 {
        self.reorder_length
    }

    /// True when no hole is outstanding anywhere in the window
    #[inline]
    pub fn is_pristine(&self) -> bool {
        self.seq_vect == u64::MAX
    }

    /// Advances the window with a received tun sequence number.
    ///
    /// Returns the loss runs confirmed by this arrival; each should be
    /// covered by one RESEND request.
    pub fn on_sequence(&mut self, seq: u64) -> Vec<LossRun> {
        let mut runs = Vec::new();

        if seq >= self.seq_last.wrapping_add(WINDOW_WIDTH) {
            // far ahead of the window, treat as a connection reset
            self.seq_vect = u64::MAX;
            self.seq_last = seq;
            self.loss_cnt += 1;
        } else if seq > self.seq_last {
            let threshold = self.reorder_length + 1;
            let mut len = 0u32;
            let mut start = 0u64;
            for i in 0..seq - self.seq_last {
                self.loss_cnt += 1;
                if !self.bit(threshold) {
                    // a zero falls past the reorder depth: confirmed hole
                    self.loss_event += 1;
                    len += 1;
                } else {
                    if len > 0 {
                        runs.push(self.run(start, len, threshold));
                        len = 0;
                    }
                    // the next hole (if any) starts after this survivor
                    start = i + 1;
                }
                self.seq_vect <<= 1;
            }
            if len > 0 {
                runs.push(self.run(start, len, threshold));
            }
            self.seq_vect |= 1;
            self.seq_last = seq;
        } else if self.seq_last - seq < WINDOW_WIDTH {
            // out-of-order arrival within the window
            self.loss_cnt += 1;
            let behind = self.seq_last - seq;
            self.seq_vect |= 1 << behind;
            if (self.reorder_length as u64) < behind {
                // previously counted as a loss, but it showed up after all
                self.loss_event = self.loss_event.saturating_sub(1);
            }
            let depth = (behind + 1).min(MAX_REORDER_LENGTH as u64) as u32;
            if self.reorder_length <= depth {
                self.reorder_length = depth;
                if depth > self.reorder_length_max {
                    self.reorder_length_max = depth;
                }
            }
        } else {
            // far behind the window, assume a sequence wrap
            self.seq_vect = u64::MAX;
            self.seq_last = seq;
            self.loss_cnt += 1;
        }

        runs
    }

    #[inline]
    fn run(&self, start: u64, len: u32, threshold: u32) -> LossRun {
        LossRun {
            start: self
                .seq_last
                .wrapping_add(start)
                .wrapping_sub(threshold as u64),
            len,
        }
    }

    /// Bit `index` of the vector; positions beyond the window read as set so
    /// an unobservable hole is never reported
    #[inline]
    fn bit(&self, index: u32) -> bool {
        match 1u64.checked_shl(index) {
            Some(mask) => self.seq_vect & mask != 0,
            None => true,
        }
    }

    /// Folds the averaging window into a loss percentage.
    ///
    /// A window with traffic reports `100·loss_event/loss_cnt`; a silent
    /// window is 100% lossy unless the link is healthy and saw no losses.
    pub fn fold_loss(&mut self, link_healthy: bool) -> f64 {
        let loss_av = if self.loss_cnt > 0 {
            (self.loss_event as f64 * 100.0) / self.loss_cnt as f64
        } else if self.loss_event > 0 || !link_healthy {
            100.0
        } else {
            0.0
        };
        self.loss_event = 0;
        self.loss_cnt = 0;
        loss_av
    }

    /// Relaxes the reordering depth toward its preset; called once per
    /// bandwidth tick while the vector is pristine
    pub fn decay_reorder_length(&mut self) {
        if self.is_pristine() && self.reorder_length > self.reorder_length_preset {
            self.reorder_length -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> SeqWindow {
        SeqWindow::new(0)
    }

    /// Runs a sequence of arrivals and returns every emitted loss run
    fn advance(w: &mut SeqWindow, seqs: &[u64]) -> Vec<LossRun> {
        seqs.iter().flat_map(|seq| w.on_sequence(*seq)).collect()
    }

    #[test]
    fn in_order_is_clean() {
        let mut w = window();
        let runs = advance(&mut w, &(1..=200).collect::<Vec<_>>());
        assert!(runs.is_empty());
        assert!(w.is_pristine());
        assert_eq!(w.seq_last(), 200);
        assert_eq!(w.fold_loss(true), 0.0);
    }

    #[test]
    fn single_hole_is_reported_once() {
        let mut w = window();
        advance(&mut w, &[1, 2, 3]);
        // 4 is lost; with reorder_length = 0 the hole is confirmed once it
        // passes bit 1
        let runs = advance(&mut w, &[5, 6]);
        assert_eq!(runs, vec![LossRun { start: 4, len: 1 }]);
        assert!(!w.is_pristine());
    }

    #[test]
    fn burst_hole_yields_one_run() {
        let mut w = window();
        advance(&mut w, &[1, 2]);
        // 3..=7 lost
        let runs = advance(&mut w, &[8, 9]);
        let total: u32 = runs.iter().map(|r| r.len).sum();
        assert_eq!(total, 5);
        assert_eq!(runs[0].start, 3);
    }

    #[test]
    fn reordering_within_depth_is_not_loss() {
        let mut w = SeqWindow::new(4);
        advance(&mut w, &[1, 2, 3]);
        // 4 and 5 swap; depth 2 < reorder_length + 1, no loss confirmed
        let runs = advance(&mut w, &[5, 4, 6, 7]);
        assert!(runs.is_empty());
        assert!(w.is_pristine());
        assert_eq!(w.fold_loss(true), 0.0);
    }

    #[test]
    fn late_arrival_takes_back_the_loss_event() {
        let mut w = window();
        advance(&mut w, &[1, 2, 3]);
        let runs = advance(&mut w, &[5, 6]);
        assert_eq!(runs.len(), 1);
        // 4 arrives late, outside the (zero) reorder depth
        let late = w.on_sequence(4);
        assert!(late.is_empty());
        assert!(w.is_pristine());
        // the loss was rescinded and the depth grew to cover the swap
        assert_eq!(w.fold_loss(true), 0.0);
        assert_eq!(w.reorder_length(), 3);
    }

    #[test]
    fn depth_is_capped_at_63() {
        let mut w = window();
        w.on_sequence(100);
        w.on_sequence(163);
        assert!(w.reorder_length() <= MAX_REORDER_LENGTH);
        w.on_sequence(101);
        assert_eq!(w.reorder_length(), MAX_REORDER_LENGTH);
    }

    #[test]
    fn jump_of_63_keeps_the_window() {
        let mut w = window();
        w.on_sequence(100);
        assert!(w.is_pristine());
        let runs = w.on_sequence(163);
        // shifted through, all holes confirmed against a pristine history:
        // the vector was all-ones, so the zero bits shifted in by 100 were
        // real history and everything between 100 and 163 is a hole
        assert!(!runs.is_empty());
        assert_eq!(w.seq_last(), 163);
        assert!(!w.is_pristine());
    }

    #[test]
    fn jump_of_64_resets() {
        let mut w = window();
        w.on_sequence(100);
        let runs = w.on_sequence(164);
        assert!(runs.is_empty());
        assert_eq!(w.seq_last(), 164);
        assert!(w.is_pristine());
    }

    #[test]
    fn ancient_sequence_resets() {
        let mut w = window();
        w.on_sequence(1000);
        let runs = w.on_sequence(100);
        assert!(runs.is_empty());
        assert_eq!(w.seq_last(), 100);
        assert!(w.is_pristine());
    }

    #[test]
    fn loss_accounting_folds() {
        let mut w = window();
        advance(&mut w, &[1, 2]);
        advance(&mut w, &[4, 5]); // 3 lost
        let loss = w.fold_loss(true);
        assert!(loss > 0.0);
        // counters reset after folding
        assert_eq!(w.fold_loss(true), 0.0);
        // a silent window on an unhealthy link reads as full loss
        assert_eq!(w.fold_loss(false), 100.0);
    }

    #[test]
    fn decay_requires_pristine() {
        let mut w = SeqWindow::new(1);
        advance(&mut w, &[1, 2, 3]);
        advance(&mut w, &[6, 4]); // grow depth via reordering
        let grown = w.reorder_length();
        assert!(grown > 1);

        // 5 is still missing, no decay
        assert!(!w.is_pristine());
        w.decay_reorder_length();
        assert_eq!(w.reorder_length(), grown);

        w.on_sequence(5);
        assert!(w.is_pristine());
        w.decay_reorder_length();
        assert_eq!(w.reorder_length(), grown - 1);
    }

    #[test]
    fn sequence_never_panics() {
        bolero::check!()
            .with_type::<Vec<u16>>()
            .for_each(|seqs: &Vec<u16>| {
                let mut w = SeqWindow::new(4);
                for seq in seqs {
                    w.on_sequence(*seq as u64);
                }
                let _ = w.fold_loss(true);
            });
    }
}
