// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bandwidth measurement and the per-tunnel rate controller.
//!
//! A global tick fires every [`AVTIME`]. Per tunnel it refreshes the quota
//! allowance, folds the RTT and loss windows, measures delivered bandwidth
//! and hunts the usable rate: grow by 5% while the peer reports the link
//! clean, back off to 80% of what the peer actually received once it
//! reports loss.

use crate::{time::Timestamp, tunnel::Tunnel};
use core::time::Duration;

/// Averaging window; long enough to make sensible averages
pub const AVTIME: Duration = Duration::from_secs(3);

pub const AVTIME_SECS: f64 = 3.0;

/// Aggregate egress bandwidth over the current window
#[derive(Debug, Default)]
pub(crate) struct GlobalBandwidth {
    last_adjust: Option<Timestamp>,
    bytes: u64,
    /// Last measured aggregate, kbit/s
    pub(crate) bandwidth: f64,
}

impl GlobalBandwidth {
    #[inline]
    pub(crate) fn accumulate(&mut self, len: usize) {
        self.bytes += len as u64;
    }

    /// Closes the measuring window. Returns the elapsed window length in
    /// seconds once at least [`AVTIME`] passed, `None` before that.
    pub(crate) fn tick(&mut self, now: Timestamp) -> Option<f64> {
        let last = match self.last_adjust {
            Some(last) => last,
            None => {
                self.last_adjust = Some(now);
                return None;
            }
        };
        let elapsed = (now - last).as_secs_f64();
        if elapsed < AVTIME_SECS {
            return None;
        }
        self.last_adjust = Some(now);
        self.bandwidth = (self.bytes as f64 * 8.0 / elapsed) / 1000.0;
        self.bytes = 0;
        Some(elapsed)
    }
}

/// Applies one controller window to a tunnel
pub(crate) fn adjust_tunnel(t: &mut Tunnel, elapsed: f64) {
    // quota allowance refill, bytes
    if t.config.quota > 0 {
        t.permitted += (t.config.quota as f64 * elapsed) as i64;
    }

    t.rtt.fold_window();

    t.bandwidth_measured = (t.bm_data as f64 * 8.0 / elapsed) / 1000.0;
    t.bm_data = 0;

    t.loss_av = t.window.fold_loss(t.state.is_auth_ok());

    if t.sent_loss == 0.0 {
        // hunt a high watermark with slow drift
        if t.bandwidth_out > t.bandwidth_max {
            t.bandwidth_max = t.bandwidth_out;
        }
        if t.bandwidth < t.bandwidth_max {
            t.bandwidth *= 1.05;
        }
    } else if t.bandwidth_out > t.bandwidth_max / 4.0 {
        t.bandwidth = t.bandwidth_out * 0.8;
        if t.bandwidth_max > 100.0 {
            t.bandwidth_max = (t.bandwidth_max * 9.0 + t.bandwidth) / 10.0;
        }
    }

    t.window.decay_reorder_length();
}
