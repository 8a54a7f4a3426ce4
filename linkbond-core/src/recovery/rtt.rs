// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc6298#section-2
//# When the first RTT measurement R is made, the host MUST set
//# SRTT <- R, RTTVAR <- R/2
//
// We deviate deliberately: links come up with a conservative 40 ms seed and
// only trust the estimator after a short warm-up, since the first samples on
// a freshly bonded path routinely include handshake queuing noise.
pub const INITIAL_SRTT: Duration = Duration::from_millis(40);

const INITIAL_RTTVAR: Duration = Duration::from_millis(5);

/// Samples above this are discarded; they are produced by peers that were
/// suspended or by replies held across a link outage, not by the path.
pub const MAX_SAMPLE: Duration = Duration::from_millis(5000);

const WARMUP_SAMPLES: u32 = 10;

/// Smoothed RTT state for one tunnel, RFC 6298 shaped.
///
/// All values are in milliseconds. `srtt_av` is the windowed mean published
/// to the reorder buffer and the timeout checks; it is folded once per
/// bandwidth tick.
#[derive(Clone, Debug)]
pub struct RttEstimator {
    /// Exponentially-weighted moving average, α = 1/8
    srtt: f64,
    /// Variance of observed samples, β = 1/4
    rttvar: f64,
    /// Most recent accepted sample
    srtt_raw: f64,
    /// Number of samples consumed by the warm-up
    rtt_hit: u32,
    /// Published windowed average
    srtt_av: f64,
    av_sum: f64,
    av_count: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: INITIAL_SRTT.as_millis() as f64,
            rttvar: INITIAL_RTTVAR.as_millis() as f64,
            srtt_raw: 0.0,
            rtt_hit: 0,
            srtt_av: INITIAL_SRTT.as_millis() as f64,
            av_sum: 0.0,
            av_count: 0,
        }
    }
}

impl RttEstimator {
    #[inline]
    pub fn smoothed_rtt(&self) -> f64 {
        self.srtt
    }

    #[inline]
    pub fn rttvar(&self) -> f64 {
        self.rttvar
    }

    #[inline]
    pub fn latest(&self) -> f64 {
        self.srtt_raw
    }

    /// The windowed average, in milliseconds
    #[inline]
    pub fn srtt_av(&self) -> f64 {
        self.srtt_av
    }

    /// The windowed average as a `Duration`
    #[inline]
    pub fn srtt_av_duration(&self) -> Duration {
        Duration::from_micros((self.srtt_av.max(0.0) * 1000.0) as u64)
    }

    /// Feeds an accepted sample (milliseconds).
    ///
    /// The caller is responsible for the acceptance gate: samples are only
    /// valid when below [`MAX_SAMPLE`] and the tunnel's sequence vector is
    /// pristine (any in-flight loss skews the echo delay).
    pub fn on_sample(&mut self, r: f64) {
        self.srtt_raw = r;
        if self.rtt_hit < WARMUP_SAMPLES {
            self.srtt = INITIAL_SRTT.as_millis() as f64;
            self.rttvar = 0.0;
            self.rtt_hit += 1;
        } else {
            //= https://www.rfc-editor.org/rfc/rfc6298#section-2
            //# RTTVAR <- (1 - beta) * RTTVAR + beta * |SRTT - R'|
            //# SRTT <- (1 - alpha) * SRTT + alpha * R'
            const ALPHA: f64 = 1.0 / 8.0;
            const BETA: f64 = 1.0 / 4.0;
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (self.srtt - r).abs();
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * r;
        }
        self.av_sum += self.srtt_raw + 4.0 * self.rttvar;
        self.av_count += 1;
    }

    /// Folds the window: publishes the mean of the samples collected since
    /// the last fold and reseeds the window with `srtt_raw + 4·rttvar` so a
    /// quiet window still reports a sane value.
    pub fn fold_window(&mut self) {
        if self.av_count > 0 {
            self.srtt_av = self.av_sum / self.av_count as f64;
        }
        self.av_sum = self.srtt_raw + 4.0 * self.rttvar;
        self.av_count = 1;
    }

    /// Called when the tunnel comes up; the published average restarts from
    /// the seed and the window is emptied.
    pub fn reset_up(&mut self) {
        self.srtt_av = INITIAL_SRTT.as_millis() as f64;
        self.av_sum = 0.0;
        self.av_count = 0;
    }

    /// Called when the tunnel goes down
    pub fn reset_down(&mut self) {
        self.srtt_av = 0.0;
        self.srtt_raw = 0.0;
        self.av_sum = 0.0;
        self.av_count = 0;
    }
}
