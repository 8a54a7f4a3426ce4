// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Egress scheduling: weight computation, weighted round-robin and the
//! fallback-mode switch.
//!
//! Weights are recomputed on every bandwidth tick and on any status change.
//! With bandwidth figures for every link the share is proportional to each
//! link's usable rate, derated by the loss its peer reports, and capped at
//! five times the currently observed aggregate so dormant capacity is still
//! probed. Without bandwidth data the scheduler falls back to sharing
//! inversely proportional to smoothed RTT.

use crate::tunnel::Tunnel;
use tracing::debug;

/// Aggregate capacity target, as a multiple of the observed bandwidth
const BANDWIDTH_HEADROOM: f64 = 5.0;

/// Recomputes every tunnel's weight.
///
/// `global_bandwidth` is the aggregate egress rate of the last window in
/// kbit/s.
pub(crate) fn recalc_weights(tunnels: &mut [Tunnel], global_bandwidth: f64) {
    if global_bandwidth <= 0.0 {
        // no traffic yet, share by RTT for the fastest pickup
        return recalc_weights_srtt(tunnels);
    }

    let bwneeded = global_bandwidth * BANDWIDTH_HEADROOM;
    let mut bwavailable = 0.0;

    for i in 0..tunnels.len() {
        let t = &mut tunnels[i];
        if t.bandwidth == 0.0 {
            // we need every link's rate to share by bandwidth
            return recalc_weights_srtt(tunnels);
        }

        if bwavailable > 2.0 * bwneeded {
            // demand is covered; keep a probing share on healthy links
            t.weight = if t.quota_ok() && t.state.is_auth_ok() {
                bwneeded / 50.0
            } else {
                0.0
            };
            continue;
        }

        // aim at half the loss at which the link would be declared lossy
        let lt = t.config.loss_tolerence as f64 / 2.0;
        let part = ((lt - t.sent_loss) / lt).max(0.0);

        if t.config.quota == 0 && t.state.is_auth_ok() {
            t.weight = t.bandwidth * part;
            bwavailable += t.weight;
        } else {
            let remaining = bwneeded - bwavailable;
            if remaining > 0.0 && t.quota_ok() && t.state.is_auth_ok() {
                // quota-limited links only fill the remaining demand
                t.weight = (t.bandwidth).min(remaining) * part;
                bwavailable += t.weight;
            } else if t.quota_ok() && t.state.is_auth_ok() {
                t.weight = bwneeded / 50.0;
            } else {
                t.weight = 0.0;
            }
        }
    }

    if bwavailable == 0.0 {
        recalc_weights_srtt(tunnels);
    }
}

/// Bootstrap regime: weight inversely proportional to smoothed RTT,
/// normalized so the weights sum to 100 and clamped to [1, 100]
fn recalc_weights_srtt(tunnels: &mut [Tunnel]) {
    let totalsrtt: f64 = tunnels.iter().map(|t| t.rtt.smoothed_rtt()).sum();
    let totalf: f64 = tunnels
        .iter()
        .filter(|t| t.rtt.smoothed_rtt() > 0.0)
        .map(|t| totalsrtt / t.rtt.smoothed_rtt())
        .sum();

    for t in tunnels.iter_mut() {
        let srtt = t.rtt.smoothed_rtt();
        if srtt > 0.0 && totalf > 0.0 {
            t.weight = ((totalsrtt * 100.0) / (srtt * totalf)).clamp(1.0, 100.0);
            debug!(tunnel = %t.name(), weight = t.weight, "srtt weight");
        }
    }
}

/// Restarts the round-robin accumulators; invoked on any status or
/// fallback-mode change
pub(crate) fn reset_wrr(tunnels: &mut [Tunnel]) {
    for t in tunnels.iter_mut() {
        t.wrr_credit = 0.0;
    }
}

/// Whether a tunnel participates in the round-robin
#[inline]
fn eligible(t: &Tunnel, fallback_mode: bool) -> bool {
    t.weight > 0.0 && t.state.is_up() && t.config.fallback_only == fallback_mode
}

/// Smooth weighted round-robin over the eligible tunnels
pub(crate) fn choose(tunnels: &mut [Tunnel], fallback_mode: bool) -> Option<usize> {
    let total: f64 = tunnels
        .iter()
        .filter(|t| eligible(t, fallback_mode))
        .map(|t| t.weight)
        .sum();
    if total <= 0.0 {
        return None;
    }

    let mut best: Option<usize> = None;
    let mut best_credit = f64::NEG_INFINITY;
    for (i, t) in tunnels.iter_mut().enumerate() {
        if !eligible(t, fallback_mode) {
            continue;
        }
        t.wrr_credit += t.weight;
        if t.wrr_credit > best_credit {
            best_credit = t.wrr_credit;
            best = Some(i);
        }
    }

    let winner = best?;
    tunnels[winner].wrr_credit -= total;
    Some(winner)
}

/// The AuthOK tunnel best suited for control traffic and retransmits: low
/// reported loss and the shortest high-priority queue
pub(crate) fn best_quick(tunnels: &[Tunnel], except: Option<usize>) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, t) in tunnels.iter().enumerate() {
        if Some(i) == except {
            continue;
        }
        if !t.state.is_auth_ok() {
            continue;
        }
        if t.sent_loss >= t.config.loss_tolerence as f64 / 4.0 {
            continue;
        }
        if best.map_or(true, |b| t.hpsbuf.len() < tunnels[b].hpsbuf.len()) {
            best = Some(i);
        }
    }
    best
}

/// Fallback mode is active iff every non-fallback tunnel is lossy or down
/// and at least one fallback tunnel is healthy
pub(crate) fn fallback_mode(tunnels: &[Tunnel]) -> bool {
    let primaries_out = tunnels
        .iter()
        .all(|t| t.config.fallback_only || !t.state.is_auth_ok());
    let fallback_ready = tunnels
        .iter()
        .any(|t| t.config.fallback_only && t.state.is_auth_ok());
    primaries_out && fallback_ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{State, TunnelConfig};

    fn tunnel(name: &str, weight: f64, state: State) -> Tunnel {
        let mut t = Tunnel::new(TunnelConfig {
            name: name.into(),
            server_mode: false,
            bind_addr: None,
            bind_port: None,
            bind_dev: None,
            bind_fib: 0,
            dest_addr: Some("192.0.2.1".into()),
            dest_port: Some(5080),
            bandwidth_max: 1_000,
            loss_tolerence: 50,
            quota: 0,
            reorder_length: 1,
            timeout: 60,
            fallback_only: false,
        });
        t.weight = weight;
        t.state = state;
        t
    }

    fn choices(tunnels: &mut [Tunnel], rounds: usize) -> Vec<usize> {
        let mut picks = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            picks.push(choose(tunnels, false).expect("a tunnel is eligible"));
        }
        picks
    }

    #[test]
    fn equal_weights_split_evenly() {
        let mut tunnels = vec![
            tunnel("a", 50.0, State::AuthOk),
            tunnel("b", 50.0, State::AuthOk),
        ];
        let picks = choices(&mut tunnels, 1000);
        let a = picks.iter().filter(|p| **p == 0).count();
        assert_eq!(a, 500);
    }

    #[test]
    fn weighted_split_follows_the_ratio() {
        let mut tunnels = vec![
            tunnel("fast", 75.0, State::AuthOk),
            tunnel("slow", 25.0, State::AuthOk),
        ];
        let picks = choices(&mut tunnels, 1000);
        let fast = picks.iter().filter(|p| **p == 0).count();
        assert_eq!(fast, 750);
    }

    #[test]
    fn lossy_tunnels_keep_their_turn_only_with_weight() {
        let mut tunnels = vec![
            tunnel("a", 50.0, State::AuthOk),
            tunnel("b", 0.0, State::Lossy),
        ];
        let picks = choices(&mut tunnels, 10);
        assert!(picks.iter().all(|p| *p == 0));
    }

    #[test]
    fn no_eligible_tunnel_yields_none() {
        let mut tunnels = vec![
            tunnel("a", 50.0, State::Disconnected),
            tunnel("b", 0.0, State::AuthOk),
        ];
        assert_eq!(choose(&mut tunnels, false), None);
    }

    #[test]
    fn fallback_mode_inverts_the_pool() {
        let mut tunnels = vec![
            tunnel("main", 50.0, State::Lossy),
            tunnel("backup", 50.0, State::AuthOk),
        ];
        tunnels[1].config.fallback_only = true;

        assert!(fallback_mode(&tunnels));
        assert_eq!(choose(&mut tunnels, true), Some(1));

        // a recovering primary leaves fallback mode
        tunnels[0].state = State::AuthOk;
        assert!(!fallback_mode(&tunnels));
        assert_eq!(choose(&mut tunnels, false), Some(0));
    }

    #[test]
    fn fallback_requires_a_healthy_backup() {
        let mut tunnels = vec![
            tunnel("main", 50.0, State::Disconnected),
            tunnel("backup", 50.0, State::Lossy),
        ];
        tunnels[1].config.fallback_only = true;
        assert!(!fallback_mode(&tunnels));
    }

    #[test]
    fn bandwidth_regime_derates_by_reported_loss() {
        let mut tunnels = vec![
            tunnel("clean", 0.0, State::AuthOk),
            tunnel("noisy", 0.0, State::AuthOk),
        ];
        tunnels[0].bandwidth = 1_000.0;
        tunnels[1].bandwidth = 1_000.0;
        tunnels[1].sent_loss = 12.5; // half of loss_tolerence/2

        recalc_weights(&mut tunnels, 100.0);
        assert_eq!(tunnels[0].weight, 1_000.0);
        assert_eq!(tunnels[1].weight, 500.0);
    }

    #[test]
    fn non_auth_ok_tunnels_get_no_weight() {
        let mut tunnels = vec![
            tunnel("up", 0.0, State::AuthOk),
            tunnel("down", 0.0, State::Disconnected),
        ];
        tunnels[0].bandwidth = 1_000.0;
        tunnels[1].bandwidth = 1_000.0;
        tunnels[1].config.quota = 1; // route it through the capped branch

        recalc_weights(&mut tunnels, 100.0);
        assert!(tunnels[0].weight > 0.0);
        assert_eq!(tunnels[1].weight, 0.0);
    }

    #[test]
    fn quota_exhausted_tunnels_get_no_weight() {
        let mut tunnels = vec![
            tunnel("free", 0.0, State::AuthOk),
            tunnel("metered", 0.0, State::AuthOk),
        ];
        tunnels[0].bandwidth = 1_000.0;
        tunnels[1].bandwidth = 1_000.0;
        tunnels[1].config.quota = 100;
        tunnels[1].permitted = 0; // exhausted

        recalc_weights(&mut tunnels, 100.0);
        assert_eq!(tunnels[1].weight, 0.0);
        // and the round robin never selects it
        for _ in 0..10 {
            assert_eq!(choose(&mut tunnels, false), Some(0));
        }
    }

    #[test]
    fn srtt_regime_prefers_faster_links() {
        let mut tunnels = vec![
            tunnel("fast", 0.0, State::AuthOk),
            tunnel("slow", 0.0, State::AuthOk),
        ];
        // drive the estimators past warm-up
        for _ in 0..11 {
            tunnels[0].rtt.on_sample(20.0);
            tunnels[1].rtt.on_sample(80.0);
        }

        // no global bandwidth yet: the srtt regime kicks in
        recalc_weights(&mut tunnels, 0.0);
        assert!(tunnels[0].weight > tunnels[1].weight);
        let sum = tunnels[0].weight + tunnels[1].weight;
        assert!((sum - 100.0).abs() < 1.0);
    }

    #[test]
    fn srtt_weights_are_clamped() {
        let mut tunnels = vec![
            tunnel("a", 0.0, State::AuthOk),
            tunnel("b", 0.0, State::AuthOk),
        ];
        for _ in 0..11 {
            tunnels[0].rtt.on_sample(1.0);
        }
        for _ in 0..11 {
            for t in tunnels.iter_mut() {
                t.rtt.on_sample(t.rtt.smoothed_rtt());
            }
        }
        recalc_weights(&mut tunnels, 0.0);
        for t in &tunnels {
            assert!(t.weight >= 1.0);
            assert!(t.weight <= 100.0);
        }
    }

    #[test]
    fn best_quick_prefers_short_queues_and_low_loss() {
        let now = crate::time::Timestamp::default();
        let mut tunnels = vec![
            tunnel("busy", 10.0, State::AuthOk),
            tunnel("quiet", 10.0, State::AuthOk),
            tunnel("lossy", 10.0, State::AuthOk),
        ];
        tunnels[0].push_hpsbuf(crate::packet::Packet::control(
            crate::packet::PacketKind::Keepalive,
            vec![],
            now,
        ));
        tunnels[2].sent_loss = 20.0; // >= loss_tolerence / 4

        assert_eq!(best_quick(&tunnels, None), Some(1));
        // excluding the winner falls back to the queued one
        assert_eq!(best_quick(&tunnels, Some(1)), Some(0));
        // a down tunnel is never considered
        tunnels[1].state = State::Disconnected;
        assert_eq!(best_quick(&tunnels, None), Some(0));
    }
}
