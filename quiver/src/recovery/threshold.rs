// Copyright (C) 2018-2019, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Adaptive loss-detection thresholds.
//!
//! The controller attributes every loss decision to either the duplicate
//! threshold or the delay threshold, and steers both thresholds from
//! symbol-level feedback: when the sender retransmits more than the peer
//! actually loses, the thresholds were too aggressive and are widened; when
//! the peer loses more than the sender retransmits, they are tightened.

use std::time::Duration;
use std::time::Instant;

/// Lower bound of the time threshold (a multiplier on max RTT).
pub const MIN_TIME_THRESHOLD: f64 = 9.0 / 8.0;

/// Upper bound of the time threshold.
pub const MAX_TIME_THRESHOLD: f64 = 5.0;

/// Lower bound of the duplicate (packet reordering) threshold.
pub const MIN_PACKET_THRESHOLD: u64 = 3;

/// Upper bound of the duplicate threshold.
pub const MAX_PACKET_THRESHOLD: u64 = 100;

// Additive increase base.
const BASE: f64 = 3.0;

// Multiplicative decrease base.
const BASE_REDU: f64 = 0.1;

/// Which leg of loss detection declared a packet lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossTrigger {
    /// The packet-number distance to the largest acknowledged packet
    /// exceeded the duplicate threshold.
    Duplicate,

    /// The time since the packet was sent exceeded the delay threshold.
    Delay,
}

/// The adaptive threshold controller.
pub struct ThreshController {
    time_threshold: f64,

    packet_threshold: f64,

    lost_by_duplicate: u64,

    lost_by_delay: u64,

    last_refresh: Instant,

    prev_max_symbol: u64,
}

impl ThreshController {
    pub fn new(now: Instant) -> Self {
        ThreshController {
            time_threshold: MIN_TIME_THRESHOLD,
            packet_threshold: MIN_PACKET_THRESHOLD as f64,
            lost_by_duplicate: 0,
            lost_by_delay: 0,
            last_refresh: now,
            prev_max_symbol: 0,
        }
    }

    /// Records a loss decision for later attribution.
    pub fn on_packet_lost_by(&mut self, trigger: LossTrigger) {
        match trigger {
            LossTrigger::Duplicate => self.lost_by_duplicate += 1,
            LossTrigger::Delay => self.lost_by_delay += 1,
        }
    }

    /// Consumes a symbol-ACK and adjusts both thresholds.
    ///
    /// `sent` and `retrans` are the sender's packet statistics, `srtt` the
    /// current smoothed RTT.
    pub fn update_threshold(
        &mut self, symbols_received: u64, max_symbol_observed: u64, sent: u64,
        retrans: u64, srtt: Duration, now: Instant,
    ) {
        let triggers = self.lost_by_duplicate + self.lost_by_delay;

        if triggers == 0 {
            return;
        }

        let peer_loss_rate = if max_symbol_observed > 0 {
            1.0 - symbols_received as f64 / max_symbol_observed as f64
        } else {
            0.0
        };

        let own_retrans_rate = if sent > retrans {
            retrans as f64 / (sent - retrans) as f64
        } else {
            1.0
        };

        // Number of RTTs the feedback window spans, used to scale the time
        // threshold adjustment to the feedback cadence.
        let delta_symbols =
            max_symbol_observed.saturating_sub(self.prev_max_symbol);
        let delta_t = now.saturating_duration_since(self.last_refresh);

        let nrtt = if delta_t > Duration::ZERO {
            srtt.as_secs_f64() * delta_symbols as f64 / delta_t.as_secs_f64()
        } else {
            0.0
        };

        let p_packet = self.lost_by_duplicate as f64 / triggers as f64;
        let p_time = 1.0 - p_packet;

        if own_retrans_rate > peer_loss_rate {
            // We retransmit more than the peer loses: the thresholds fire
            // too eagerly, widen them.
            if nrtt > 0.0 {
                self.time_threshold += BASE * p_time / nrtt;
            }

            self.packet_threshold += BASE * p_packet;
        } else if own_retrans_rate < peer_loss_rate {
            // The peer loses more than we retransmit: tighten.
            if nrtt > 0.0 {
                self.time_threshold *= 1.0 - BASE_REDU * p_time / nrtt;
            }

            self.packet_threshold *= 1.0 - BASE_REDU * p_packet;
        }

        self.time_threshold = self
            .time_threshold
            .clamp(MIN_TIME_THRESHOLD, MAX_TIME_THRESHOLD);

        self.packet_threshold = self
            .packet_threshold
            .clamp(MIN_PACKET_THRESHOLD as f64, MAX_PACKET_THRESHOLD as f64);

        trace!(
            "threshold update: time={:.4} packet={:.1} peer_loss={:.4} own_retrans={:.4}",
            self.time_threshold,
            self.packet_threshold,
            peer_loss_rate,
            own_retrans_rate,
        );

        self.lost_by_duplicate = 0;
        self.lost_by_delay = 0;
        self.last_refresh = now;
        self.prev_max_symbol = max_symbol_observed;
    }

    /// The current time threshold (multiplier on max RTT).
    pub fn time_threshold(&self) -> f64 {
        self.time_threshold
    }

    /// The current duplicate threshold (packet-number distance).
    pub fn packet_threshold(&self) -> u64 {
        self.packet_threshold as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (ThreshController, Instant) {
        let now = Instant::now();
        (ThreshController::new(now), now)
    }

    #[test]
    fn initial_values() {
        let (thr, _) = controller();
        assert_eq!(thr.time_threshold(), 9.0 / 8.0);
        assert_eq!(thr.packet_threshold(), 3);
    }

    #[test]
    fn no_triggers_no_update() {
        let (mut thr, now) = controller();

        thr.update_threshold(
            95,
            100,
            100,
            10,
            Duration::from_millis(100),
            now + Duration::from_secs(1),
        );

        assert_eq!(thr.time_threshold(), 9.0 / 8.0);
        assert_eq!(thr.packet_threshold(), 3);
    }

    #[test]
    fn own_retrans_above_peer_loss_increases() {
        let (mut thr, now) = controller();

        thr.on_packet_lost_by(LossTrigger::Duplicate);
        thr.on_packet_lost_by(LossTrigger::Delay);

        // peer_loss = 0.05, own_retrans = 10 / 90 = 0.111…
        thr.update_threshold(
            95,
            100,
            100,
            10,
            Duration::from_millis(100),
            now + Duration::from_secs(1),
        );

        assert!(thr.time_threshold() > 9.0 / 8.0);
        assert!(thr.packet_threshold() > 3);

        // Trigger counters were consumed.
        let tt = thr.time_threshold();
        thr.update_threshold(
            95,
            200,
            100,
            10,
            Duration::from_millis(100),
            now + Duration::from_secs(2),
        );
        assert_eq!(thr.time_threshold(), tt);
    }

    #[test]
    fn peer_loss_above_own_retrans_decreases() {
        let (mut thr, now) = controller();

        // Drive the thresholds up first.
        thr.on_packet_lost_by(LossTrigger::Duplicate);
        thr.on_packet_lost_by(LossTrigger::Delay);
        thr.update_threshold(
            95,
            100,
            100,
            10,
            Duration::from_millis(100),
            now + Duration::from_secs(1),
        );

        let tt = thr.time_threshold();
        let pt = thr.packet_threshold();

        // peer_loss = 0.5, own_retrans = 1 / 99.
        thr.on_packet_lost_by(LossTrigger::Duplicate);
        thr.on_packet_lost_by(LossTrigger::Delay);
        thr.update_threshold(
            100,
            200,
            100,
            1,
            Duration::from_millis(100),
            now + Duration::from_secs(2),
        );

        assert!(thr.time_threshold() <= tt);
        assert!(thr.packet_threshold() <= pt);
    }

    #[test]
    fn clamps_hold_for_any_input() {
        let (mut thr, now) = controller();

        for i in 1..200u64 {
            thr.on_packet_lost_by(LossTrigger::Duplicate);
            thr.on_packet_lost_by(LossTrigger::Delay);

            thr.update_threshold(
                95,
                100 * i,
                100,
                50,
                Duration::from_millis(100),
                now + Duration::from_secs(i),
            );

            assert!(thr.time_threshold() >= 9.0 / 8.0);
            assert!(thr.time_threshold() <= 5.0);
            assert!(thr.packet_threshold() >= 3);
            assert!(thr.packet_threshold() <= 100);
        }
    }

    #[test]
    fn packet_threshold_clamps_at_ceiling() {
        let (mut thr, now) = controller();

        // 50 increase-direction updates with all-duplicate triggers push the
        // packet threshold to its ceiling.
        for i in 1..=50u64 {
            thr.on_packet_lost_by(LossTrigger::Duplicate);

            thr.update_threshold(
                95,
                100 * i,
                100,
                10,
                Duration::from_millis(100),
                now + Duration::from_secs(i),
            );
        }

        assert_eq!(thr.packet_threshold(), 100);
    }

    #[test]
    fn duplicate_only_triggers_leave_time_threshold() {
        let (mut thr, now) = controller();

        thr.on_packet_lost_by(LossTrigger::Duplicate);

        // Increase direction with p_time == 0: only the packet threshold
        // moves.
        thr.update_threshold(
            95,
            100,
            100,
            10,
            Duration::from_millis(100),
            now + Duration::from_secs(1),
        );

        assert_eq!(thr.time_threshold(), 9.0 / 8.0);
        assert!(thr.packet_threshold() > 3);

        // Decrease direction with p_time == 0: the time threshold does not
        // decrease either.
        thr.on_packet_lost_by(LossTrigger::Duplicate);
        let tt = thr.time_threshold();
        thr.update_threshold(
            100,
            200,
            100,
            1,
            Duration::from_millis(100),
            now + Duration::from_secs(2),
        );
        assert_eq!(thr.time_threshold(), tt);
    }

    #[test]
    fn delay_only_triggers_leave_packet_threshold() {
        let (mut thr, now) = controller();

        thr.on_packet_lost_by(LossTrigger::Delay);

        thr.update_threshold(
            95,
            100,
            100,
            10,
            Duration::from_millis(100),
            now + Duration::from_secs(1),
        );

        // p_packet == 0 so the packet threshold is untouched.
        assert_eq!(thr.packet_threshold(), 3);
        assert!(thr.time_threshold() > 9.0 / 8.0);
    }
}
