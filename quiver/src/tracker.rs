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

//! Received-packet bookkeeping and ACK/RECOVERED frame production.

use std::time::Duration;
use std::time::Instant;

use crate::frame;
use crate::ranges;

use crate::Config;
use crate::Error;
use crate::Result;

/// Tracks the packet numbers received on one path, in two parallel
/// histories: packets that arrived normally and packets obtained through
/// FEC recovery.
///
/// ACK frames are queued immediately when the peer needs to hear quickly
/// (first packet, reported-missing arrivals, new gaps, enough
/// retransmittable packets) and otherwise batched behind a short alarm.
/// RECOVERED frames follow the same structure against the recovered
/// history.
pub struct ReceivedPacketTracker {
    largest_observed: u64,

    largest_observed_time: Option<Instant>,

    lower_limit: u64,

    history: ranges::RangeSet,

    recovered_history: ranges::RangeSet,

    ack_send_delay: Duration,

    packets_since_last_ack: usize,

    packets_since_last_recovered: usize,

    retransmittable_since_last_ack: usize,

    ack_queued: bool,

    recovered_queued: bool,

    ack_alarm: Option<Instant>,

    recovered_alarm: Option<Instant>,

    // Largest acked of the last ACK frame handed out, if any.
    last_ack_largest: Option<u64>,

    last_recovered_largest: Option<u64>,

    // When set, recovered packets fold into the normal history and no
    // RECOVERED frames are produced.
    disable_recovered_frames: bool,

    legacy: bool,

    packets: u64,

    recovered_packets: u64,

    // Reordering observed on this path, reported back to the sender in RD
    // frames so it can widen its loss thresholds.
    max_displacement: u16,

    max_delay: Duration,

    rd_pending: bool,
}

impl ReceivedPacketTracker {
    pub fn new(config: &Config) -> Self {
        ReceivedPacketTracker {
            largest_observed: 0,
            largest_observed_time: None,
            lower_limit: 0,
            history: ranges::RangeSet::new(crate::MAX_TRACKED_ACK_RANGES),
            recovered_history: ranges::RangeSet::new(
                crate::MAX_TRACKED_ACK_RANGES,
            ),
            ack_send_delay: config.max_ack_delay,
            packets_since_last_ack: 0,
            packets_since_last_recovered: 0,
            retransmittable_since_last_ack: 0,
            ack_queued: false,
            recovered_queued: false,
            ack_alarm: None,
            recovered_alarm: None,
            last_ack_largest: None,
            last_recovered_largest: None,
            disable_recovered_frames: config.disable_fec_recovered_frames,
            legacy: config.is_legacy(),
            packets: 0,
            recovered_packets: 0,
            max_displacement: 0,
            max_delay: Duration::ZERO,
            rd_pending: false,
        }
    }

    /// Records a received packet.
    ///
    /// `should_instigate_ack` is set for packets whose content the peer
    /// retransmits (or packets carrying only repair frames, which may be
    /// the sole traffic on a path). `recovered` marks packets re-injected
    /// by the FEC receiver rather than received from the network.
    pub fn on_packet_received(
        &mut self, pkt_num: u64, should_instigate_ack: bool, recovered: bool,
        now: Instant,
    ) -> Result<()> {
        if pkt_num == 0 {
            return Err(Error::InvalidPacketNumber);
        }

        self.packets += 1;

        if recovered {
            self.recovered_packets += 1;
        }

        if pkt_num > self.largest_observed {
            self.largest_observed = pkt_num;
            self.largest_observed_time = Some(now);
        } else if !recovered &&
            pkt_num > self.lower_limit &&
            !self.history.contains(pkt_num)
        {
            // A network arrival below the largest observed packet is
            // reordering; remember the worst displacement and delay for
            // the next RD frame.
            let displacement = self.largest_observed - pkt_num;

            self.max_displacement = self
                .max_displacement
                .max(displacement.min(u64::from(u16::MAX)) as u16);

            if let Some(t) = self.largest_observed_time {
                self.max_delay =
                    self.max_delay.max(now.saturating_duration_since(t));
            }

            self.rd_pending = true;
        }

        // Packets at or below the stop-waiting limit are counted but not
        // tracked.
        if pkt_num <= self.lower_limit {
            return Ok(());
        }

        if self.disable_recovered_frames || !recovered {
            self.history.push_item(pkt_num)?;
            self.maybe_queue_ack(pkt_num, should_instigate_ack, now);
        } else {
            self.recovered_history.push_item(pkt_num)?;
            self.maybe_queue_recovered(pkt_num, now);
        }

        Ok(())
    }

    /// Drops tracked packet numbers at or below `pkt_num` from both
    /// histories, typically on a STOP_WAITING from the peer.
    pub fn set_lower_limit(&mut self, pkt_num: u64) {
        self.lower_limit = pkt_num;
        self.history.remove_until(pkt_num);
        self.recovered_history.remove_until(pkt_num);
    }

    /// Returns an ACK frame when one is due, either because it was queued
    /// immediately or because the ACK alarm expired.
    pub fn get_ack_frame(&mut self, now: Instant) -> Option<frame::Frame> {
        if !self.ack_queued && !alarm_expired(self.ack_alarm, now) {
            return None;
        }

        if self.history.is_empty() {
            self.ack_queued = false;
            return None;
        }

        let frame = frame::Frame::ACK {
            ack_delay: self.pending_ack_delay(now),
            ranges: self.history.clone(),
        };

        self.last_ack_largest = self.history.last();
        self.ack_alarm = None;
        self.ack_queued = false;
        self.packets_since_last_ack = 0;
        self.retransmittable_since_last_ack = 0;

        Some(frame)
    }

    /// Returns a RECOVERED frame when one is due, mirroring the ACK policy
    /// against the recovered history.
    pub fn get_recovered_frame(&mut self, now: Instant) -> Option<frame::Frame> {
        if !self.recovered_queued && !alarm_expired(self.recovered_alarm, now) {
            return None;
        }

        if self.recovered_history.is_empty() {
            self.recovered_queued = false;
            return None;
        }

        let frame = frame::Frame::Recovered {
            ranges: self.recovered_history.clone(),
        };

        self.last_recovered_largest = self.recovered_history.last();
        self.recovered_alarm = None;
        self.recovered_queued = false;
        self.packets_since_last_recovered = 0;

        Some(frame)
    }

    /// Returns an RD frame when reordering has been observed since the
    /// last one.
    pub fn get_rd_frame(&mut self) -> Option<frame::Frame> {
        if !self.rd_pending {
            return None;
        }

        self.rd_pending = false;

        Some(frame::Frame::Rd {
            max_displacement: self.max_displacement,
            max_delay_ms: self.max_delay.as_millis().min(u128::from(u16::MAX))
                as u16,
        })
    }

    /// The earliest pending ACK or RECOVERED alarm.
    pub fn alarm_timeout(&self) -> Option<Instant> {
        match (self.ack_alarm, self.recovered_alarm) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// `(received, recovered)` packet counts.
    pub fn statistics(&self) -> (u64, u64) {
        (self.packets, self.recovered_packets)
    }

    fn maybe_queue_ack(
        &mut self, pkt_num: u64, should_instigate_ack: bool, now: Instant,
    ) {
        self.packets_since_last_ack += 1;

        if should_instigate_ack {
            self.retransmittable_since_last_ack += 1;
        }

        // Always ack the first packet.
        if self.last_ack_largest.is_none() {
            self.ack_queued = true;
        }

        // Legacy versions ack on a fixed cadence so the peer can bound its
        // sent-packet state and keep measuring the RTT.
        if self.legacy &&
            self.packets_since_last_ack >=
                crate::MAX_PACKETS_RECEIVED_BEFORE_ACK
        {
            self.ack_queued = true;
        }

        if let Some(last_largest) = self.last_ack_largest {
            // A packet below the previously reported largest must have been
            // reported missing; duplicates never reach this point.
            if pkt_num < last_largest {
                self.ack_queued = true;
            }

            // A new missing range appeared above the previously acked top.
            if let Some(highest_start) =
                self.history.iter().next_back().map(|r| r.start)
            {
                if highest_start > last_largest {
                    self.ack_queued = true;
                }
            }
        }

        if !self.ack_queued && should_instigate_ack {
            // Counted against the packets received before this one.
            if self.retransmittable_since_last_ack >
                crate::RETRANSMITTABLE_PACKETS_BEFORE_ACK
            {
                self.ack_queued = true;
            } else if self.ack_alarm.is_none() {
                self.ack_alarm = Some(now + self.ack_send_delay);
            }
        }

        if self.ack_queued {
            self.ack_alarm = None;
        }
    }

    fn maybe_queue_recovered(&mut self, pkt_num: u64, now: Instant) {
        self.packets_since_last_recovered += 1;

        // Always report the first recovered packet.
        if self.last_recovered_largest.is_none() {
            self.recovered_queued = true;
        }

        if self.legacy &&
            self.packets_since_last_recovered >=
                crate::MAX_PACKETS_RECEIVED_BEFORE_ACK
        {
            self.recovered_queued = true;
        }

        if let Some(last_largest) = self.last_recovered_largest {
            if pkt_num < last_largest {
                self.recovered_queued = true;
            }

            if let Some(highest_start) = self
                .recovered_history
                .iter()
                .next_back()
                .map(|r| r.start)
            {
                if highest_start > last_largest {
                    self.recovered_queued = true;
                }
            }
        }

        if !self.recovered_queued {
            if self.recovered_alarm.is_none() {
                self.recovered_alarm = Some(now + self.ack_send_delay);
            }
        } else {
            self.recovered_alarm = None;
        }
    }

    fn pending_ack_delay(&self, now: Instant) -> u64 {
        match self.largest_observed_time {
            Some(t) => now.saturating_duration_since(t).as_micros() as u64,
            None => 0,
        }
    }
}

fn alarm_expired(alarm: Option<Instant>, now: Instant) -> bool {
    match alarm {
        Some(deadline) => deadline <= now,
        None => false,
    }
}

impl std::fmt::Debug for ReceivedPacketTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "largest_observed={} ", self.largest_observed)?;
        write!(f, "ack_queued={} ", self.ack_queued)?;
        write!(f, "history={:?} ", self.history)?;
        write!(f, "recovered={:?} ", self.recovered_history)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ReceivedPacketTracker {
        let config = Config::new(crate::PROTOCOL_VERSION).unwrap();
        ReceivedPacketTracker::new(&config)
    }

    fn ack_ranges(frame: frame::Frame) -> ranges::RangeSet {
        match frame {
            frame::Frame::ACK { ranges, .. } => ranges,
            frame::Frame::Recovered { ranges } => ranges,
            _ => panic!("not an ack-carrying frame"),
        }
    }

    #[test]
    fn zero_packet_number_is_invalid() {
        let mut t = tracker();

        assert_eq!(
            t.on_packet_received(0, true, false, Instant::now()),
            Err(Error::InvalidPacketNumber)
        );
    }

    #[test]
    fn first_packet_acks_immediately() {
        let mut t = tracker();
        let now = Instant::now();

        t.on_packet_received(1, true, false, now).unwrap();

        let frame = t.get_ack_frame(now).unwrap();
        assert_eq!(ack_ranges(frame), 1..2);
    }

    #[test]
    fn ack_alarm_batches_retransmittable() {
        let mut t = tracker();
        let now = Instant::now();

        // Flush the first-packet ACK.
        t.on_packet_received(1, true, false, now).unwrap();
        t.get_ack_frame(now).unwrap();

        // Two retransmittable packets: alarm armed, no immediate ACK.
        t.on_packet_received(2, true, false, now).unwrap();
        t.on_packet_received(3, true, false, now + Duration::from_millis(5))
            .unwrap();
        assert!(t.get_ack_frame(now + Duration::from_millis(5)).is_none());
        assert_eq!(
            t.alarm_timeout(),
            Some(now + Duration::from_millis(25))
        );

        // A third retransmittable packet queues the ACK and clears the
        // alarm.
        t.on_packet_received(4, true, false, now + Duration::from_millis(6))
            .unwrap();
        assert_eq!(t.alarm_timeout(), None);

        let frame = t.get_ack_frame(now + Duration::from_millis(6)).unwrap();
        assert_eq!(ack_ranges(frame), 1..5);
    }

    #[test]
    fn ack_alarm_fires() {
        let mut t = tracker();
        let now = Instant::now();

        t.on_packet_received(1, true, false, now).unwrap();
        t.get_ack_frame(now).unwrap();

        t.on_packet_received(2, true, false, now).unwrap();
        assert!(t.get_ack_frame(now).is_none());

        // Past the alarm deadline the pending ACK is released.
        let later = now + Duration::from_millis(30);
        let frame = t.get_ack_frame(later).unwrap();
        assert_eq!(ack_ranges(frame), 1..3);
    }

    #[test]
    fn new_gap_above_acked_top_triggers_ack() {
        let mut t = tracker();
        let now = Instant::now();

        t.on_packet_received(1, true, false, now).unwrap();
        t.get_ack_frame(now).unwrap();

        // Packet 5 leaves a hole above the acked top: queue at once.
        t.on_packet_received(5, false, false, now).unwrap();

        let frame = t.get_ack_frame(now).unwrap();
        let r = ack_ranges(frame);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn reported_missing_arrival_triggers_ack() {
        let mut t = tracker();
        let now = Instant::now();

        t.on_packet_received(1, true, false, now).unwrap();
        t.on_packet_received(5, true, false, now).unwrap();
        t.get_ack_frame(now).unwrap();

        // Packet 3 is below the last reported largest (5): the peer was
        // told it was missing, so correct the record immediately.
        t.on_packet_received(3, false, false, now).unwrap();

        let frame = t.get_ack_frame(now).unwrap();
        let r = ack_ranges(frame);
        assert!(r.contains(3));
    }

    #[test]
    fn non_retransmittable_does_not_arm_alarm() {
        let mut t = tracker();
        let now = Instant::now();

        t.on_packet_received(1, true, false, now).unwrap();
        t.get_ack_frame(now).unwrap();

        t.on_packet_received(2, false, false, now).unwrap();
        assert!(t.get_ack_frame(now).is_none());
        assert_eq!(t.alarm_timeout(), None);
    }

    #[test]
    fn legacy_cadence_forces_ack() {
        let mut config = Config::new(35).unwrap();
        config.set_max_ack_delay(Duration::from_millis(25));
        let mut t = ReceivedPacketTracker::new(&config);
        let now = Instant::now();

        t.on_packet_received(1, true, false, now).unwrap();
        t.get_ack_frame(now).unwrap();

        // 19 further packets do not reach the cadence threshold...
        for pn in 2..=20 {
            t.on_packet_received(pn, false, false, now).unwrap();
        }
        assert!(t.get_ack_frame(now).is_none());

        // ...the 20th since the last ACK does.
        t.on_packet_received(21, false, false, now).unwrap();
        assert!(t.get_ack_frame(now).is_some());
    }

    #[test]
    fn recovered_packets_use_parallel_history() {
        let mut t = tracker();
        let now = Instant::now();

        t.on_packet_received(1, true, false, now).unwrap();
        t.on_packet_received(2, false, true, now).unwrap();

        let ack = t.get_ack_frame(now).unwrap();
        assert_eq!(ack_ranges(ack), 1..2);

        let recovered = t.get_recovered_frame(now).unwrap();
        assert_eq!(ack_ranges(recovered), 2..3);

        assert_eq!(t.statistics(), (2, 1));
    }

    #[test]
    fn recovered_disabled_folds_into_ack_path() {
        let mut config = Config::new(crate::PROTOCOL_VERSION).unwrap();
        config.set_disable_fec_recovered_frames(true);
        let mut t = ReceivedPacketTracker::new(&config);
        let now = Instant::now();

        t.on_packet_received(1, true, false, now).unwrap();
        t.on_packet_received(2, false, true, now).unwrap();

        let ack = t.get_ack_frame(now).unwrap();
        assert_eq!(ack_ranges(ack), 1..3);

        assert!(t.get_recovered_frame(now).is_none());
    }

    #[test]
    fn lower_limit_drops_history() {
        let mut t = tracker();
        let now = Instant::now();

        for pn in 1..=6 {
            t.on_packet_received(pn, true, false, now).unwrap();
        }

        t.set_lower_limit(4);

        let frame = t.get_ack_frame(now).unwrap();
        let r = ack_ranges(frame);
        assert_eq!(r.first(), Some(5));
        assert_eq!(r.last(), Some(6));

        // Packets at or below the limit are counted but not stored.
        t.on_packet_received(2, true, false, now).unwrap();
        assert_eq!(t.statistics(), (7, 0));
    }

    #[test]
    fn rd_frame_reports_reordering() {
        let mut t = tracker();
        let now = Instant::now();

        t.on_packet_received(1, true, false, now).unwrap();
        t.on_packet_received(2, true, false, now).unwrap();
        t.on_packet_received(5, true, false, now).unwrap();

        // In-order arrivals produce no RD frame.
        assert!(t.get_rd_frame().is_none());

        // Packet 3 arrives 7ms after packet 5 was observed.
        t.on_packet_received(3, true, false, now + Duration::from_millis(7))
            .unwrap();

        assert_eq!(
            t.get_rd_frame(),
            Some(frame::Frame::Rd {
                max_displacement: 2,
                max_delay_ms: 7,
            })
        );

        // Nothing new to report.
        assert!(t.get_rd_frame().is_none());

        // A smaller displacement keeps the running maxima.
        t.on_packet_received(4, true, false, now + Duration::from_millis(9))
            .unwrap();

        assert_eq!(
            t.get_rd_frame(),
            Some(frame::Frame::Rd {
                max_displacement: 2,
                max_delay_ms: 9,
            })
        );
    }

    #[test]
    fn range_cap_is_fatal() {
        let mut config = Config::new(crate::PROTOCOL_VERSION).unwrap();
        config.set_max_ack_delay(Duration::from_millis(25));
        let mut t = ReceivedPacketTracker::new(&config);
        let now = Instant::now();

        // Every second packet number opens a new range.
        let mut result = Ok(());
        for pn in 0..2 * crate::MAX_TRACKED_ACK_RANGES as u64 + 2 {
            result = t.on_packet_received(pn * 2 + 1, false, false, now);

            if result.is_err() {
                break;
            }
        }

        assert_eq!(result, Err(Error::TooManyRanges));
    }
}
