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

//! Sent-packet tracking, loss detection and retransmission alarms.

use std::cmp;

use std::collections::VecDeque;

use std::time::Duration;
use std::time::Instant;

use smallvec::SmallVec;

use crate::frame;
use crate::packet::EncryptionLevel;
use crate::ranges;

use crate::fec::redundancy::SharedRedundancyController;

use crate::Config;
use crate::Enhancement;
use crate::Error;
use crate::Result;

pub mod congestion;
pub mod rtt;
pub mod threshold;

use congestion::CongestionController;
use threshold::LossTrigger;
use threshold::ThreshController;

// The default RTO on new connections, used until the congestion controller
// produces an estimate.
const DEFAULT_RTO_TIMEOUT: Duration = Duration::from_millis(500);

// Minimum time in the future a tail loss probe alarm may be set for.
const MIN_TLP_TIMEOUT: Duration = Duration::from_millis(10);

// Minimum retransmission timeout, following the Linux convention rather
// than the RFC's 1 second.
const MIN_RTO_TIMEOUT: Duration = Duration::from_millis(200);

// Upper bound on the backed-off RTO.
const MAX_RTO_TIMEOUT: Duration = Duration::from_secs(60);

// Up to two tail loss probes are sent before falling back to RTO.
const MAX_TLP_COUNT: u32 = 2;

/// The record of a sent packet, retained until it is acknowledged,
/// recovered or queued for retransmission.
#[derive(Clone)]
pub struct Sent {
    /// The packet number.
    pub pkt_num: u64,

    /// The frames the packet carried. Pure signaling is stripped on
    /// submission; what remains is what a retransmission must reconstruct.
    pub frames: Vec<frame::Frame>,

    /// When the packet was handed to the wire.
    pub time_sent: Instant,

    /// The wire length of the packet.
    pub size: usize,

    /// The encryption level the packet was protected at.
    pub enc_level: EncryptionLevel,

    /// Whether the packet counts towards bytes in flight.
    pub in_flight: bool,
}

impl std::fmt::Debug for Sent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "pkt_num={:?} ", self.pkt_num)?;
        write!(f, "pkt_size={:?} ", self.size)?;
        write!(f, "in_flight={} ", self.in_flight)?;

        Ok(())
    }
}

// Produces STOP_WAITING frames so the peer can drop history below the
// least packet number we may still retransmit.
#[derive(Default)]
struct StopWaitingManager {
    next_least_unacked: u64,

    last_sent_least_unacked: u64,
}

impl StopWaitingManager {
    fn received_ack(&mut self, largest_acked: u64) {
        self.next_least_unacked =
            cmp::max(self.next_least_unacked, largest_acked + 1);
    }

    fn queued_retransmission(&mut self, pkt_num: u64) {
        self.next_least_unacked =
            cmp::max(self.next_least_unacked, pkt_num + 1);
    }

    fn get(&mut self, force: bool) -> Option<frame::Frame> {
        if self.next_least_unacked == 0 {
            return None;
        }

        if !force && self.next_least_unacked <= self.last_sent_least_unacked {
            return None;
        }

        self.last_sent_least_unacked = self.next_least_unacked;

        Some(frame::Frame::StopWaiting {
            least_unacked: self.next_least_unacked,
        })
    }
}

/// The sent-packet tracker: in-flight ledger, loss detector, retransmission
/// queue and per-path alarms.
pub struct Recovery {
    last_sent_pkt_num: u64,

    // Packet numbers deliberately left unused between consecutive sends.
    // An acknowledgement covering any of them is a protocol violation.
    skipped: SmallVec<[u64; crate::MAX_TRACKED_SKIPPED_PACKETS]>,

    non_retransmittable_in_a_row: usize,

    largest_acked: u64,

    largest_received_pkt_with_ack: u64,

    // Sent packets in ascending packet number order.
    sent: VecDeque<Sent>,

    retransmission_queue: VecDeque<Sent>,

    stop_waiting: StopWaitingManager,

    bytes_in_flight: usize,

    congestion: Box<dyn CongestionController>,

    rtt: rtt::RttStats,

    thresh: Option<ThreshController>,

    rd_frame: Option<(u16, u16)>,

    on_rto: Option<Box<dyn FnMut(Instant) -> bool>>,

    handshake_complete: bool,

    handshake_count: u32,

    rto_count: u32,

    tlp_count: u32,

    tlp_alarm: bool,

    loss_time: Option<Instant>,

    last_sent_time: Option<Instant>,

    alarm: Option<Instant>,

    redundancy: SharedRedundancyController,

    sent_count: u64,

    retrans_count: u64,

    lost_count: u64,

    acked_symbols: u64,

    use_fast_retransmit: bool,

    apply_congestion_control: bool,

    enhancement: Enhancement,

    max_tracked: usize,
}

impl Recovery {
    pub fn new(
        config: &Config, congestion: Box<dyn CongestionController>,
        redundancy: SharedRedundancyController,
        on_rto: Option<Box<dyn FnMut(Instant) -> bool>>, now: Instant,
    ) -> Self {
        let thresh = if config.enhancement == Enhancement::LossRecovery {
            Some(ThreshController::new(now))
        } else {
            None
        };

        Recovery {
            last_sent_pkt_num: 0,
            skipped: SmallVec::new(),
            non_retransmittable_in_a_row: 0,
            largest_acked: 0,
            largest_received_pkt_with_ack: 0,
            sent: VecDeque::new(),
            retransmission_queue: VecDeque::new(),
            stop_waiting: StopWaitingManager::default(),
            bytes_in_flight: 0,
            congestion,
            rtt: rtt::RttStats::new(config.max_ack_delay),
            thresh,
            rd_frame: None,
            on_rto,
            handshake_complete: false,
            handshake_count: 0,
            rto_count: 0,
            tlp_count: 0,
            tlp_alarm: false,
            loss_time: None,
            last_sent_time: None,
            alarm: None,
            redundancy,
            sent_count: 0,
            retrans_count: 0,
            lost_count: 0,
            acked_symbols: 0,
            use_fast_retransmit: config.use_fast_retransmit,
            apply_congestion_control: config.apply_congestion_control,
            enhancement: config.enhancement,
            max_tracked: config.max_tracked_sent_packets,
        }
    }

    /// Marks the handshake as complete, switching the alarm ladder from
    /// handshake retransmission to loss/TLP/RTO.
    pub fn set_handshake_complete(&mut self) {
        self.handshake_complete = true;
    }

    /// Records a sent packet.
    ///
    /// Pure-signaling frames are stripped from the record; packets carrying
    /// any retransmittable, unreliable-stream or FEC-related frame enter
    /// the in-flight ledger.
    pub fn on_packet_sent(
        &mut self, mut pkt: Sent, now: Instant, trace_id: &str,
    ) -> Result<()> {
        if pkt.pkt_num <= self.last_sent_pkt_num {
            return Err(Error::PacketNumberNotIncreasing);
        }

        if self.retransmission_queue.len() + self.sent.len() + 1 >
            self.max_tracked
        {
            return Err(Error::TooManyTrackedPackets);
        }

        for p in self.last_sent_pkt_num + 1..pkt.pkt_num {
            if self.skipped.len() == crate::MAX_TRACKED_SKIPPED_PACKETS {
                self.skipped.remove(0);
            }

            self.skipped.push(p);
        }

        self.last_sent_pkt_num = pkt.pkt_num;
        self.last_sent_time = Some(now);
        self.sent_count += 1;

        let has_retransmittable_or_unreliable =
            frame::has_retransmittable_or_unreliable_stream_frames(&pkt.frames);
        let has_fec_related = frame::has_fec_related_frames(&pkt.frames);

        pkt.frames = frame::strip_non_retransmittable(std::mem::take(
            &mut pkt.frames,
        ));

        let is_retransmittable = !pkt.frames.is_empty();

        let pkt_num = pkt.pkt_num;
        let size = pkt.size;

        if has_retransmittable_or_unreliable || has_fec_related {
            pkt.time_sent = now;
            pkt.in_flight = true;

            self.bytes_in_flight += size;
            self.sent.push_back(pkt);
            self.non_retransmittable_in_a_row = 0;
        } else {
            self.non_retransmittable_in_a_row += 1;
        }

        self.congestion.on_packet_sent(
            now,
            self.bytes_in_flight,
            pkt_num,
            size,
            is_retransmittable,
        );

        self.update_loss_detection_alarm(now);

        trace!("{} {:?}", trace_id, self);

        Ok(())
    }

    /// Processes an ACK frame received in a packet numbered `observed_pn`
    /// at encryption level `enc_level`.
    ///
    /// Duplicate and out-of-order ACKs fail with [`Error::DuplicateAck`],
    /// which is transient; the remaining errors are fatal protocol
    /// violations.
    pub fn on_ack_received(
        &mut self, acked: &ranges::RangeSet, ack_delay: u64, observed_pn: u64,
        enc_level: EncryptionLevel, recv_time: Instant, now: Instant,
        trace_id: &str,
    ) -> Result<()> {
        let largest_acked = acked.last().ok_or(Error::InvalidFrame)?;

        if largest_acked > self.last_sent_pkt_num {
            return Err(Error::AckForUnsentPacket);
        }

        if observed_pn <= self.largest_received_pkt_with_ack {
            return Err(Error::DuplicateAck);
        }

        self.largest_received_pkt_with_ack = observed_pn;

        if self.skipped.iter().any(|p| acked.contains(*p)) {
            return Err(Error::AckForSkippedPacket);
        }

        // Repeated ACKs that do not advance the largest acknowledged packet
        // carry no new information.
        if largest_acked <= self.largest_in_order_acked() {
            return Ok(());
        }

        self.largest_acked = largest_acked;

        // An ACK must arrive at a level at least as high as every packet it
        // acknowledges.
        for p in &self.sent {
            if p.pkt_num > largest_acked {
                break;
            }

            if acked.contains(p.pkt_num) && enc_level < p.enc_level {
                return Err(Error::EncryptionLevelMismatch);
            }
        }

        // The RTT sample comes from the largest acknowledged packet only.
        let largest_send_time = self
            .sent
            .iter()
            .take_while(|p| p.pkt_num <= largest_acked)
            .find(|p| p.pkt_num == largest_acked)
            .map(|p| p.time_sent);

        if let Some(time_sent) = largest_send_time {
            self.rtt.update_rtt(
                recv_time.saturating_duration_since(time_sent),
                Duration::from_micros(ack_delay),
            );

            self.congestion.maybe_exit_slow_start(&self.rtt);
        }

        let newly_acked: Vec<u64> = self
            .sent
            .iter()
            .take_while(|p| p.pkt_num <= largest_acked)
            .filter(|p| acked.contains(p.pkt_num))
            .map(|p| p.pkt_num)
            .collect();

        for pkt_num in newly_acked {
            let size = self.remove_acked(pkt_num);

            trace!("{} packet newly acked {}", trace_id, pkt_num);

            self.redundancy.borrow_mut().on_packet_received(pkt_num);
            self.congestion.on_packet_acked(
                pkt_num,
                size,
                self.bytes_in_flight,
                &self.rtt,
            );
        }

        self.detect_lost_packets(now, trace_id);
        self.update_loss_detection_alarm(now);
        self.garbage_collect_skipped_packets();
        self.stop_waiting.received_ack(largest_acked);

        Ok(())
    }

    /// Processes a RECOVERED frame.
    ///
    /// Covered packets leave the ledger like acknowledged ones, but the RTT
    /// estimator is not updated (recovery may have delayed the feedback)
    /// and the congestion controller is told the underlying packets were
    /// lost before being repaired.
    pub fn on_recovered_received(
        &mut self, recovered: &ranges::RangeSet, enc_level: EncryptionLevel,
        now: Instant, trace_id: &str,
    ) -> Result<()> {
        let largest_recovered =
            recovered.last().ok_or(Error::InvalidFrame)?;

        for p in &self.sent {
            if p.pkt_num > largest_recovered {
                break;
            }

            if recovered.contains(p.pkt_num) && enc_level < p.enc_level {
                return Err(Error::EncryptionLevelMismatch);
            }
        }

        if largest_recovered > self.largest_acked {
            self.largest_acked = largest_recovered;
        }

        let newly_recovered: Vec<u64> = self
            .sent
            .iter()
            .take_while(|p| p.pkt_num <= largest_recovered)
            .filter(|p| recovered.contains(p.pkt_num))
            .map(|p| p.pkt_num)
            .collect();

        for pkt_num in newly_recovered {
            let size = self.remove_acked(pkt_num);

            trace!("{} packet recovered by peer {}", trace_id, pkt_num);

            // The packet was lost on the path and repaired end-to-end; the
            // congestion controller still pays the loss.
            self.congestion.on_packet_lost(
                pkt_num,
                size,
                self.bytes_in_flight,
            );
        }

        self.detect_lost_packets(now, trace_id);
        self.update_loss_detection_alarm(now);
        self.garbage_collect_skipped_packets();
        self.stop_waiting.received_ack(largest_recovered);

        Ok(())
    }

    /// Forwards symbol-level feedback to the threshold controller.
    pub fn on_symbol_ack_received(
        &mut self, symbols_received: u64, max_symbol_observed: u64,
        now: Instant,
    ) {
        self.acked_symbols = symbols_received;

        if let Some(thresh) = &mut self.thresh {
            thresh.update_threshold(
                symbols_received,
                max_symbol_observed,
                self.sent_count,
                self.retrans_count,
                self.rtt.rtt(),
                now,
            );
        }
    }

    /// Stores the peer's reorder-detection report for subsequent loss
    /// detection passes.
    pub fn on_rd_received(&mut self, max_displacement: u16, max_delay_ms: u16) {
        self.rd_frame = Some((max_displacement, max_delay_ms));
    }

    /// Queues an already-built packet for (re)transmission without touching
    /// the history, used when the peer signals a duplicate was needed.
    pub fn on_duplicate_packet(&mut self, pkt: Sent) {
        self.retransmission_queue.push_back(pkt);
    }

    /// Pops the next packet to retransmit, FIFO.
    pub fn dequeue_for_retransmission(&mut self) -> Option<Sent> {
        let pkt = self.retransmission_queue.pop_front()?;

        self.retrans_count += 1;

        Some(pkt)
    }

    /// Whether the path may send another packet.
    ///
    /// Sending is blocked when the tracked-packet cap is reached, or when
    /// congestion limited with nothing queued for retransmission (unless
    /// congestion gating is disabled).
    pub fn sending_allowed(&self) -> bool {
        let max_tracked_limited = self.retransmission_queue.len() +
            self.sent.len() >=
            self.max_tracked;

        if max_tracked_limited {
            return false;
        }

        if !self.apply_congestion_control {
            return true;
        }

        let congestion_limited =
            self.bytes_in_flight > self.congestion.congestion_window();

        if congestion_limited {
            trace!(
                "congestion limited: bytes in flight {}, window {}",
                self.bytes_in_flight,
                self.congestion.congestion_window()
            );
        }

        !congestion_limited || !self.retransmission_queue.is_empty()
    }

    /// Whether the sender should force a retransmittable packet to give the
    /// peer an RTT measurement opportunity.
    pub fn should_send_retransmittable(&self) -> bool {
        self.non_retransmittable_in_a_row >=
            crate::MAX_NON_RETRANSMITTABLE_PACKETS
    }

    /// The loss-detection alarm deadline, if armed.
    pub fn loss_detection_timer(&self) -> Option<Instant> {
        self.alarm
    }

    /// Handles an expired loss-detection alarm.
    pub fn on_loss_detection_timeout(&mut self, now: Instant, trace_id: &str) {
        if !self.has_outstanding_retransmittable_packet() {
            self.alarm = None;
            return;
        }

        if !self.handshake_complete {
            self.queue_handshake_packets_for_retransmission();
            self.handshake_count += 1;
        } else if self.loss_time.is_some() {
            // Early retransmit or time loss detection.
            self.detect_lost_packets(now, trace_id);
        } else if self.tlp_alarm && self.tlp_count < MAX_TLP_COUNT {
            self.retransmit_tlp();
            self.tlp_count += 1;
        } else {
            // RTO.
            let potentially_failed = match (&mut self.on_rto, self.last_sent_time)
            {
                (Some(cb), Some(last_sent)) => cb(last_sent),
                _ => false,
            };

            if potentially_failed {
                self.retransmit_all_packets();
            } else {
                self.retransmit_oldest_two_packets();
            }

            self.rto_count += 1;
        }

        self.update_loss_detection_alarm(now);

        trace!("{} {:?}", trace_id, self);
    }

    /// Requeues every tracked packet, used on connection teardown paths.
    pub fn set_inflight_as_lost(&mut self) {
        while let Some(front) = self.sent.front() {
            let pkt_num = front.pkt_num;

            if pkt_num > self.largest_acked {
                break;
            }

            self.lost_count += 1;
            self.queue_front_for_retransmission();
        }
    }

    /// Produces a STOP_WAITING frame when the least unacked packet number
    /// advanced since the last one.
    pub fn get_stop_waiting_frame(&mut self, force: bool) -> Option<frame::Frame> {
        self.stop_waiting.get(force)
    }

    /// The lowest packet number the peer should still expect.
    pub fn least_unacked(&self) -> u64 {
        self.largest_in_order_acked() + 1
    }

    /// Bytes currently counted against the congestion window.
    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    /// Number of tracked in-flight packets.
    pub fn packets_in_flight(&self) -> usize {
        self.sent.len()
    }

    /// The congestion controller driving this path.
    pub fn send_algorithm(&self) -> &dyn CongestionController {
        self.congestion.as_ref()
    }

    /// `(sent, retransmitted, lost)` packet counts.
    pub fn statistics(&self) -> (u64, u64, u64) {
        (self.sent_count, self.retrans_count, self.lost_count)
    }

    /// The number of repair symbols the peer reported receiving.
    pub fn acked_symbols(&self) -> u64 {
        self.acked_symbols
    }

    /// The RTT estimator for this path.
    pub fn rtt_stats(&self) -> &rtt::RttStats {
        &self.rtt
    }

    #[cfg(test)]
    pub(crate) fn rtt_stats_mut(&mut self) -> &mut rtt::RttStats {
        &mut self.rtt
    }

    /// The current loss-detection thresholds `(time, packet)`.
    pub fn loss_thresholds(&self) -> (f64, u64) {
        match &self.thresh {
            Some(thresh) =>
                (thresh.time_threshold(), thresh.packet_threshold()),

            None => (
                threshold::MIN_TIME_THRESHOLD,
                threshold::MIN_PACKET_THRESHOLD,
            ),
        }
    }

    fn largest_in_order_acked(&self) -> u64 {
        match self.sent.front() {
            Some(p) => p.pkt_num - 1,
            None => self.largest_acked,
        }
    }

    // Removes an acknowledged (or peer-recovered) packet from the ledger
    // and returns its size.
    fn remove_acked(&mut self, pkt_num: u64) -> usize {
        let idx = self
            .sent
            .iter()
            .position(|p| p.pkt_num == pkt_num)
            .unwrap_or_else(|| {
                // The caller only passes packet numbers found in the ledger.
                debug_assert!(false, "acked packet {pkt_num} not in ledger");
                usize::MAX
            });

        if idx == usize::MAX {
            return 0;
        }

        let pkt = self.sent.remove(idx).unwrap();

        if pkt.in_flight {
            self.bytes_in_flight =
                self.bytes_in_flight.saturating_sub(pkt.size);
        }

        self.rto_count = 0;
        self.handshake_count = 0;
        self.tlp_count = 0;

        pkt.size
    }

    fn has_outstanding_retransmittable_packet(&self) -> bool {
        self.sent
            .iter()
            .any(|p| frame::has_retransmittable_frames(&p.frames))
    }

    fn detect_lost_packets(&mut self, now: Instant, trace_id: &str) {
        self.loss_time = None;

        let max_rtt = self.rtt.max_rtt();

        let (time_threshold, mut packet_threshold) = self.loss_thresholds();

        let mut delay_until_lost = Duration::from_secs_f64(
            (1.0 + time_threshold) * max_rtt.as_secs_f64(),
        );

        if self.enhancement == Enhancement::ReorderDetection {
            if let Some((max_displacement, max_delay_ms)) = self.rd_frame {
                delay_until_lost +=
                    Duration::from_millis(u64::from(max_delay_ms));
                packet_threshold += u64::from(max_displacement);
            }
        }

        if self.enhancement == Enhancement::DelayVariance {
            delay_until_lost = Duration::from_secs_f64(
                (1.0 + time_threshold) * max_rtt.as_secs_f64(),
            ) + self.rtt.rttvar() * 4;
        }

        let mut lost_pkts: Vec<u64> = Vec::new();

        for p in &self.sent {
            if p.pkt_num > self.largest_acked {
                break;
            }

            let time_since_sent = now.saturating_duration_since(p.time_sent);

            let by_duplicate = self.largest_acked >= packet_threshold &&
                p.pkt_num <= self.largest_acked - packet_threshold;

            let by_delay = time_since_sent > delay_until_lost;

            if let Some(thresh) = &mut self.thresh {
                if by_delay {
                    thresh.on_packet_lost_by(LossTrigger::Delay);
                } else if by_duplicate {
                    thresh.on_packet_lost_by(LossTrigger::Duplicate);
                }
            }

            if (self.use_fast_retransmit && by_duplicate) || by_delay {
                self.lost_count += 1;
                lost_pkts.push(p.pkt_num);
            } else if self.loss_time.is_none() {
                // Only entered once per pass: the earliest future loss
                // candidate arms the alarm.
                self.loss_time = Some(now + (delay_until_lost - time_since_sent));
            }
        }

        for pkt_num in lost_pkts {
            trace!(
                "{} packet {} lost, largest_acked={}",
                trace_id,
                pkt_num,
                self.largest_acked
            );

            let idx = match self.sent.iter().position(|p| p.pkt_num == pkt_num)
            {
                Some(idx) => idx,
                None => continue,
            };

            let (size, retransmittable) = {
                let p = &self.sent[idx];
                (p.size, frame::has_retransmittable_frames(&p.frames))
            };

            if !retransmittable {
                // Nothing to resend; the loss only releases the in-flight
                // budget.
                self.remove_acked(pkt_num);
            } else {
                self.queue_at_for_retransmission(idx);
            }

            self.redundancy.borrow_mut().on_packet_lost(pkt_num);
            self.congestion.on_packet_lost(
                pkt_num,
                size,
                self.bytes_in_flight,
            );
        }
    }

    fn update_loss_detection_alarm(&mut self, now: Instant) {
        self.tlp_alarm = false;

        if self.sent.is_empty() {
            self.alarm = None;
            return;
        }

        if !self.handshake_complete {
            self.alarm = Some(now + self.handshake_timeout());
            return;
        }

        if let Some(loss_time) = self.loss_time {
            // Early retransmit timer or time loss detection.
            self.alarm = Some(loss_time);
            return;
        }

        let last_sent_time = match self.last_sent_time {
            Some(t) => t,
            None => return,
        };

        if self.rtt.smoothed_rtt().is_some() && self.tlp_count < MAX_TLP_COUNT {
            self.tlp_alarm = true;
            self.alarm = Some(last_sent_time + self.tlp_timeout());
            return;
        }

        // RTO, taking the sooner of the regular timer and a late TLP probe.
        let timeout = cmp::max(self.rto_timeout(), MIN_RTO_TIMEOUT);

        let first_sent_time = self.sent.front().map(|p| p.time_sent);

        let rto_alarm = match first_sent_time {
            Some(first) => first + timeout,
            None => now + timeout,
        };

        let mut alarm = cmp::max(rto_alarm, now + Duration::from_micros(1));

        let tlp_alarm = last_sent_time + timeout;

        if tlp_alarm < alarm {
            alarm = cmp::max(tlp_alarm, now + Duration::from_micros(1));
            self.tlp_alarm = true;
        }

        self.alarm = Some(alarm);
    }

    // Doubles with every unacknowledged handshake retransmission.
    fn handshake_timeout(&self) -> Duration {
        let mut duration = match self.rtt.smoothed_rtt() {
            Some(srtt) => srtt * 2,
            None => rtt::INITIAL_RTT * 2,
        };

        duration = cmp::max(duration, MIN_TLP_TIMEOUT);

        duration * 2_u32.pow(self.handshake_count)
    }

    fn rto_timeout(&self) -> Duration {
        let mut rto = self.congestion.retransmission_delay(&self.rtt);

        if rto.is_zero() {
            rto = DEFAULT_RTO_TIMEOUT;
        }

        rto = cmp::max(rto, MIN_RTO_TIMEOUT);

        rto *= 2_u32.pow(self.rto_count);

        cmp::min(rto, MAX_RTO_TIMEOUT)
    }

    fn tlp_timeout(&self) -> Duration {
        let srtt = self.rtt.rtt();

        if self.sent.len() > 1 {
            cmp::max(srtt * 2, srtt * 3 / 2 + MIN_RTO_TIMEOUT / 2)
        } else {
            cmp::max(srtt * 2, MIN_TLP_TIMEOUT)
        }
    }

    fn retransmit_tlp(&mut self) {
        if let Some(back) = self.sent.back() {
            let idx = self.sent.len() - 1;

            trace!("tail loss probe for packet {}", back.pkt_num);

            self.queue_at_for_retransmission(idx);
        }
    }

    fn retransmit_all_packets(&mut self) {
        while !self.sent.is_empty() {
            self.queue_front_for_rto();
        }

        self.congestion.on_retransmission_timeout(true);
    }

    fn retransmit_oldest_two_packets(&mut self) {
        if !self.sent.is_empty() {
            self.queue_front_for_rto();
        }

        if !self.sent.is_empty() {
            self.queue_front_for_rto();
        }

        self.congestion.on_retransmission_timeout(true);
    }

    // RTO retransmissions count as losses for both controllers.
    fn queue_front_for_rto(&mut self) {
        let (pkt_num, size) = match self.sent.front() {
            Some(p) => (p.pkt_num, p.size),
            None => return,
        };

        self.queue_front_for_retransmission();

        self.lost_count += 1;

        self.redundancy.borrow_mut().on_packet_lost(pkt_num);
        self.congestion
            .on_packet_lost(pkt_num, size, self.bytes_in_flight);
    }

    fn queue_handshake_packets_for_retransmission(&mut self) {
        let handshake_pkts: Vec<u64> = self
            .sent
            .iter()
            .filter(|p| p.enc_level < EncryptionLevel::ForwardSecure)
            .map(|p| p.pkt_num)
            .collect();

        for pkt_num in handshake_pkts {
            if let Some(idx) =
                self.sent.iter().position(|p| p.pkt_num == pkt_num)
            {
                self.queue_at_for_retransmission(idx);
            }
        }
    }

    fn queue_front_for_retransmission(&mut self) {
        self.queue_at_for_retransmission(0);
    }

    fn queue_at_for_retransmission(&mut self, idx: usize) {
        let pkt = match self.sent.remove(idx) {
            Some(pkt) => pkt,
            None => return,
        };

        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(pkt.size);
        self.stop_waiting.queued_retransmission(pkt.pkt_num);
        self.retransmission_queue.push_back(pkt);
    }

    fn garbage_collect_skipped_packets(&mut self) {
        let lioa = self.largest_in_order_acked();

        self.skipped.retain(|p| *p > lioa);
    }
}

impl std::fmt::Debug for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.alarm {
            Some(v) => write!(f, "alarm={v:?} ")?,
            None => write!(f, "alarm=none ")?,
        };

        write!(f, "largest_acked={} ", self.largest_acked)?;
        write!(f, "loss_time={:?} ", self.loss_time)?;
        write!(f, "bytes_in_flight={} ", self.bytes_in_flight)?;
        write!(f, "in_flight={} ", self.sent.len())?;
        write!(f, "retx_queue={} ", self.retransmission_queue.len())?;
        write!(f, "{:?} ", self.rtt)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::fec::redundancy::RedundancyController;
    use crate::fec::redundancy::TransmissionParams;

    #[derive(Default)]
    struct TestCongestion {
        acked: Vec<u64>,
        lost: Vec<u64>,
        rto_count: usize,
        window: usize,
    }

    impl TestCongestion {
        fn shared() -> Rc<RefCell<TestCongestion>> {
            Rc::new(RefCell::new(TestCongestion {
                window: usize::MAX,
                ..Default::default()
            }))
        }
    }

    struct TestCongestionHandle(Rc<RefCell<TestCongestion>>);

    impl CongestionController for TestCongestionHandle {
        fn on_packet_sent(
            &mut self, _now: Instant, _bytes_in_flight: usize, _pkt_num: u64,
            _bytes: usize, _is_retransmittable: bool,
        ) {
        }

        fn on_packet_acked(
            &mut self, pkt_num: u64, _bytes: usize, _bytes_in_flight: usize,
            _rtt: &rtt::RttStats,
        ) {
            self.0.borrow_mut().acked.push(pkt_num);
        }

        fn on_packet_lost(
            &mut self, pkt_num: u64, _bytes: usize, _bytes_in_flight: usize,
        ) {
            self.0.borrow_mut().lost.push(pkt_num);
        }

        fn on_retransmission_timeout(&mut self, _packets_retransmitted: bool) {
            self.0.borrow_mut().rto_count += 1;
        }

        fn congestion_window(&self) -> usize {
            self.0.borrow().window
        }

        fn maybe_exit_slow_start(&mut self, _rtt: &rtt::RttStats) {}

        fn retransmission_delay(&self, _rtt: &rtt::RttStats) -> Duration {
            Duration::ZERO
        }
    }

    #[derive(Default)]
    struct TestRedundancy {
        lost: Vec<u64>,
        received: Vec<u64>,
    }

    impl RedundancyController for TestRedundancy {
        fn on_packet_lost(&mut self, pkt_num: u64) {
            self.lost.push(pkt_num);
        }

        fn on_packet_received(&mut self, pkt_num: u64) {
            self.received.push(pkt_num);
        }

        fn data_symbols(&self) -> usize {
            4
        }

        fn repair_symbols(&self) -> usize {
            1
        }

        fn interleaved_blocks(&self) -> usize {
            1
        }

        fn window_step(&self) -> usize {
            2
        }

        fn push_params(&mut self, _params: TransmissionParams) {}
    }

    struct Harness {
        r: Recovery,
        cc: Rc<RefCell<TestCongestion>>,
        rc: Rc<RefCell<TestRedundancy>>,
        now: Instant,
    }

    fn harness() -> Harness {
        harness_with(|_config| ())
    }

    fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
        let mut config = Config::new(crate::PROTOCOL_VERSION).unwrap();
        tweak(&mut config);

        let cc = TestCongestion::shared();
        let rc = Rc::new(RefCell::new(TestRedundancy::default()));

        let now = Instant::now();

        let mut r = Recovery::new(
            &config,
            Box::new(TestCongestionHandle(cc.clone())),
            rc.clone(),
            None,
            now,
        );

        r.set_handshake_complete();

        Harness { r, cc, rc, now }
    }

    fn stream_pkt(pkt_num: u64, size: usize) -> Sent {
        Sent {
            pkt_num,
            frames: vec![frame::Frame::Stream {
                stream_id: 0,
                offset: pkt_num * 100,
                data: vec![0; 10],
                fin: false,
                unreliable: false,
            }],
            time_sent: Instant::now(),
            size,
            enc_level: EncryptionLevel::ForwardSecure,
            in_flight: false,
        }
    }

    fn ack_of(ranges_list: &[std::ops::Range<u64>]) -> ranges::RangeSet {
        let mut set = ranges::RangeSet::default();
        for r in ranges_list {
            set.insert(r.clone()).unwrap();
        }
        set
    }

    #[test]
    fn pn_must_increase() {
        let mut h = harness();

        h.r.on_packet_sent(stream_pkt(3, 100), h.now, "").unwrap();

        assert_eq!(
            h.r.on_packet_sent(stream_pkt(3, 100), h.now, ""),
            Err(Error::PacketNumberNotIncreasing)
        );

        assert_eq!(
            h.r.on_packet_sent(stream_pkt(2, 100), h.now, ""),
            Err(Error::PacketNumberNotIncreasing)
        );
    }

    #[test]
    fn tracked_cap_is_fatal() {
        let mut h = harness_with(|config| {
            config.set_max_tracked_sent_packets(3);
        });

        for pn in 1..=3 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }

        assert_eq!(
            h.r.on_packet_sent(stream_pkt(4, 100), h.now, ""),
            Err(Error::TooManyTrackedPackets)
        );
    }

    #[test]
    fn bytes_in_flight_accounting() {
        let mut h = harness();

        for pn in 1..=4 {
            h.r.on_packet_sent(stream_pkt(pn, 250), h.now, "").unwrap();
        }
        assert_eq!(h.r.bytes_in_flight(), 1000);
        assert_eq!(h.r.packets_in_flight(), 4);

        let now = h.now + Duration::from_millis(10);
        h.r.on_ack_received(
            &ack_of(&[1..3]),
            0,
            1,
            EncryptionLevel::ForwardSecure,
            now,
            now,
            "",
        )
        .unwrap();

        assert_eq!(h.r.bytes_in_flight(), 500);
        assert_eq!(h.r.packets_in_flight(), 2);
        assert_eq!(h.cc.borrow().acked, vec![1, 2]);
        assert_eq!(h.rc.borrow().received, vec![1, 2]);
        assert_eq!(h.r.least_unacked(), 3);
    }

    #[test]
    fn duplicate_ack_is_transient() {
        let mut h = harness();

        for pn in 1..=4 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }

        let now = h.now + Duration::from_millis(10);
        h.r.on_ack_received(
            &ack_of(&[1..3]),
            0,
            7,
            EncryptionLevel::ForwardSecure,
            now,
            now,
            "",
        )
        .unwrap();

        // Same observed packet number: duplicate.
        assert_eq!(
            h.r.on_ack_received(
                &ack_of(&[1..4]),
                0,
                7,
                EncryptionLevel::ForwardSecure,
                now,
                now,
                "",
            ),
            Err(Error::DuplicateAck)
        );

        // Only the first ACK changed state.
        assert_eq!(h.cc.borrow().acked, vec![1, 2]);
    }

    #[test]
    fn ack_for_unsent_is_fatal() {
        let mut h = harness();

        h.r.on_packet_sent(stream_pkt(1, 100), h.now, "").unwrap();

        assert_eq!(
            h.r.on_ack_received(
                &ack_of(&[1..9]),
                0,
                1,
                EncryptionLevel::ForwardSecure,
                h.now,
                h.now,
                "",
            ),
            Err(Error::AckForUnsentPacket)
        );
    }

    #[test]
    fn ack_for_skipped_is_fatal() {
        let mut h = harness();

        // Send PN 3, skipping 1 and 2.
        h.r.on_packet_sent(stream_pkt(3, 100), h.now, "").unwrap();

        assert_eq!(
            h.r.on_ack_received(
                &ack_of(&[2..3]),
                0,
                1,
                EncryptionLevel::ForwardSecure,
                h.now,
                h.now,
                "",
            ),
            Err(Error::AckForSkippedPacket)
        );
    }

    #[test]
    fn loss_by_duplicate_threshold() {
        let mut h = harness();

        for pn in 1..=10 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }
        assert_eq!(h.r.bytes_in_flight(), 1000);

        let now = h.now + Duration::from_millis(10);
        h.r.on_ack_received(
            &ack_of(&[6..11]),
            0,
            1,
            EncryptionLevel::ForwardSecure,
            now,
            now,
            "",
        )
        .unwrap();

        // packet_threshold = 3, largest_acked = 10: packets 1..=5 still in
        // the ledger fall below 10 - 3 and are declared lost.
        let (_, _, lost) = h.r.statistics();
        assert_eq!(lost, 5);
        assert_eq!(h.r.bytes_in_flight(), 0);
        assert_eq!(h.r.packets_in_flight(), 0);

        // All five were retransmittable and await retransmission.
        let mut retx = Vec::new();
        while let Some(p) = h.r.dequeue_for_retransmission() {
            retx.push(p.pkt_num);
        }
        assert_eq!(retx, vec![1, 2, 3, 4, 5]);

        assert_eq!(h.rc.borrow().lost, vec![1, 2, 3, 4, 5]);
        assert_eq!(h.cc.borrow().lost, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn loss_by_delay_threshold() {
        let mut h = harness();

        h.r.rtt_stats_mut()
            .set_smoothed_rtt(Duration::from_millis(100));

        h.r.on_packet_sent(stream_pkt(1, 100), h.now, "").unwrap();
        h.r.on_packet_sent(stream_pkt(2, 100), h.now, "").unwrap();

        // Ack PN 2 a full RTT later, leaving PN 1 outstanding below the
        // largest acked. The 100ms sample keeps the smoothed RTT at 100ms.
        let ack_time = h.now + Duration::from_millis(100);
        h.r.on_ack_received(
            &ack_of(&[2..3]),
            0,
            1,
            EncryptionLevel::ForwardSecure,
            ack_time,
            ack_time,
            "",
        )
        .unwrap();

        // Not yet lost; a loss-time alarm is armed instead.
        let (_, _, lost) = h.r.statistics();
        assert_eq!(lost, 0);

        let alarm = h.r.loss_detection_timer().unwrap();

        // delay_until_lost = (1 + 9/8) * 100ms = 212.5ms past the send
        // time.
        assert!(alarm > h.now + Duration::from_millis(212));
        assert!(alarm < h.now + Duration::from_millis(213));

        // Fire past the deadline: PN 1 is declared lost.
        let now = h.now + Duration::from_millis(230);
        h.r.on_loss_detection_timeout(now, "");

        let (_, _, lost) = h.r.statistics();
        assert_eq!(lost, 1);

        let p = h.r.dequeue_for_retransmission().unwrap();
        assert_eq!(p.pkt_num, 1);
    }

    #[test]
    fn fast_retransmit_disabled_keeps_duplicate_leg_off() {
        let mut h = harness_with(|config| {
            config.set_use_fast_retransmit(false);
        });

        for pn in 1..=10 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }

        let now = h.now + Duration::from_millis(10);
        h.r.on_ack_received(
            &ack_of(&[6..11]),
            0,
            1,
            EncryptionLevel::ForwardSecure,
            now,
            now,
            "",
        )
        .unwrap();

        // Without fast retransmit nothing is lost yet.
        let (_, _, lost) = h.r.statistics();
        assert_eq!(lost, 0);
        assert_eq!(h.r.packets_in_flight(), 5);
    }

    #[test]
    fn recovered_pays_congestion_loss() {
        let mut h = harness();

        for pn in 1..=5 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }

        let now = h.now + Duration::from_millis(10);
        h.r.on_recovered_received(
            &ack_of(&[3..4]),
            EncryptionLevel::ForwardSecure,
            now,
            "",
        )
        .unwrap();

        // PN 3 left the ledger like an ack, but congestion control saw a
        // loss, not an ack.
        assert_eq!(h.r.packets_in_flight(), 4);
        assert_eq!(h.cc.borrow().lost, vec![3]);
        assert!(h.cc.borrow().acked.is_empty());
        assert_eq!(h.r.bytes_in_flight(), 400);
    }

    #[test]
    fn non_retransmittable_lost_packet_is_implicitly_acked() {
        let mut h = harness();

        // A packet carrying only an unreliable stream frame is in flight
        // but not retransmittable.
        let pkt = Sent {
            pkt_num: 1,
            frames: vec![frame::Frame::Stream {
                stream_id: 2,
                offset: 0,
                data: vec![0; 10],
                fin: false,
                unreliable: true,
            }],
            time_sent: h.now,
            size: 100,
            enc_level: EncryptionLevel::ForwardSecure,
            in_flight: false,
        };

        h.r.on_packet_sent(pkt, h.now, "").unwrap();

        for pn in 2..=10 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }

        let now = h.now + Duration::from_millis(10);
        h.r.on_ack_received(
            &ack_of(&[6..11]),
            0,
            1,
            EncryptionLevel::ForwardSecure,
            now,
            now,
            "",
        )
        .unwrap();

        // PN 1 was declared lost but is not queued for retransmission.
        let mut retx = Vec::new();
        while let Some(p) = h.r.dequeue_for_retransmission() {
            retx.push(p.pkt_num);
        }
        assert_eq!(retx, vec![2, 3, 4, 5]);

        // It still counted as a loss for both controllers.
        assert!(h.cc.borrow().lost.contains(&1));
        assert!(h.rc.borrow().lost.contains(&1));
        assert_eq!(h.r.bytes_in_flight(), 0);
    }

    #[test]
    fn tlp_then_rto_ladder() {
        let mut h = harness();

        h.r.rtt_stats_mut()
            .set_smoothed_rtt(Duration::from_millis(50));

        h.r.on_packet_sent(stream_pkt(1, 100), h.now, "").unwrap();
        h.r.on_packet_sent(stream_pkt(2, 100), h.now, "").unwrap();

        // First two alarms are tail loss probes of the newest packet.
        let alarm = h.r.loss_detection_timer().unwrap();
        h.r.on_loss_detection_timeout(alarm, "");
        let p = h.r.dequeue_for_retransmission().unwrap();
        assert_eq!(p.pkt_num, 2);

        let alarm = h.r.loss_detection_timer().unwrap();
        h.r.on_loss_detection_timeout(alarm, "");
        let p = h.r.dequeue_for_retransmission().unwrap();
        assert_eq!(p.pkt_num, 1);

        // TLP budget exhausted; nothing left in history, so the alarm is
        // disarmed on the next firing.
        let alarm = h.r.loss_detection_timer();
        assert!(alarm.is_none());
    }

    #[test]
    fn rto_requeues_oldest_two() {
        let mut h = harness();

        // No RTT sample: the TLP leg is skipped and the alarm goes straight
        // to RTO.
        for pn in 1..=4 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }

        let alarm = h.r.loss_detection_timer().unwrap();
        h.r.on_loss_detection_timeout(alarm, "");

        let mut retx = Vec::new();
        while let Some(p) = h.r.dequeue_for_retransmission() {
            retx.push(p.pkt_num);
        }
        assert_eq!(retx, vec![1, 2]);

        assert_eq!(h.cc.borrow().rto_count, 1);
        let (_, retransmitted, lost) = h.r.statistics();
        assert_eq!(retransmitted, 2);
        assert_eq!(lost, 2);
    }

    #[test]
    fn rto_callback_requeues_all_when_potentially_failed() {
        let mut config = Config::new(crate::PROTOCOL_VERSION).unwrap();
        config.set_use_fast_retransmit(true);

        let cc = TestCongestion::shared();
        let rc = Rc::new(RefCell::new(TestRedundancy::default()));
        let now = Instant::now();

        let mut r = Recovery::new(
            &config,
            Box::new(TestCongestionHandle(cc.clone())),
            rc,
            Some(Box::new(|_last_sent| true)),
            now,
        );
        r.set_handshake_complete();

        for pn in 1..=4 {
            r.on_packet_sent(stream_pkt(pn, 100), now, "").unwrap();
        }

        let alarm = r.loss_detection_timer().unwrap();
        r.on_loss_detection_timeout(alarm, "");

        let mut retx = Vec::new();
        while let Some(p) = r.dequeue_for_retransmission() {
            retx.push(p.pkt_num);
        }
        assert_eq!(retx, vec![1, 2, 3, 4]);
        assert_eq!(r.bytes_in_flight(), 0);
    }

    #[test]
    fn handshake_retransmission() {
        let h = harness();

        // The harness marks the handshake complete, so build a fresh
        // tracker that still considers it pending.
        let mut config = Config::new(crate::PROTOCOL_VERSION).unwrap();
        config.set_use_fast_retransmit(true);

        let cc = TestCongestion::shared();
        let rc = Rc::new(RefCell::new(TestRedundancy::default()));

        let mut r = Recovery::new(
            &config,
            Box::new(TestCongestionHandle(cc)),
            rc,
            None,
            h.now,
        );

        let mut pkt = stream_pkt(1, 100);
        pkt.enc_level = EncryptionLevel::Handshake;
        r.on_packet_sent(pkt, h.now, "").unwrap();

        let mut pkt = stream_pkt(2, 100);
        pkt.enc_level = EncryptionLevel::ForwardSecure;
        r.on_packet_sent(pkt, h.now, "").unwrap();

        let alarm = r.loss_detection_timer().unwrap();
        r.on_loss_detection_timeout(alarm, "");

        // Only the non-forward-secure packet was requeued.
        let mut retx = Vec::new();
        while let Some(p) = r.dequeue_for_retransmission() {
            retx.push(p.pkt_num);
        }
        assert_eq!(retx, vec![1]);
    }

    #[test]
    fn stale_ack_is_ignored() {
        let mut h = harness();

        for pn in 1..=4 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }

        let now = h.now + Duration::from_millis(10);
        h.r.on_ack_received(
            &ack_of(&[1..4]),
            0,
            1,
            EncryptionLevel::ForwardSecure,
            now,
            now,
            "",
        )
        .unwrap();

        // A later packet repeats the same largest acked: no error, no
        // state change.
        h.r.on_ack_received(
            &ack_of(&[1..4]),
            0,
            2,
            EncryptionLevel::ForwardSecure,
            now,
            now,
            "",
        )
        .unwrap();

        assert_eq!(h.cc.borrow().acked, vec![1, 2, 3]);
    }

    #[test]
    fn enc_level_mismatch_is_fatal() {
        let mut h = harness();

        h.r.on_packet_sent(stream_pkt(1, 100), h.now, "").unwrap();

        assert_eq!(
            h.r.on_ack_received(
                &ack_of(&[1..2]),
                0,
                1,
                EncryptionLevel::Handshake,
                h.now,
                h.now,
                "",
            ),
            Err(Error::EncryptionLevelMismatch)
        );
    }

    #[test]
    fn stop_waiting_advances_with_acks() {
        let mut h = harness();

        for pn in 1..=4 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }

        assert!(h.r.get_stop_waiting_frame(false).is_none());

        let now = h.now + Duration::from_millis(10);
        h.r.on_ack_received(
            &ack_of(&[1..3]),
            0,
            1,
            EncryptionLevel::ForwardSecure,
            now,
            now,
            "",
        )
        .unwrap();

        assert_eq!(
            h.r.get_stop_waiting_frame(false),
            Some(frame::Frame::StopWaiting { least_unacked: 3 })
        );

        // Unchanged state produces no further frame unless forced.
        assert!(h.r.get_stop_waiting_frame(false).is_none());
        assert!(h.r.get_stop_waiting_frame(true).is_some());
    }

    #[test]
    fn symbol_ack_updates_thresholds() {
        let mut h = harness_with(|config| {
            config.set_enhancement(Enhancement::LossRecovery);
        });

        h.r.rtt_stats_mut()
            .set_smoothed_rtt(Duration::from_millis(100));

        // Build up sent/retransmission statistics: 10 sent, 1 requeued.
        for pn in 1..=10 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }

        let now = h.now + Duration::from_millis(10);
        h.r.on_ack_received(
            &ack_of(&[6..11]),
            0,
            1,
            EncryptionLevel::ForwardSecure,
            now,
            now,
            "",
        )
        .unwrap();
        while h.r.dequeue_for_retransmission().is_some() {}

        let (tt_before, pt_before) = h.r.loss_thresholds();

        // own_retrans_rate = 5/5 = 1.0 > peer_loss_rate = 0.05: thresholds
        // widen.
        h.r.on_symbol_ack_received(95, 100, now + Duration::from_secs(1));

        let (tt_after, pt_after) = h.r.loss_thresholds();
        assert!(tt_after >= tt_before);
        assert!(pt_after >= pt_before);
        assert_eq!(h.r.acked_symbols(), 95);
    }

    #[test]
    fn rd_frame_widens_thresholds() {
        let mut h = harness_with(|config| {
            config.set_enhancement(Enhancement::ReorderDetection);
        });

        for pn in 1..=10 {
            h.r.on_packet_sent(stream_pkt(pn, 100), h.now, "").unwrap();
        }

        // Reordering of up to 5 packets reported: the duplicate threshold
        // becomes 3 + 5 = 8, so an ack of 6..=10 no longer marks 3..=5.
        h.r.on_rd_received(5, 0);

        let now = h.now + Duration::from_millis(10);
        h.r.on_ack_received(
            &ack_of(&[6..11]),
            0,
            1,
            EncryptionLevel::ForwardSecure,
            now,
            now,
            "",
        )
        .unwrap();

        let (_, _, lost) = h.r.statistics();
        assert_eq!(lost, 2);

        let mut retx = Vec::new();
        while let Some(p) = h.r.dequeue_for_retransmission() {
            retx.push(p.pkt_num);
        }
        assert_eq!(retx, vec![1, 2]);
    }

    #[test]
    fn sending_allowed_gates() {
        let mut h = harness();

        assert!(h.r.sending_allowed());

        // Congestion limited with nothing to retransmit.
        h.cc.borrow_mut().window = 50;
        h.r.on_packet_sent(stream_pkt(1, 100), h.now, "").unwrap();
        assert!(!h.r.sending_allowed());

        // Retransmissions bypass the congestion gate.
        h.r.on_duplicate_packet(stream_pkt(1, 100));
        assert!(h.r.sending_allowed());
    }

    #[test]
    fn sending_allowed_ignores_congestion_when_disabled() {
        let mut h = harness_with(|config| {
            config.set_apply_congestion_control(false);
        });

        h.cc.borrow_mut().window = 0;
        h.r.on_packet_sent(stream_pkt(1, 100), h.now, "").unwrap();

        assert!(h.r.sending_allowed());
    }

    #[test]
    fn should_send_retransmittable_after_a_run() {
        let mut h = harness();

        for pn in 1..=19u64 {
            let pkt = Sent {
                pkt_num: pn,
                frames: vec![frame::Frame::ACK {
                    ack_delay: 0,
                    ranges: ack_of(&[1..2]),
                }],
                time_sent: h.now,
                size: 30,
                enc_level: EncryptionLevel::ForwardSecure,
                in_flight: false,
            };

            h.r.on_packet_sent(pkt, h.now, "").unwrap();
        }

        assert!(h.r.should_send_retransmittable());

        h.r.on_packet_sent(stream_pkt(20, 100), h.now, "").unwrap();
        assert!(!h.r.should_send_retransmittable());
    }
}
