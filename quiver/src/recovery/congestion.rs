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

//! The congestion-control seam.
//!
//! The recovery core does not choose a congestion control algorithm; it
//! drives whatever implementation of [`CongestionController`] the connection
//! hands it. [`NewReno`] is provided as the default.

use std::time::Duration;
use std::time::Instant;

use crate::recovery::rtt::RttStats;

const INITIAL_WINDOW_PACKETS: usize = 10;

const MINIMUM_WINDOW_PACKETS: usize = 2;

const LOSS_REDUCTION_FACTOR: f64 = 0.5;

const MAX_DATAGRAM_SIZE: usize = 1452;

/// The interface between the sent-packet tracker and congestion control.
///
/// RTT state is owned by the tracker and lent to the controller on each
/// call.
pub trait CongestionController {
    /// Called for every sent packet.
    fn on_packet_sent(
        &mut self, now: Instant, bytes_in_flight: usize, pkt_num: u64,
        bytes: usize, is_retransmittable: bool,
    );

    /// Called for every newly acknowledged packet.
    fn on_packet_acked(
        &mut self, pkt_num: u64, bytes: usize, bytes_in_flight: usize,
        rtt: &RttStats,
    );

    /// Called for every packet declared lost, including recovered ones.
    fn on_packet_lost(
        &mut self, pkt_num: u64, bytes: usize, bytes_in_flight: usize,
    );

    /// Called when the retransmission timeout fires.
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// The current congestion window in bytes.
    fn congestion_window(&self) -> usize;

    /// Gives the controller a chance to leave slow start after an RTT
    /// update.
    fn maybe_exit_slow_start(&mut self, rtt: &RttStats);

    /// The retransmission delay the RTO alarm should use, or zero when the
    /// controller has no opinion.
    fn retransmission_delay(&self, rtt: &RttStats) -> Duration;
}

/// NewReno congestion control.
pub struct NewReno {
    congestion_window: usize,

    ssthresh: usize,

    bytes_acked: usize,

    max_datagram_size: usize,

    largest_sent_pkt: u64,

    // Loss events for packets sent before this point belong to an already
    // handled congestion event and must not shrink the window again.
    largest_sent_at_last_cutback: Option<u64>,
}

impl NewReno {
    pub fn new() -> Self {
        Self::with_max_datagram_size(MAX_DATAGRAM_SIZE)
    }

    pub fn with_max_datagram_size(max_datagram_size: usize) -> Self {
        NewReno {
            congestion_window: max_datagram_size * INITIAL_WINDOW_PACKETS,
            ssthresh: usize::MAX,
            bytes_acked: 0,
            max_datagram_size,
            largest_sent_pkt: 0,
            largest_sent_at_last_cutback: None,
        }
    }

    fn in_slow_start(&self) -> bool {
        self.congestion_window < self.ssthresh
    }
}

impl Default for NewReno {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionController for NewReno {
    fn on_packet_sent(
        &mut self, _now: Instant, _bytes_in_flight: usize, pkt_num: u64,
        _bytes: usize, _is_retransmittable: bool,
    ) {
        self.largest_sent_pkt = self.largest_sent_pkt.max(pkt_num);
    }

    fn on_packet_acked(
        &mut self, _pkt_num: u64, bytes: usize, _bytes_in_flight: usize,
        _rtt: &RttStats,
    ) {
        if self.in_slow_start() {
            self.congestion_window += bytes;
            return;
        }

        // Congestion avoidance.
        self.bytes_acked += bytes;

        if self.bytes_acked >= self.congestion_window {
            self.bytes_acked -= self.congestion_window;
            self.congestion_window += self.max_datagram_size;
        }
    }

    fn on_packet_lost(
        &mut self, pkt_num: u64, _bytes: usize, _bytes_in_flight: usize,
    ) {
        if let Some(cutback) = self.largest_sent_at_last_cutback {
            if pkt_num <= cutback {
                return;
            }
        }

        self.congestion_window = std::cmp::max(
            (self.congestion_window as f64 * LOSS_REDUCTION_FACTOR) as usize,
            self.max_datagram_size * MINIMUM_WINDOW_PACKETS,
        );

        self.ssthresh = self.congestion_window;
        self.bytes_acked = 0;
        self.largest_sent_at_last_cutback = Some(self.largest_sent_pkt);
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        if packets_retransmitted {
            self.ssthresh = self.congestion_window / 2;
            self.congestion_window =
                self.max_datagram_size * MINIMUM_WINDOW_PACKETS;
        }
    }

    fn congestion_window(&self) -> usize {
        self.congestion_window
    }

    fn maybe_exit_slow_start(&mut self, rtt: &RttStats) {
        // Delay increase is taken as the end of the uncongested regime.
        if self.in_slow_start() &&
            rtt.latest_rtt() > rtt.min_rtt() + rtt.min_rtt() / 8
        {
            self.ssthresh = self.congestion_window;
        }
    }

    fn retransmission_delay(&self, rtt: &RttStats) -> Duration {
        match rtt.smoothed_rtt() {
            Some(srtt) => srtt + rtt.rttvar() * 4,
            None => Duration::ZERO,
        }
    }
}
