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

//! Redundancy control: choosing how many source packets a block covers (k),
//! how many repair symbols accompany it (r), how many blocks are
//! interleaved, and how far a convolutional window steps between symbols.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use std::time::Duration;
use std::time::Instant;

use crate::Config;
use crate::RedundancyKind;

// Sample window of the averaging controller, in packets.
const SAMPLE_SIZE: usize = 500;

// EMA weight of the previous mean burst length.
const BURST_SMOOTHING: f64 = 0.5;

// EMA weight of the previous mean inter-loss distance.
const ILD_SMOOTHING: f64 = 0.7;

// Loss-rate controller: number of smoothed RTTs between samples.
const SAMPLE_RTTS: u32 = 5;

// Loss-rate controller: samples per gamma refresh.
const SAMPLES_PER_REFRESH: usize = 3;

// Loss-rate controller: initial block size.
const GAMMA_INIT: f64 = 10.0;

// Loss-rate controller: target residual loss rate.
const GAMMA_TARGET: f64 = 0.03;

// Loss-rate controller: multiplicative step.
const DELTA: f64 = 0.33;

const MIN_SOURCE_SYMBOLS: f64 = 2.0;

const MAX_SOURCE_SYMBOLS: f64 = 255.0;

/// Transmission statistics pushed to the controller on every protected
/// packet.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransmissionParams {
    /// Total packets sent on the path.
    pub sent: u64,

    /// Total retransmissions.
    pub retransmitted: u64,

    /// Total packets declared lost.
    pub lost: u64,

    /// Total packets the peer received.
    pub received: u64,

    /// Total packets the peer obtained through recovery.
    pub recovered: u64,

    /// The current smoothed RTT.
    pub smoothed_rtt: Duration,

    /// The time of the push.
    pub now: Option<Instant>,
}

/// Chooses the FEC block shape from loss observations.
///
/// One instance is shared between the sent-packet tracker (which feeds it
/// loss and delivery events) and the FEC sender (which polls it for the
/// block shape).
pub trait RedundancyController {
    /// Called for every packet declared lost.
    fn on_packet_lost(&mut self, pkt_num: u64);

    /// Called for every packet the peer acknowledged.
    fn on_packet_received(&mut self, pkt_num: u64);

    /// The number of source packets per block (k).
    fn data_symbols(&self) -> usize;

    /// The number of repair symbols per block (r).
    fn repair_symbols(&self) -> usize;

    /// The number of blocks filled round-robin at the same time.
    fn interleaved_blocks(&self) -> usize;

    /// The number of new packets between repair symbols of a convolutional
    /// window.
    fn window_step(&self) -> usize;

    /// Feeds fresh transmission statistics to the controller.
    fn push_params(&mut self, params: TransmissionParams);
}

/// The controller handle shared between components of one connection.
pub type SharedRedundancyController = Rc<RefCell<dyn RedundancyController>>;

/// Builds the controller selected by the configuration.
pub fn new_redundancy_controller(config: &Config) -> SharedRedundancyController {
    match config.redundancy {
        RedundancyKind::Constant {
            data,
            repair,
            interleave,
            window_step,
        } => Rc::new(RefCell::new(ConstantRedundancyController::new(
            data,
            repair,
            interleave,
            window_step,
        ))),

        RedundancyKind::Average {
            max_data,
            max_repair,
        } => Rc::new(RefCell::new(AverageRedundancyController::new(
            max_data, max_repair,
        ))),

        RedundancyKind::LossRate { repair } =>
            Rc::new(RefCell::new(LossRateRedundancyController::new(repair))),
    }
}

/// Fixed block shape.
pub struct ConstantRedundancyController {
    data_symbols: usize,

    repair_symbols: usize,

    interleaved_blocks: usize,

    window_step: usize,
}

impl ConstantRedundancyController {
    pub fn new(
        data_symbols: usize, repair_symbols: usize, interleaved_blocks: usize,
        window_step: usize,
    ) -> Self {
        ConstantRedundancyController {
            data_symbols,
            repair_symbols,
            interleaved_blocks,
            window_step,
        }
    }
}

impl RedundancyController for ConstantRedundancyController {
    fn on_packet_lost(&mut self, _pkt_num: u64) {}

    fn on_packet_received(&mut self, _pkt_num: u64) {}

    fn data_symbols(&self) -> usize {
        self.data_symbols
    }

    fn repair_symbols(&self) -> usize {
        self.repair_symbols
    }

    fn interleaved_blocks(&self) -> usize {
        self.interleaved_blocks
    }

    fn window_step(&self) -> usize {
        self.window_step
    }

    fn push_params(&mut self, _params: TransmissionParams) {}
}

/// Tracks the mean loss burst length and mean inter-loss distance over a
/// 500-packet sample and shapes blocks so one block spans roughly one
/// inter-loss interval with enough symbols to repair one burst.
///
/// Assumes packet numbers increase by one between consecutive sends.
pub struct AverageRedundancyController {
    initial_packet_of_sample: u64,

    packets_counter: usize,

    contiguous_lost_packets: usize,

    last_lost_packet: u64,

    // Histogram of burst lengths seen this sample.
    burst_counter: HashMap<usize, usize>,

    // Histogram of distances between consecutive loss events.
    inter_loss_counter: HashMap<usize, usize>,

    mean_burst_length: usize,

    mean_inter_loss_distance: usize,

    max_data_symbols: u8,

    max_repair_symbols: u8,
}

impl AverageRedundancyController {
    pub fn new(max_data_symbols: u8, max_repair_symbols: u8) -> Self {
        AverageRedundancyController {
            initial_packet_of_sample: 0,
            packets_counter: 0,
            contiguous_lost_packets: 0,
            last_lost_packet: 0,
            burst_counter: HashMap::new(),
            inter_loss_counter: HashMap::new(),
            mean_burst_length: max_repair_symbols as usize,
            mean_inter_loss_distance: max_data_symbols as usize,
            max_data_symbols,
            max_repair_symbols,
        }
    }

    fn increment_counter(&mut self) {
        self.packets_counter += 1;

        if self.packets_counter == SAMPLE_SIZE {
            self.compute_estimations();

            self.packets_counter = 0;
            self.burst_counter.clear();
            self.inter_loss_counter.clear();
        }
    }

    fn compute_estimations(&mut self) {
        let mut sum_burst = 0;
        let mut occurrences = 0;

        for (burst_len, count) in &self.burst_counter {
            sum_burst += burst_len * count;
            occurrences += count;
        }

        self.mean_burst_length = if occurrences > 0 {
            moving_average(
                self.mean_burst_length,
                sum_burst / occurrences,
                BURST_SMOOTHING,
            )
        } else {
            moving_average(self.mean_burst_length, 0, BURST_SMOOTHING)
        };

        let mut sum_ild = 0;
        occurrences = 0;

        for (ild, count) in &self.inter_loss_counter {
            sum_ild += ild * count;
            occurrences += count;
        }

        self.mean_inter_loss_distance = if occurrences > 0 {
            std::cmp::min(
                moving_average(
                    self.mean_inter_loss_distance,
                    sum_ild / occurrences,
                    ILD_SMOOTHING,
                ),
                self.max_data_symbols as usize,
            )
        } else {
            moving_average(
                self.mean_inter_loss_distance,
                self.max_data_symbols as usize,
                ILD_SMOOTHING,
            )
        };
    }
}

impl RedundancyController for AverageRedundancyController {
    fn on_packet_lost(&mut self, pkt_num: u64) {
        if self.packets_counter == 0 {
            self.initial_packet_of_sample = pkt_num;
        }

        if pkt_num < self.initial_packet_of_sample {
            return;
        }

        if self.last_lost_packet == pkt_num.wrapping_sub(1) {
            // The current burst continues.
            self.contiguous_lost_packets += 1;
        } else {
            // A new burst begins: account for the finished one.
            *self
                .burst_counter
                .entry(self.contiguous_lost_packets)
                .or_insert(0) += 1;

            *self
                .inter_loss_counter
                .entry((pkt_num - self.last_lost_packet) as usize)
                .or_insert(0) += 1;

            self.contiguous_lost_packets = 1;
        }

        self.last_lost_packet = pkt_num;

        self.increment_counter();
    }

    fn on_packet_received(&mut self, pkt_num: u64) {
        if pkt_num < self.initial_packet_of_sample {
            return;
        }

        if self.packets_counter == 0 {
            self.initial_packet_of_sample = pkt_num;
        }

        self.increment_counter();
    }

    fn data_symbols(&self) -> usize {
        std::cmp::min(
            self.mean_inter_loss_distance,
            self.max_data_symbols as usize,
        )
    }

    fn repair_symbols(&self) -> usize {
        std::cmp::min(self.mean_burst_length, self.max_repair_symbols as usize)
    }

    fn interleaved_blocks(&self) -> usize {
        // With a single repair symbol per block, a burst of n losses needs
        // n interleaved blocks to be repairable.
        if self.max_repair_symbols == 1 {
            std::cmp::max(self.mean_burst_length, 1)
        } else {
            1
        }
    }

    fn window_step(&self) -> usize {
        std::cmp::max(
            2,
            self.mean_inter_loss_distance /
                std::cmp::max(self.mean_burst_length, 1),
        )
    }

    fn push_params(&mut self, _params: TransmissionParams) {}
}

fn moving_average(old: usize, new: usize, factor: f64) -> usize {
    (factor * old as f64 + (1.0 - factor) * new as f64) as usize
}

/// Adapts the block size to the observed retransmission rate, keeping the
/// residual loss near a fixed target (the rQUIC approach).
pub struct LossRateRedundancyController {
    gamma: f64,

    repair_symbols: usize,

    epsilon: [f64; SAMPLES_PER_REFRESH],

    state: usize,

    sample_time: Option<Instant>,

    last_saved: TransmissionParams,
}

impl LossRateRedundancyController {
    pub fn new(repair_symbols: usize) -> Self {
        LossRateRedundancyController {
            gamma: GAMMA_INIT,
            repair_symbols,
            epsilon: [0.0; SAMPLES_PER_REFRESH],
            state: 0,
            sample_time: None,
            last_saved: TransmissionParams::default(),
        }
    }

    fn compute_estimations(&mut self) {
        let average =
            self.epsilon.iter().sum::<f64>() / SAMPLES_PER_REFRESH as f64;

        if average > GAMMA_TARGET {
            self.gamma *= 1.0 - DELTA;
        } else {
            self.gamma *= 1.0 + DELTA;
        }

        self.gamma = self.gamma.clamp(MIN_SOURCE_SYMBOLS, MAX_SOURCE_SYMBOLS);

        trace!("loss-rate rc: epsilon={average:.4} gamma={:.1}", self.gamma);
    }
}

impl RedundancyController for LossRateRedundancyController {
    fn on_packet_lost(&mut self, _pkt_num: u64) {}

    fn on_packet_received(&mut self, _pkt_num: u64) {}

    fn data_symbols(&self) -> usize {
        self.gamma as usize
    }

    fn repair_symbols(&self) -> usize {
        self.repair_symbols
    }

    fn interleaved_blocks(&self) -> usize {
        1
    }

    fn window_step(&self) -> usize {
        2
    }

    fn push_params(&mut self, params: TransmissionParams) {
        let now = match params.now {
            Some(now) => now,
            None => return,
        };

        match self.sample_time {
            None => {
                self.sample_time = Some(now);
                self.last_saved = params;
                return;
            },

            Some(sample_time) => {
                if now.saturating_duration_since(sample_time) <
                    params.smoothed_rtt * SAMPLE_RTTS
                {
                    return;
                }
            },
        }

        self.sample_time = Some(now);

        let sent = params.sent - self.last_saved.sent;
        let retransmitted =
            params.retransmitted - self.last_saved.retransmitted;

        self.last_saved = params;

        self.epsilon[self.state] = if sent == 0 || retransmitted >= sent {
            1.0
        } else {
            retransmitted as f64 / sent as f64
        };

        self.state += 1;

        if self.state == SAMPLES_PER_REFRESH {
            self.compute_estimations();

            self.epsilon = [0.0; SAMPLES_PER_REFRESH];
            self.state = 0;
        }
    }
}
