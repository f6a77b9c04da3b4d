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

//! 🏹 Loss recovery and forward error correction for QUIC-family transports.
//!
//! quiver is the recovery core of an FEC-enabled QUIC transport: it decides,
//! for every packet an endpoint sends or receives, whether the packet is
//! lost, whether it is in flight, whether to retransmit or repair it, when to
//! emit acknowledgements, and how much repair redundancy to produce.
//!
//! The crate provides the building blocks that a connection task composes,
//! one set per network path:
//!
//! * [`recovery::Recovery`] is the sent-packet tracker: in-flight ledger,
//!   loss detector, retransmission queue and the loss/TLP/RTO alarms.
//! * [`tracker::ReceivedPacketTracker`] does received and recovered packet
//!   bookkeeping, producing ACK and RECOVERED frames on schedule.
//! * [`fec::FecSender`] and [`fec::FecReceiver`] form the FEC pipeline:
//!   source block assembly, repair symbol generation and fragmentation into
//!   repair frames on the send side; reassembly, decoding and recovered
//!   packet re-injection on the receive side.
//! * [`fec::redundancy`] holds the controllers choosing the (k, r) block
//!   shape from observed loss patterns.
//! * The sent-packet tracker owns an adaptive threshold controller that
//!   tunes loss detection from symbol-level feedback when
//!   [`Enhancement::LossRecovery`] is selected.
//!
//! All components are driven by the owning connection task: every mutating
//! call takes the current time explicitly and no internal threads or locks
//! exist. Alarms are exposed as [`std::time::Instant`] deadlines that the
//! task is expected to observe in its event loop.

#![allow(clippy::upper_case_acronyms)]
#![warn(unused_qualifications)]

#[macro_use]
extern crate log;

use std::time::Duration;

pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::error::WireErrorCode;

/// The current wire version.
pub const PROTOCOL_VERSION: u32 = PROTOCOL_VERSION_46;

/// Wire version with TLS-style framing (repair frames use type 0x0f).
const PROTOCOL_VERSION_46: u32 = 46;

/// First wire version with modern ACK cadence. Versions below this ACK every
/// 20 packets to bound the peer's sent-packet state.
const PROTOCOL_VERSION_MODERN_ACKS: u32 = 39;

/// Oldest supported wire version.
const PROTOCOL_VERSION_LEGACY: u32 = 35;

/// The maximum size of a received packet's payload.
pub const MAX_RECV_PACKET_SIZE: usize = 1452;

// The delay before a pending acknowledgement is flushed.
const ACK_SEND_DELAY: Duration = Duration::from_millis(25);

// How many retransmittable packets may be received before an ACK is queued
// immediately.
const RETRANSMITTABLE_PACKETS_BEFORE_ACK: usize = 2;

// Legacy versions force an ACK after this many received packets.
const MAX_PACKETS_RECEIVED_BEFORE_ACK: usize = 20;

// How many non-retransmittable packets may be sent in a row before the
// sender is asked to produce a retransmittable one.
const MAX_NON_RETRANSMITTABLE_PACKETS: usize = 19;

// The maximum number of sent packets tracked before the connection is
// terminated rather than growing without bound.
const MAX_TRACKED_SENT_PACKETS: usize = 5000;

// The maximum number of intentionally skipped packet numbers remembered for
// optimistic-ACK detection.
const MAX_TRACKED_SKIPPED_PACKETS: usize = 10;

// The maximum number of ACK ranges tracked for received packets.
const MAX_TRACKED_ACK_RANGES: usize = 255;

// The maximum number of ranges tracked for received repair symbols.
const MAX_TRACKED_SYMBOL_ACK_RANGES: usize = 2000;

// The maximum number of partially received FEC blocks buffered before the
// oldest is evicted.
const MAX_BUFFERED_FEC_BLOCKS: usize = 200;

mod error;

pub mod fec;
pub mod frame;
pub mod packet;
pub mod ranges;
pub mod recovery;
pub mod tracker;

/// The FEC scheme used to produce and consume repair symbols.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FecSchemeKind {
    /// Single parity symbol per block. Repairs exactly one erasure.
    Xor,

    /// Random linear code over GF(256) with a sliding encoding window.
    Rlc,

    /// Reed-Solomon over GF(256).
    ReedSolomon,
}

/// The redundancy controller variant choosing the block shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedundancyKind {
    /// Fixed (k, r, interleave, window step) provided at configuration time.
    Constant {
        /// Source symbols per block.
        data: usize,
        /// Repair symbols per block.
        repair: usize,
        /// Interleaved block count.
        interleave: usize,
        /// Convolutional window step.
        window_step: usize,
    },

    /// Moving averages of loss burst length and inter-loss distance.
    Average {
        /// Upper bound on source symbols per block.
        max_data: u8,
        /// Upper bound on repair symbols per block.
        max_repair: u8,
    },

    /// Loss-rate tracking with a residual-loss target (rQUIC style).
    LossRate {
        /// Fixed repair symbol count.
        repair: usize,
    },
}

/// Loss-detection enhancement modes. At most one is active per connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Enhancement {
    /// Static thresholds.
    #[default]
    None,

    /// Adapt the loss-detection thresholds from symbol-ACK feedback.
    LossRecovery,

    /// Widen the loss-detection thresholds with peer-reported reordering
    /// (RD frames).
    ReorderDetection,

    /// Augment the time threshold with four times the RTT variance.
    DelayVariance,
}

/// Connection configuration consumed by the recovery and FEC components.
///
/// All switches are per-connection; components copy what they need at
/// construction time.
pub struct Config {
    version: u32,

    fec_scheme: FecSchemeKind,

    redundancy: RedundancyKind,

    disable_fec_recovered_frames: bool,

    protect_reliable_stream_frames: bool,

    use_fast_retransmit: bool,

    only_send_fec_when_application_limited: bool,

    apply_congestion_control: bool,

    enhancement: Enhancement,

    max_ack_delay: Duration,

    max_tracked_sent_packets: usize,
}

impl Config {
    /// Creates a config object with the given version.
    pub fn new(version: u32) -> Result<Config> {
        if !version_is_supported(version) {
            return Err(Error::UnknownVersion);
        }

        Ok(Config {
            version,
            fec_scheme: FecSchemeKind::Xor,
            redundancy: RedundancyKind::Constant {
                data: 4,
                repair: 1,
                interleave: 1,
                window_step: 2,
            },
            disable_fec_recovered_frames: false,
            protect_reliable_stream_frames: false,
            use_fast_retransmit: true,
            only_send_fec_when_application_limited: false,
            apply_congestion_control: true,
            enhancement: Enhancement::None,
            max_ack_delay: ACK_SEND_DELAY,
            max_tracked_sent_packets: MAX_TRACKED_SENT_PACKETS,
        })
    }

    /// Sets the FEC scheme used by both directions of the connection.
    pub fn set_fec_scheme(&mut self, scheme: FecSchemeKind) {
        self.fec_scheme = scheme;
    }

    /// Sets the redundancy controller variant.
    pub fn set_redundancy(&mut self, redundancy: RedundancyKind) {
        self.redundancy = redundancy;
    }

    /// Folds recovered packets into the normal ACK path instead of emitting
    /// RECOVERED frames.
    pub fn set_disable_fec_recovered_frames(&mut self, v: bool) {
        self.disable_fec_recovered_frames = v;
    }

    /// FEC-protects reliable stream frames in addition to unreliable ones.
    pub fn set_protect_reliable_stream_frames(&mut self, v: bool) {
        self.protect_reliable_stream_frames = v;
    }

    /// Enables the duplicate-threshold leg of loss detection.
    pub fn set_use_fast_retransmit(&mut self, v: bool) {
        self.use_fast_retransmit = v;
    }

    /// Only generates repair symbols while the sender is application
    /// limited.
    pub fn set_only_send_fec_when_application_limited(&mut self, v: bool) {
        self.only_send_fec_when_application_limited = v;
    }

    /// Gates sending on the congestion window. Disabling this lets the
    /// sender ignore the congestion controller entirely.
    pub fn set_apply_congestion_control(&mut self, v: bool) {
        self.apply_congestion_control = v;
    }

    /// Selects the loss-detection enhancement mode.
    pub fn set_enhancement(&mut self, enhancement: Enhancement) {
        self.enhancement = enhancement;
    }

    /// Sets the delay before a pending acknowledgement is flushed.
    pub fn set_max_ack_delay(&mut self, delay: Duration) {
        self.max_ack_delay = delay;
    }

    /// Overrides the cap on tracked sent packets.
    pub fn set_max_tracked_sent_packets(&mut self, max: usize) {
        self.max_tracked_sent_packets = max;
    }

    /// Whether repair frames use the legacy 0x0a frame type.
    pub(crate) fn is_legacy(&self) -> bool {
        self.version < PROTOCOL_VERSION_MODERN_ACKS
    }
}

/// Returns true if the given wire version is supported.
pub fn version_is_supported(version: u32) -> bool {
    (PROTOCOL_VERSION_LEGACY..=PROTOCOL_VERSION_46).contains(&version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_version() {
        assert!(Config::new(PROTOCOL_VERSION).is_ok());
        assert!(Config::new(PROTOCOL_VERSION_LEGACY).is_ok());
        assert_eq!(Config::new(0xbaba_baba).err(), Some(Error::UnknownVersion));
    }

    #[test]
    fn legacy_versions() {
        let config = Config::new(35).unwrap();
        assert!(config.is_legacy());

        let config = Config::new(PROTOCOL_VERSION).unwrap();
        assert!(!config.is_legacy());
    }
}
