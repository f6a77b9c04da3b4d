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

//! The send side of the FEC pipeline.
//!
//! Outgoing protected packets are stamped with a payload id, copied into
//! the current container (a source block, or the convolutional window for
//! RLC), and when the container is ready its repair symbols are generated
//! and handed to the framer for fragmentation into repair frames.

use crate::fec::framer::FecFramer;
use crate::fec::redundancy::SharedRedundancyController;
use crate::fec::redundancy::TransmissionParams;
use crate::fec::scheduler::RoundRobinScheduler;
use crate::fec::scheme;
use crate::fec::scheme::FecScheme;
use crate::fec::window::FecWindow;

use crate::frame;
use crate::packet;

use crate::Config;
use crate::FecSchemeKind;
use crate::Result;

/// The effective block shape after scheme constraints are applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BlockShape {
    data: usize,

    repair: usize,

    interleave: usize,

    window_step: usize,
}

/// The sender-side FEC framework.
pub struct FecSender {
    scheme: Box<dyn FecScheme>,

    scheme_kind: FecSchemeKind,

    scheduler: RoundRobinScheduler,

    framer: FecFramer,

    window: FecWindow,

    redundancy: SharedRedundancyController,

    // RLC runs over the sliding window; the block schemes over the
    // scheduler's interleaved blocks.
    convolutional: bool,

    only_send_when_application_limited: bool,

    protect_reliable_stream_frames: bool,

    next_encoding_symbol_id: u32,

    symbols_sent: u64,

    symbols_acked: u64,
}

impl FecSender {
    pub fn new(
        config: &Config, redundancy: SharedRedundancyController,
    ) -> Self {
        let convolutional = config.fec_scheme == FecSchemeKind::Rlc;

        let window_size = redundancy.borrow().data_symbols().max(1);

        FecSender {
            scheme: scheme::new_fec_scheme(config.fec_scheme),
            scheme_kind: config.fec_scheme,
            scheduler: RoundRobinScheduler::new(),
            framer: FecFramer::new(),
            window: FecWindow::new(window_size),
            redundancy,
            convolutional,
            only_send_when_application_limited: config
                .only_send_fec_when_application_limited,
            protect_reliable_stream_frames: config
                .protect_reliable_stream_frames,
            next_encoding_symbol_id: 1,
            symbols_sent: 0,
            symbols_acked: 0,
        }
    }

    /// Whether reliable stream frames should be FEC-tagged on send.
    pub fn protects_reliable_stream_frames(&self) -> bool {
        self.protect_reliable_stream_frames
    }

    /// The payload id the next protected packet will be stamped with.
    pub fn next_payload_id(&self) -> Result<packet::FecPayloadId> {
        if self.convolutional {
            return Ok(packet::FecPayloadId::new_convolutional_source(
                self.next_encoding_symbol_id,
            ));
        }

        let shape = self.shape();

        packet::FecPayloadId::new_block_source(
            self.scheduler.peek_block_number(shape.interleave),
            self.scheduler.peek_block_offset(shape.interleave),
        )
    }

    /// Takes custody of a protected packet and possibly generates the
    /// repair symbols of the container it completed.
    ///
    /// `hdr` must carry the id returned by [`next_payload_id`];
    /// `app_limited` gates symbol generation when the configuration asks
    /// for FEC only during application-limited phases.
    ///
    /// [`next_payload_id`]: FecSender::next_payload_id
    pub fn on_packet_sent(
        &mut self, data: &[u8], hdr: &packet::Header,
        params: TransmissionParams, app_limited: bool,
    ) -> Result<()> {
        self.redundancy.borrow_mut().push_params(params);

        let shape = self.shape();

        if self.convolutional {
            if self.window.size() != shape.data {
                self.window.set_size(shape.data);
            }

            self.window
                .add_packet(data, hdr.payload_id.encoding_symbol_id());
            self.next_encoding_symbol_id += 1;
        } else {
            let block = self.scheduler.next_block(shape.interleave);
            block.add_packet(data, hdr);
        }

        if self.only_send_when_application_limited && !app_limited {
            return Ok(());
        }

        if self.convolutional {
            self.maybe_generate_window_symbols(shape)
        } else {
            self.maybe_generate_block_symbols(
                shape,
                hdr.payload_id.block_number(),
            )
        }
    }

    /// Pops the next repair frame within `max_bytes`, if any repair data
    /// is queued.
    pub fn pop_repair_frame(&mut self, max_bytes: usize) -> Option<frame::Frame> {
        self.framer.pop_frame(max_bytes)
    }

    /// Whether repair frames await transmission.
    pub fn has_repair_data_to_send(&self) -> bool {
        self.framer.has_data_to_send()
    }

    /// Generates and queues symbols for every container that still holds
    /// unsent packets, used when the connection is about to go idle.
    pub fn flush(&mut self) -> Result<()> {
        let shape = self.shape();

        if self.convolutional {
            if self.window.has_something_to_send() {
                self.generate_window_symbols(shape)?;
            }

            return Ok(());
        }

        for mut block in self.scheduler.drain_pending_blocks() {
            let packets = block.packet_data();

            if packets.is_empty() {
                continue;
            }

            let symbols = self.scheme.generate_repair_symbols(
                &packets,
                shape.repair,
                block.block_number(),
            )?;

            block.set_repair_symbols(symbols);
            block.prepare_to_send();

            let symbols = block.take_repair_symbols();

            self.symbols_sent += symbols.len() as u64;
            self.framer.push_symbols(symbols);
        }

        Ok(())
    }

    /// Updates the acknowledged-symbol counter from peer feedback.
    pub fn on_symbol_ack(&mut self, symbols_received: u64) {
        self.symbols_acked = symbols_received;

        if self.symbols_sent > 0 {
            let loss_rate = (self.symbols_sent.saturating_sub(symbols_received))
                as f64 /
                self.symbols_sent as f64;

            trace!(
                "symbols sent={} acked={} loss_rate={:.4}",
                self.symbols_sent,
                symbols_received,
                loss_rate
            );
        }
    }

    /// Total repair symbols handed to the framer.
    pub fn symbols_sent(&self) -> u64 {
        self.symbols_sent
    }

    /// Repair symbols the peer reported receiving.
    pub fn symbols_acked(&self) -> u64 {
        self.symbols_acked
    }

    // The controller's shape, with the XOR constraint applied: one parity
    // symbol over k/r packets, r-way interleaved.
    fn shape(&self) -> BlockShape {
        let rc = self.redundancy.borrow();

        let mut shape = BlockShape {
            data: rc.data_symbols().max(1),
            repair: rc.repair_symbols().max(1),
            interleave: rc.interleaved_blocks().max(1),
            window_step: rc.window_step().max(1),
        };

        if self.scheme_kind == FecSchemeKind::Xor {
            shape.interleave = shape.repair;
            shape.data = (shape.data / shape.repair).max(1);
            shape.repair = 1;
        }

        shape
    }

    fn maybe_generate_window_symbols(&mut self, shape: BlockShape) -> Result<()> {
        let emitted_distance = self
            .window
            .current_index()
            .wrapping_sub(self.window.last_symbol_sent())
            as usize;

        if self.window.has_something_to_send() &&
            emitted_distance >= shape.window_step
        {
            self.generate_window_symbols(shape)?;
        }

        Ok(())
    }

    fn maybe_generate_block_symbols(
        &mut self, shape: BlockShape, block_number: u64,
    ) -> Result<()> {
        let block = match self.scheduler.block_mut(block_number) {
            Some(b) => b,
            None => return Ok(()),
        };

        if block.current_number_of_packets() < shape.data {
            return Ok(());
        }

        let packets = block.packet_data();

        let symbols = self.scheme.generate_repair_symbols(
            &packets,
            shape.repair,
            block_number,
        )?;

        block.set_repair_symbols(symbols);
        block.prepare_to_send();

        let symbols = block.take_repair_symbols();

        self.symbols_sent += symbols.len() as u64;
        self.framer.push_symbols(symbols);

        self.scheduler.sent_block(block_number);

        Ok(())
    }

    fn generate_window_symbols(&mut self, shape: BlockShape) -> Result<()> {
        let packets = self.window.packet_data();

        if packets.is_empty() {
            return Ok(());
        }

        let symbols = self.scheme.generate_repair_symbols(
            &packets,
            shape.repair,
            u64::from(self.window.current_index()),
        )?;

        self.window.set_repair_symbols(symbols);
        self.window.prepare_to_send();

        let symbols = self.window.take_repair_symbols();

        self.symbols_sent += symbols.len() as u64;
        self.framer.push_symbols(symbols);

        Ok(())
    }
}
