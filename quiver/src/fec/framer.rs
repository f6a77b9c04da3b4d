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

//! Fragmentation of repair symbols into repair frames.

use std::collections::VecDeque;

use crate::fec::RepairSymbol;
use crate::frame;

/// A FIFO of repair symbols awaiting transmission.
///
/// [`pop_frame`] peels the next fragment off the head symbol, setting the
/// FIN bit on the fragment that exhausts it. The scheduler polls
/// [`has_data_to_send`] to know whether more repair frames are pending.
///
/// [`pop_frame`]: FecFramer::pop_frame
/// [`has_data_to_send`]: FecFramer::has_data_to_send
#[derive(Default)]
pub struct FecFramer {
    transmission_queue: VecDeque<RepairSymbol>,

    // Bytes of the head symbol already emitted.
    offset_in_symbol: usize,

    // Fragment index of the next frame of the head symbol.
    frame_offset: u8,
}

impl FecFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a repair symbol for transmission.
    pub fn push_symbol(&mut self, symbol: RepairSymbol) {
        self.transmission_queue.push_back(symbol);
    }

    /// Queues a batch of repair symbols.
    pub fn push_symbols(&mut self, symbols: Vec<RepairSymbol>) {
        self.transmission_queue.extend(symbols);
    }

    /// Whether any repair data awaits transmission.
    pub fn has_data_to_send(&self) -> bool {
        !self.transmission_queue.is_empty()
    }

    /// The number of queued symbols.
    pub fn queued_symbols(&self) -> usize {
        self.transmission_queue.len()
    }

    /// Produces the next repair frame, at most `max_bytes` long on the
    /// wire, or `None` when the budget cannot fit a fragment header plus
    /// one payload byte.
    pub fn pop_frame(&mut self, max_bytes: usize) -> Option<frame::Frame> {
        let symbol = self.transmission_queue.front()?;

        let header_len = frame::repair_frame_header_len(self.frame_offset);

        if max_bytes <= header_len {
            return None;
        }

        let budget = max_bytes - header_len;

        let remaining = &symbol.data[self.offset_in_symbol..];
        let len = budget.min(remaining.len());

        let fin = len == remaining.len();

        let frame = frame::Frame::Repair {
            fin,
            convolutional: symbol.convolutional,
            scheme_specific: symbol.scheme_specific,
            block_number: symbol.block_number,
            symbol_index: symbol.symbol_index,
            encoding_symbol_id: symbol.encoding_symbol_id,
            offset_in_symbol: self.frame_offset,
            num_source: if self.frame_offset == 0 {
                symbol.num_source
            } else {
                0
            },
            num_repair: if self.frame_offset == 0 {
                symbol.num_repair
            } else {
                0
            },
            data: remaining[..len].to_vec(),
        };

        self.offset_in_symbol += len;

        if fin {
            self.transmission_queue.pop_front();
            self.offset_in_symbol = 0;
            self.frame_offset = 0;
        } else {
            self.frame_offset += 1;
        }

        Some(frame)
    }
}
