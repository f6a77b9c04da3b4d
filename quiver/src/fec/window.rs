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

//! The convolutional (sliding window) FEC container.

use std::collections::VecDeque;

use crate::fec::redundancy::RedundancyController;
use crate::fec::RepairSymbol;

/// A ring of the last `window_size` protected packets.
///
/// Where a block emits its repair symbols once k packets accumulated, the
/// window emits whenever `window_step` new packets entered since the last
/// emission.
pub struct FecWindow {
    window_size: usize,

    packets: VecDeque<Vec<u8>>,

    repair_symbols: Vec<RepairSymbol>,

    // Encoding symbol id of the newest packet in the window.
    current_index: u32,

    last_symbol_sent: u32,
}

impl FecWindow {
    pub fn new(window_size: usize) -> Self {
        FecWindow {
            window_size: window_size.max(1),
            packets: VecDeque::new(),
            repair_symbols: Vec::new(),
            current_index: 0,
            last_symbol_sent: 0,
        }
    }

    /// Whether enough new packets entered the window since the last
    /// emission.
    pub fn should_be_sent(&self, rc: &dyn RedundancyController) -> bool {
        (self.current_index - self.last_symbol_sent) as usize >=
            rc.window_step()
    }

    /// Appends a packet, sliding the oldest one out when full.
    pub fn add_packet(&mut self, data: &[u8], encoding_symbol_id: u32) {
        debug_assert_eq!(
            encoding_symbol_id,
            self.current_index + 1,
            "encoding symbol ids must be contiguous"
        );

        if self.packets.len() == self.window_size {
            self.packets.pop_front();
        }

        self.packets.push_back(data.to_vec());
        self.current_index = encoding_symbol_id;
    }

    /// Resizes the ring, keeping the newest packets.
    pub fn set_size(&mut self, window_size: usize) {
        self.window_size = window_size.max(1);

        while self.packets.len() > self.window_size {
            self.packets.pop_front();
        }
    }

    /// Marks the current window contents as covered by the symbols just
    /// generated.
    pub fn prepare_to_send(&mut self) {
        self.last_symbol_sent = self.current_index;
    }

    /// Attaches freshly generated repair symbols, stamping them with the
    /// window position.
    pub fn set_repair_symbols(&mut self, mut symbols: Vec<RepairSymbol>) {
        let total = symbols.len() as u8;
        let packets = self.packets.len() as u8;

        for s in &mut symbols {
            s.convolutional = true;
            s.encoding_symbol_id = self.current_index;
            s.num_repair = total;
            s.num_source = packets;
        }

        self.repair_symbols = symbols;
    }

    pub fn take_repair_symbols(&mut self) -> Vec<RepairSymbol> {
        std::mem::take(&mut self.repair_symbols)
    }

    pub fn current_number_of_packets(&self) -> usize {
        self.packets.len()
    }

    /// The encoding symbol id of the newest packet.
    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    /// The encoding symbol id at the last emission.
    pub fn last_symbol_sent(&self) -> u32 {
        self.last_symbol_sent
    }

    /// The configured ring size.
    pub fn size(&self) -> usize {
        self.window_size
    }

    /// Whether packets entered the window since the last emission.
    pub fn has_something_to_send(&self) -> bool {
        self.current_index != self.last_symbol_sent
    }

    /// The window contents, oldest first.
    pub fn packet_data(&self) -> Vec<&[u8]> {
        self.packets.iter().map(|p| p.as_slice()).collect()
    }
}
