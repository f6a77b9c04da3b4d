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

//! FEC source blocks.

use std::collections::BTreeMap;

use crate::fec::redundancy::RedundancyController;
use crate::fec::RepairSymbol;
use crate::packet;

/// One FEC source block: up to k source packet copies indexed by their
/// block offset, plus the repair symbols produced from (or received for)
/// them.
///
/// On the send side the totals are frozen by [`prepare_to_send`] so every
/// repair symbol carries the final (k', r'). On the receive side the totals
/// arrive with the first fragment of any repair symbol.
///
/// [`prepare_to_send`]: FecBlock::prepare_to_send
pub struct FecBlock {
    block_number: u64,

    // Sparse source packet copies by block offset.
    packets: Vec<Option<Vec<u8>>>,

    // Packet number to offset, also suppressing duplicate insertions of
    // retransmitted packets.
    packet_offsets: BTreeMap<u64, usize>,

    repair_symbols: Vec<RepairSymbol>,

    total_source: usize,

    total_repair: usize,
}

impl FecBlock {
    pub fn new(block_number: u64) -> Self {
        FecBlock {
            block_number,
            packets: Vec::new(),
            packet_offsets: BTreeMap::new(),
            repair_symbols: Vec::new(),
            total_source: 0,
            total_repair: 0,
        }
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// Whether the block has accumulated enough source packets for its
    /// repair symbols to be generated.
    pub fn should_be_sent(&self, rc: &dyn RedundancyController) -> bool {
        self.current_number_of_packets() >= rc.data_symbols()
    }

    /// Copies a source packet into the slot named by its payload id.
    ///
    /// Re-adding a packet number already present (a retransmission) is a
    /// no-op.
    pub fn add_packet(&mut self, data: &[u8], hdr: &packet::Header) {
        if self.packet_offsets.contains_key(&hdr.pkt_num) {
            return;
        }

        let offset = hdr.payload_id.block_offset() as usize;

        if offset >= self.packets.len() {
            self.packets.resize(offset + 1, None);
        }

        self.packets[offset] = Some(data.to_vec());
        self.packet_offsets.insert(hdr.pkt_num, offset);
    }

    /// Buffers a repair symbol for (or from) this block.
    pub fn add_repair_symbol(&mut self, symbol: RepairSymbol) {
        self.repair_symbols.push(symbol);
    }

    /// Attaches freshly generated repair symbols, stamping them with the
    /// block's identity and current shape.
    pub fn set_repair_symbols(&mut self, mut symbols: Vec<RepairSymbol>) {
        let total = symbols.len() as u8;
        let packets = self.current_number_of_packets() as u8;

        for s in &mut symbols {
            s.block_number = self.block_number;
            s.num_repair = total;
            s.num_source = packets;
        }

        self.repair_symbols = symbols;
    }

    /// Freezes the totals so every repair symbol carries the final
    /// (k', r'). Must be called before handing symbols to the framer.
    pub fn prepare_to_send(&mut self) {
        self.total_source = self.packets.len();
        self.total_repair = self.repair_symbols.len();

        for s in &mut self.repair_symbols {
            s.num_source = self.total_source as u8;
            s.num_repair = self.total_repair as u8;
        }
    }

    /// Records the peer-advertised totals (receive side).
    pub fn set_totals(&mut self, total_source: usize, total_repair: usize) {
        self.total_source = total_source;
        self.total_repair = total_repair;
    }

    pub fn total_source(&self) -> usize {
        self.total_source
    }

    pub fn total_repair(&self) -> usize {
        self.total_repair
    }

    pub fn has_packet(&self, pkt_num: u64) -> bool {
        self.packet_offsets.contains_key(&pkt_num)
    }

    /// The number of source packets currently present.
    pub fn current_number_of_packets(&self) -> usize {
        self.packet_offsets.len()
    }

    /// The number of repair symbols currently present.
    pub fn current_number_of_repair_symbols(&self) -> usize {
        self.repair_symbols.len()
    }

    /// The number of source slots known to be missing, receive side. Zero
    /// until the totals are known.
    pub fn missing_source_packets(&self) -> usize {
        self.total_source
            .saturating_sub(self.current_number_of_packets())
    }

    /// The sparse source slots, indexed by block offset.
    pub fn packets(&self) -> &[Option<Vec<u8>>] {
        &self.packets
    }

    /// The source packets in offset order, for encoding. Holes are
    /// skipped.
    pub fn packet_data(&self) -> Vec<&[u8]> {
        self.packets
            .iter()
            .flatten()
            .map(|p| p.as_slice())
            .collect()
    }

    pub fn repair_symbols(&self) -> &[RepairSymbol] {
        &self.repair_symbols
    }

    /// Hands the repair symbols over to the framer.
    pub fn take_repair_symbols(&mut self) -> Vec<RepairSymbol> {
        std::mem::take(&mut self.repair_symbols)
    }

    /// Whether every advertised source packet and repair symbol arrived,
    /// making the block useless for recovery.
    pub fn is_complete(&self) -> bool {
        self.total_source > 0 &&
            self.current_number_of_packets() == self.total_source &&
            self.repair_symbols.len() == self.total_repair
    }
}
