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

//! The receive side of the FEC pipeline.
//!
//! Repair frames are buffered per (block, symbol, fragment) until a full
//! symbol can be assembled; symbols and FEC-protected source packets feed
//! the decoder, and recovered packets are re-injected into the receive
//! path. The receiver also produces the symbol-ACK feedback that steers
//! the sender's threshold controller.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use std::time::Instant;

use crate::fec::block::FecBlock;
use crate::fec::scheme;
use crate::fec::scheme::FecScheme;
use crate::fec::RepairSymbol;

use crate::frame;
use crate::packet;

use crate::Config;
use crate::Error;
use crate::Result;

// A symbol-ACK frame is produced every this many newly assembled symbols.
const SYMBOL_ACK_GAP: u64 = 10;

// Cap on remembered expired block numbers.
const MAX_BLACKLISTED_BLOCKS: usize = 1000;

/// A packet obtained by FEC decoding, ready for re-injection into the
/// normal receive path.
#[derive(Clone, Debug)]
pub struct RecoveredPacket {
    /// The re-parsed packet header.
    pub header: packet::Header,

    /// The full packet bytes, header included.
    pub data: Vec<u8>,

    /// When the packet was recovered.
    pub recv_time: Instant,
}

// One buffered repair-frame fragment.
struct Fragment {
    fin: bool,

    data: Vec<u8>,

    num_source: u8,

    num_repair: u8,

    scheme_specific: u32,

    convolutional: bool,
}

/// The receiver-side FEC framework.
pub struct FecReceiver {
    scheme: Box<dyn FecScheme>,

    perspective: packet::Perspective,

    // Partially received blocks, evicted FIFO beyond the buffer bound.
    blocks: HashMap<u64, FecBlock>,

    block_fifo: VecDeque<u64>,

    // Blocks already decoded, completed or evicted; duplicate repair
    // frames for them are dropped silently.
    blacklist: HashSet<u64>,

    blacklist_fifo: VecDeque<u64>,

    // Fragments waiting for their siblings: block -> symbol index ->
    // fragment offset.
    waiting_frames: HashMap<u64, Vec<HashMap<u8, Fragment>>>,

    recovered: VecDeque<RecoveredPacket>,

    tracker: SymbolTracker,

    max_blocks: usize,
}

impl FecReceiver {
    pub fn new(config: &Config, perspective: packet::Perspective) -> Self {
        FecReceiver {
            scheme: scheme::new_fec_scheme(config.fec_scheme),
            perspective,
            blocks: HashMap::new(),
            block_fifo: VecDeque::new(),
            blacklist: HashSet::new(),
            blacklist_fifo: VecDeque::new(),
            waiting_frames: HashMap::new(),
            recovered: VecDeque::new(),
            tracker: SymbolTracker::default(),
            max_blocks: crate::MAX_BUFFERED_FEC_BLOCKS,
        }
    }

    /// Buffers a copy of an FEC-protected source packet and attempts
    /// recovery of its block.
    pub fn on_source_packet(
        &mut self, data: &[u8], hdr: &packet::Header, now: Instant,
    ) {
        if !hdr.fec_protected {
            return;
        }

        let block_number = hdr.payload_id.block_number();

        if self.blacklist.contains(&block_number) {
            return;
        }

        self.block_of(block_number).add_packet(data, hdr);

        self.try_recover(block_number, now);
    }

    /// Processes a repair frame: buffers the fragment, assembles the
    /// symbol when complete, and attempts recovery.
    ///
    /// Frames for expired blocks are dropped silently.
    pub fn on_repair_frame(
        &mut self, repair: &frame::Frame, now: Instant,
    ) -> Result<()> {
        let (
            fin,
            convolutional,
            scheme_specific,
            block_number,
            symbol_index,
            encoding_symbol_id,
            offset_in_symbol,
            num_source,
            num_repair,
            data,
        ) = match repair {
            frame::Frame::Repair {
                fin,
                convolutional,
                scheme_specific,
                block_number,
                symbol_index,
                encoding_symbol_id,
                offset_in_symbol,
                num_source,
                num_repair,
                data,
            } => (
                *fin,
                *convolutional,
                *scheme_specific,
                *block_number,
                *symbol_index,
                *encoding_symbol_id,
                *offset_in_symbol,
                *num_source,
                *num_repair,
                data,
            ),

            _ => return Err(Error::InvalidFrame),
        };

        if data.is_empty() {
            return Err(Error::EmptyRepairFrame);
        }

        // Convolutional symbols are keyed by their encoding symbol id so
        // each window emission assembles independently.
        let key = if convolutional {
            u64::from(encoding_symbol_id)
        } else {
            block_number
        };

        if self.blacklist.contains(&key) {
            trace!("repair frame for expired block {key}");
            return Ok(());
        }

        let waiting = self.waiting_frames.entry(key).or_default();

        if waiting.len() <= symbol_index as usize {
            waiting.resize_with(symbol_index as usize + 1, HashMap::new);
        }

        let fragments = &mut waiting[symbol_index as usize];

        fragments.entry(offset_in_symbol).or_insert(Fragment {
            fin,
            data: data.clone(),
            num_source,
            num_repair,
            scheme_specific,
            convolutional,
        });

        let symbol = Self::assemble_symbol(fragments, key, symbol_index);

        if let Some(symbol) = symbol {
            if let Some(waiting) = self.waiting_frames.get_mut(&key) {
                waiting[symbol_index as usize].clear();
            }

            self.on_repair_symbol(symbol, now);
        }

        Ok(())
    }

    /// Drains one recovered packet, if any.
    pub fn poll_recovered(&mut self) -> Option<RecoveredPacket> {
        self.recovered.pop_front()
    }

    /// Returns a symbol-ACK frame once enough new symbols arrived since
    /// the last one.
    pub fn get_symbol_ack_frame(&mut self) -> Option<frame::Frame> {
        self.tracker.symbol_ack_frame()
    }

    /// The number of blocks currently buffered.
    pub fn buffered_blocks(&self) -> usize {
        self.blocks.len()
    }

    // Looks in the waiting fragments for a complete symbol: either a
    // single FIN-bearing first fragment, or a FIN fragment plus every
    // offset below it.
    fn assemble_symbol(
        fragments: &HashMap<u8, Fragment>, block_number: u64, symbol_index: u8,
    ) -> Option<RepairSymbol> {
        if fragments.is_empty() {
            return None;
        }

        if fragments.len() == 1 {
            let (offset, fragment) = fragments.iter().next().unwrap();

            if !fragment.fin || *offset != 0 {
                return None;
            }

            return Some(RepairSymbol {
                scheme_specific: fragment.scheme_specific,
                block_number,
                symbol_index,
                data: fragment.data.clone(),
                num_source: fragment.num_source,
                num_repair: fragment.num_repair,
                convolutional: fragment.convolutional,
                encoding_symbol_id: if fragment.convolutional {
                    block_number as u32
                } else {
                    0
                },
            });
        }

        let mut fin_found = false;
        let mut largest_offset = 0u8;

        for (offset, fragment) in fragments {
            if fragment.fin {
                fin_found = true;
            }

            largest_offset = largest_offset.max(*offset);
        }

        if !fin_found || largest_offset as usize >= fragments.len() {
            // Either the tail is still missing, or there are gaps below
            // the largest offset.
            return None;
        }

        // All offsets 0..=largest are present exactly once; concatenate in
        // order.
        let mut data = Vec::new();
        let mut num_source = 0;
        let mut num_repair = 0;
        let mut scheme_specific = 0;
        let mut convolutional = false;

        for offset in 0..=largest_offset {
            let fragment = &fragments[&offset];

            if offset == 0 {
                num_source = fragment.num_source;
                num_repair = fragment.num_repair;
                scheme_specific = fragment.scheme_specific;
                convolutional = fragment.convolutional;
            }

            data.extend_from_slice(&fragment.data);
        }

        Some(RepairSymbol {
            scheme_specific,
            block_number,
            symbol_index,
            data,
            num_source,
            num_repair,
            convolutional,
            encoding_symbol_id: if convolutional {
                block_number as u32
            } else {
                0
            },
        })
    }

    fn on_repair_symbol(&mut self, symbol: RepairSymbol, now: Instant) {
        self.tracker.on_symbol(
            symbol.block_number,
            symbol.symbol_index,
            symbol.num_repair,
        );

        // Convolutional symbols are tracked for feedback but the decoder
        // operates on blocks only.
        if symbol.convolutional {
            return;
        }

        let block_number = symbol.block_number;

        let num_source = symbol.num_source as usize;
        let num_repair = symbol.num_repair as usize;

        let block = self.block_of(block_number);

        block.set_totals(num_source, num_repair);
        block.add_repair_symbol(symbol);

        self.try_recover(block_number, now);
    }

    fn try_recover(&mut self, block_number: u64, now: Instant) {
        let block = match self.blocks.get(&block_number) {
            Some(b) => b,
            None => return,
        };

        if block.current_number_of_repair_symbols() == 0 {
            return;
        }

        if self.scheme.can_recover(block) {
            match self.scheme.recover(block) {
                Ok(packets) => {
                    trace!(
                        "block {} recovered {} packets",
                        block_number,
                        packets.len()
                    );

                    for data in packets {
                        self.inject_recovered(data, now);
                    }

                    self.remove_block(block_number);
                    return;
                },

                Err(e) => {
                    // Keep the block; more symbols may still arrive.
                    debug!("block {block_number} recovery failed: {e:?}");
                },
            }
        }

        // Nothing missing and every symbol present: the block is useless.
        if block.is_complete() {
            self.remove_block(block_number);
        }
    }

    fn inject_recovered(&mut self, data: Vec<u8>, now: Instant) {
        let mut b = octets::Octets::with_slice(&data);

        match packet::Header::from_bytes(&mut b, self.perspective) {
            Ok(header) => {
                self.recovered.push_back(RecoveredPacket {
                    header,
                    data,
                    recv_time: now,
                });
            },

            Err(e) => {
                warn!("recovered packet failed to parse: {e:?}");
            },
        }
    }

    fn block_of(&mut self, block_number: u64) -> &mut FecBlock {
        if !self.blocks.contains_key(&block_number) {
            if self.blocks.len() == self.max_blocks {
                // Evict the oldest partial block.
                if let Some(oldest) = self.block_fifo.pop_front() {
                    self.blocks.remove(&oldest);
                    self.waiting_frames.remove(&oldest);
                    self.blacklist_block(oldest);
                }
            }

            self.blocks
                .insert(block_number, FecBlock::new(block_number));
            self.block_fifo.push_back(block_number);
        }

        self.blocks.get_mut(&block_number).unwrap()
    }

    fn remove_block(&mut self, block_number: u64) {
        self.blocks.remove(&block_number);
        self.block_fifo.retain(|b| *b != block_number);
        self.waiting_frames.remove(&block_number);
        self.blacklist_block(block_number);
    }

    fn blacklist_block(&mut self, block_number: u64) {
        if self.blacklist.insert(block_number) {
            self.blacklist_fifo.push_back(block_number);
        }

        while self.blacklist_fifo.len() > MAX_BLACKLISTED_BLOCKS {
            if let Some(oldest) = self.blacklist_fifo.pop_front() {
                self.blacklist.remove(&oldest);
            }
        }
    }
}

// Counts assembled repair symbols and estimates the highest symbol number
// the sender has emitted, for symbol-ACK feedback.
#[derive(Default)]
struct SymbolTracker {
    symbols_received: u64,

    last_reported: u64,

    // Contribution of blocks already pruned from the map.
    base_max: u64,

    blocks: BTreeMap<u64, BlockSymbols>,
}

struct BlockSymbols {
    count: u64,

    last_index: u8,

    num_repair: u8,
}

impl SymbolTracker {
    fn on_symbol(&mut self, block_number: u64, index: u8, num_repair: u8) {
        let entry =
            self.blocks.entry(block_number).or_insert(BlockSymbols {
                count: 0,
                last_index: 0,
                num_repair,
            });

        entry.count += 1;
        entry.last_index = entry.last_index.max(index);
        entry.num_repair = num_repair;

        self.symbols_received += 1;

        // Bound the per-block map, folding pruned blocks into the base.
        while self.blocks.len() > crate::MAX_TRACKED_SYMBOL_ACK_RANGES {
            let (&oldest, _) = self.blocks.iter().next().unwrap();
            let next_present = self.blocks.contains_key(&(oldest + 1));

            let pruned = self.blocks.remove(&oldest).unwrap();

            self.base_max += if next_present {
                u64::from(pruned.num_repair)
            } else {
                u64::from(pruned.last_index)
            };
        }
    }

    // Sums the symbol numbers across blocks: a block followed by a newer
    // one must have been emitted in full, otherwise only the symbols up to
    // the last seen index are assumed to exist.
    fn max_symbol_observed(&self) -> u64 {
        let mut max = self.base_max;

        for (block_number, symbols) in &self.blocks {
            max += if self.blocks.contains_key(&(block_number + 1)) {
                u64::from(symbols.num_repair)
            } else {
                u64::from(symbols.last_index)
            };
        }

        max
    }

    fn symbol_ack_frame(&mut self) -> Option<frame::Frame> {
        if self.symbols_received <= self.last_reported + SYMBOL_ACK_GAP {
            return None;
        }

        self.last_reported = self.symbols_received;

        Some(frame::Frame::SymbolAck {
            symbols_received: self.symbols_received,
            max_symbol_observed: self.max_symbol_observed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::fec::redundancy::ConstantRedundancyController;
    use crate::fec::redundancy::SharedRedundancyController;
    use crate::fec::redundancy::TransmissionParams;
    use crate::fec::sender::FecSender;

    use crate::FecSchemeKind;

    fn config_with(scheme: FecSchemeKind) -> Config {
        let mut config = Config::new(crate::PROTOCOL_VERSION).unwrap();
        config.set_fec_scheme(scheme);
        config
    }

    fn sender(scheme: FecSchemeKind, data: usize, repair: usize) -> FecSender {
        let rc: SharedRedundancyController = Rc::new(RefCell::new(
            ConstantRedundancyController::new(data, repair, 1, 2),
        ));

        FecSender::new(&config_with(scheme), rc)
    }

    fn receiver(scheme: FecSchemeKind) -> FecReceiver {
        FecReceiver::new(&config_with(scheme), packet::Perspective::Server)
    }

    // Builds a protected packet: header + payload, returning the full
    // bytes and the header.
    fn protected_packet(
        s: &mut FecSender, pkt_num: u64, payload: &[u8],
    ) -> (Vec<u8>, packet::Header) {
        let hdr = packet::Header {
            pkt_num,
            fec_protected: true,
            payload_id: s.next_payload_id().unwrap(),
            from_server: false,
        };

        let mut buf = vec![0; hdr.wire_len() + payload.len()];
        let mut b = octets::OctetsMut::with_slice(&mut buf);
        hdr.to_bytes(&mut b).unwrap();
        b.put_bytes(payload).unwrap();

        s.on_packet_sent(&buf, &hdr, TransmissionParams::default(), true)
            .unwrap();

        (buf, hdr)
    }

    #[test]
    fn xor_end_to_end_recovery() {
        let mut s = sender(FecSchemeKind::Xor, 4, 1);
        let mut r = receiver(FecSchemeKind::Xor);
        let now = Instant::now();

        let mut dropped = None;

        for pn in 1..=4u64 {
            let (data, hdr) = protected_packet(&mut s, pn, b"payload");

            if pn == 3 {
                // Packet 3 is lost on the wire.
                dropped = Some(data);
                continue;
            }

            r.on_source_packet(&data, &hdr, now);
        }

        // Deliver the repair symbol.
        while let Some(frame) = s.pop_repair_frame(1500) {
            r.on_repair_frame(&frame, now).unwrap();
        }

        let recovered = r.poll_recovered().unwrap();
        assert_eq!(recovered.header.pkt_num, 3);
        assert_eq!(recovered.data, dropped.unwrap());
        assert_eq!(recovered.recv_time, now);
        assert!(r.poll_recovered().is_none());

        // The decoded block is gone and blacklisted.
        assert_eq!(r.buffered_blocks(), 0);
    }

    #[test]
    fn rs_recovers_two_losses() {
        let mut s = sender(FecSchemeKind::ReedSolomon, 4, 2);
        let mut r = receiver(FecSchemeKind::ReedSolomon);
        let now = Instant::now();

        for pn in 1..=4u64 {
            let (data, hdr) = protected_packet(&mut s, pn, b"some payload");

            if pn == 2 || pn == 4 {
                continue;
            }

            r.on_source_packet(&data, &hdr, now);
        }

        while let Some(frame) = s.pop_repair_frame(1500) {
            r.on_repair_frame(&frame, now).unwrap();
        }

        let mut pns: Vec<u64> = Vec::new();
        while let Some(p) = r.poll_recovered() {
            pns.push(p.header.pkt_num);
        }
        pns.sort_unstable();

        assert_eq!(pns, vec![2, 4]);
    }

    #[test]
    fn fragmented_symbol_reassembles_in_any_order() {
        let mut s = sender(FecSchemeKind::Xor, 2, 1);
        let mut r = receiver(FecSchemeKind::Xor);
        let now = Instant::now();

        // Large payloads force multi-fragment repair symbols.
        let payload = vec![0x42u8; 600];

        let (data1, hdr1) = protected_packet(&mut s, 1, &payload);
        r.on_source_packet(&data1, &hdr1, now);

        let (lost, _) = protected_packet(&mut s, 2, &payload);

        let mut frames = Vec::new();
        while let Some(frame) = s.pop_repair_frame(200) {
            frames.push(frame);
        }
        assert!(frames.len() > 1);

        // Deliver the fragments in reverse order.
        for frame in frames.iter().rev() {
            r.on_repair_frame(frame, now).unwrap();
        }

        let recovered = r.poll_recovered().unwrap();
        assert_eq!(recovered.header.pkt_num, 2);
        assert_eq!(recovered.data, lost);
    }

    #[test]
    fn missing_fragment_blocks_assembly() {
        let mut s = sender(FecSchemeKind::Xor, 2, 1);
        let mut r = receiver(FecSchemeKind::Xor);
        let now = Instant::now();

        let payload = vec![0x42u8; 600];

        let (data1, hdr1) = protected_packet(&mut s, 1, &payload);
        r.on_source_packet(&data1, &hdr1, now);

        protected_packet(&mut s, 2, &payload);

        let mut frames = Vec::new();
        while let Some(frame) = s.pop_repair_frame(200) {
            frames.push(frame);
        }
        assert!(frames.len() > 2);

        // Drop the middle fragment: assembly must not complete.
        frames.remove(1);

        for frame in &frames {
            r.on_repair_frame(frame, now).unwrap();
        }

        assert!(r.poll_recovered().is_none());
    }

    #[test]
    fn duplicate_repair_frame_for_decoded_block_is_dropped() {
        let mut s = sender(FecSchemeKind::Xor, 2, 1);
        let mut r = receiver(FecSchemeKind::Xor);
        let now = Instant::now();

        let (data1, hdr1) = protected_packet(&mut s, 1, b"first");
        r.on_source_packet(&data1, &hdr1, now);
        protected_packet(&mut s, 2, b"second");

        let frame = s.pop_repair_frame(1500).unwrap();

        r.on_repair_frame(&frame, now).unwrap();
        assert!(r.poll_recovered().is_some());

        // The same frame again targets a blacklisted block: silently
        // ignored.
        r.on_repair_frame(&frame, now).unwrap();
        assert!(r.poll_recovered().is_none());
    }

    #[test]
    fn block_buffer_is_bounded() {
        let mut r = receiver(FecSchemeKind::Xor);
        let now = Instant::now();

        for block in 0..crate::MAX_BUFFERED_FEC_BLOCKS as u64 + 5 {
            let hdr = packet::Header {
                pkt_num: block + 1,
                fec_protected: true,
                payload_id: packet::FecPayloadId::new_block_source(block, 0)
                    .unwrap(),
                from_server: false,
            };

            let mut buf = vec![0; hdr.wire_len() + 5];
            let mut b = octets::OctetsMut::with_slice(&mut buf);
            hdr.to_bytes(&mut b).unwrap();
            b.put_bytes(b"data!").unwrap();

            r.on_source_packet(&buf, &hdr, now);
        }

        assert_eq!(r.buffered_blocks(), crate::MAX_BUFFERED_FEC_BLOCKS);
    }

    #[test]
    fn symbol_ack_every_ten_symbols() {
        let mut s = sender(FecSchemeKind::Xor, 1, 1);
        let mut r = receiver(FecSchemeKind::Xor);
        let now = Instant::now();

        // Eleven single-packet blocks, each with one repair symbol. The
        // sources are delivered so no recovery happens, but every symbol
        // is assembled and counted.
        for pn in 1..=11u64 {
            let (data, hdr) = protected_packet(&mut s, pn, b"payload");
            r.on_source_packet(&data, &hdr, now);

            let frame = s.pop_repair_frame(1500).unwrap();
            r.on_repair_frame(&frame, now).unwrap();
        }

        let frame = r.get_symbol_ack_frame().unwrap();

        match frame {
            frame::Frame::SymbolAck {
                symbols_received, ..
            } => {
                assert_eq!(symbols_received, 11);
            },

            _ => panic!("expected symbol ack"),
        }

        // No further frame until another ten symbols arrive.
        assert!(r.get_symbol_ack_frame().is_none());
    }
}
