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

//! Round-robin assignment of source packets to interleaved blocks.

use std::collections::HashMap;

use crate::fec::block::FecBlock;
use crate::packet;

/// Rotates consecutive packets across up to `interleave` concurrently open
/// blocks, so a burst of consecutive losses spreads over several blocks
/// instead of exhausting one block's repair budget.
///
/// Finished blocks leave the rotation and a fresh block with the next
/// (24-bit, wrapping) block number takes their slot.
pub struct RoundRobinScheduler {
    blocks: Vec<FecBlock>,

    // Rotation position: the slot the next packet goes to.
    offset: usize,

    next_block_number: u64,

    block_index: HashMap<u64, usize>,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        RoundRobinScheduler {
            blocks: Vec::new(),
            offset: 0,
            next_block_number: 0,
            block_index: HashMap::new(),
        }
    }

    /// The block number the next packet will be assigned to.
    pub fn peek_block_number(&self, interleave: usize) -> u64 {
        if self.blocks.len() < interleave.max(1) && self.offset == self.blocks.len()
        {
            return self.next_block_number;
        }

        self.blocks[self.offset].block_number()
    }

    /// The block offset the next packet will be assigned.
    pub fn peek_block_offset(&self, interleave: usize) -> u8 {
        if self.blocks.len() < interleave.max(1) && self.offset == self.blocks.len()
        {
            return 0;
        }

        self.blocks[self.offset].current_number_of_packets() as u8
    }

    /// Returns the block the next packet goes to and advances the
    /// rotation. New slots are opened lazily up to `interleave`.
    pub fn next_block(&mut self, interleave: usize) -> &mut FecBlock {
        let interleave = interleave.max(1);

        if self.blocks.len() < interleave && self.offset == self.blocks.len() {
            let block_number = self.take_block_number();

            self.block_index.insert(block_number, self.blocks.len());
            self.blocks.push(FecBlock::new(block_number));
        }

        let idx = self.offset;
        self.offset = (self.offset + 1) % interleave;

        &mut self.blocks[idx]
    }

    /// Looks up an open block by number.
    pub fn block_mut(&mut self, block_number: u64) -> Option<&mut FecBlock> {
        let idx = *self.block_index.get(&block_number)?;
        Some(&mut self.blocks[idx])
    }

    /// Replaces a block whose repair symbols were handed to the framer
    /// with a fresh one in the same slot.
    pub fn sent_block(&mut self, block_number: u64) {
        if let Some(idx) = self.block_index.remove(&block_number) {
            let fresh = self.take_block_number();

            self.block_index.insert(fresh, idx);
            self.blocks[idx] = FecBlock::new(fresh);
        }
    }

    /// Open blocks that still hold unsent packets, for flushing at
    /// connection teardown.
    pub fn drain_pending_blocks(&mut self) -> Vec<FecBlock> {
        self.block_index.clear();
        self.offset = 0;

        self.blocks
            .drain(..)
            .filter(|b| b.current_number_of_packets() > 0)
            .collect()
    }

    fn take_block_number(&mut self) -> u64 {
        let n = self.next_block_number;

        self.next_block_number =
            (self.next_block_number + 1) & packet::MAX_BLOCK_NUMBER;

        n
    }
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}
