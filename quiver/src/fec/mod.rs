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

//! Forward error correction: source blocks, repair symbols, schemes and the
//! send/receive pipelines.

pub mod block;
pub mod framer;
pub mod receiver;
pub mod redundancy;
pub mod scheduler;
pub mod scheme;
pub mod sender;
pub mod window;

pub use receiver::FecReceiver;
pub use receiver::RecoveredPacket;
pub use sender::FecSender;

/// An erasure-coded repair unit produced from the source packets of one
/// block (or window).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepairSymbol {
    /// FEC-scheme-specific header bits, carried opaquely on the wire.
    pub scheme_specific: u32,

    /// The 24-bit block number the symbol repairs.
    pub block_number: u64,

    /// The index of this symbol among the block's repair symbols.
    pub symbol_index: u8,

    /// The encoded payload.
    pub data: Vec<u8>,

    /// The number of source packets in the block (k'), fixed when the
    /// block is prepared for sending.
    pub num_source: u8,

    /// The number of repair symbols in the block (r').
    pub num_repair: u8,

    /// Whether the symbol was produced over a convolutional window.
    pub convolutional: bool,

    /// The encoding symbol id (convolutional codes only).
    pub encoding_symbol_id: u32,
}
