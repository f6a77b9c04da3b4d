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

//! Packet-level types shared by the recovery and FEC components.

use crate::Error;
use crate::Result;

/// The largest valid FEC block number (24-bit space, wrapping).
pub const MAX_BLOCK_NUMBER: u64 = (1 << 24) - 1;

const HEADER_FLAG_FEC: u8 = 0x01;
const HEADER_FLAG_FROM_SERVER: u8 = 0x02;

/// The encryption level a packet was protected at.
///
/// Acknowledgements must arrive at a level at least as high as the packets
/// they acknowledge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EncryptionLevel {
    /// Initial keys.
    Initial,

    /// Handshake keys.
    Handshake,

    /// Forward-secure application keys.
    ForwardSecure,
}

/// The side of the connection an endpoint is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Perspective {
    /// The endpoint initiated the connection.
    Client,

    /// The endpoint accepted the connection.
    Server,
}

/// The 64-bit FEC payload identifier stamped on protected packets and
/// carried by repair frames.
///
/// The high 32 bits are scheme-specific. For block codes the low 32 bits are
/// the 24-bit block number followed by the 8-bit offset (source packets) or
/// symbol index (repair symbols). For convolutional codes the low 32 bits
/// are the encoding symbol id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FecPayloadId(u64);

impl FecPayloadId {
    /// Builds the id of a source packet within a block.
    pub fn new_block_source(block: u64, offset: u8) -> Result<Self> {
        if block > MAX_BLOCK_NUMBER {
            return Err(Error::InvalidBlockNumber);
        }

        Ok(FecPayloadId(block << 8 | u64::from(offset)))
    }

    /// Builds the id of a repair symbol within a block.
    pub fn new_block_repair(
        scheme_specific: u32, block: u64, symbol_index: u8,
    ) -> Result<Self> {
        if block > MAX_BLOCK_NUMBER {
            return Err(Error::InvalidBlockNumber);
        }

        Ok(FecPayloadId(
            u64::from(scheme_specific) << 32 |
                block << 8 |
                u64::from(symbol_index),
        ))
    }

    /// Builds the id of a source packet in a convolutional window.
    pub fn new_convolutional_source(encoding_symbol_id: u32) -> Self {
        FecPayloadId(u64::from(encoding_symbol_id))
    }

    /// Builds the id of a convolutional repair symbol.
    pub fn new_convolutional_repair(
        scheme_specific: u32, encoding_symbol_id: u32,
    ) -> Self {
        FecPayloadId(
            u64::from(scheme_specific) << 32 | u64::from(encoding_symbol_id),
        )
    }

    /// The scheme-specific high 32 bits.
    pub fn scheme_specific(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The 24-bit block number.
    pub fn block_number(self) -> u64 {
        (self.0 >> 8) & MAX_BLOCK_NUMBER
    }

    /// The block offset of a source packet, or the symbol index of a repair
    /// symbol.
    pub fn block_offset(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// The convolutional encoding symbol id.
    pub fn encoding_symbol_id(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// The raw 64-bit value as written to the wire.
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// Rebuilds an id from its wire representation.
    pub fn from_u64(v: u64) -> Self {
        FecPayloadId(v)
    }
}

/// The compact header carried by FEC-protected packets.
///
/// Recovered payloads are re-parsed through this header so they can be
/// re-injected into the receive path with their packet number intact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// The packet number. Zero is invalid.
    pub pkt_num: u64,

    /// Whether the packet is FEC-protected and carries a payload id.
    pub fec_protected: bool,

    /// The block/offset (or encoding symbol) identifier, present when
    /// `fec_protected` is set.
    pub payload_id: FecPayloadId,

    /// Whether the packet was sent by the server side of the connection.
    pub from_server: bool,
}

impl Header {
    /// Parses a packet header from the given buffer.
    ///
    /// `perspective` is the side doing the parsing; packets must come from
    /// the opposite side.
    pub fn from_bytes(
        b: &mut octets::Octets, perspective: Perspective,
    ) -> Result<Header> {
        let flags = b.get_u8()?;

        let from_server = flags & HEADER_FLAG_FROM_SERVER != 0;

        let expected = match perspective {
            Perspective::Client => true,
            Perspective::Server => false,
        };

        if from_server != expected {
            return Err(Error::InvalidPacket);
        }

        let pkt_num = b.get_u64()?;

        if pkt_num == 0 {
            return Err(Error::InvalidPacketNumber);
        }

        let fec_protected = flags & HEADER_FLAG_FEC != 0;

        let payload_id = if fec_protected {
            FecPayloadId::from_u64(b.get_u64()?)
        } else {
            FecPayloadId::default()
        };

        Ok(Header {
            pkt_num,
            fec_protected,
            payload_id,
            from_server,
        })
    }

    /// Writes the header to the given buffer.
    pub fn to_bytes(&self, b: &mut octets::OctetsMut) -> Result<()> {
        let mut flags = 0;

        if self.fec_protected {
            flags |= HEADER_FLAG_FEC;
        }

        if self.from_server {
            flags |= HEADER_FLAG_FROM_SERVER;
        }

        b.put_u8(flags)?;
        b.put_u64(self.pkt_num)?;

        if self.fec_protected {
            b.put_u64(self.payload_id.to_u64())?;
        }

        Ok(())
    }

    /// The encoded length of the header.
    pub fn wire_len(&self) -> usize {
        if self.fec_protected {
            1 + 8 + 8
        } else {
            1 + 8
        }
    }
}
