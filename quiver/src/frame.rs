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

//! Wire frames and their classification.

use crate::packet;
use crate::ranges;

use crate::Error;
use crate::Result;

const FRAME_TYPE_PADDING: u8 = 0x00;
const FRAME_TYPE_PING: u8 = 0x01;
const FRAME_TYPE_ACK: u8 = 0x02;
const FRAME_TYPE_STOP_WAITING: u8 = 0x03;
const FRAME_TYPE_STREAM: u8 = 0x04;
const FRAME_TYPE_RECOVERED: u8 = 0x05;
const FRAME_TYPE_REPAIR_LEGACY: u8 = 0x0a;
const FRAME_TYPE_REPAIR: u8 = 0x0f;
const FRAME_TYPE_SYMBOL_ACK: u8 = 0x13;
const FRAME_TYPE_RD: u8 = 0x14;
const FRAME_TYPE_CONNECTION_CLOSE: u8 = 0x1c;

const SYMBOL_ACK_SUBTYPE: u8 = 0x40;

const STREAM_FLAG_FIN: u8 = 0x01;
const STREAM_FLAG_UNRELIABLE: u8 = 0x02;

// A repair frame payload length must fit the 14 length bits left after the
// FIN and convolutional flags; anything at or above this is rejected.
const MAX_REPAIR_DATA_LEN: usize = 1 << 15;

/// A wire frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// PADDING frame.
    Padding {
        /// Number of padding bytes.
        len: usize,
    },

    /// PING frame.
    Ping,

    /// ACK frame acknowledging normally received packets.
    ACK {
        /// The peer's ack delay in microseconds.
        ack_delay: u64,

        /// The acknowledged packet number ranges.
        ranges: ranges::RangeSet,
    },

    /// STOP_WAITING frame telling the peer to forget packets below
    /// `least_unacked`.
    StopWaiting {
        /// The lowest packet number the sender may still retransmit.
        least_unacked: u64,
    },

    /// STREAM frame carrying application data.
    Stream {
        /// The stream identifier.
        stream_id: u64,

        /// The data offset within the stream.
        offset: u64,

        /// The stream data.
        data: Vec<u8>,

        /// Whether this is the final frame of the stream.
        fin: bool,

        /// Whether the stream is unreliable (not retransmitted past its
        /// deadline).
        unreliable: bool,
    },

    /// RECOVERED frame acknowledging packets obtained through FEC recovery.
    Recovered {
        /// The recovered packet number ranges.
        ranges: ranges::RangeSet,
    },

    /// REPAIR frame carrying (a fragment of) a repair symbol.
    Repair {
        /// Whether this is the last fragment of the symbol.
        fin: bool,

        /// Whether the symbol belongs to a convolutional window rather than
        /// a block.
        convolutional: bool,

        /// FEC-scheme-specific header bits.
        scheme_specific: u32,

        /// The 24-bit block number (block codes).
        block_number: u64,

        /// The symbol index within the block (block codes).
        symbol_index: u8,

        /// The encoding symbol id (convolutional codes).
        encoding_symbol_id: u32,

        /// The fragment's offset within the symbol, in fragments.
        offset_in_symbol: u8,

        /// The number of source packets in the block (k'), carried only on
        /// the first fragment.
        num_source: u8,

        /// The number of repair symbols in the block (r'), carried only on
        /// the first fragment.
        num_repair: u8,

        /// The fragment payload.
        data: Vec<u8>,
    },

    /// SYMBOL_ACK frame reporting symbol-level reception to the sender.
    SymbolAck {
        /// Total number of repair symbols received.
        symbols_received: u64,

        /// The highest symbol number observed.
        max_symbol_observed: u64,
    },

    /// RD frame reporting observed reordering to the sender.
    Rd {
        /// Maximum observed packet number displacement.
        max_displacement: u16,

        /// Maximum observed reordering delay in milliseconds.
        max_delay_ms: u16,
    },

    /// CONNECTION_CLOSE frame.
    ConnectionClose {
        /// The wire error code.
        error_code: u64,

        /// The human readable reason.
        reason: Vec<u8>,
    },
}

impl Frame {
    /// Parses a frame from the given buffer.
    pub fn from_bytes(b: &mut octets::Octets) -> Result<Frame> {
        let frame_type = b.get_u8()?;

        let frame = match frame_type {
            FRAME_TYPE_PADDING => {
                let mut len = 1;

                while b.peek_u8() == Ok(FRAME_TYPE_PADDING) {
                    b.get_u8()?;

                    len += 1;
                }

                Frame::Padding { len }
            },

            FRAME_TYPE_PING => Frame::Ping,

            FRAME_TYPE_ACK => {
                let ack_delay = b.get_varint()?;
                let ranges = parse_ack_ranges(b)?;

                Frame::ACK { ack_delay, ranges }
            },

            FRAME_TYPE_STOP_WAITING => Frame::StopWaiting {
                least_unacked: b.get_varint()?,
            },

            FRAME_TYPE_STREAM => {
                let flags = b.get_u8()?;

                Frame::Stream {
                    stream_id: b.get_varint()?,
                    offset: b.get_varint()?,
                    data: b.get_bytes_with_varint_length()?.to_vec(),
                    fin: flags & STREAM_FLAG_FIN != 0,
                    unreliable: flags & STREAM_FLAG_UNRELIABLE != 0,
                }
            },

            FRAME_TYPE_RECOVERED => Frame::Recovered {
                ranges: parse_ack_ranges(b)?,
            },

            FRAME_TYPE_REPAIR | FRAME_TYPE_REPAIR_LEGACY =>
                parse_repair_frame(b)?,

            FRAME_TYPE_SYMBOL_ACK => {
                // The ack sub-type byte is fixed.
                if b.get_u8()? != SYMBOL_ACK_SUBTYPE {
                    return Err(Error::InvalidFrame);
                }

                Frame::SymbolAck {
                    symbols_received: get_sized_uint(b)?,
                    max_symbol_observed: get_sized_uint(b)?,
                }
            },

            FRAME_TYPE_RD => Frame::Rd {
                max_displacement: b.get_u16()?,
                max_delay_ms: b.get_u16()?,
            },

            FRAME_TYPE_CONNECTION_CLOSE => Frame::ConnectionClose {
                error_code: b.get_varint()?,
                reason: b.get_bytes_with_varint_length()?.to_vec(),
            },

            _ => return Err(Error::InvalidFrame),
        };

        Ok(frame)
    }

    /// Serializes the frame into the given buffer, returning the number of
    /// bytes written.
    pub fn to_bytes(&self, b: &mut octets::OctetsMut) -> Result<usize> {
        let before = b.cap();

        match self {
            Frame::Padding { len } => {
                let mut left = *len;

                while left > 0 {
                    b.put_u8(FRAME_TYPE_PADDING)?;

                    left -= 1;
                }
            },

            Frame::Ping => {
                b.put_u8(FRAME_TYPE_PING)?;
            },

            Frame::ACK { ack_delay, ranges } => {
                b.put_u8(FRAME_TYPE_ACK)?;
                b.put_varint(*ack_delay)?;

                put_ack_ranges(b, ranges)?;
            },

            Frame::StopWaiting { least_unacked } => {
                b.put_u8(FRAME_TYPE_STOP_WAITING)?;
                b.put_varint(*least_unacked)?;
            },

            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
                unreliable,
            } => {
                let mut flags = 0;

                if *fin {
                    flags |= STREAM_FLAG_FIN;
                }

                if *unreliable {
                    flags |= STREAM_FLAG_UNRELIABLE;
                }

                b.put_u8(FRAME_TYPE_STREAM)?;
                b.put_u8(flags)?;
                b.put_varint(*stream_id)?;
                b.put_varint(*offset)?;
                b.put_varint(data.len() as u64)?;
                b.put_bytes(data)?;
            },

            Frame::Recovered { ranges } => {
                b.put_u8(FRAME_TYPE_RECOVERED)?;

                put_ack_ranges(b, ranges)?;
            },

            Frame::Repair {
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
            } => {
                if *block_number > packet::MAX_BLOCK_NUMBER {
                    return Err(Error::InvalidBlockNumber);
                }

                if data.len() >= MAX_REPAIR_DATA_LEN {
                    return Err(Error::RepairPayloadTooLong);
                }

                if data.is_empty() {
                    return Err(Error::EmptyRepairFrame);
                }

                b.put_u8(FRAME_TYPE_REPAIR)?;

                let mut len_fin_conv = (data.len() as u16) << 2;

                if *fin {
                    len_fin_conv |= 0x1;
                }

                if *convolutional {
                    len_fin_conv |= 0x2;
                }

                b.put_u16(len_fin_conv)?;

                let payload_id = if *convolutional {
                    packet::FecPayloadId::new_convolutional_repair(
                        *scheme_specific,
                        *encoding_symbol_id,
                    )
                } else {
                    packet::FecPayloadId::new_block_repair(
                        *scheme_specific,
                        *block_number,
                        *symbol_index,
                    )?
                };

                b.put_u64(payload_id.to_u64())?;

                b.put_u8(*offset_in_symbol)?;

                if *offset_in_symbol == 0 {
                    b.put_u8(*num_source)?;
                    b.put_u8(*num_repair)?;
                }

                b.put_bytes(data)?;
            },

            Frame::SymbolAck {
                symbols_received,
                max_symbol_observed,
            } => {
                b.put_u8(FRAME_TYPE_SYMBOL_ACK)?;
                b.put_u8(SYMBOL_ACK_SUBTYPE)?;

                put_sized_uint(b, *symbols_received)?;
                put_sized_uint(b, *max_symbol_observed)?;
            },

            Frame::Rd {
                max_displacement,
                max_delay_ms,
            } => {
                b.put_u8(FRAME_TYPE_RD)?;
                b.put_u16(*max_displacement)?;
                b.put_u16(*max_delay_ms)?;
            },

            Frame::ConnectionClose { error_code, reason } => {
                b.put_u8(FRAME_TYPE_CONNECTION_CLOSE)?;
                b.put_varint(*error_code)?;
                b.put_varint(reason.len() as u64)?;
                b.put_bytes(reason)?;
            },
        }

        Ok(before - b.cap())
    }

    /// The number of bytes the frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Frame::Padding { len } => *len,

            Frame::Ping => 1,

            Frame::ACK { ack_delay, ranges } =>
                1 + octets::varint_len(*ack_delay) + ack_ranges_len(ranges),

            Frame::StopWaiting { least_unacked } =>
                1 + octets::varint_len(*least_unacked),

            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } =>
                1 + 1 +
                    octets::varint_len(*stream_id) +
                    octets::varint_len(*offset) +
                    octets::varint_len(data.len() as u64) +
                    data.len(),

            Frame::Recovered { ranges } => 1 + ack_ranges_len(ranges),

            Frame::Repair {
                offset_in_symbol,
                data,
                ..
            } => repair_frame_header_len(*offset_in_symbol) + data.len(),

            Frame::SymbolAck {
                symbols_received,
                max_symbol_observed,
            } =>
                2 + 1 +
                    sized_uint_len(*symbols_received) +
                    1 +
                    sized_uint_len(*max_symbol_observed),

            Frame::Rd { .. } => 1 + 2 + 2,

            Frame::ConnectionClose { error_code, reason } =>
                1 + octets::varint_len(*error_code) +
                    octets::varint_len(reason.len() as u64) +
                    reason.len(),
        }
    }

    /// Whether the frame's payload must be retransmitted if the carrying
    /// packet is lost.
    ///
    /// Pure signaling (ACK, STOP_WAITING), padding and repair frames are
    /// not; unreliable stream frames are not either.
    pub fn is_retransmittable(&self) -> bool {
        match self {
            Frame::Padding { .. } => false,
            Frame::ACK { .. } => false,
            Frame::StopWaiting { .. } => false,
            Frame::Repair { .. } => false,

            Frame::Stream { unreliable, .. } => !unreliable,

            _ => true,
        }
    }

    /// Whether the frame belongs to the FEC machinery.
    pub fn is_fec_related(&self) -> bool {
        matches!(self, Frame::Repair { .. } | Frame::Recovered { .. })
    }

    /// Whether the frame is a stream frame (reliable or not).
    pub fn is_stream(&self) -> bool {
        matches!(self, Frame::Stream { .. })
    }
}

/// Returns true if at least one frame is retransmittable.
pub fn has_retransmittable_frames(frames: &[Frame]) -> bool {
    frames.iter().any(Frame::is_retransmittable)
}

/// Returns true if at least one frame is retransmittable or is a stream
/// frame (including unreliable ones).
pub fn has_retransmittable_or_unreliable_stream_frames(
    frames: &[Frame],
) -> bool {
    frames
        .iter()
        .any(|f| f.is_stream() || f.is_retransmittable())
}

/// Returns true if at least one frame belongs to the FEC machinery.
pub fn has_fec_related_frames(frames: &[Frame]) -> bool {
    frames.iter().any(Frame::is_fec_related)
}

/// Drops pure-signaling frames, keeping everything that may need to be
/// reconstructed on retransmission: retransmittable frames, stream frames
/// (reliable or not) and FEC-related frames.
pub fn strip_non_retransmittable(frames: Vec<Frame>) -> Vec<Frame> {
    frames
        .into_iter()
        .filter(|f| f.is_stream() || f.is_retransmittable() || f.is_fec_related())
        .collect()
}

fn parse_ack_ranges(b: &mut octets::Octets) -> Result<ranges::RangeSet> {
    let largest_acked = b.get_varint()?;
    let block_count = b.get_varint()?;
    let ack_block = b.get_varint()?;

    if largest_acked < ack_block {
        return Err(Error::InvalidFrame);
    }

    let mut smallest_acked = largest_acked - ack_block;

    let mut ranges = ranges::RangeSet::default();

    ranges.insert(smallest_acked..largest_acked + 1)?;

    for _ in 0..block_count {
        let gap = b.get_varint()?;

        if smallest_acked < 2 + gap {
            return Err(Error::InvalidFrame);
        }

        let largest = smallest_acked - gap - 2;

        let ack_block = b.get_varint()?;

        if largest < ack_block {
            return Err(Error::InvalidFrame);
        }

        smallest_acked = largest - ack_block;

        ranges.insert(smallest_acked..largest + 1)?;
    }

    Ok(ranges)
}

fn put_ack_ranges(
    b: &mut octets::OctetsMut, ranges: &ranges::RangeSet,
) -> Result<()> {
    let mut it = ranges.iter().rev();

    let first = it.next().ok_or(Error::InvalidFrame)?;
    let ack_block = (first.end - 1) - first.start;

    b.put_varint(first.end - 1)?;
    b.put_varint(it.len() as u64)?;
    b.put_varint(ack_block)?;

    let mut smallest_acked = first.start;

    for block in it {
        let gap = smallest_acked - block.end - 1;
        let ack_block = (block.end - 1) - block.start;

        b.put_varint(gap)?;
        b.put_varint(ack_block)?;

        smallest_acked = block.start;
    }

    Ok(())
}

fn ack_ranges_len(ranges: &ranges::RangeSet) -> usize {
    let mut it = ranges.iter().rev();

    let first = match it.next() {
        Some(r) => r,
        None => return 0,
    };

    let ack_block = (first.end - 1) - first.start;

    let mut len = octets::varint_len(first.end - 1) +
        octets::varint_len(it.len() as u64) +
        octets::varint_len(ack_block);

    let mut smallest_acked = first.start;

    for block in it {
        let gap = smallest_acked - block.end - 1;
        let ack_block = (block.end - 1) - block.start;

        len += octets::varint_len(gap) + octets::varint_len(ack_block);

        smallest_acked = block.start;
    }

    len
}

fn parse_repair_frame(b: &mut octets::Octets) -> Result<Frame> {
    let len_fin_conv = b.get_u16()?;

    let fin = len_fin_conv & 0x1 != 0;
    let convolutional = len_fin_conv & 0x2 != 0;
    let data_len = (len_fin_conv >> 2) as usize;

    let payload_id = packet::FecPayloadId::from_u64(b.get_u64()?);

    let offset_in_symbol = b.get_u8()?;

    let (num_source, num_repair) = if offset_in_symbol == 0 {
        (b.get_u8()?, b.get_u8()?)
    } else {
        (0, 0)
    };

    if data_len == 0 {
        return Err(Error::EmptyRepairFrame);
    }

    let data = b.get_bytes(data_len)?.to_vec();

    let (block_number, symbol_index, encoding_symbol_id) = if convolutional {
        (0, 0, payload_id.encoding_symbol_id())
    } else {
        (payload_id.block_number(), payload_id.block_offset(), 0)
    };

    Ok(Frame::Repair {
        fin,
        convolutional,
        scheme_specific: payload_id.scheme_specific(),
        block_number,
        symbol_index,
        encoding_symbol_id,
        offset_in_symbol,
        num_source,
        num_repair,
        data,
    })
}

/// The fixed header size of a repair frame with the given fragment offset.
pub fn repair_frame_header_len(offset_in_symbol: u8) -> usize {
    let tuple = if offset_in_symbol == 0 { 2 } else { 0 };

    // type + fin/length + payload id + offset (+ k'/r').
    1 + 2 + 8 + 1 + tuple
}

// Variable-size unsigned integers prefixed with their length in bytes
// (1, 2, 4 or 6), as used by the symbol-ACK frame.
fn sized_uint_len(v: u64) -> usize {
    if v < 1 << 8 {
        1
    } else if v < 1 << 16 {
        2
    } else if v < 1 << 32 {
        4
    } else {
        6
    }
}

fn put_sized_uint(b: &mut octets::OctetsMut, v: u64) -> Result<()> {
    let len = sized_uint_len(v);

    b.put_u8(len as u8)?;

    match len {
        1 => {
            b.put_u8(v as u8)?;
        },
        2 => {
            b.put_u16(v as u16)?;
        },
        4 => {
            b.put_u32(v as u32)?;
        },
        _ => {
            // 6 bytes, big-endian, truncated to 48 bits.
            b.put_u16((v >> 32) as u16)?;
            b.put_u32(v as u32)?;
        },
    };

    Ok(())
}

fn get_sized_uint(b: &mut octets::Octets) -> Result<u64> {
    let len = b.get_u8()?;

    let v = match len {
        1 => u64::from(b.get_u8()?),
        2 => u64::from(b.get_u16()?),
        4 => u64::from(b.get_u32()?),

        6 => {
            let high = u64::from(b.get_u16()?);
            let low = u64::from(b.get_u32()?);

            high << 32 | low
        },

        _ => return Err(Error::InvalidFrame),
    };

    Ok(v)
}
