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

/// A specialized [`Result`] type for quiver operations.
///
/// This type is used throughout quiver's public API for any operation that
/// can produce an error.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// A quiver error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// There is no more work to do.
    Done,

    /// The provided buffer is too short.
    BufferTooShort,

    /// The provided packet cannot be parsed because its version is unknown.
    UnknownVersion,

    /// The provided packet cannot be parsed because it contains an invalid
    /// frame.
    InvalidFrame,

    /// The provided packet cannot be parsed.
    InvalidPacket,

    /// The operation cannot be completed because the connection is in an
    /// invalid state.
    InvalidState,

    /// A packet with packet number zero was received.
    InvalidPacketNumber,

    /// A packet was submitted for sending with a packet number lower than or
    /// equal to an already-sent one.
    PacketNumberNotIncreasing,

    /// The peer acknowledged a packet that was never sent.
    AckForUnsentPacket,

    /// The peer acknowledged a packet number that was intentionally skipped.
    AckForSkippedPacket,

    /// The received ACK frame is a duplicate or arrived out of order.
    DuplicateAck,

    /// An acknowledgement references a packet protected at a higher
    /// encryption level than the frame it arrived in.
    EncryptionLevelMismatch,

    /// The number of tracked sent packets exceeds the configured limit.
    TooManyTrackedPackets,

    /// The number of tracked acknowledgement ranges exceeds the configured
    /// limit.
    TooManyRanges,

    /// A repair frame with an empty payload was received.
    EmptyRepairFrame,

    /// A repair frame references a block number outside the 24-bit space.
    InvalidBlockNumber,

    /// A repair frame payload exceeds the maximum encodable length.
    RepairPayloadTooLong,

    /// The FEC scheme failed to encode or decode a block.
    FecFailed,

    /// Error in congestion control.
    CongestionControl,
}

/// Wire error codes carried in CONNECTION_CLOSE frames.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WireErrorCode {
    /// The connection is being closed abruptly in the absence of any error.
    NoError            = 0x0,
    /// The endpoint encountered an internal error and cannot continue.
    InternalError      = 0x1,
    /// A frame was badly formatted.
    FrameEncodingError = 0x7,
    /// A protocol compliance error not covered by a more specific code.
    ProtocolViolation  = 0xa,
    /// Invalid data was carried in an acknowledgement frame.
    InvalidAckData     = 0x50,
    /// A peer exhausted a tracking limit on this endpoint.
    TrackingLimit      = 0x51,
    /// A repair frame violated the FEC framing rules.
    FecFramingError    = 0x52,
}

impl Error {
    /// Returns whether the error must terminate the connection.
    ///
    /// Transient input issues (duplicate or stale acknowledgements, repair
    /// frames for expired blocks) are reported to the caller but require no
    /// action beyond dropping the input.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Error::Done | Error::DuplicateAck)
    }

    pub(crate) fn to_wire(self) -> u64 {
        match self {
            Error::Done => WireErrorCode::NoError as u64,

            Error::BufferTooShort | Error::InvalidFrame =>
                WireErrorCode::FrameEncodingError as u64,

            Error::AckForUnsentPacket |
            Error::AckForSkippedPacket |
            Error::EncryptionLevelMismatch =>
                WireErrorCode::InvalidAckData as u64,

            Error::TooManyTrackedPackets | Error::TooManyRanges =>
                WireErrorCode::TrackingLimit as u64,

            Error::EmptyRepairFrame |
            Error::InvalidBlockNumber |
            Error::RepairPayloadTooLong => WireErrorCode::FecFramingError as u64,

            _ => WireErrorCode::ProtocolViolation as u64,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<octets::BufferTooShortError> for Error {
    fn from(_err: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}
