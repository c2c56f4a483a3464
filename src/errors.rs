use thiserror::Error;

use crate::packet::PackId;

/// Errors raised while encoding or decoding packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer underrun while decoding")]
    Underrun,
    #[error("unknown packet id {0:#04x}")]
    UnknownPackId(u8),
    #[error("invalid reliability type {0}")]
    InvalidReliability(u8),
    #[error("invalid ack record type {0}")]
    InvalidRecordType(u8),
    #[error("ack count exceeded the maximum")]
    AckCountExceed,
    #[error("offline magic bytes mismatch")]
    BadMagic,
    #[error("invalid address family {0}")]
    InvalidAddressFamily(u8),
    #[error("nonzero order channel {0}")]
    InvalidOrderChannel(u8),
}

/// Errors surfaced by connections and the handshake drivers.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unexpected packet {0:?} during handshake")]
    UnexpectedPacket(PackId),
    #[error("fragment channel is missing index {0}")]
    MissingFragment(u32),
    #[error("connection closed")]
    ConnectionClosed,
}
