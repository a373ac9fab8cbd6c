use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("bad magic")]
    BadMagic,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData { need: usize, have: usize },
    #[error("client identifier must be 4 ASCII bytes")]
    InvalidClientId,
    #[error("sequence {sequence} out of range 0..={max_sequence}")]
    SequenceOutOfRange { sequence: u8, max_sequence: u8 },
    #[error("port count {0} out of range")]
    PortCount(usize),
    #[error("invalid key material")]
    InvalidKey,
}

/// Why a datagram failed authentication.
///
/// Callers drop on every variant alike; the distinction only exists for
/// local logging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed: {0}")]
    Malformed(#[from] ProtoError),
    #[error("not an authenticated packet")]
    Unauthenticated,
    #[error("unknown client")]
    UnknownClient,
    #[error("replay: nonce {nonce} <= watermark {watermark}")]
    Replay { nonce: u32, watermark: u32 },
    #[error("bad tag")]
    BadTag,
    #[error("timestamp {timestamp} ahead of clock {now}")]
    FromFuture { timestamp: u32, now: u32 },
    #[error("unusable key")]
    InvalidKey,
}
