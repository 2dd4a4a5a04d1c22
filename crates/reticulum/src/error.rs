use core::fmt;

/// Error kinds surfaced by the protocol core.
///
/// Wire-boundary failures (malformed frames, bad IFAC tags) are dropped
/// silently by the transport and never reach application code as errors.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum RnsError {
    InvalidPacket,
    IncorrectHash,
    IncorrectSignature,
    DecryptionFailed,
    MissingPrivateKey,
    UnknownIdentity,
    NoPath,
    InterfaceClosed,
    MtuExceeded,
    LinkStale,
    LinkClosed,
    ResourceTimeout,
    ResourceCorrupt,
    ResourceRejected,
    RatchetFileCorrupt,
    StorageError,
    Timeout,
    OutOfMemory,
    InvalidArgument,
    CryptoError,
}

impl fmt::Display for RnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RnsError::InvalidPacket => "invalid packet",
            RnsError::IncorrectHash => "incorrect hash",
            RnsError::IncorrectSignature => "incorrect signature",
            RnsError::DecryptionFailed => "decryption failed",
            RnsError::MissingPrivateKey => "operation requires a private key",
            RnsError::UnknownIdentity => "unknown identity",
            RnsError::NoPath => "no known path",
            RnsError::InterfaceClosed => "interface closed",
            RnsError::MtuExceeded => "mtu exceeded",
            RnsError::LinkStale => "link stale",
            RnsError::LinkClosed => "link closed",
            RnsError::ResourceTimeout => "resource timed out",
            RnsError::ResourceCorrupt => "resource corrupt",
            RnsError::ResourceRejected => "resource rejected",
            RnsError::RatchetFileCorrupt => "ratchet file corrupt",
            RnsError::StorageError => "storage error",
            RnsError::Timeout => "timed out",
            RnsError::OutOfMemory => "buffer exhausted",
            RnsError::InvalidArgument => "invalid argument",
            RnsError::CryptoError => "crypto error",
        };

        write!(f, "{}", text)
    }
}

impl std::error::Error for RnsError {}
