//! Error types for udrpc.

use std::fmt;

/// Error type for udrpc operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying transport or control plane.
    Io(std::io::Error),
    /// No session with this number exists (never created, or already reaped).
    NoSuchSession(u16),
    /// The session exists but is not in the connected state.
    SessionNotConnected(u16),
    /// All request slots of the session are occupied.
    NoSlotAvailable,
    /// Message data exceeds the maximum message size.
    MsgBufTooLarge { size: usize, max: usize },
    /// A datapath call was made from a thread other than the creator.
    ///
    /// The endpoint type is not `Send`, so this is normally ruled out at
    /// compile time; the variant exists for the few runtime-guarded paths.
    WrongThread,
    /// An argument failed validation.
    BadArg(&'static str),
    /// The endpoint id is already registered with the broker.
    EndpointIdInUse(u8),
    /// Endpoint construction failed.
    Construction(String),
    /// A received packet failed header validation.
    InvalidPacket,
    /// Invalid magic byte in a packet header.
    InvalidMagic { expected: u8, got: u8 },
    /// A buffer was too small for the requested operation.
    BufferTooSmall { required: usize, available: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::NoSuchSession(n) => write!(f, "No such session: {}", n),
            Error::SessionNotConnected(n) => write!(f, "Session {} is not connected", n),
            Error::NoSlotAvailable => write!(f, "No request slot available"),
            Error::MsgBufTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes, max {} bytes", size, max)
            }
            Error::WrongThread => write!(f, "Called from a non-creator thread"),
            Error::BadArg(what) => write!(f, "Bad argument: {}", what),
            Error::EndpointIdInUse(id) => write!(f, "Endpoint id {} already in use", id),
            Error::Construction(msg) => write!(f, "Endpoint construction failed: {}", msg),
            Error::InvalidPacket => write!(f, "Invalid packet received"),
            Error::InvalidMagic { expected, got } => {
                write!(f, "Invalid magic: expected {:#x}, got {:#x}", expected, got)
            }
            Error::BufferTooSmall { required, available } => {
                write!(
                    f,
                    "Buffer too small: required {} bytes, available {} bytes",
                    required, available
                )
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for udrpc operations.
pub type Result<T> = std::result::Result<T, Error>;
