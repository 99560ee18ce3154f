//! Stratum v2 dialect
//!
//! Little-endian binary frames behind an NX-pattern encrypted transport.
//! [`codec`] frames plaintext messages, [`messages`] defines the typed
//! payloads, [`noise`] owns the handshake and per-direction AEAD states.

pub mod codec;
pub mod messages;
pub mod noise;

use thiserror::Error;

pub use codec::{Frame, FrameCodec, HEADER_LEN};
pub use messages::MessageType;
pub use noise::{HandshakeInitiator, HandshakeResponder, NoiseTransport, V2_MAGIC};

/// V2 dialect errors
#[derive(Error, Debug)]
pub enum V2Error {
    /// Frame exceeds the configured maximum; the session closes
    #[error("oversize frame: {len} bytes exceeds limit {max}")]
    Oversize { len: usize, max: usize },

    /// Payload ended before a field was fully read
    #[error("truncated payload reading {0}")]
    Truncated(&'static str),

    /// Message type byte not in the profile
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Field value outside its wire domain
    #[error("bad field {0}")]
    BadField(&'static str),

    /// Handshake or transport cipher failure
    #[error("noise transport: {0}")]
    Noise(#[from] noise::NoiseError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
