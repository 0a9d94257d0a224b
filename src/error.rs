use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A frame started with a byte that is neither the message nor the
    /// stream tag. Fatal for the connection it was read from.
    #[error("unknown frame tag {0:#04x}")]
    UnknownFrameTag(u8),

    /// A control message exceeded the bounded scratch size.
    #[error("control message of {0} bytes exceeds the {max} byte limit", max = crate::MAX_MESSAGE_SIZE)]
    MessageTooLarge(usize),

    /// A stream body ended before the announced byte count was delivered.
    #[error("stream ended after {got} of {expected} bytes")]
    StreamTruncated { expected: u64, got: u64 },

    /// A well-formed message carried values the protocol forbids.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A peer announced a stream and never sent it.
    #[error("timed out waiting for stream from {0}")]
    StreamWait(SocketAddr),

    /// A frame referenced a connection the controller does not track.
    #[error("no tracked peer at {0}")]
    UnknownPeer(SocketAddr),

    #[error("key {0:?} not found locally or on any peer")]
    NotFound(String),

    /// The transport's inbound queue was already taken or the transport
    /// never started listening.
    #[error("transport not consumable: {0}")]
    Transport(&'static str),

    #[error("message codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
