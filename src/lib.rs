pub mod bytes;
pub mod commands;
pub mod cryptography;
pub mod error;
pub mod messages;
pub mod networking;
pub mod server;
pub mod storage;

pub use error::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 16;
pub const ID_SIZE: usize = 32;
pub const STREAM_CHUNK_SIZE: usize = 32 * 1024;
pub const MAX_MESSAGE_SIZE: usize = 1028;
pub const DEFAULT_SEGMENT_LEN: usize = 5;
