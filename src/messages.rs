use serde::{Deserialize, Serialize};

use crate::{Error, Result, MAX_MESSAGE_SIZE};

/// Frame tag announcing a length-prefixed control message.
pub const MSG_TAG: u8 = 0x01;
/// Frame tag announcing an opaque byte stream of externally agreed length.
pub const STREAM_TAG: u8 = 0x02;

/// Control messages exchanged between peers. Both sides of every
/// connection speak exactly these variants; the enum being closed is what
/// keeps encoder and decoder in agreement.
///
/// Identifiers and digests travel as hex strings; `size` is the byte
/// count of the stream that follows a `StoreAnnounce`, nonce included.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Message {
    StoreAnnounce {
        owner: String,
        net_key: String,
        size: i64,
    },
    GetRequest {
        owner: String,
        net_key: String,
    },
}

/// Encode a message as a complete wire frame: the message tag, a
/// big-endian u32 length, then the bincode payload.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(1 + 4 + payload.len());
    frame.push(MSG_TAG);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the payload of a message frame (the bytes after the tag and
/// length prefix).
pub fn decode_message(payload: &[u8]) -> Result<Message> {
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // Frame codec round-trip tests
    // ============================================================================

    #[test]
    fn test_store_announce_roundtrip() {
        let msg = Message::StoreAnnounce {
            owner: "ab".repeat(32),
            net_key: "cd".repeat(16),
            size: 38,
        };

        let frame = encode_message(&msg).unwrap();
        assert_eq!(frame[0], MSG_TAG);

        let len = u32::from_be_bytes(frame[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 5);

        let decoded = decode_message(&frame[5..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_get_request_roundtrip() {
        let msg = Message::GetRequest {
            owner: "12".repeat(32),
            net_key: "34".repeat(16),
        };

        let frame = encode_message(&msg).unwrap();
        let decoded = decode_message(&frame[5..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let msg = Message::StoreAnnounce {
            owner: "ff".repeat(32),
            net_key: "00".repeat(16),
            size: i64::MAX,
        };

        assert_eq!(encode_message(&msg).unwrap(), encode_message(&msg).unwrap());
    }

    #[test]
    fn test_control_messages_fit_the_scratch_buffer() {
        // the largest well-formed message stays far under the decode limit
        let msg = Message::StoreAnnounce {
            owner: "ab".repeat(32),
            net_key: "cd".repeat(16),
            size: i64::MAX,
        };

        let frame = encode_message(&msg).unwrap();
        assert!(frame.len() - 5 <= MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_garbage_payload_fails_to_decode() {
        // variant index far out of range
        let garbage = [0xFFu8; 16];
        assert!(decode_message(&garbage).is_err());
    }

    #[test]
    fn test_truncated_payload_fails_to_decode() {
        let msg = Message::GetRequest {
            owner: "12".repeat(32),
            net_key: "34".repeat(16),
        };
        let frame = encode_message(&msg).unwrap();

        assert!(decode_message(&frame[5..frame.len() - 3]).is_err());
    }
}
