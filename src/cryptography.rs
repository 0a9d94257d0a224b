use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Result, ID_SIZE, KEY_SIZE, NONCE_SIZE, STREAM_CHUNK_SIZE};

/// AES-256 in counter mode with a big-endian counter over the full
/// 16-byte initialization vector.
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Generates a fresh node identity: the lowercase hex encoding of 32
/// random bytes. Generated once per process start and immutable for the
/// process lifetime.
pub fn generate_id() -> String {
    let mut id = [0u8; ID_SIZE];
    OsRng.fill_bytes(&mut id);
    hex::encode(id)
}

/// Generates a fresh 32-byte symmetric key. Each node keeps its key in
/// memory only; there is no key exchange, so data encrypted under it is
/// recoverable only by this node.
pub fn new_encryption_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Digest of a user key for use in wire messages: the first 32 hex
/// characters (128 bits) of its SHA-256. The network never sees the
/// original key, only this digest.
pub fn net_digest(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Digest of a key for the on-disk layout: the first 40 hex characters
/// (160 bits) of its SHA-256. The path transform splits this into
/// equal-length directory segments.
pub fn path_digest(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(digest)[..40].to_string()
}

/// Encrypt bytes from `src` into `dst` without buffering the whole input.
///
/// A fresh 16-byte nonce is drawn from the OS random source and written
/// to `dst` first, then the input is encrypted in 32 KiB chunks. CTR mode
/// is length-preserving, so the total written is the input length plus
/// the 16-byte nonce, which is also the returned count.
///
/// The output carries no authentication tag: tampered ciphertext decrypts
/// to garbage rather than an error.
pub async fn encrypt_copy<R, W>(key: &[u8; KEY_SIZE], src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    dst.write_all(&nonce).await?;

    let written = apply_copy(key, &nonce, src, dst).await?;
    Ok(written + NONCE_SIZE as u64)
}

/// Decrypt bytes from `src` into `dst` without buffering the whole input.
///
/// The first 16 bytes of `src` are consumed as the nonce; the remainder
/// is decrypted in 32 KiB chunks until `src` is exhausted. Returns the
/// number of plaintext bytes written to `dst`.
pub async fn decrypt_copy<R, W>(key: &[u8; KEY_SIZE], src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut nonce = [0u8; NONCE_SIZE];
    src.read_exact(&mut nonce).await?;
    apply_copy(key, &nonce, src, dst).await
}

// Encryption and decryption are the same XOR against the keystream.
async fn apply_copy<R, W>(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    src: &mut R,
    dst: &mut W,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut cipher = Aes256Ctr::new(key.into(), nonce.into());
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    dst.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn roundtrip(plaintext: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let key = new_encryption_key();

        let mut ciphertext = Vec::new();
        let written = encrypt_copy(&key, &mut &plaintext[..], &mut ciphertext)
            .await
            .expect("encryption should succeed");
        assert_eq!(written as usize, ciphertext.len());

        let mut decrypted = Vec::new();
        let read = decrypt_copy(&key, &mut &ciphertext[..], &mut decrypted)
            .await
            .expect("decryption should succeed");
        assert_eq!(read as usize, decrypted.len());

        (ciphertext, decrypted)
    }

    // ============================================================================
    // Stream codec round-trip tests
    // ============================================================================

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let plaintext = b"some big data file here!";
        let (ciphertext, decrypted) = roundtrip(plaintext).await;

        assert_eq!(ciphertext.len(), plaintext.len() + NONCE_SIZE);
        assert_eq!(&decrypted[..], plaintext);
        // body differs from the plaintext beyond the nonce prefix
        assert_ne!(&ciphertext[NONCE_SIZE..], plaintext);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (ciphertext, decrypted) = roundtrip(b"").await;

        // an empty payload still carries the nonce on the wire
        assert_eq!(ciphertext.len(), NONCE_SIZE);
        assert!(decrypted.is_empty());
    }

    #[tokio::test]
    async fn test_exact_chunk_boundary() {
        let plaintext = vec![0xABu8; STREAM_CHUNK_SIZE];
        let (ciphertext, decrypted) = roundtrip(&plaintext).await;

        assert_eq!(ciphertext.len(), plaintext.len() + NONCE_SIZE);
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn test_one_past_chunk_boundary() {
        let plaintext = vec![0xCDu8; STREAM_CHUNK_SIZE + 1];
        let (ciphertext, decrypted) = roundtrip(&plaintext).await;

        assert_eq!(ciphertext.len(), plaintext.len() + NONCE_SIZE);
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn test_wrong_key_yields_garbage_of_same_length() {
        let plaintext = b"confidential but unauthenticated";
        let key = new_encryption_key();
        let other = new_encryption_key();

        let mut ciphertext = Vec::new();
        encrypt_copy(&key, &mut &plaintext[..], &mut ciphertext)
            .await
            .unwrap();

        let mut decrypted = Vec::new();
        decrypt_copy(&other, &mut &ciphertext[..], &mut decrypted)
            .await
            .unwrap();

        // no authentication: the transform succeeds, the content does not
        assert_eq!(decrypted.len(), plaintext.len());
        assert_ne!(&decrypted[..], plaintext);
    }

    #[tokio::test]
    async fn test_truncated_source_fails_on_missing_nonce() {
        let key = new_encryption_key();
        let short = [0u8; NONCE_SIZE - 1];

        let mut out = Vec::new();
        let result = decrypt_copy(&key, &mut &short[..], &mut out).await;
        assert!(result.is_err(), "nonce shorter than 16 bytes should fail");
    }

    // ============================================================================
    // Nonce freshness tests
    // ============================================================================

    #[tokio::test]
    async fn test_nonces_are_distinct_across_encryptions() {
        let key = new_encryption_key();
        let mut seen = HashSet::new();

        for _ in 0..256 {
            let mut ciphertext = Vec::new();
            encrypt_copy(&key, &mut &b"x"[..], &mut ciphertext)
                .await
                .unwrap();
            let nonce: [u8; NONCE_SIZE] = ciphertext[..NONCE_SIZE].try_into().unwrap();
            assert!(seen.insert(nonce), "nonce reused across encryptions");
        }
    }

    #[tokio::test]
    async fn test_same_plaintext_same_key_different_ciphertext() {
        let key = new_encryption_key();
        let plaintext = b"repeated payload";

        let mut first = Vec::new();
        let mut second = Vec::new();
        encrypt_copy(&key, &mut &plaintext[..], &mut first).await.unwrap();
        encrypt_copy(&key, &mut &plaintext[..], &mut second).await.unwrap();

        assert_ne!(first, second);
    }

    // ============================================================================
    // Identity and digest tests
    // ============================================================================

    #[test]
    fn test_generated_ids_are_hex_and_unique() {
        let a = generate_id();
        let b = generate_id();

        assert_eq!(a.len(), ID_SIZE * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_digests_are_deterministic() {
        assert_eq!(net_digest("picture_0.png"), net_digest("picture_0.png"));
        assert_eq!(path_digest("picture_0.png"), path_digest("picture_0.png"));
        assert_ne!(net_digest("picture_0.png"), net_digest("picture_1.png"));
    }

    #[test]
    fn test_digest_widths() {
        assert_eq!(net_digest("alpha").len(), 32);
        assert_eq!(path_digest("alpha").len(), 40);
    }
}
