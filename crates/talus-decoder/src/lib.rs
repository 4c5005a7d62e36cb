//! Decodes raw upload buffers into newline-delimited log text.
//!
//! Buffers either start with the vendor container magic (AES-128-CBC payload,
//! key/IV from deployment config) or are treated as plain UTF-8 text. The
//! transform is pure; a failed decrypt is a file-level error for the caller.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Magic prefix the on-device SDK writes before the encrypted payload.
pub const CONTAINER_MAGIC: [u8; 4] = [0xD1, 0x4C, 0x47, 0x01];

const BLOCK_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("buffer is an encrypted container but no cipher key is configured")]
    MissingKey,
    #[error("invalid hex in cipher config: {0}")]
    InvalidHex(String),
    #[error("cipher {field} must be {expected} bytes, got {got}")]
    KeyLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("container payload is truncated or not block-aligned ({len} bytes)")]
    Truncated { len: usize },
    #[error("container decryption failed (bad key or corrupt padding)")]
    Decrypt,
}

/// Symmetric key material supplied by deployment configuration.
#[derive(Clone)]
pub struct CipherConfig {
    key: [u8; BLOCK_LEN],
    iv: [u8; BLOCK_LEN],
}

impl CipherConfig {
    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self, DecodeError> {
        Ok(Self {
            key: hex_block(key_hex, "key")?,
            iv: hex_block(iv_hex, "iv")?,
        })
    }
}

impl std::fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("CipherConfig").finish_non_exhaustive()
    }
}

fn hex_block(raw: &str, field: &'static str) -> Result<[u8; BLOCK_LEN], DecodeError> {
    let bytes =
        hex::decode(raw.trim()).map_err(|err| DecodeError::InvalidHex(err.to_string()))?;
    let got = bytes.len();
    bytes.try_into().map_err(|_| DecodeError::KeyLength {
        field,
        expected: BLOCK_LEN,
        got,
    })
}

pub fn is_encrypted_container(buf: &[u8]) -> bool {
    buf.len() >= CONTAINER_MAGIC.len() && buf[..CONTAINER_MAGIC.len()] == CONTAINER_MAGIC
}

/// Turns an upload buffer into log text. Plain buffers pass through; magic-
/// prefixed buffers are decrypted with the configured cipher.
pub fn decode(buf: &[u8], cipher: Option<&CipherConfig>) -> Result<String, DecodeError> {
    if !is_encrypted_container(buf) {
        return Ok(String::from_utf8_lossy(buf).into_owned());
    }

    let cipher = cipher.ok_or(DecodeError::MissingKey)?;
    let payload = &buf[CONTAINER_MAGIC.len()..];
    if payload.is_empty() || payload.len() % BLOCK_LEN != 0 {
        return Err(DecodeError::Truncated { len: payload.len() });
    }

    let plain = Aes128CbcDec::new(&cipher.key.into(), &cipher.iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(payload)
        .map_err(|_| DecodeError::Decrypt)?;

    Ok(String::from_utf8_lossy(&plain).into_owned())
}

/// Inverse of [`decode`] for encrypted containers. Used by tests and fixture
/// tooling; the production path only ever decodes.
pub fn encode(text: &str, cipher: &CipherConfig) -> Vec<u8> {
    let ciphertext = Aes128CbcEnc::new(&cipher.key.into(), &cipher.iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(text.as_bytes());

    let mut out = Vec::with_capacity(CONTAINER_MAGIC.len() + ciphertext.len());
    out.extend_from_slice(&CONTAINER_MAGIC);
    out.extend_from_slice(&ciphertext);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f";
    const IV_HEX: &str = "0f0e0d0c0b0a09080706050403020100";

    fn test_cipher() -> CipherConfig {
        CipherConfig::from_hex(KEY_HEX, IV_HEX).expect("valid test cipher")
    }

    #[test]
    fn plain_text_passes_through_unchanged() {
        let text = "{\"c\":\"{}\",\"f\":1,\"l\":1000,\"n\":\"main\"}\n";
        let decoded = decode(text.as_bytes(), None).expect("plain decode");
        assert_eq!(decoded, text);
    }

    #[test]
    fn plain_text_decodes_without_cipher_configured() {
        let decoded = decode(b"hello world", None).expect("plain decode");
        assert_eq!(decoded, "hello world");
    }

    #[test]
    fn encrypted_round_trip_restores_original_text() {
        let cipher = test_cipher();
        let text = "line one\nline two with \u{4e2d}\u{6587}\nline three";

        let container = encode(text, &cipher);
        assert!(is_encrypted_container(&container));

        let decoded = decode(&container, Some(&cipher)).expect("encrypted decode");
        assert_eq!(decoded, text);
        // Re-encoding the decoded text reproduces the container bytes.
        assert_eq!(encode(&decoded, &cipher), container);
    }

    #[test]
    fn encrypted_container_without_key_is_rejected() {
        let container = encode("secret", &test_cipher());
        let err = decode(&container, None).expect_err("missing key should fail");
        assert!(matches!(err, DecodeError::MissingKey));
    }

    #[test]
    fn wrong_key_fails_as_decrypt_error() {
        let container = encode("secret", &test_cipher());
        let wrong = CipherConfig::from_hex(
            "ffffffffffffffffffffffffffffffff",
            IV_HEX,
        )
        .expect("valid wrong key");

        let err = decode(&container, Some(&wrong)).expect_err("wrong key should fail");
        assert!(matches!(err, DecodeError::Decrypt));
    }

    #[test]
    fn unaligned_payload_is_truncated_error() {
        let mut container = CONTAINER_MAGIC.to_vec();
        container.extend_from_slice(&[0u8; 17]);

        let err =
            decode(&container, Some(&test_cipher())).expect_err("unaligned payload should fail");
        assert!(matches!(err, DecodeError::Truncated { len: 17 }));
    }

    #[test]
    fn short_hex_key_is_rejected_with_length() {
        let err = CipherConfig::from_hex("0011", IV_HEX).expect_err("short key should fail");
        assert!(matches!(
            err,
            DecodeError::KeyLength {
                field: "key",
                expected: 16,
                got: 2
            }
        ));
    }

    #[test]
    fn non_hex_key_is_rejected() {
        let err = CipherConfig::from_hex("zz", IV_HEX).expect_err("non-hex key should fail");
        assert!(matches!(err, DecodeError::InvalidHex(_)));
    }
}
