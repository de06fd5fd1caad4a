//! Per-room chat message encryption.
//!
//! Messages are sealed with AES-256-GCM. The key for a message is derived with
//! PBKDF2-HMAC-SHA256 from the server secret, the room id and a hash of the
//! time window the message was written in, salted per message. The window
//! index travels in the envelope so a message stays readable after its window
//! has passed.
//!
//! Envelope layout (base64):
//!
//! ```text
//! version (1) | window (8, BE) | salt (32) | nonce (12) | ciphertext + tag
//! ```

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const VERSION: u8 = 1;
const WINDOW_LEN: usize = 8;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 1 + WINDOW_LEN + SALT_LEN + NONCE_LEN;

pub const DEFAULT_ITERATIONS: u32 = 100_000;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const UNREADABLE_PLACEHOLDER: &str = "[Message could not be decrypted]";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("envelope is not valid base64")]
    Encoding,
    #[error("envelope is truncated")]
    Truncated,
    #[error("unsupported envelope version {0}")]
    Version(u8),
    #[error("message failed authentication")]
    Authentication,
    #[error("decrypted message is not valid utf-8")]
    Utf8,
    #[error("message could not be sealed")]
    Seal,
}

#[derive(Clone)]
pub struct ChatCipher {
    secret: Vec<u8>,
    iterations: u32,
    window: Duration,
}

impl ChatCipher {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            iterations: DEFAULT_ITERATIONS,
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window.max(Duration::from_secs(1));
        self
    }

    fn window_index(&self, at: DateTime<Utc>) -> u64 {
        let secs = at.timestamp().max(0) as u64;
        secs / self.window.as_secs()
    }

    fn derive_key(&self, room_id: Uuid, window: u64, salt: &[u8]) -> [u8; 32] {
        let window_hash = Sha256::digest(window.to_string().as_bytes());
        let mut base = self.secret.clone();
        base.extend_from_slice(room_id.to_string().as_bytes());
        base.extend_from_slice(hex_lower(&window_hash).as_bytes());

        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(&base, salt, self.iterations, &mut key);
        key
    }

    pub fn encrypt(&self, room_id: Uuid, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt_at(room_id, plaintext, Utc::now())
    }

    pub fn encrypt_at(
        &self,
        room_id: Uuid,
        plaintext: &str,
        at: DateTime<Utc>,
    ) -> Result<String, CryptoError> {
        let window = self.window_index(at);
        let salt: [u8; SALT_LEN] = rand::random();
        let key = self.derive_key(room_id, window, &salt);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: room_id.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Seal)?;

        let mut envelope = Vec::with_capacity(HEADER_LEN + sealed.len());
        envelope.push(VERSION);
        envelope.extend_from_slice(&window.to_be_bytes());
        envelope.extend_from_slice(&salt);
        envelope.extend_from_slice(nonce.as_slice());
        envelope.extend_from_slice(&sealed);
        Ok(STANDARD.encode(envelope))
    }

    pub fn decrypt(&self, room_id: Uuid, envelope: &str) -> Result<String, CryptoError> {
        let raw = STANDARD
            .decode(envelope.trim())
            .map_err(|_| CryptoError::Encoding)?;
        if raw.is_empty() {
            return Err(CryptoError::Truncated);
        }
        if raw[0] != VERSION {
            return Err(CryptoError::Version(raw[0]));
        }
        // the GCM tag alone is 16 bytes
        if raw.len() < HEADER_LEN + 16 {
            return Err(CryptoError::Truncated);
        }

        let (window_bytes, rest) = raw[1..].split_at(WINDOW_LEN);
        let (salt, rest) = rest.split_at(SALT_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let mut window = [0u8; WINDOW_LEN];
        window.copy_from_slice(window_bytes);
        let key = self.derive_key(room_id, u64::from_be_bytes(window), salt);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plain = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: room_id.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Authentication)?;

        String::from_utf8(plain).map_err(|_| CryptoError::Utf8)
    }

    pub fn decrypt_or_placeholder(&self, room_id: Uuid, envelope: &str) -> String {
        self.decrypt(room_id, envelope).unwrap_or_else(|e| {
            tracing::warn!(%room_id, error = %e, "failed to decrypt chat message");
            UNREADABLE_PLACEHOLDER.to_string()
        })
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cipher() -> ChatCipher {
        ChatCipher::new("test-chat-secret").with_iterations(10)
    }

    #[test]
    fn decrypts_what_it_encrypted() {
        let room = Uuid::new_v4();
        let envelope = cipher().encrypt(room, "see you at the hackathon").unwrap();
        assert_eq!(
            cipher().decrypt(room, &envelope).unwrap(),
            "see you at the hackathon"
        );
    }

    #[test]
    fn old_windows_stay_readable() {
        let room = Uuid::new_v4();
        let written = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let envelope = cipher().encrypt_at(room, "from last year", written).unwrap();
        assert_eq!(cipher().decrypt(room, &envelope).unwrap(), "from last year");
    }

    #[test]
    fn same_message_encrypts_differently() {
        let room = Uuid::new_v4();
        let c = cipher();
        assert_ne!(c.encrypt(room, "hello").unwrap(), c.encrypt(room, "hello").unwrap());
    }

    #[test]
    fn other_room_cannot_read() {
        let envelope = cipher().encrypt(Uuid::new_v4(), "club secrets").unwrap();
        assert_eq!(
            cipher().decrypt(Uuid::new_v4(), &envelope),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn other_secret_cannot_read() {
        let room = Uuid::new_v4();
        let envelope = cipher().encrypt(room, "club secrets").unwrap();
        let other = ChatCipher::new("another-secret").with_iterations(10);
        assert_eq!(
            other.decrypt(room, &envelope),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn tampering_is_detected() {
        let room = Uuid::new_v4();
        let mut raw = STANDARD
            .decode(cipher().encrypt(room, "attendance at 5").unwrap())
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert_eq!(
            cipher().decrypt(room, &STANDARD.encode(raw)),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn malformed_envelopes() {
        let room = Uuid::new_v4();
        assert_eq!(cipher().decrypt(room, "not base64!"), Err(CryptoError::Encoding));
        assert_eq!(
            cipher().decrypt(room, &STANDARD.encode([VERSION, 0, 0])),
            Err(CryptoError::Truncated)
        );
        assert_eq!(
            cipher().decrypt(room, &STANDARD.encode([9u8; 80])),
            Err(CryptoError::Version(9))
        );
        assert_eq!(
            cipher().decrypt_or_placeholder(room, "garbage"),
            UNREADABLE_PLACEHOLDER
        );
    }
}
