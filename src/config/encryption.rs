//! At-rest protection for the stored SFTP password.
//!
//! The password is sealed with AES-256-GCM under a key derived (PBKDF2) from
//! the local host and user names, then stored as `base64(salt | nonce | data)`.

use std::num::NonZeroU32;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::pbkdf2::{PBKDF2_HMAC_SHA256, derive};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{AppError, Result};

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 100_000;

fn encryption_error(msg: &str) -> AppError {
    AppError::EncryptionError(msg.to_string())
}

pub struct SecretBox {
    rng: SystemRandom,
    machine_id: String,
}

impl SecretBox {
    pub fn new() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "default_host".to_string());
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "default_user".to_string());

        Self::with_machine_id(format!("remotesync_{hostname}_{username}"))
    }

    fn with_machine_id(machine_id: String) -> Self {
        Self {
            rng: SystemRandom::new(),
            machine_id,
        }
    }

    fn key(&self, salt: &[u8]) -> Result<LessSafeKey> {
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
            .ok_or_else(|| encryption_error("Invalid iteration count"))?;
        let mut key = [0u8; KEY_LEN];
        derive(
            PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            self.machine_id.as_bytes(),
            &mut key,
        );
        let unbound = UnboundKey::new(&AES_256_GCM, &key)
            .map_err(|_| encryption_error("Failed to create encryption key"))?;
        Ok(LessSafeKey::new(unbound))
    }

    pub fn seal(&self, plain: &str) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut salt)
            .map_err(|_| encryption_error("Failed to generate salt"))?;
        self.rng
            .fill(&mut nonce)
            .map_err(|_| encryption_error("Failed to generate nonce"))?;

        let mut data = plain.as_bytes().to_vec();
        self.key(&salt)?
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut data)
            .map_err(|_| encryption_error("Failed to encrypt password"))?;

        let mut sealed = Vec::with_capacity(SALT_LEN + NONCE_LEN + data.len());
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&data);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let raw = STANDARD
            .decode(sealed)
            .map_err(|_| encryption_error("Invalid base64 encoding"))?;
        if raw.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(encryption_error("Invalid encrypted data length"));
        }

        let (salt, rest) = raw.split_at(SALT_LEN);
        let (nonce, data) = rest.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| encryption_error("Invalid nonce length"))?;

        let mut data = data.to_vec();
        let plain = self
            .key(salt)?
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut data)
            .map_err(|_| encryption_error("Failed to decrypt password"))?;

        String::from_utf8(plain.to_vec())
            .map_err(|_| encryption_error("Invalid UTF-8 in decrypted password"))
    }
}

impl Default for SecretBox {
    fn default() -> Self {
        Self::new()
    }
}
