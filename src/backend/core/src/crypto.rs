//! Credential encryption at rest.
//!
//! SMTP passwords are stored as AES-256-CBC ciphertext with a random
//! 16-byte IV per value, persisted as `hex(iv) + ":" + hex(ciphertext)`.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::{CascadeError, ErrorCode, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypt a plaintext value for storage.
pub fn encrypt(key: &[u8; 32], plaintext: &str) -> String {
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    format!("{}:{}", hex::encode(iv), hex::encode(ciphertext))
}

/// Decrypt a stored `hex(iv):hex(ciphertext)` value.
pub fn decrypt(key: &[u8; 32], stored: &str) -> Result<String> {
    let (iv_hex, ct_hex) = stored.split_once(':').ok_or_else(|| {
        CascadeError::new(
            ErrorCode::ConfigurationError,
            "Stored credential is not in iv:ciphertext form",
        )
    })?;

    let iv = hex::decode(iv_hex).map_err(|e| {
        CascadeError::with_internal(
            ErrorCode::ConfigurationError,
            "Stored credential IV is not valid hex",
            e.to_string(),
        )
    })?;
    let iv: [u8; 16] = iv.try_into().map_err(|_| {
        CascadeError::new(ErrorCode::ConfigurationError, "Credential IV must be 16 bytes")
    })?;

    let ciphertext = hex::decode(ct_hex).map_err(|e| {
        CascadeError::with_internal(
            ErrorCode::ConfigurationError,
            "Stored credential ciphertext is not valid hex",
            e.to_string(),
        )
    })?;

    let plaintext = Aes256CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| {
            CascadeError::new(
                ErrorCode::ConfigurationError,
                "Credential decryption failed (wrong key or corrupt value)",
            )
        })?;

    String::from_utf8(plaintext).map_err(|e| {
        CascadeError::with_internal(
            ErrorCode::ConfigurationError,
            "Decrypted credential is not valid UTF-8",
            e.to_string(),
        )
    })
}
