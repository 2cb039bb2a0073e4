//! Decryption of the private execution-notice channel
//!
//! Payloads are base64 text of AES-CBC ciphertext with PKCS7 padding. The key
//! and IV arrive as UTF-8 strings in the topic's subscription ack; the key
//! length selects AES-128/192/256.

use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

use crate::common::errors::FrameDecodeError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Key material for one encrypted topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicKey {
    pub key: String,
    pub iv: String,
}

impl TopicKey {
    pub fn new(key: impl Into<String>, iv: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            iv: iv.into(),
        }
    }

    /// Decrypt one base64 payload into UTF-8 text
    pub fn decrypt(&self, cipher_b64: &str) -> Result<String, FrameDecodeError> {
        let data = BASE64
            .decode(cipher_b64.trim())
            .map_err(|e| FrameDecodeError::Decrypt(format!("base64: {}", e)))?;

        let key = self.key.as_bytes();
        let iv = self.iv.as_bytes();
        let bad_len = |e: cbc::cipher::InvalidLength| {
            FrameDecodeError::Decrypt(format!("key/iv length: {}", e))
        };

        let plain = match key.len() {
            16 => Aes128CbcDec::new_from_slices(key, iv)
                .map_err(bad_len)?
                .decrypt_padded_vec_mut::<Pkcs7>(&data),
            24 => Aes192CbcDec::new_from_slices(key, iv)
                .map_err(bad_len)?
                .decrypt_padded_vec_mut::<Pkcs7>(&data),
            32 => Aes256CbcDec::new_from_slices(key, iv)
                .map_err(bad_len)?
                .decrypt_padded_vec_mut::<Pkcs7>(&data),
            n => {
                return Err(FrameDecodeError::Decrypt(format!(
                    "unsupported key length {}",
                    n
                )))
            }
        }
        .map_err(|_| FrameDecodeError::Decrypt("bad padding".to_string()))?;

        String::from_utf8(plain).map_err(|e| FrameDecodeError::Decrypt(format!("utf-8: {}", e)))
    }
}
