//! Event payload crypto
//!
//! Encrypted webhook payloads are AES-256-CBC with the ciphertext prefixed
//! by the IV, keyed by the SHA-256 of the shared encrypt key. Request
//! authenticity is a SHA-256 over `timestamp || nonce || key || raw body`
//! compared against the provider-supplied signature header.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// AES block size; also the IV length prefixed to the ciphertext.
const IV_LEN: usize = 16;

fn derive_key(encrypt_key: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    key.copy_from_slice(&Sha256::digest(encrypt_key.as_bytes()));
    key
}

/// Decrypt a base64 `encrypt` field into its JSON plaintext.
pub fn decrypt_event(encrypt_key: &str, encrypted_b64: &str) -> Result<String> {
    let data = BASE64
        .decode(encrypted_b64.trim())
        .context("encrypted payload is not valid base64")?;
    if data.len() <= IV_LEN {
        return Err(anyhow!("encrypted payload too short"));
    }
    let (iv, ciphertext) = data.split_at(IV_LEN);

    let key = derive_key(encrypt_key);
    let plaintext = Aes256CbcDec::new_from_slices(&key, iv)
        .map_err(|e| anyhow!("bad key/iv length: {}", e))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| anyhow!("decryption failed: {}", e))?;

    String::from_utf8(plaintext).context("decrypted payload is not UTF-8")
}

/// Inverse of [`decrypt_event`]; exercised by the webhook tests.
pub fn encrypt_event(encrypt_key: &str, plaintext: &str) -> String {
    let key = derive_key(encrypt_key);
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
        .expect("key and iv lengths are fixed")
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut framed = iv.to_vec();
    framed.extend_from_slice(&ciphertext);
    BASE64.encode(framed)
}

/// Check the provider signature over the raw request body.
pub fn verify_signature(
    timestamp: &str,
    nonce: &str,
    encrypt_key: &str,
    body: &[u8],
    expected: &str,
) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(encrypt_key.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize()) == expected
}
