//! Authenticated blob encryption
//!
//! Layout: `iv (16) || AES-256-CBC-PAD ciphertext || HMAC-SHA256 (32)`.
//! Encryption and MAC keys are derived from the 32-byte master key so a
//! single secret protects both.

use super::cipher::run_cipher;
use super::digest::hmac_sha256;
use crate::error::{TokenError, TokenResult};
use crate::mechanism::{CipherAlgorithm, CipherMode};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;

fn derive(master: &[u8], label: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut h = Sha256::new();
    h.update(master);
    h.update(label);
    Zeroizing::new(h.finalize().to_vec())
}

/// Encrypt and authenticate `plaintext` under `master`
pub fn seal_blob(master: &[u8], plaintext: &[u8]) -> TokenResult<Vec<u8>> {
    let enc_key = derive(master, b"tpmtok-blob-enc-v1");
    let mac_key = derive(master, b"tpmtok-blob-mac-v1");

    let iv: [u8; IV_LEN] = rand::random();
    let ciphertext = run_cipher(CipherAlgorithm::Aes, CipherMode::CbcPad, &enc_key, &iv, true, plaintext)?;

    let mut sealed = Vec::with_capacity(IV_LEN + ciphertext.len() + MAC_LEN);
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&ciphertext);
    let tag = hmac_sha256(&mac_key, &sealed)?;
    sealed.extend_from_slice(&tag);
    Ok(sealed)
}

/// Verify and decrypt a blob produced by [`seal_blob`]
pub fn open_blob(master: &[u8], sealed: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
    if sealed.len() < IV_LEN + 16 + MAC_LEN {
        return Err(TokenError::GeneralError("Sealed blob too short".into()));
    }
    let enc_key = derive(master, b"tpmtok-blob-enc-v1");
    let mac_key = derive(master, b"tpmtok-blob-mac-v1");

    let (body, tag) = sealed.split_at(sealed.len() - MAC_LEN);
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&mac_key)
        .map_err(|_| TokenError::GeneralError("Bad MAC key".into()))?;
    Mac::update(&mut mac, body);
    Mac::verify_slice(mac, tag)
        .map_err(|_| TokenError::GeneralError("Blob integrity check failed".into()))?;

    let (iv, ciphertext) = body.split_at(IV_LEN);
    let plaintext = run_cipher(CipherAlgorithm::Aes, CipherMode::CbcPad, &enc_key, iv, false, ciphertext)
        .map_err(|_| TokenError::GeneralError("Blob decryption failed".into()))?;
    Ok(Zeroizing::new(plaintext))
}
