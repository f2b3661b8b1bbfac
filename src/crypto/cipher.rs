//! Streaming block cipher engine
//!
//! Input is buffered until whole blocks are available. When decrypting with
//! padding the last full block is held back until `finish` so the padding
//! can be checked and stripped.

use crate::error::{TokenError, TokenResult};
use crate::mechanism::{CipherAlgorithm, CipherMode};
use aes::{Aes128, Aes192, Aes256};
use ::cipher::block_padding::{Pkcs7, RawPadding};
use ::cipher::generic_array::GenericArray;
use ::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use des::{Des, TdesEde2, TdesEde3};
use zeroize::Zeroize;

/// A keyed block mode (ECB or CBC) in one direction. The mode keeps its own
/// chaining state between calls.
trait ModeCipher: Send {
    fn process_block(&mut self, block: &mut [u8]);
}

struct Encrypting<M>(M);

struct Decrypting<M>(M);

impl<M: BlockEncryptMut + Send> ModeCipher for Encrypting<M> {
    fn process_block(&mut self, block: &mut [u8]) {
        self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

impl<M: BlockDecryptMut + Send> ModeCipher for Decrypting<M> {
    fn process_block(&mut self, block: &mut [u8]) {
        self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn new_mode_cipher(
    alg: CipherAlgorithm,
    mode: CipherMode,
    key: &[u8],
    iv: &[u8],
    encrypt: bool,
) -> TokenResult<Box<dyn ModeCipher>> {
    fn build<C>(mode: CipherMode, key: &[u8], iv: &[u8], encrypt: bool) -> TokenResult<Box<dyn ModeCipher>>
    where
        C: BlockCipher + BlockEncryptMut + BlockDecryptMut + KeyInit + Send + 'static,
    {
        let bad_key = |_: ::cipher::InvalidLength| TokenError::KeySizeRange;
        let cipher: Box<dyn ModeCipher> = match (mode, encrypt) {
            (CipherMode::Ecb, true) => {
                Box::new(Encrypting(ecb::Encryptor::<C>::new_from_slice(key).map_err(bad_key)?))
            }
            (CipherMode::Ecb, false) => {
                Box::new(Decrypting(ecb::Decryptor::<C>::new_from_slice(key).map_err(bad_key)?))
            }
            (_, true) => Box::new(Encrypting(
                cbc::Encryptor::<C>::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            (_, false) => Box::new(Decrypting(
                cbc::Decryptor::<C>::new_from_slices(key, iv).map_err(bad_key)?,
            )),
        };
        Ok(cipher)
    }

    match (alg, key.len()) {
        (CipherAlgorithm::Aes, 16) => build::<Aes128>(mode, key, iv, encrypt),
        (CipherAlgorithm::Aes, 24) => build::<Aes192>(mode, key, iv, encrypt),
        (CipherAlgorithm::Aes, 32) => build::<Aes256>(mode, key, iv, encrypt),
        (CipherAlgorithm::Des, 8) => build::<Des>(mode, key, iv, encrypt),
        (CipherAlgorithm::Des3, 16) => build::<TdesEde2>(mode, key, iv, encrypt),
        (CipherAlgorithm::Des3, 24) => build::<TdesEde3>(mode, key, iv, encrypt),
        _ => Err(TokenError::KeySizeRange),
    }
}

/// Multi-part encryption or decryption state
pub struct BlockCipherState {
    cipher: Box<dyn ModeCipher>,
    mode: CipherMode,
    encrypt: bool,
    block_size: usize,
    pending: Vec<u8>,
}

impl BlockCipherState {
    /// `iv` must be one block for CBC modes and is ignored for ECB
    pub fn new(
        alg: CipherAlgorithm,
        mode: CipherMode,
        key: &[u8],
        iv: &[u8],
        encrypt: bool,
    ) -> TokenResult<Self> {
        let block_size = alg.block_size();
        if mode != CipherMode::Ecb && iv.len() != block_size {
            return Err(TokenError::MechanismParamInvalid);
        }
        Ok(Self {
            cipher: new_mode_cipher(alg, mode, key, iv, encrypt)?,
            mode,
            encrypt,
            block_size,
            pending: Vec::new(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Feed input, returning whatever whole blocks could be processed
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);
        let mut blocks = self.pending.len() / self.block_size;
        let holds_back = !self.encrypt && self.mode == CipherMode::CbcPad;
        if holds_back && blocks > 0 && self.pending.len() % self.block_size == 0 {
            blocks -= 1;
        }
        let take = blocks * self.block_size;
        let mut out: Vec<u8> = self.pending.drain(..take).collect();
        for block in out.chunks_mut(self.block_size) {
            self.cipher.process_block(block);
        }
        out
    }

    /// Flush the remaining input, applying or removing padding
    pub fn finish(&mut self) -> TokenResult<Vec<u8>> {
        let bs = self.block_size;
        let mut rest = std::mem::take(&mut self.pending);
        let out = match (self.encrypt, self.mode) {
            (true, CipherMode::CbcPad) => {
                let pos = rest.len();
                rest.resize(bs, 0);
                Pkcs7::raw_pad(&mut rest, pos);
                self.cipher.process_block(&mut rest);
                rest
            }
            (false, CipherMode::CbcPad) => {
                if rest.len() != bs {
                    return Err(TokenError::EncryptedDataLenRange);
                }
                self.cipher.process_block(&mut rest);
                let unpadded = match Pkcs7::raw_unpad(&rest) {
                    Ok(unpadded) => unpadded.len(),
                    Err(_) => {
                        rest.zeroize();
                        return Err(TokenError::EncryptedDataInvalid);
                    }
                };
                rest.truncate(unpadded);
                rest
            }
            (true, _) => {
                if !rest.is_empty() {
                    return Err(TokenError::DataLenRange);
                }
                rest
            }
            (false, _) => {
                if !rest.is_empty() {
                    return Err(TokenError::EncryptedDataLenRange);
                }
                rest
            }
        };
        Ok(out)
    }
}

impl Drop for BlockCipherState {
    fn drop(&mut self) {
        self.pending.zeroize();
    }
}

/// One-shot helper: process all of `data`
pub fn run_cipher(
    alg: CipherAlgorithm,
    mode: CipherMode,
    key: &[u8],
    iv: &[u8],
    encrypt: bool,
    data: &[u8],
) -> TokenResult<Vec<u8>> {
    let mut state = BlockCipherState::new(alg, mode, key, iv, encrypt)?;
    let mut out = state.update(data);
    out.extend(state.finish()?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];
    const IV: [u8; 16] = [9u8; 16];

    #[test]
    fn test_cbc_pad_streaming_layout() {
        let mut enc = BlockCipherState::new(CipherAlgorithm::Aes, CipherMode::CbcPad, &KEY, &IV, true).unwrap();
        let first = enc.update(&[b'B'; 22]);
        assert_eq!(first.len(), 16);
        let last = enc.finish().unwrap();
        assert_eq!(last.len(), 16);

        let mut ct = first;
        ct.extend(last);
        let pt = run_cipher(CipherAlgorithm::Aes, CipherMode::CbcPad, &KEY, &IV, false, &ct).unwrap();
        assert_eq!(pt, vec![b'B'; 22]);
    }

    #[test]
    fn test_split_updates_match_one_shot() {
        let data: Vec<u8> = (0u8..48).collect();
        let one_shot = run_cipher(CipherAlgorithm::Aes, CipherMode::Cbc, &KEY[..16], &IV, true, &data).unwrap();

        let mut enc = BlockCipherState::new(CipherAlgorithm::Aes, CipherMode::Cbc, &KEY[..16], &IV, true).unwrap();
        let mut split = enc.update(&data[..5]);
        split.extend(enc.update(&data[5..33]));
        split.extend(enc.update(&data[33..]));
        split.extend(enc.finish().unwrap());
        assert_eq!(split, one_shot);
    }

    #[test]
    fn test_unpadded_partial_block_rejected() {
        let result = run_cipher(CipherAlgorithm::Des3, CipherMode::Ecb, &KEY[..24], &[], true, &[1u8; 9]);
        assert_eq!(result, Err(TokenError::DataLenRange));

        let result = run_cipher(CipherAlgorithm::Aes, CipherMode::CbcPad, &KEY, &IV, false, &[1u8; 20]);
        assert_eq!(result, Err(TokenError::EncryptedDataLenRange));
    }

    #[test]
    fn test_iv_and_key_length_checks() {
        let bad_iv = BlockCipherState::new(CipherAlgorithm::Aes, CipherMode::Cbc, &KEY, &IV[..8], true);
        assert!(matches!(bad_iv, Err(TokenError::MechanismParamInvalid)));

        let bad_key = BlockCipherState::new(CipherAlgorithm::Des, CipherMode::Ecb, &KEY[..7], &[], true);
        assert!(matches!(bad_key, Err(TokenError::KeySizeRange)));
    }

    #[test]
    fn test_aes128_known_answers() {
        // NIST SP 800-38A F.1.1 and F.2.1, first block
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let pt = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();

        let ecb = run_cipher(CipherAlgorithm::Aes, CipherMode::Ecb, &key, &[], true, &pt).unwrap();
        assert_eq!(hex::encode(ecb), "3ad77bb40d7a3660a89ecaf32466ef97");
        let cbc = run_cipher(CipherAlgorithm::Aes, CipherMode::Cbc, &key, &iv, true, &pt).unwrap();
        assert_eq!(hex::encode(&cbc), "7649abac8119b246cee98e9b12e9197d");
        let back = run_cipher(CipherAlgorithm::Aes, CipherMode::Cbc, &key, &iv, false, &cbc).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn test_des_cbc_pad() {
        let key = [0x13u8, 0x34, 0x57, 0x79, 0x9b, 0xbc, 0xdf, 0xf1];
        let iv = [0u8; 8];
        let ct = run_cipher(CipherAlgorithm::Des, CipherMode::CbcPad, &key, &iv, true, b"hello world").unwrap();
        assert_eq!(ct.len(), 16);
        let pt = run_cipher(CipherAlgorithm::Des, CipherMode::CbcPad, &key, &iv, false, &ct).unwrap();
        assert_eq!(pt, b"hello world");
    }

    #[test]
    fn test_bad_padding_detected() {
        let ct = run_cipher(CipherAlgorithm::Aes, CipherMode::Cbc, &KEY, &IV, true, &[0u8; 16]).unwrap();
        let result = run_cipher(CipherAlgorithm::Aes, CipherMode::CbcPad, &KEY, &IV, false, &ct);
        assert_eq!(result, Err(TokenError::EncryptedDataInvalid));
    }
}
