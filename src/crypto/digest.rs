//! Digest and HMAC state

use crate::error::{TokenError, TokenResult};
use crate::mechanism::DigestAlgorithm;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::digest::DynDigest;
use sha2::{Sha256, Sha384, Sha512};

/// Running message digest
pub struct DigestState {
    algorithm: DigestAlgorithm,
    inner: Box<dyn DynDigest + Send>,
}

impl DigestState {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let inner: Box<dyn DynDigest + Send> = match algorithm {
            DigestAlgorithm::Md5 => Box::new(Md5::default()),
            DigestAlgorithm::Sha1 => Box::new(Sha1::default()),
            DigestAlgorithm::Sha256 => Box::new(Sha256::default()),
            DigestAlgorithm::Sha384 => Box::new(Sha384::default()),
            DigestAlgorithm::Sha512 => Box::new(Sha512::default()),
        };
        Self { algorithm, inner }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn update(&mut self, data: &[u8]) {
        DynDigest::update(&mut *self.inner, data);
    }

    pub fn finish(self) -> Vec<u8> {
        self.inner.finalize().into_vec()
    }
}

/// One-shot digest
pub fn digest(algorithm: DigestAlgorithm, data: &[u8]) -> Vec<u8> {
    let mut state = DigestState::new(algorithm);
    state.update(data);
    state.finish()
}

macro_rules! hmac_dispatch {
    ($self:expr, $mac:ident => $body:expr) => {
        match $self {
            HmacState::Md5($mac) => $body,
            HmacState::Sha1($mac) => $body,
            HmacState::Sha256($mac) => $body,
            HmacState::Sha384($mac) => $body,
            HmacState::Sha512($mac) => $body,
        }
    };
}

/// Running HMAC
pub enum HmacState {
    Md5(Hmac<Md5>),
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
    Sha512(Hmac<Sha512>),
}

impl HmacState {
    pub fn new(algorithm: DigestAlgorithm, key: &[u8]) -> TokenResult<Self> {
        let bad_key = |_| TokenError::KeySizeRange;
        let state = match algorithm {
            DigestAlgorithm::Md5 => HmacState::Md5(<Hmac<Md5> as Mac>::new_from_slice(key).map_err(bad_key)?),
            DigestAlgorithm::Sha1 => HmacState::Sha1(<Hmac<Sha1> as Mac>::new_from_slice(key).map_err(bad_key)?),
            DigestAlgorithm::Sha256 => {
                HmacState::Sha256(<Hmac<Sha256> as Mac>::new_from_slice(key).map_err(bad_key)?)
            }
            DigestAlgorithm::Sha384 => {
                HmacState::Sha384(<Hmac<Sha384> as Mac>::new_from_slice(key).map_err(bad_key)?)
            }
            DigestAlgorithm::Sha512 => {
                HmacState::Sha512(<Hmac<Sha512> as Mac>::new_from_slice(key).map_err(bad_key)?)
            }
        };
        Ok(state)
    }

    pub fn update(&mut self, data: &[u8]) {
        hmac_dispatch!(self, mac => Mac::update(mac, data))
    }

    pub fn finish(self) -> Vec<u8> {
        hmac_dispatch!(self, mac => Mac::finalize(mac).into_bytes().to_vec())
    }

    /// Constant-time comparison against an expected tag of the full length
    pub fn verify(self, tag: &[u8]) -> bool {
        hmac_dispatch!(self, mac => Mac::verify_slice(mac, tag).is_ok())
    }
}

/// One-shot HMAC-SHA256 (used for blob integrity)
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> TokenResult<Vec<u8>> {
    let mut mac = HmacState::new(DigestAlgorithm::Sha256, key)?;
    mac.update(data);
    Ok(mac.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            hex::encode(digest(DigestAlgorithm::Sha256, b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hex::encode(digest(DigestAlgorithm::Md5, b"abc")),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            hex::encode(digest(DigestAlgorithm::Sha1, b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(digest(DigestAlgorithm::Sha512, b"").len(), 64);
    }

    #[test]
    fn test_incremental_digest() {
        let mut state = DigestState::new(DigestAlgorithm::Sha384);
        state.update(b"hello ");
        state.update(b"world");
        assert_eq!(state.finish(), digest(DigestAlgorithm::Sha384, b"hello world"));
    }

    #[test]
    fn test_hmac_verify() {
        let mut mac = HmacState::new(DigestAlgorithm::Sha256, b"key").unwrap();
        mac.update(b"The quick brown fox jumps over the lazy dog");
        let tag = mac.finish();
        assert_eq!(
            hex::encode(&tag),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );

        let mut check = HmacState::new(DigestAlgorithm::Sha256, b"key").unwrap();
        check.update(b"The quick brown fox jumps over the lazy dog");
        assert!(check.verify(&tag));

        let mut tampered = tag.clone();
        tampered[0] ^= 1;
        let mut check = HmacState::new(DigestAlgorithm::Sha256, b"key").unwrap();
        check.update(b"The quick brown fox jumps over the lazy dog");
        assert!(!check.verify(&tampered));
    }
}
