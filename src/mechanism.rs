//! Mechanisms — the supported set, their capability table and digest bindings

use crate::config::ServiceConfig;
use crate::object::{KeyType, CKK_AES, CKK_DES, CKK_DES3, CKK_EC, CKK_GENERIC_SECRET, CKK_RSA};
use serde::{Deserialize, Serialize};

/// PKCS#11 mechanism type (`CKM_*`)
pub type MechanismType = u64;

pub const CKM_RSA_PKCS_KEY_PAIR_GEN: MechanismType = 0x0000;
pub const CKM_RSA_PKCS: MechanismType = 0x0001;
pub const CKM_MD5_RSA_PKCS: MechanismType = 0x0005;
pub const CKM_SHA1_RSA_PKCS: MechanismType = 0x0006;
pub const CKM_SHA256_RSA_PKCS: MechanismType = 0x0040;
pub const CKM_SHA384_RSA_PKCS: MechanismType = 0x0041;
pub const CKM_SHA512_RSA_PKCS: MechanismType = 0x0042;
pub const CKM_DES_KEY_GEN: MechanismType = 0x0120;
pub const CKM_DES_ECB: MechanismType = 0x0121;
pub const CKM_DES_CBC: MechanismType = 0x0122;
pub const CKM_DES_CBC_PAD: MechanismType = 0x0125;
pub const CKM_DES3_KEY_GEN: MechanismType = 0x0131;
pub const CKM_DES3_ECB: MechanismType = 0x0132;
pub const CKM_DES3_CBC: MechanismType = 0x0133;
pub const CKM_DES3_CBC_PAD: MechanismType = 0x0136;
pub const CKM_MD5: MechanismType = 0x0210;
pub const CKM_MD5_HMAC: MechanismType = 0x0211;
pub const CKM_SHA_1: MechanismType = 0x0220;
pub const CKM_SHA_1_HMAC: MechanismType = 0x0221;
pub const CKM_SHA256: MechanismType = 0x0250;
pub const CKM_SHA256_HMAC: MechanismType = 0x0251;
pub const CKM_SHA384: MechanismType = 0x0260;
pub const CKM_SHA384_HMAC: MechanismType = 0x0261;
pub const CKM_SHA512: MechanismType = 0x0270;
pub const CKM_SHA512_HMAC: MechanismType = 0x0271;
pub const CKM_GENERIC_SECRET_KEY_GEN: MechanismType = 0x0350;
pub const CKM_EC_KEY_PAIR_GEN: MechanismType = 0x1040;
pub const CKM_ECDSA: MechanismType = 0x1041;
pub const CKM_ECDSA_SHA1: MechanismType = 0x1042;
pub const CKM_ECDSA_SHA256: MechanismType = 0x1044;
pub const CKM_AES_KEY_GEN: MechanismType = 0x1080;
pub const CKM_AES_ECB: MechanismType = 0x1081;
pub const CKM_AES_CBC: MechanismType = 0x1082;
pub const CKM_AES_CBC_PAD: MechanismType = 0x1085;

pub const CKF_HW: u64 = 0x0001;
pub const CKF_ENCRYPT: u64 = 0x0100;
pub const CKF_DECRYPT: u64 = 0x0200;
pub const CKF_DIGEST: u64 = 0x0400;
pub const CKF_SIGN: u64 = 0x0800;
pub const CKF_VERIFY: u64 = 0x2000;
pub const CKF_GENERATE: u64 = 0x8000;
pub const CKF_GENERATE_KEY_PAIR: u64 = 0x0001_0000;
pub const CKF_WRAP: u64 = 0x0002_0000;
pub const CKF_UNWRAP: u64 = 0x0004_0000;

/// Capability entry for one mechanism (key sizes in bits for RSA/EC, bytes otherwise)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MechanismInfo {
    pub min_key_size: u64,
    pub max_key_size: u64,
    pub flags: u64,
}

/// Digest algorithms that can be bound to HMAC / RSA / ECDSA mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// DER prefix of the PKCS#1 v1.5 DigestInfo for this algorithm
    pub fn digest_info_prefix(&self) -> &'static [u8] {
        match self {
            DigestAlgorithm::Md5 => &[
                0x30, 0x20, 0x30, 0x0c, 0x06, 0x08, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x02,
                0x05, 0x05, 0x00, 0x04, 0x10,
            ],
            DigestAlgorithm::Sha1 => &[
                0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00,
                0x04, 0x14,
            ],
            DigestAlgorithm::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04,
                0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
            ],
            DigestAlgorithm::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04,
                0x02, 0x02, 0x05, 0x00, 0x04, 0x30,
            ],
            DigestAlgorithm::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04,
                0x02, 0x03, 0x05, 0x00, 0x04, 0x40,
            ],
        }
    }

    /// DigestInfo structure wrapping `digest`
    pub fn digest_info(&self, digest: &[u8]) -> Vec<u8> {
        let prefix = self.digest_info_prefix();
        let mut out = Vec::with_capacity(prefix.len() + digest.len());
        out.extend_from_slice(prefix);
        out.extend_from_slice(digest);
        out
    }
}

/// Block cipher algorithm family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Des,
    Des3,
    Aes,
}

impl CipherAlgorithm {
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes => 16,
            CipherAlgorithm::Des | CipherAlgorithm::Des3 => 8,
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            CipherAlgorithm::Des => CKK_DES,
            CipherAlgorithm::Des3 => CKK_DES3,
            CipherAlgorithm::Aes => CKK_AES,
        }
    }
}

/// Chaining mode of a block cipher mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Ecb,
    Cbc,
    CbcPad,
}

/// How a mechanism is executed by an operation context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismKind {
    Cipher(CipherAlgorithm, CipherMode),
    Digest(DigestAlgorithm),
    Hmac(DigestAlgorithm),
    /// Raw PKCS#1 v1.5 (caller supplies DigestInfo or plaintext)
    RsaPkcs,
    RsaWithDigest(DigestAlgorithm),
    Ecdsa(Option<DigestAlgorithm>),
    KeyGen(KeyType),
    KeyPairGen(KeyType),
}

/// Classify a mechanism; `None` means unsupported
pub fn classify(mechanism: MechanismType) -> Option<MechanismKind> {
    use CipherAlgorithm::*;
    use CipherMode::*;
    use DigestAlgorithm::*;
    let kind = match mechanism {
        CKM_DES_ECB => MechanismKind::Cipher(Des, Ecb),
        CKM_DES_CBC => MechanismKind::Cipher(Des, Cbc),
        CKM_DES_CBC_PAD => MechanismKind::Cipher(Des, CbcPad),
        CKM_DES3_ECB => MechanismKind::Cipher(Des3, Ecb),
        CKM_DES3_CBC => MechanismKind::Cipher(Des3, Cbc),
        CKM_DES3_CBC_PAD => MechanismKind::Cipher(Des3, CbcPad),
        CKM_AES_ECB => MechanismKind::Cipher(Aes, Ecb),
        CKM_AES_CBC => MechanismKind::Cipher(Aes, Cbc),
        CKM_AES_CBC_PAD => MechanismKind::Cipher(Aes, CbcPad),
        CKM_MD5 => MechanismKind::Digest(Md5),
        CKM_SHA_1 => MechanismKind::Digest(Sha1),
        CKM_SHA256 => MechanismKind::Digest(Sha256),
        CKM_SHA384 => MechanismKind::Digest(Sha384),
        CKM_SHA512 => MechanismKind::Digest(Sha512),
        CKM_MD5_HMAC => MechanismKind::Hmac(Md5),
        CKM_SHA_1_HMAC => MechanismKind::Hmac(Sha1),
        CKM_SHA256_HMAC => MechanismKind::Hmac(Sha256),
        CKM_SHA384_HMAC => MechanismKind::Hmac(Sha384),
        CKM_SHA512_HMAC => MechanismKind::Hmac(Sha512),
        CKM_RSA_PKCS => MechanismKind::RsaPkcs,
        CKM_MD5_RSA_PKCS => MechanismKind::RsaWithDigest(Md5),
        CKM_SHA1_RSA_PKCS => MechanismKind::RsaWithDigest(Sha1),
        CKM_SHA256_RSA_PKCS => MechanismKind::RsaWithDigest(Sha256),
        CKM_SHA384_RSA_PKCS => MechanismKind::RsaWithDigest(Sha384),
        CKM_SHA512_RSA_PKCS => MechanismKind::RsaWithDigest(Sha512),
        CKM_ECDSA => MechanismKind::Ecdsa(None),
        CKM_ECDSA_SHA1 => MechanismKind::Ecdsa(Some(Sha1)),
        CKM_ECDSA_SHA256 => MechanismKind::Ecdsa(Some(Sha256)),
        CKM_DES_KEY_GEN => MechanismKind::KeyGen(CKK_DES),
        CKM_DES3_KEY_GEN => MechanismKind::KeyGen(CKK_DES3),
        CKM_AES_KEY_GEN => MechanismKind::KeyGen(CKK_AES),
        CKM_GENERIC_SECRET_KEY_GEN => MechanismKind::KeyGen(CKK_GENERIC_SECRET),
        CKM_RSA_PKCS_KEY_PAIR_GEN => MechanismKind::KeyPairGen(CKK_RSA),
        CKM_EC_KEY_PAIR_GEN => MechanismKind::KeyPairGen(CKK_EC),
        _ => return None,
    };
    Some(kind)
}

/// Capability table advertised for a slot
pub fn mechanism_table(config: &ServiceConfig, tpm_available: bool) -> Vec<(MechanismType, MechanismInfo)> {
    let hw = if tpm_available { CKF_HW } else { 0 };
    let (rsa_min, _) = config.rsa_bounds(tpm_available);
    let (_, rsa_max) = config.rsa_bounds(false);
    let rsa = |flags: u64| MechanismInfo { min_key_size: rsa_min as u64, max_key_size: rsa_max as u64, flags: flags | hw };
    let ec = |flags: u64| MechanismInfo { min_key_size: 256, max_key_size: 256, flags: flags | hw };
    let sym = |min: u64, max: u64, flags: u64| MechanismInfo { min_key_size: min, max_key_size: max, flags };
    let digest = MechanismInfo { min_key_size: 0, max_key_size: 0, flags: CKF_DIGEST };
    let hmac = sym(1, 512, CKF_SIGN | CKF_VERIFY);
    let cipher = CKF_ENCRYPT | CKF_DECRYPT | CKF_WRAP | CKF_UNWRAP;

    vec![
        (CKM_RSA_PKCS_KEY_PAIR_GEN, rsa(CKF_GENERATE_KEY_PAIR)),
        (CKM_RSA_PKCS, rsa(CKF_ENCRYPT | CKF_DECRYPT | CKF_SIGN | CKF_VERIFY | CKF_WRAP | CKF_UNWRAP)),
        (CKM_MD5_RSA_PKCS, rsa(CKF_SIGN | CKF_VERIFY)),
        (CKM_SHA1_RSA_PKCS, rsa(CKF_SIGN | CKF_VERIFY)),
        (CKM_SHA256_RSA_PKCS, rsa(CKF_SIGN | CKF_VERIFY)),
        (CKM_SHA384_RSA_PKCS, rsa(CKF_SIGN | CKF_VERIFY)),
        (CKM_SHA512_RSA_PKCS, rsa(CKF_SIGN | CKF_VERIFY)),
        (CKM_EC_KEY_PAIR_GEN, ec(CKF_GENERATE_KEY_PAIR)),
        (CKM_ECDSA, ec(CKF_SIGN | CKF_VERIFY)),
        (CKM_ECDSA_SHA1, ec(CKF_SIGN | CKF_VERIFY)),
        (CKM_ECDSA_SHA256, ec(CKF_SIGN | CKF_VERIFY)),
        (CKM_DES_KEY_GEN, sym(8, 8, CKF_GENERATE)),
        (CKM_DES_ECB, sym(8, 8, cipher)),
        (CKM_DES_CBC, sym(8, 8, cipher)),
        (CKM_DES_CBC_PAD, sym(8, 8, cipher)),
        (CKM_DES3_KEY_GEN, sym(24, 24, CKF_GENERATE)),
        (CKM_DES3_ECB, sym(16, 24, cipher)),
        (CKM_DES3_CBC, sym(16, 24, cipher)),
        (CKM_DES3_CBC_PAD, sym(16, 24, cipher)),
        (CKM_AES_KEY_GEN, sym(16, 32, CKF_GENERATE)),
        (CKM_AES_ECB, sym(16, 32, cipher)),
        (CKM_AES_CBC, sym(16, 32, cipher)),
        (CKM_AES_CBC_PAD, sym(16, 32, cipher)),
        (CKM_GENERIC_SECRET_KEY_GEN, sym(1, 512, CKF_GENERATE)),
        (CKM_MD5, digest),
        (CKM_SHA_1, digest),
        (CKM_SHA256, digest),
        (CKM_SHA384, digest),
        (CKM_SHA512, digest),
        (CKM_MD5_HMAC, hmac),
        (CKM_SHA_1_HMAC, hmac),
        (CKM_SHA256_HMAC, hmac),
        (CKM_SHA384_HMAC, hmac),
        (CKM_SHA512_HMAC, hmac),
    ]
}

/// Look up one entry of the capability table
pub fn mechanism_info(
    config: &ServiceConfig,
    tpm_available: bool,
    mechanism: MechanismType,
) -> Option<MechanismInfo> {
    mechanism_table(config, tpm_available)
        .into_iter()
        .find(|(m, _)| *m == mechanism)
        .map(|(_, info)| info)
}

/// Key types an operation may use with a given mechanism kind
pub fn key_type_for(kind: &MechanismKind) -> Option<KeyType> {
    match kind {
        MechanismKind::Cipher(alg, _) => Some(alg.key_type()),
        MechanismKind::Hmac(_) => Some(CKK_GENERIC_SECRET),
        MechanismKind::RsaPkcs | MechanismKind::RsaWithDigest(_) => Some(CKK_RSA),
        MechanismKind::Ecdsa(_) => Some(CKK_EC),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(CKM_AES_CBC_PAD),
            Some(MechanismKind::Cipher(CipherAlgorithm::Aes, CipherMode::CbcPad))
        );
        assert_eq!(
            classify(CKM_SHA256_RSA_PKCS),
            Some(MechanismKind::RsaWithDigest(DigestAlgorithm::Sha256))
        );
        assert_eq!(classify(0xFFFF), None);
    }

    #[test]
    fn test_digest_info_lengths() {
        for alg in [
            DigestAlgorithm::Md5,
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ] {
            let prefix = alg.digest_info_prefix();
            // Outer SEQUENCE length covers everything after the first two bytes
            assert_eq!(prefix[1] as usize, prefix.len() - 2 + alg.output_len());
            assert_eq!(*prefix.last().unwrap() as usize, alg.output_len());
        }
    }

    #[test]
    fn test_table_uses_config_bounds() {
        let config = ServiceConfig::default();
        let info = mechanism_info(&config, true, CKM_RSA_PKCS).unwrap();
        assert_eq!(info.max_key_size, 8192);
        assert_ne!(info.flags & CKF_HW, 0);

        let soft = mechanism_info(&config, false, CKM_AES_CBC).unwrap();
        assert_eq!((soft.min_key_size, soft.max_key_size), (16, 32));
        assert!(mechanism_info(&config, false, 0xDEAD).is_none());
    }
}
