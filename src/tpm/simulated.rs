//! Simulated TPM — software device with TPM semantics
//!
//! Keys never leave the device in the clear: every blob handed out is a
//! JSON record sealed under the storage root (or under a parent key), and
//! carries the SHA-1 usage-auth digest checked on load. The storage root
//! secret can be persisted so blobs survive restarts.

use super::{EccCurve, PublicKeyInfo, SlotId, TpmKey, TpmKeyHandle, TpmUtility, TpmVersion};
use crate::crypto::{open_blob, seal_blob};
use crate::error::{TokenError, TokenResult};
use crate::mechanism::{MechanismType, CKM_ECDSA, CKM_RSA_PKCS};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use zeroize::Zeroizing;

const SRK_SEED_FILE: &str = "srk.seed";
const FIRST_HANDLE: TpmKeyHandle = 0x8000_0001;
const DEFAULT_EXPONENT: u32 = 65537;

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum BlobPayload {
    Rsa {
        public_exponent: String,
        prime_1: String,
        prime_2: String,
    },
    Ec {
        scalar: String,
    },
    Data {
        value: String,
    },
}

#[derive(Serialize, Deserialize)]
struct BlobRecord {
    auth_digest: String,
    payload: BlobPayload,
}

enum KeyMaterial {
    Rsa(Box<RsaPrivateKey>),
    Ec(Box<SigningKey>),
}

struct LoadedKey {
    slot: SlotId,
    material: KeyMaterial,
    /// Secret protecting blobs of keys created under this one
    child_secret: Zeroizing<Vec<u8>>,
}

/// Software TPM emulating either generation
pub struct SimulatedTpm {
    version: TpmVersion,
    state_dir: Option<PathBuf>,
    srk: Option<Zeroizing<Vec<u8>>>,
    rng: StdRng,
    keys: HashMap<TpmKeyHandle, LoadedKey>,
    next_handle: TpmKeyHandle,
}

impl SimulatedTpm {
    pub fn new(version: TpmVersion, state_dir: Option<PathBuf>) -> Self {
        Self {
            version,
            state_dir,
            srk: None,
            rng: StdRng::from_entropy(),
            keys: HashMap::new(),
            next_handle: FIRST_HANDLE,
        }
    }

    /// Number of keys currently loaded (all slots)
    pub fn loaded_key_count(&self) -> usize {
        self.keys.len()
    }

    /// Create an RSA key wrapped under an already-loaded parent instead of
    /// the storage root. Older token formats kept their keys this way.
    pub fn generate_rsa_key_with_parent(
        &mut self,
        slot: SlotId,
        parent: TpmKeyHandle,
        modulus_bits: usize,
        auth_data: &[u8],
    ) -> TokenResult<TpmKey> {
        let secret = self
            .keys
            .get(&parent)
            .map(|k| k.child_secret.clone())
            .ok_or_else(|| TokenError::tpm("parent key not loaded"))?;
        let key = RsaPrivateKey::new_with_exp(&mut self.rng, modulus_bits, &BigUint::from(DEFAULT_EXPONENT))
            .map_err(|e| TokenError::tpm(&format!("RSA generation failed: {}", e)))?;
        self.store_key(slot, &secret, KeyMaterial::Rsa(Box::new(key)), auth_data)
    }

    fn srk(&self) -> TokenResult<Zeroizing<Vec<u8>>> {
        self.srk.clone().ok_or_else(|| TokenError::tpm("device not initialized"))
    }

    fn load_or_create_srk(&mut self) -> TokenResult<Zeroizing<Vec<u8>>> {
        let Some(dir) = self.state_dir.clone() else {
            return Ok(Zeroizing::new(self.random_vec(32)));
        };
        let path = dir.join(SRK_SEED_FILE);
        if path.exists() {
            let encoded = Zeroizing::new(std::fs::read_to_string(&path)?);
            let seed = hex::decode(encoded.trim())?;
            if seed.len() != 32 {
                return Err(TokenError::tpm("corrupt storage root seed"));
            }
            return Ok(Zeroizing::new(seed));
        }
        std::fs::create_dir_all(&dir)?;
        let seed = Zeroizing::new(self.random_vec(32));
        std::fs::write(&path, hex::encode(seed.as_slice()))?;
        log::info!("Created simulated TPM storage root at {}", path.display());
        Ok(seed)
    }

    fn random_vec(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.rng.fill_bytes(&mut buf);
        buf
    }

    fn auth_digest(auth_data: &[u8]) -> String {
        hex::encode(Sha1::digest(auth_data))
    }

    fn seal_record(secret: &[u8], record: &BlobRecord) -> TokenResult<Vec<u8>> {
        let json = Zeroizing::new(serde_json::to_vec(record).map_err(|_| TokenError::tpm("blob encoding failed"))?);
        seal_blob(secret, &json).map_err(|_| TokenError::tpm("blob sealing failed"))
    }

    fn open_record(secret: &[u8], blob: &[u8]) -> TokenResult<BlobRecord> {
        let json = open_blob(secret, blob).map_err(|_| TokenError::tpm("blob rejected"))?;
        serde_json::from_slice(&json).map_err(|_| TokenError::tpm("malformed blob"))
    }

    fn check_auth(record: &BlobRecord, auth_data: &[u8]) -> TokenResult<()> {
        if record.auth_digest != Self::auth_digest(auth_data) {
            return Err(TokenError::tpm("authorization failed"));
        }
        Ok(())
    }

    fn payload_of(material: &KeyMaterial) -> BlobPayload {
        match material {
            KeyMaterial::Rsa(key) => {
                let primes = key.primes();
                BlobPayload::Rsa {
                    public_exponent: hex::encode(key.e().to_bytes_be()),
                    prime_1: hex::encode(primes[0].to_bytes_be()),
                    prime_2: hex::encode(primes[1].to_bytes_be()),
                }
            }
            KeyMaterial::Ec(key) => BlobPayload::Ec {
                scalar: hex::encode(key.to_bytes()),
            },
        }
    }

    fn material_of(payload: &BlobPayload) -> TokenResult<KeyMaterial> {
        match payload {
            BlobPayload::Rsa {
                public_exponent,
                prime_1,
                prime_2,
            } => {
                let e = BigUint::from_bytes_be(&hex::decode(public_exponent)?);
                let p = BigUint::from_bytes_be(&hex::decode(prime_1)?);
                let q = BigUint::from_bytes_be(&hex::decode(prime_2)?);
                let key = RsaPrivateKey::from_p_q(p, q, e).map_err(|_| TokenError::tpm("invalid RSA key blob"))?;
                Ok(KeyMaterial::Rsa(Box::new(key)))
            }
            BlobPayload::Ec { scalar } => {
                let bytes = Zeroizing::new(hex::decode(scalar)?);
                let key = SigningKey::from_slice(&bytes).map_err(|_| TokenError::tpm("invalid EC key blob"))?;
                Ok(KeyMaterial::Ec(Box::new(key)))
            }
            BlobPayload::Data { .. } => Err(TokenError::tpm("blob does not hold a key")),
        }
    }

    fn child_secret_of(material: &KeyMaterial) -> Zeroizing<Vec<u8>> {
        let mut h = Sha256::new();
        match material {
            KeyMaterial::Rsa(key) => h.update(key.d().to_bytes_be()),
            KeyMaterial::Ec(key) => h.update(key.to_bytes()),
        }
        h.update(b"tpmtok-sim-parent-v1");
        Zeroizing::new(h.finalize().to_vec())
    }

    fn insert_loaded(&mut self, slot: SlotId, material: KeyMaterial) -> TpmKeyHandle {
        while self.keys.contains_key(&self.next_handle) {
            self.next_handle = self.next_handle.wrapping_add(1).max(FIRST_HANDLE);
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(FIRST_HANDLE);
        let child_secret = Self::child_secret_of(&material);
        self.keys.insert(
            handle,
            LoadedKey {
                slot,
                material,
                child_secret,
            },
        );
        handle
    }

    fn store_key(
        &mut self,
        slot: SlotId,
        wrapping_secret: &[u8],
        material: KeyMaterial,
        auth_data: &[u8],
    ) -> TokenResult<TpmKey> {
        let record = BlobRecord {
            auth_digest: Self::auth_digest(auth_data),
            payload: Self::payload_of(&material),
        };
        let blob = Self::seal_record(wrapping_secret, &record)?;
        let handle = self.insert_loaded(slot, material);
        Ok(TpmKey { blob, handle })
    }

    fn load_with_secret(
        &mut self,
        slot: SlotId,
        secret: &[u8],
        key_blob: &[u8],
        auth_data: &[u8],
    ) -> TokenResult<TpmKeyHandle> {
        let record = Self::open_record(secret, key_blob)?;
        Self::check_auth(&record, auth_data)?;
        let material = Self::material_of(&record.payload)?;
        Ok(self.insert_loaded(slot, material))
    }

    fn rsa_key(&self, handle: TpmKeyHandle) -> TokenResult<&RsaPrivateKey> {
        match self.keys.get(&handle).map(|k| &k.material) {
            Some(KeyMaterial::Rsa(key)) => Ok(&**key),
            Some(_) => Err(TokenError::tpm("not an RSA key")),
            None => Err(TokenError::tpm("invalid key handle")),
        }
    }
}

impl TpmUtility for SimulatedTpm {
    fn init(&mut self) -> TokenResult<()> {
        if self.srk.is_none() {
            self.srk = Some(self.load_or_create_srk()?);
            log::debug!("Simulated TPM ready ({:?})", self.version);
        }
        Ok(())
    }

    fn is_tpm_available(&self) -> bool {
        true
    }

    fn version(&self) -> Option<TpmVersion> {
        Some(self.version)
    }

    fn generate_random(&mut self, num_bytes: usize) -> TokenResult<Vec<u8>> {
        Ok(self.random_vec(num_bytes))
    }

    fn stir_random(&mut self, entropy: &[u8]) -> TokenResult<()> {
        let mut h = Sha256::new();
        h.update(entropy);
        h.update(self.random_vec(32));
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&h.finalize());
        self.rng = StdRng::from_seed(seed);
        Ok(())
    }

    fn generate_rsa_key(
        &mut self,
        slot: SlotId,
        modulus_bits: usize,
        public_exponent: &[u8],
        auth_data: &[u8],
    ) -> TokenResult<TpmKey> {
        let srk = self.srk()?;
        let exponent = if public_exponent.is_empty() {
            BigUint::from(DEFAULT_EXPONENT)
        } else {
            BigUint::from_bytes_be(public_exponent)
        };
        let key = RsaPrivateKey::new_with_exp(&mut self.rng, modulus_bits, &exponent)
            .map_err(|e| TokenError::tpm(&format!("RSA generation failed: {}", e)))?;
        log::debug!("Generated {}-bit RSA key for slot {}", modulus_bits, slot);
        self.store_key(slot, &srk, KeyMaterial::Rsa(Box::new(key)), auth_data)
    }

    fn generate_ecc_key(&mut self, slot: SlotId, curve: EccCurve, auth_data: &[u8]) -> TokenResult<TpmKey> {
        let srk = self.srk()?;
        let key = match curve {
            EccCurve::NistP256 => SigningKey::random(&mut self.rng),
        };
        self.store_key(slot, &srk, KeyMaterial::Ec(Box::new(key)), auth_data)
    }

    fn get_public_key(&mut self, handle: TpmKeyHandle) -> TokenResult<PublicKeyInfo> {
        let loaded = self.keys.get(&handle).ok_or_else(|| TokenError::tpm("invalid key handle"))?;
        let info = match &loaded.material {
            KeyMaterial::Rsa(key) => PublicKeyInfo::Rsa {
                modulus: key.n().to_bytes_be(),
                public_exponent: key.e().to_bytes_be(),
            },
            KeyMaterial::Ec(key) => PublicKeyInfo::Ec {
                point: key.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
            },
        };
        Ok(info)
    }

    fn wrap_rsa_key(
        &mut self,
        slot: SlotId,
        public_exponent: &[u8],
        modulus: &[u8],
        prime_factor: &[u8],
        auth_data: &[u8],
    ) -> TokenResult<TpmKey> {
        let srk = self.srk()?;
        let n = BigUint::from_bytes_be(modulus);
        let p = BigUint::from_bytes_be(prime_factor);
        let e = BigUint::from_bytes_be(public_exponent);
        if p <= BigUint::from(1u32) {
            return Err(TokenError::tpm("invalid prime factor"));
        }
        let q = &n / &p;
        if &p * &q != n {
            return Err(TokenError::tpm("prime does not divide modulus"));
        }
        let key = RsaPrivateKey::from_p_q(p, q, e).map_err(|_| TokenError::tpm("RSA key import failed"))?;
        self.store_key(slot, &srk, KeyMaterial::Rsa(Box::new(key)), auth_data)
    }

    fn load_key(&mut self, slot: SlotId, key_blob: &[u8], auth_data: &[u8]) -> TokenResult<TpmKeyHandle> {
        let srk = self.srk()?;
        self.load_with_secret(slot, &srk, key_blob, auth_data)
    }

    fn load_key_with_parent(
        &mut self,
        slot: SlotId,
        key_blob: &[u8],
        auth_data: &[u8],
        parent: TpmKeyHandle,
    ) -> TokenResult<TpmKeyHandle> {
        let secret = self
            .keys
            .get(&parent)
            .map(|k| k.child_secret.clone())
            .ok_or_else(|| TokenError::tpm("parent key not loaded"))?;
        self.load_with_secret(slot, &secret, key_blob, auth_data)
    }

    fn unload_keys_for_slot(&mut self, slot: SlotId) {
        let before = self.keys.len();
        self.keys.retain(|_, key| key.slot != slot);
        log::debug!("Unloaded {} keys for slot {}", before - self.keys.len(), slot);
    }

    fn bind(&mut self, handle: TpmKeyHandle, plaintext: &[u8]) -> TokenResult<Vec<u8>> {
        let public = self.rsa_key(handle)?.to_public_key();
        public
            .encrypt(&mut self.rng, Pkcs1v15Encrypt, plaintext)
            .map_err(|e| TokenError::tpm(&format!("bind failed: {}", e)))
    }

    fn unbind(&mut self, handle: TpmKeyHandle, ciphertext: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
        self.rsa_key(handle)?
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| TokenError::tpm("unbind failed"))
    }

    fn sign(
        &mut self,
        handle: TpmKeyHandle,
        mechanism: MechanismType,
        _parameter: &[u8],
        input: &[u8],
    ) -> TokenResult<Vec<u8>> {
        let loaded = self.keys.get(&handle).ok_or_else(|| TokenError::tpm("invalid key handle"))?;
        match (&loaded.material, mechanism) {
            (KeyMaterial::Rsa(key), CKM_RSA_PKCS) => key
                .sign(Pkcs1v15Sign::new_unprefixed(), input)
                .map_err(|e| TokenError::tpm(&format!("sign failed: {}", e))),
            (KeyMaterial::Ec(key), CKM_ECDSA) => {
                let signature: Signature = key
                    .sign_prehash(input)
                    .map_err(|_| TokenError::tpm("ECDSA sign failed"))?;
                Ok(signature.to_bytes().to_vec())
            }
            _ => Err(TokenError::MechanismInvalid),
        }
    }

    fn authenticate(
        &mut self,
        slot: SlotId,
        auth_data: &[u8],
        auth_key_blob: &[u8],
        encrypted_master_key: &[u8],
    ) -> TokenResult<Zeroizing<Vec<u8>>> {
        match self.version {
            TpmVersion::V1_2 => {
                let handle = self.load_key(slot, auth_key_blob, auth_data)?;
                let master = self.unbind(handle, encrypted_master_key);
                self.keys.remove(&handle);
                master
            }
            TpmVersion::V2_0 => self.unseal_data(slot, auth_data, encrypted_master_key),
        }
    }

    fn change_auth_data(
        &mut self,
        _slot: SlotId,
        old_auth_data: &[u8],
        new_auth_data: &[u8],
        old_blob: &[u8],
    ) -> TokenResult<Vec<u8>> {
        let srk = self.srk()?;
        let mut record = Self::open_record(&srk, old_blob)?;
        Self::check_auth(&record, old_auth_data)?;
        record.auth_digest = Self::auth_digest(new_auth_data);
        Self::seal_record(&srk, &record)
    }

    fn seal_data(&mut self, _slot: SlotId, auth_data: &[u8], data: &[u8]) -> TokenResult<Vec<u8>> {
        let srk = self.srk()?;
        let record = BlobRecord {
            auth_digest: Self::auth_digest(auth_data),
            payload: BlobPayload::Data {
                value: hex::encode(data),
            },
        };
        Self::seal_record(&srk, &record)
    }

    fn unseal_data(&mut self, _slot: SlotId, auth_data: &[u8], sealed: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
        let srk = self.srk()?;
        let record = Self::open_record(&srk, sealed)?;
        Self::check_auth(&record, auth_data)?;
        match record.payload {
            BlobPayload::Data { value } => Ok(Zeroizing::new(hex::decode(value)?)),
            _ => Err(TokenError::tpm("blob does not hold sealed data")),
        }
    }
}
