//! Objects — attribute-keyed token items (keys, certificates, data)
//!
//! An [`Object`] is a bag of PKCS#11 attributes plus the process-unique
//! handle its pool assigned on insert. Blobs persisted by a token pool are
//! the serialized attribute set, hex-encoded inside JSON.

pub mod policy;

use crate::error::{TokenError, TokenResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use policy::ObjectPolicy;

/// Process-unique object handle (0 is never assigned)
pub type ObjectHandle = u64;
/// PKCS#11 attribute type (`CKA_*`)
pub type AttributeType = u64;
/// PKCS#11 object class (`CKO_*`)
pub type ObjectClass = u64;
/// PKCS#11 key type (`CKK_*`)
pub type KeyType = u64;

pub const INVALID_HANDLE: ObjectHandle = 0;

pub const CKA_CLASS: AttributeType = 0x0000;
pub const CKA_TOKEN: AttributeType = 0x0001;
pub const CKA_PRIVATE: AttributeType = 0x0002;
pub const CKA_LABEL: AttributeType = 0x0003;
pub const CKA_APPLICATION: AttributeType = 0x0010;
pub const CKA_VALUE: AttributeType = 0x0011;
pub const CKA_CERTIFICATE_TYPE: AttributeType = 0x0080;
pub const CKA_KEY_TYPE: AttributeType = 0x0100;
pub const CKA_SUBJECT: AttributeType = 0x0101;
pub const CKA_ID: AttributeType = 0x0102;
pub const CKA_SENSITIVE: AttributeType = 0x0103;
pub const CKA_ENCRYPT: AttributeType = 0x0104;
pub const CKA_DECRYPT: AttributeType = 0x0105;
pub const CKA_WRAP: AttributeType = 0x0106;
pub const CKA_UNWRAP: AttributeType = 0x0107;
pub const CKA_SIGN: AttributeType = 0x0108;
pub const CKA_VERIFY: AttributeType = 0x010A;
pub const CKA_DERIVE: AttributeType = 0x010C;
pub const CKA_MODULUS: AttributeType = 0x0120;
pub const CKA_MODULUS_BITS: AttributeType = 0x0121;
pub const CKA_PUBLIC_EXPONENT: AttributeType = 0x0122;
pub const CKA_PRIVATE_EXPONENT: AttributeType = 0x0123;
pub const CKA_PRIME_1: AttributeType = 0x0124;
pub const CKA_PRIME_2: AttributeType = 0x0125;
pub const CKA_EXPONENT_1: AttributeType = 0x0126;
pub const CKA_EXPONENT_2: AttributeType = 0x0127;
pub const CKA_COEFFICIENT: AttributeType = 0x0128;
pub const CKA_VALUE_LEN: AttributeType = 0x0161;
pub const CKA_EXTRACTABLE: AttributeType = 0x0162;
pub const CKA_LOCAL: AttributeType = 0x0163;
pub const CKA_NEVER_EXTRACTABLE: AttributeType = 0x0164;
pub const CKA_ALWAYS_SENSITIVE: AttributeType = 0x0165;
pub const CKA_KEY_GEN_MECHANISM: AttributeType = 0x0166;
pub const CKA_MODIFIABLE: AttributeType = 0x0170;
pub const CKA_EC_PARAMS: AttributeType = 0x0180;
pub const CKA_EC_POINT: AttributeType = 0x0181;

/// Vendor range: never enumerable through attribute queries
pub const CKA_VENDOR_DEFINED: AttributeType = 0x8000_0000;
/// TPM-opaque wrapped private key
pub const CKA_TPM_KEY_BLOB: AttributeType = CKA_VENDOR_DEFINED | 0x4B42;
/// Usage authorization for the wrapped key
pub const CKA_TPM_AUTH_DATA: AttributeType = CKA_VENDOR_DEFINED | 0x4144;
/// Key was imported from a legacy token and hangs off the legacy root
pub const CKA_LEGACY_KEY: AttributeType = CKA_VENDOR_DEFINED | 0x4C47;

pub const CKO_DATA: ObjectClass = 0;
pub const CKO_CERTIFICATE: ObjectClass = 1;
pub const CKO_PUBLIC_KEY: ObjectClass = 2;
pub const CKO_PRIVATE_KEY: ObjectClass = 3;
pub const CKO_SECRET_KEY: ObjectClass = 4;

pub const CKK_RSA: KeyType = 0x00;
pub const CKK_EC: KeyType = 0x03;
pub const CKK_GENERIC_SECRET: KeyType = 0x10;
pub const CKK_DES: KeyType = 0x13;
pub const CKK_DES3: KeyType = 0x15;
pub const CKK_AES: KeyType = 0x1F;

/// A single attribute in a caller-supplied template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: AttributeType,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn bytes(kind: AttributeType, value: impl Into<Vec<u8>>) -> Self {
        Self { kind, value: value.into() }
    }

    pub fn bool(kind: AttributeType, value: bool) -> Self {
        Self { kind, value: vec![value as u8] }
    }

    pub fn ulong(kind: AttributeType, value: u64) -> Self {
        Self { kind, value: value.to_le_bytes().to_vec() }
    }
}

/// An attribute-keyed record tracked by an object pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Object {
    handle: ObjectHandle,
    attributes: BTreeMap<AttributeType, Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct ObjectBlob {
    attributes: BTreeMap<AttributeType, String>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an object from a template
    pub fn from_template(template: &[Attribute]) -> Self {
        let mut object = Self::new();
        for attr in template {
            object.set_bytes(attr.kind, attr.value.clone());
        }
        object
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub(crate) fn set_handle(&mut self, handle: ObjectHandle) {
        self.handle = handle;
    }

    pub fn has(&self, kind: AttributeType) -> bool {
        self.attributes.contains_key(&kind)
    }

    pub fn get_bytes(&self, kind: AttributeType) -> Option<&[u8]> {
        self.attributes.get(&kind).map(|v| v.as_slice())
    }

    pub fn get_bool(&self, kind: AttributeType, default: bool) -> bool {
        match self.attributes.get(&kind) {
            Some(v) if !v.is_empty() => v[0] != 0,
            _ => default,
        }
    }

    pub fn get_ulong(&self, kind: AttributeType) -> Option<u64> {
        let v = self.attributes.get(&kind)?;
        match v.len() {
            8 => Some(u64::from_le_bytes(v[..8].try_into().ok()?)),
            4 => Some(u32::from_le_bytes(v[..4].try_into().ok()?) as u64),
            1 => Some(v[0] as u64),
            _ => None,
        }
    }

    pub fn set_bytes(&mut self, kind: AttributeType, value: impl Into<Vec<u8>>) {
        self.attributes.insert(kind, value.into());
    }

    pub fn set_bool(&mut self, kind: AttributeType, value: bool) {
        self.attributes.insert(kind, vec![value as u8]);
    }

    pub fn set_ulong(&mut self, kind: AttributeType, value: u64) {
        self.attributes.insert(kind, value.to_le_bytes().to_vec());
    }

    /// Set only when the caller did not supply a value
    pub fn default_bool(&mut self, kind: AttributeType, value: bool) {
        if !self.has(kind) {
            self.set_bool(kind, value);
        }
    }

    pub fn remove(&mut self, kind: AttributeType) -> Option<Vec<u8>> {
        self.attributes.remove(&kind)
    }

    pub fn class(&self) -> Option<ObjectClass> {
        self.get_ulong(CKA_CLASS)
    }

    pub fn key_type(&self) -> Option<KeyType> {
        self.get_ulong(CKA_KEY_TYPE)
    }

    pub fn is_token_object(&self) -> bool {
        self.get_bool(CKA_TOKEN, false)
    }

    pub fn is_private(&self) -> bool {
        self.get_bool(CKA_PRIVATE, false)
    }

    /// Private key whose private half lives inside the TPM
    pub fn is_tpm_backed(&self) -> bool {
        self.has(CKA_TPM_KEY_BLOB)
    }

    /// Attribute types present (hidden vendor attributes included)
    pub fn attribute_types(&self) -> impl Iterator<Item = AttributeType> + '_ {
        self.attributes.keys().copied()
    }

    /// True when every attribute in `template` is present with the same value
    pub fn matches(&self, template: &Object) -> bool {
        template
            .attributes
            .iter()
            .all(|(kind, value)| self.attributes.get(kind) == Some(value))
    }

    /// Total serialized attribute size (used for `get_object_size`)
    pub fn size(&self) -> usize {
        self.attributes.values().map(|v| v.len() + 16).sum()
    }

    /// Serialize the attribute set for storage
    pub fn to_blob(&self) -> TokenResult<Vec<u8>> {
        let blob = ObjectBlob {
            attributes: self
                .attributes
                .iter()
                .map(|(k, v)| (*k, hex::encode(v)))
                .collect(),
        };
        Ok(serde_json::to_vec(&blob)?)
    }

    /// Parse a stored attribute set (the handle is assigned by the pool)
    pub fn from_blob(bytes: &[u8]) -> TokenResult<Self> {
        let blob: ObjectBlob = serde_json::from_slice(bytes)
            .map_err(|e| TokenError::GeneralError(format!("Corrupt object blob: {}", e)))?;
        let mut attributes = BTreeMap::new();
        for (kind, value) in blob.attributes {
            attributes.insert(kind, hex::decode(value)?);
        }
        Ok(Self { handle: INVALID_HANDLE, attributes })
    }
}
