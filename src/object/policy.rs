//! Object policy — defaults, mandatory attributes and attribute access rules

use super::*;

/// Attributes holding private key material
const PRIVATE_KEY_COMPONENTS: [AttributeType; 6] = [
    CKA_PRIVATE_EXPONENT,
    CKA_PRIME_1,
    CKA_PRIME_2,
    CKA_EXPONENT_1,
    CKA_EXPONENT_2,
    CKA_COEFFICIENT,
];

/// Attributes fixed once an object exists
const READ_ONLY: [AttributeType; 13] = [
    CKA_CLASS,
    CKA_KEY_TYPE,
    CKA_TOKEN,
    CKA_PRIVATE,
    CKA_LOCAL,
    CKA_KEY_GEN_MECHANISM,
    CKA_MODULUS,
    CKA_MODULUS_BITS,
    CKA_PUBLIC_EXPONENT,
    CKA_VALUE_LEN,
    CKA_ALWAYS_SENSITIVE,
    CKA_NEVER_EXTRACTABLE,
    CKA_EC_PARAMS,
];

/// Stateless rules applied by sessions when objects are created, copied,
/// queried or modified
pub struct ObjectPolicy;

impl ObjectPolicy {
    /// Vendor attributes (TPM blob, auth data, legacy tag) are internal
    pub fn is_hidden(kind: AttributeType) -> bool {
        kind & CKA_VENDOR_DEFINED != 0
    }

    pub fn private_key_components() -> &'static [AttributeType] {
        &PRIVATE_KEY_COMPONENTS
    }

    /// Whether `kind` is secret material for an object of this class
    pub fn is_sensitive_attribute(class: ObjectClass, kind: AttributeType) -> bool {
        match class {
            CKO_PRIVATE_KEY => PRIVATE_KEY_COMPONENTS.contains(&kind) || kind == CKA_VALUE,
            CKO_SECRET_KEY => kind == CKA_VALUE,
            _ => false,
        }
    }

    /// Fill in defaults for attributes the caller left out
    pub fn apply_defaults(object: &mut Object) {
        let class = object.class().unwrap_or(CKO_DATA);
        object.default_bool(CKA_TOKEN, false);
        object.default_bool(CKA_MODIFIABLE, true);
        if !object.has(CKA_LABEL) {
            object.set_bytes(CKA_LABEL, Vec::new());
        }

        match class {
            CKO_SECRET_KEY => {
                object.default_bool(CKA_PRIVATE, true);
                Self::key_defaults(object);
                object.default_bool(CKA_SENSITIVE, false);
                object.default_bool(CKA_EXTRACTABLE, true);
                for usage in [CKA_ENCRYPT, CKA_DECRYPT, CKA_SIGN, CKA_VERIFY, CKA_WRAP, CKA_UNWRAP] {
                    object.default_bool(usage, true);
                }
            }
            CKO_PRIVATE_KEY => {
                object.default_bool(CKA_PRIVATE, true);
                Self::key_defaults(object);
                object.default_bool(CKA_SENSITIVE, false);
                object.default_bool(CKA_EXTRACTABLE, true);
                for usage in [CKA_DECRYPT, CKA_SIGN, CKA_UNWRAP] {
                    object.default_bool(usage, true);
                }
            }
            CKO_PUBLIC_KEY => {
                object.default_bool(CKA_PRIVATE, false);
                Self::key_defaults(object);
                for usage in [CKA_ENCRYPT, CKA_VERIFY, CKA_WRAP] {
                    object.default_bool(usage, true);
                }
            }
            _ => object.default_bool(CKA_PRIVATE, false),
        }
    }

    fn key_defaults(object: &mut Object) {
        object.default_bool(CKA_LOCAL, false);
        object.default_bool(CKA_DERIVE, false);
        if !object.has(CKA_ID) {
            object.set_bytes(CKA_ID, Vec::new());
        }
    }

    /// Record the sensitivity history of a freshly generated key
    pub fn finalize_generated(object: &mut Object, mechanism: u64) {
        object.set_bool(CKA_LOCAL, true);
        object.set_ulong(CKA_KEY_GEN_MECHANISM, mechanism);
        let sensitive = object.get_bool(CKA_SENSITIVE, false);
        let extractable = object.get_bool(CKA_EXTRACTABLE, true);
        object.set_bool(CKA_ALWAYS_SENSITIVE, sensitive);
        object.set_bool(CKA_NEVER_EXTRACTABLE, !extractable);
    }

    /// Validate an object supplied in full by the caller (`create_object`)
    pub fn validate_new(object: &Object) -> TokenResult<()> {
        let class = object.class().ok_or(TokenError::TemplateIncomplete)?;
        if object.attribute_types().any(Self::is_hidden) {
            return Err(TokenError::AttributeTypeInvalid);
        }
        match class {
            CKO_DATA | CKO_CERTIFICATE => Ok(()),
            CKO_SECRET_KEY => {
                let key_type = object.key_type().ok_or(TokenError::TemplateIncomplete)?;
                let value = object.get_bytes(CKA_VALUE).ok_or(TokenError::TemplateIncomplete)?;
                if !secret_key_length_valid(key_type, value.len()) {
                    return Err(TokenError::AttributeValueInvalid);
                }
                Ok(())
            }
            CKO_PUBLIC_KEY | CKO_PRIVATE_KEY => {
                let key_type = object.key_type().ok_or(TokenError::TemplateIncomplete)?;
                let required: &[AttributeType] = match (key_type, class) {
                    (CKK_RSA, CKO_PUBLIC_KEY) => &[CKA_MODULUS, CKA_PUBLIC_EXPONENT],
                    (CKK_RSA, _) => &[CKA_MODULUS, CKA_PUBLIC_EXPONENT, CKA_PRIVATE_EXPONENT],
                    (CKK_EC, CKO_PUBLIC_KEY) => &[CKA_EC_PARAMS, CKA_EC_POINT],
                    (CKK_EC, _) => &[CKA_EC_PARAMS, CKA_VALUE],
                    _ => return Err(TokenError::TemplateInconsistent),
                };
                if required.iter().all(|kind| object.has(*kind)) {
                    Ok(())
                } else {
                    Err(TokenError::TemplateIncomplete)
                }
            }
            _ => Err(TokenError::AttributeValueInvalid),
        }
    }

    /// Check one attribute read; hidden attributes look absent
    pub fn check_readable(object: &Object, kind: AttributeType) -> TokenResult<()> {
        if Self::is_hidden(kind) || !object.has(kind) {
            return Err(TokenError::AttributeTypeInvalid);
        }
        let class = object.class().unwrap_or(CKO_DATA);
        let locked = object.get_bool(CKA_SENSITIVE, false) || !object.get_bool(CKA_EXTRACTABLE, true);
        if locked && Self::is_sensitive_attribute(class, kind) {
            return Err(TokenError::AttributeSensitive);
        }
        Ok(())
    }

    /// Check one attribute write against the object's current state
    pub fn check_writable(object: &Object, attr: &Attribute) -> TokenResult<()> {
        if Self::is_hidden(attr.kind) {
            return Err(TokenError::AttributeTypeInvalid);
        }
        if !object.get_bool(CKA_MODIFIABLE, true) {
            return Err(TokenError::ActionProhibited);
        }
        if READ_ONLY.contains(&attr.kind) || PRIVATE_KEY_COMPONENTS.contains(&attr.kind) {
            return Err(TokenError::AttributeReadOnly);
        }
        let new_value = attr.value.first().copied().unwrap_or(0) != 0;
        match attr.kind {
            // Sensitivity may only be raised, extractability only dropped
            CKA_SENSITIVE if object.get_bool(CKA_SENSITIVE, false) && !new_value => {
                Err(TokenError::AttributeReadOnly)
            }
            CKA_EXTRACTABLE if !object.get_bool(CKA_EXTRACTABLE, true) && new_value => {
                Err(TokenError::AttributeReadOnly)
            }
            CKA_VALUE if object.class() == Some(CKO_SECRET_KEY) => Err(TokenError::AttributeReadOnly),
            _ => Ok(()),
        }
    }
}

/// Supported raw key lengths (bytes) per symmetric key type
pub fn secret_key_length_valid(key_type: KeyType, len: usize) -> bool {
    match key_type {
        CKK_AES => matches!(len, 16 | 24 | 32),
        CKK_DES => len == 8,
        CKK_DES3 => matches!(len, 16 | 24),
        CKK_GENERIC_SECRET => (1..=512).contains(&len),
        _ => false,
    }
}
