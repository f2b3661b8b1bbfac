//! Result codes for every token operation
//!
//! A flat taxonomy mirroring the PKCS#11 `CKR_*` space. Each variant knows
//! its numeric code so the dispatch layer can forward it unchanged.

/// Result type alias for token operations
pub type TokenResult<T> = Result<T, TokenError>;

/// Token service errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Bad arguments: {0}")]
    ArgumentsBad(String),

    #[error("Slot ID invalid")]
    SlotIdInvalid,

    #[error("Session handle invalid")]
    SessionHandleInvalid,

    #[error("Object handle invalid")]
    ObjectHandleInvalid,

    #[error("Key handle invalid")]
    KeyHandleInvalid,

    #[error("Token not present")]
    TokenNotPresent,

    #[error("Operation already active")]
    OperationActive,

    #[error("Operation not initialized")]
    OperationNotInitialized,

    #[error("Mechanism invalid")]
    MechanismInvalid,

    #[error("Mechanism parameter invalid")]
    MechanismParamInvalid,

    #[error("Key type inconsistent with mechanism")]
    KeyTypeInconsistent,

    #[error("Key function not permitted")]
    KeyFunctionNotPermitted,

    #[error("Key size out of range")]
    KeySizeRange,

    #[error("Template incomplete")]
    TemplateIncomplete,

    #[error("Template inconsistent")]
    TemplateInconsistent,

    #[error("Attribute is read-only")]
    AttributeReadOnly,

    #[error("Attribute is sensitive")]
    AttributeSensitive,

    #[error("Attribute type invalid")]
    AttributeTypeInvalid,

    #[error("Attribute value invalid")]
    AttributeValueInvalid,

    #[error("Action prohibited")]
    ActionProhibited,

    #[error("Signature length out of range")]
    SignatureLenRange,

    #[error("Signature invalid")]
    SignatureInvalid,

    #[error("Data length out of range")]
    DataLenRange,

    #[error("Encrypted data length out of range")]
    EncryptedDataLenRange,

    #[error("Encrypted data invalid")]
    EncryptedDataInvalid,

    #[error("Wrapped key invalid")]
    WrappedKeyInvalid,

    #[error("Buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("Session is read-only")]
    SessionReadOnly,

    #[error("Session count exhausted")]
    SessionCount,

    #[error("User not logged in")]
    UserNotLoggedIn,

    #[error("User already logged in")]
    UserAlreadyLoggedIn,

    #[error("PIN incorrect")]
    PinIncorrect,

    #[error("Domain parameters invalid")]
    DomainParamsInvalid,

    #[error("Function not supported")]
    FunctionNotSupported,

    #[error("Function failed: {0}")]
    FunctionFailed(String),

    #[error("General error: {0}")]
    GeneralError(String),
}

impl TokenError {
    /// The PKCS#11 `CKR_*` value for this error
    pub fn code(&self) -> u64 {
        match self {
            TokenError::ArgumentsBad(_) => 0x07,
            TokenError::SlotIdInvalid => 0x03,
            TokenError::SessionHandleInvalid => 0xB3,
            TokenError::ObjectHandleInvalid => 0x82,
            TokenError::KeyHandleInvalid => 0x60,
            TokenError::TokenNotPresent => 0xE0,
            TokenError::OperationActive => 0x90,
            TokenError::OperationNotInitialized => 0x91,
            TokenError::MechanismInvalid => 0x70,
            TokenError::MechanismParamInvalid => 0x71,
            TokenError::KeyTypeInconsistent => 0x63,
            TokenError::KeyFunctionNotPermitted => 0x68,
            TokenError::KeySizeRange => 0x62,
            TokenError::TemplateIncomplete => 0xD0,
            TokenError::TemplateInconsistent => 0xD1,
            TokenError::AttributeReadOnly => 0x10,
            TokenError::AttributeSensitive => 0x11,
            TokenError::AttributeTypeInvalid => 0x12,
            TokenError::AttributeValueInvalid => 0x13,
            TokenError::ActionProhibited => 0x1B,
            TokenError::SignatureLenRange => 0xC1,
            TokenError::SignatureInvalid => 0xC0,
            TokenError::DataLenRange => 0x21,
            TokenError::EncryptedDataLenRange => 0x41,
            TokenError::EncryptedDataInvalid => 0x40,
            TokenError::WrappedKeyInvalid => 0x110,
            TokenError::BufferTooSmall { .. } => 0x150,
            TokenError::SessionReadOnly => 0xB5,
            TokenError::SessionCount => 0xB1,
            TokenError::UserNotLoggedIn => 0x101,
            TokenError::UserAlreadyLoggedIn => 0x100,
            TokenError::PinIncorrect => 0xA0,
            TokenError::DomainParamsInvalid => 0x130,
            TokenError::FunctionNotSupported => 0x54,
            TokenError::FunctionFailed(_) => 0x06,
            TokenError::GeneralError(_) => 0x05,
        }
    }

    /// Whether the caller may retry the same call (with a larger buffer)
    /// and get the result that was already computed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TokenError::BufferTooSmall { .. })
    }

    /// Required output length carried by a buffer-too-small error
    pub fn required_len(&self) -> Option<usize> {
        match self {
            TokenError::BufferTooSmall { required } => Some(*required),
            _ => None,
        }
    }

    /// Shorthand for a TPM backend failure
    pub fn tpm(context: &str) -> Self {
        TokenError::FunctionFailed(format!("TPM: {}", context))
    }
}

impl From<std::io::Error> for TokenError {
    fn from(err: std::io::Error) -> Self {
        TokenError::GeneralError(format!("I/O: {}", err))
    }
}

impl From<serde_json::Error> for TokenError {
    fn from(err: serde_json::Error) -> Self {
        TokenError::GeneralError(format!("Serialize: {}", err))
    }
}

impl From<hex::FromHexError> for TokenError {
    fn from(err: hex::FromHexError) -> Self {
        TokenError::GeneralError(format!("Hex decode: {}", err))
    }
}

impl From<rsa::Error> for TokenError {
    fn from(err: rsa::Error) -> Self {
        TokenError::FunctionFailed(format!("RSA: {}", err))
    }
}
