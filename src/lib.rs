//! tpmtok — TPM-backed PKCS#11 token service core
//!
//! Tokens are directories of encrypted objects whose master key is protected
//! by the platform TPM. A [`SlotManager`] maps loaded tokens onto slots,
//! scopes slot visibility by isolate and hands out [`Session`]s that run the
//! object, key management and crypto operations. All TPM access is
//! serialized through a single [`TpmThread`].

pub mod config;
pub mod crypto;
pub mod error;
pub mod mechanism;
pub mod object;
pub mod pool;
pub mod session;
pub mod slot;
pub mod tpm;

pub use config::{ConfigError, ServiceConfig};
pub use error::{TokenError, TokenResult};
pub use object::{Attribute, Object, ObjectHandle};
pub use pool::{ObjectPool, PrivateLoadState, TokenObjectPool};
pub use session::{OperationType, Session, SessionHandle, UserType};
pub use slot::{IsolateCredential, SlotInfo, SlotManager, TokenInfo, DEFAULT_ISOLATE};
pub use tpm::{SlotId, TpmThread, TpmUtility, TpmVersion};
