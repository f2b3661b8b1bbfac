//! Slot and token descriptions returned to callers

use crate::pool::PrivateLoadState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

pub const MANUFACTURER_ID: &str = "tpmtok";
pub const TOKEN_MODEL: &str = "TPM token";

pub const CKF_TOKEN_PRESENT: u64 = 0x0001;
pub const CKF_HW_SLOT: u64 = 0x0004;

pub const CKF_RNG: u64 = 0x0001;
pub const CKF_LOGIN_REQUIRED: u64 = 0x0004;
pub const CKF_USER_PIN_INITIALIZED: u64 = 0x0008;
pub const CKF_PROTECTED_AUTHENTICATION_PATH: u64 = 0x0100;
pub const CKF_TOKEN_INITIALIZED: u64 = 0x0400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub description: String,
    pub manufacturer_id: String,
    pub flags: u64,
}

impl SlotInfo {
    pub(super) fn new(slot: u64, hardware: bool) -> Self {
        Self {
            description: format!("TPM slot {}", slot),
            manufacturer_id: MANUFACTURER_ID.to_string(),
            flags: if hardware { CKF_HW_SLOT } else { 0 },
        }
    }

    pub fn is_token_present(&self) -> bool {
        self.flags & CKF_TOKEN_PRESENT != 0
    }

    pub(super) fn set_token_present(&mut self, present: bool) {
        if present {
            self.flags |= CKF_TOKEN_PRESENT;
        } else {
            self.flags &= !CKF_TOKEN_PRESENT;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    /// Stable per token path
    pub serial_number: String,
    pub flags: u64,
    pub session_count: usize,
    pub rw_session_count: usize,
    pub private_objects_ready: bool,
    pub loaded_at: DateTime<Utc>,
}

impl TokenInfo {
    pub(super) fn new(
        label: &str,
        path: &Path,
        state: PrivateLoadState,
        sessions: (usize, usize),
        loaded_at: DateTime<Utc>,
    ) -> Self {
        let digest = Sha256::digest(path.to_string_lossy().as_bytes());
        Self {
            label: label.to_string(),
            manufacturer_id: MANUFACTURER_ID.to_string(),
            model: TOKEN_MODEL.to_string(),
            serial_number: hex::encode(&digest[..8]),
            flags: CKF_RNG
                | CKF_LOGIN_REQUIRED
                | CKF_USER_PIN_INITIALIZED
                | CKF_PROTECTED_AUTHENTICATION_PATH
                | CKF_TOKEN_INITIALIZED,
            session_count: sessions.0,
            rw_session_count: sessions.1,
            private_objects_ready: state == PrivateLoadState::Ready,
            loaded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_presence_flag() {
        let mut info = SlotInfo::new(2, true);
        assert_eq!(info.description, "TPM slot 2");
        assert!(!info.is_token_present());
        info.set_token_present(true);
        assert!(info.is_token_present());
        assert_ne!(info.flags & CKF_HW_SLOT, 0);
        info.set_token_present(false);
        assert!(!info.is_token_present());
    }

    #[test]
    fn test_serial_is_stable_per_path() {
        let now = Utc::now();
        let a = TokenInfo::new("a", Path::new("/var/lib/a"), PrivateLoadState::Ready, (1, 0), now);
        let b = TokenInfo::new("b", Path::new("/var/lib/a"), PrivateLoadState::Pending, (0, 0), now);
        let c = TokenInfo::new("c", Path::new("/var/lib/c"), PrivateLoadState::Pending, (0, 0), now);
        assert_eq!(a.serial_number, b.serial_number);
        assert_ne!(a.serial_number, c.serial_number);
        assert_eq!(a.serial_number.len(), 16);
        assert!(a.private_objects_ready);
        assert!(!b.private_objects_ready);
    }
}
