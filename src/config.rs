//! Service configuration
//!
//! Loaded once at process start and shared (read-only) by the slot manager
//! and every session. JSON on disk, with a few environment overrides.

use crate::tpm::TpmBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming a JSON config file
pub const CONFIG_ENV: &str = "TPMTOK_CONFIG";
/// Environment override for the TPM backend (`tpm12`, `tpm20`, `simulated`, `stub`)
pub const BACKEND_ENV: &str = "TPMTOK_TPM_BACKEND";
/// Environment override for the legacy default PIN
pub const LEGACY_PIN_ENV: &str = "TPMTOK_LEGACY_PIN";

/// Configuration consumed by the token service core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Which TPM variant to bring up at startup
    pub tpm_backend: TpmBackend,
    /// Directory persisting the simulated TPM's storage root (None = ephemeral)
    pub simulated_tpm_state: Option<PathBuf>,
    /// RSA modulus bounds for keys handled in software
    pub software_rsa_min_bits: usize,
    pub software_rsa_max_bits: usize,
    /// RSA modulus bounds for keys created inside the TPM
    pub tpm_rsa_min_bits: usize,
    pub tpm_rsa_max_bits: usize,
    /// PIN accepted by `login` for backward compatibility
    pub legacy_default_pin: String,
    /// Modulus size of the per-token authorization key (TPM 1.2 hierarchy)
    pub auth_key_bits: usize,
    /// Number of empty slots created at startup
    pub initial_slot_count: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tpm_backend: TpmBackend::Simulated,
            simulated_tpm_state: None,
            software_rsa_min_bits: 512,
            software_rsa_max_bits: 8192,
            tpm_rsa_min_bits: 512,
            tpm_rsa_max_bits: 2048,
            legacy_default_pin: "111111".to_string(),
            auth_key_bits: 2048,
            initial_slot_count: 1,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from `TPMTOK_CONFIG` (if set) plus the individual overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(backend) = std::env::var(BACKEND_ENV) {
            config.tpm_backend = backend
                .parse()
                .map_err(|_| ConfigError::InvalidValue(BACKEND_ENV.into()))?;
        }

        if let Ok(pin) = std::env::var(LEGACY_PIN_ENV) {
            config.legacy_default_pin = pin;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sanity-check bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.software_rsa_min_bits > self.software_rsa_max_bits {
            return Err(ConfigError::InvalidValue("software_rsa_min_bits".into()));
        }
        if self.tpm_rsa_min_bits > self.tpm_rsa_max_bits {
            return Err(ConfigError::InvalidValue("tpm_rsa_min_bits".into()));
        }
        if self.auth_key_bits < 512 || self.auth_key_bits % 8 != 0 {
            return Err(ConfigError::InvalidValue("auth_key_bits".into()));
        }
        Ok(())
    }

    /// RSA bounds for a key, depending on where its private half lives
    pub fn rsa_bounds(&self, tpm_backed: bool) -> (usize, usize) {
        if tpm_backed {
            (self.tpm_rsa_min_bits, self.tpm_rsa_max_bits)
        } else {
            (self.software_rsa_min_bits, self.software_rsa_max_bits)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
