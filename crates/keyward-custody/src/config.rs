//! Custody configuration.
//!
//! Every tunable the subsystem recognizes lives here and is supplied at
//! construction time — call sites never bake in their own defaults.

use std::time::Duration;

use crate::crypto;
use crate::error::{CustodyError, Result};

/// Configuration for a [`crate::CustodyContext`].
#[derive(Debug, Clone)]
pub struct CustodyConfig {
    /// PBKDF2 iteration count (derivation cost factor).
    pub iterations: u32,

    /// Derived key length in bytes. Must be 16 or 32 (AES-128-GCM or
    /// AES-256-GCM).
    pub key_length: usize,

    /// How long a cached session key stays usable after its last access.
    pub session_ttl: Duration,

    /// Maximum number of successful `get_session_key` calls before the
    /// entry is evicted.
    pub max_session_access_count: u32,

    /// Lifetime of a vault entry from the moment it is stored.
    pub vault_entry_ttl: Duration,

    /// Maximum number of audit events retained in memory.
    pub audit_log_capacity: usize,

    /// How often the background sweep evicts expired sessions and vault
    /// entries.
    pub sweep_interval: Duration,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            iterations: 100_000,
            key_length: 32,
            session_ttl: Duration::from_secs(15 * 60),
            max_session_access_count: 100,
            vault_entry_ttl: Duration::from_secs(24 * 60 * 60),
            audit_log_capacity: 1024,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CustodyConfig {
    /// Reject configurations the crypto layer cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(CustodyError::Validation(
                "iterations must be non-zero".into(),
            ));
        }
        if !crypto::is_supported_key_length(self.key_length) {
            return Err(CustodyError::Validation(format!(
                "unsupported key length {} (expected 16 or 32 bytes)",
                self.key_length
            )));
        }
        if self.max_session_access_count == 0 {
            return Err(CustodyError::Validation(
                "max_session_access_count must be non-zero".into(),
            ));
        }
        if self.audit_log_capacity == 0 {
            return Err(CustodyError::Validation(
                "audit_log_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CustodyConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_iterations_rejected() {
        let config = CustodyConfig {
            iterations: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CustodyError::Validation(_))
        ));
    }

    #[test]
    fn odd_key_length_rejected() {
        let config = CustodyConfig {
            key_length: 24,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
