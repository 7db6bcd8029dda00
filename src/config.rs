//! Issuance and ledger configuration, loaded from TOML.
//!
//! ```toml
//! [issuance]
//! minimum_prototoken_count = 1
//! default_prototoken_count = 3
//!
//! [ledger]
//! root = "/var/lib/blindcash/spent"
//! ```

use crate::error::{CashError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default for how many blinded prototokens a withdrawal must carry.
///
/// More prototokens cost more to generate and sign but make it harder to
/// predict which one the mint will pick.
pub const DEFAULT_MINIMUM_PROTOTOKEN_COUNT: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct IssuancePolicy {
    pub minimum_prototoken_count: usize,
    /// Prototokens generated per withdrawal when the caller doesn't say.
    /// Falls back to the minimum.
    pub default_prototoken_count: Option<usize>,
}

impl Default for IssuancePolicy {
    fn default() -> Self {
        Self {
            minimum_prototoken_count: DEFAULT_MINIMUM_PROTOTOKEN_COUNT,
            default_prototoken_count: None,
        }
    }
}

impl IssuancePolicy {
    pub fn with_minimum(minimum_prototoken_count: usize) -> Self {
        Self {
            minimum_prototoken_count,
            default_prototoken_count: None,
        }
    }

    pub fn prototoken_count(&self) -> usize {
        self.default_prototoken_count
            .unwrap_or(self.minimum_prototoken_count)
    }

    pub fn validate(&self) -> Result<()> {
        if self.minimum_prototoken_count == 0 {
            return Err(CashError::PolicyViolation(
                "minimum_prototoken_count must be at least 1".into(),
            ));
        }
        self.check_count(self.prototoken_count())
    }

    /// Reject a prototoken count below this policy's minimum.
    pub fn check_count(&self, count: usize) -> Result<()> {
        if count < self.minimum_prototoken_count {
            return Err(CashError::PolicyViolation(format!(
                "{} prototokens offered, at least {} required",
                count, self.minimum_prototoken_count
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CashConfig {
    pub issuance: IssuancePolicy,
    pub ledger: LedgerConfig,
}

impl CashConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.issuance.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            CashError::MalformedInput(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }
}
