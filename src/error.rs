use crate::ledger::LedgerError;
use blsttc::error::FromBytesError;
use std::array::TryFromSliceError;
use thiserror::Error;

/// Specialisation of `std::Result`.
pub type Result<T, E = CashError> = std::result::Result<T, E>;
pub type Error = CashError;

#[derive(Error, Debug)]
/// error variants.
pub enum CashError {
    #[error("cannot {operation}: token is {actual}, expected {expected}")]
    WrongState {
        operation: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("token already spent: {0}")]
    AlreadySpent(String),

    #[error("token does not match mint: {0}")]
    MintMismatch(String),

    #[error("spent ledger unavailable")]
    Ledger(#[from] LedgerError),

    #[error("bls error: {0}")]
    Blsttc(#[from] blsttc::error::Error),

    #[error("deserialization from bytes failed")]
    BlsttcFromBytes(#[from] FromBytesError),

    #[error("deserialization from bytes failed")]
    InvalidBytes(#[from] TryFromSliceError),
}

impl CashError {
    /// Errors after which the token instance must not be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CryptoFailure(_)
                | Self::MalformedInput(_)
                | Self::Blsttc(_)
                | Self::BlsttcFromBytes(_)
                | Self::InvalidBytes(_)
        )
    }

    /// Errors the caller may retry with corrected input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::WrongState { .. } | Self::PolicyViolation(_) | Self::MintMismatch(_)
        )
    }
}

impl From<base64::DecodeError> for CashError {
    fn from(e: base64::DecodeError) -> Self {
        Self::MalformedInput(format!("base64: {}", e))
    }
}

impl From<serde_json::Error> for CashError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedInput(format!("token document: {}", e))
    }
}

impl From<toml::de::Error> for CashError {
    fn from(e: toml::de::Error) -> Self {
        Self::MalformedInput(format!("config: {}", e))
    }
}

impl From<hex::FromHexError> for CashError {
    fn from(e: hex::FromHexError) -> Self {
        Self::MalformedInput(format!("hex: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(CashError::MalformedInput("x".into()).is_terminal());
        assert!(CashError::CryptoFailure("x".into()).is_terminal());
        assert!(!CashError::AlreadySpent("x".into()).is_terminal());
        assert!(!CashError::AlreadySpent("x".into()).is_recoverable());
        assert!(CashError::MintMismatch("x".into()).is_recoverable());
        assert!(CashError::PolicyViolation("x".into()).is_recoverable());
        assert!(CashError::WrongState {
            operation: "verify",
            expected: "spendable",
            actual: "blank",
        }
        .is_recoverable());
    }
}
