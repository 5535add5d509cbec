//! Crate-wide result alias and the backend driver error taxonomy.

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Errors surfaced by backend drivers.
///
/// Both variants keep the owning row claimable after backoff; contract
/// violations are additionally logged at error level because only a driver
/// fix can resolve them.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("backend request failed: {0:#}")]
    Transient(#[from] anyhow::Error),
    #[error("driver contract violation: {0}")]
    Contract(String),
}

impl DriverError {
    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract(message.into())
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::Contract(_))
    }
}
