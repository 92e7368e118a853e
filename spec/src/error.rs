use crate::versionbits::DeploymentPos;
use keel_types::core::BlockNumber;
use thiserror::Error;

/// Errors raised while loading or validating a chain spec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// The signalling period must span at least one block.
    #[error("deployment {pos:?}: period must be at least one block")]
    InvalidPeriod {
        /// The offending deployment.
        pos: DeploymentPos,
    },

    /// The threshold cannot exceed the period length.
    #[error("deployment {pos:?}: threshold {threshold} exceeds period {period}")]
    InvalidThreshold {
        /// The offending deployment.
        pos: DeploymentPos,
        /// The configured threshold.
        threshold: BlockNumber,
        /// The configured period.
        period: BlockNumber,
    },

    /// The signal bit must fall within the versionbits range.
    #[error("deployment {pos:?}: signal bit {bit} is out of range")]
    InvalidBit {
        /// The offending deployment.
        pos: DeploymentPos,
        /// The configured bit.
        bit: u8,
    },

    /// The start/timeout pair mixes sentinel heights in an unsupported way.
    #[error("deployment {pos:?}: unsupported start/timeout combination")]
    InvalidWindow {
        /// The offending deployment.
        pos: DeploymentPos,
    },

    /// The chain spec file could not be parsed.
    #[error("malformed chain spec: {0}")]
    Malformed(String),
}

impl From<toml::de::Error> for SpecError {
    fn from(error: toml::de::Error) -> Self {
        SpecError::Malformed(error.to_string())
    }
}
