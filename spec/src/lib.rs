//! # The Chain Specification
//!
//! A chain spec names the network and declares its soft fork deployment
//! schedule. Nodes that disagree on any of these parameters fork away from
//! each other, so the spec is loaded once at startup and treated as
//! immutable afterwards.

pub mod consensus;
pub mod error;
pub mod versionbits;


use crate::consensus::{Consensus, ConsensusBuilder};
use crate::error::SpecError;
use crate::versionbits::{Deployment, DeploymentPos};
use keel_types::core::BlockNumber;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Length in blocks of the default signalling window.
pub const DEFAULT_SIGNAL_WINDOW: BlockNumber = 2016;
/// Signalling threshold used by mainnet deployments (90% of the window).
pub const MAINNET_ACTIVATION_THRESHOLD: BlockNumber = 1815;
/// Signalling threshold used by testnet deployments (75% of the window).
pub const TESTNET_ACTIVATION_THRESHOLD: BlockNumber = 1512;

/// Declarative description of a chain, deserialized from a TOML file.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSpec {
    /// The name of the chain.
    pub name: String,
    /// The soft fork deployment schedule.
    #[serde(default)]
    pub deployments: DeploymentsConfig,
}

/// Soft fork deployments declared by a chain spec, one optional entry per
/// slot.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentsConfig {
    /// Dummy deployment used by tests and integration harnesses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testdummy: Option<Deployment>,
    /// Reserved header extension field deployment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_extension: Option<Deployment>,
}

impl DeploymentsConfig {
    fn build_table(&self) -> HashMap<DeploymentPos, Deployment> {
        let mut table = HashMap::new();
        if let Some(deployment) = self.testdummy {
            table.insert(DeploymentPos::Testdummy, deployment);
        }
        if let Some(deployment) = self.header_extension {
            table.insert(DeploymentPos::HeaderExtension, deployment);
        }
        table
    }
}

impl ChainSpec {
    /// Parses a chain spec from its TOML representation.
    pub fn load_from_str(data: &str) -> Result<ChainSpec, SpecError> {
        let spec: ChainSpec = toml::from_str(data)?;
        Ok(spec)
    }

    /// Builds the consensus parameters declared by this spec.
    pub fn build_consensus(&self) -> Result<Consensus, SpecError> {
        let deployments = self.deployments.build_table();
        debug!(
            "chain spec {} declares {} softfork deployments",
            self.name,
            deployments.len()
        );
        ConsensusBuilder::default()
            .id(self.name.clone())
            .softfork_deployments(deployments)
            .build()
    }
}
