//! Consensus parameters of a chain, including its soft fork deployment table.

use crate::error::SpecError;
use crate::versionbits::{
    Deployment, DeploymentInfo, DeploymentPos, ThresholdState, Versionbits, VersionbitsCache,
    VersionbitsConditionChecker, VersionbitsIndexer, VersionbitsStats, VERSIONBITS_TOP_BITS,
};
use keel_types::core::{BlockId, BlockNumber, Version};
use std::collections::HashMap;

/// Consensus parameters shared by every node of a chain.
///
/// The embedded versionbits caches are shared between clones, so every view
/// of the same `Consensus` observes the same memo tables.
#[derive(Clone, Debug)]
pub struct Consensus {
    /// Chain identity; cached states are only meaningful within one chain.
    pub id: String,
    /// The soft fork deployment table.
    pub deployments: HashMap<DeploymentPos, Deployment>,
    /// Per-deployment threshold state caches.
    pub versionbits_caches: VersionbitsCache,
}

impl Default for Consensus {
    fn default() -> Self {
        Consensus {
            id: "main".to_owned(),
            deployments: HashMap::new(),
            versionbits_caches: VersionbitsCache::default(),
        }
    }
}

impl Consensus {
    /// Returns the soft fork deployment table.
    pub fn deployments(&self) -> &HashMap<DeploymentPos, Deployment> {
        &self.deployments
    }

    /// Returns the state of the deployment for the block following `prev`.
    pub fn versionbits_state<I: VersionbitsIndexer>(
        &self,
        pos: DeploymentPos,
        prev: Option<BlockId>,
        indexer: &I,
    ) -> Option<ThresholdState> {
        if !self.deployments.contains_key(&pos) {
            return None;
        }
        let versionbits = Versionbits::new(pos, self);
        let cache = self.versionbits_caches.cache(pos);
        versionbits.get_state(prev, cache, indexer)
    }

    /// Returns the first height to which the deployment's current state
    /// applies.
    pub fn versionbits_state_since_height<I: VersionbitsIndexer>(
        &self,
        pos: DeploymentPos,
        prev: Option<BlockId>,
        indexer: &I,
    ) -> Option<BlockNumber> {
        if !self.deployments.contains_key(&pos) {
            return None;
        }
        let versionbits = Versionbits::new(pos, self);
        let cache = self.versionbits_caches.cache(pos);
        versionbits.get_state_since_height(prev, cache, indexer)
    }

    /// Returns the signalling statistics of the period containing `block`.
    pub fn versionbits_statistics<I: VersionbitsIndexer>(
        &self,
        pos: DeploymentPos,
        block: Option<BlockId>,
        indexer: &I,
    ) -> Option<VersionbitsStats> {
        if !self.deployments.contains_key(&pos) {
            return None;
        }
        let versionbits = Versionbits::new(pos, self);
        versionbits.get_statistics(block, indexer)
    }

    /// Returns the version bit mask of the deployment.
    pub fn versionbits_mask(&self, pos: DeploymentPos) -> Option<Version> {
        if !self.deployments.contains_key(&pos) {
            return None;
        }
        Some(Versionbits::new(pos, self).mask())
    }

    /// Returns what version a new block should use.
    ///
    /// Signalling deployments keep their bit set through `Started`,
    /// `MustSignal` and `LockedIn`, so a compliant miner satisfies a forced
    /// signalling period without special-casing it.
    pub fn compute_versionbits<I: VersionbitsIndexer>(
        &self,
        parent: Option<BlockId>,
        indexer: &I,
    ) -> Option<Version> {
        let mut version = VERSIONBITS_TOP_BITS;

        for pos in self.deployments.keys() {
            let versionbits = Versionbits::new(*pos, self);
            let cache = self.versionbits_caches.cache(*pos);
            let state = versionbits.get_state(parent, cache, indexer)?;
            match state {
                ThresholdState::Started
                | ThresholdState::MustSignal
                | ThresholdState::LockedIn => {
                    version |= versionbits.mask();
                }
                ThresholdState::Defined | ThresholdState::Active | ThresholdState::Failed => {}
            }
        }

        Some(version)
    }

    /// Assembles the RPC-facing information of the deployment.
    pub fn deployment_info<I: VersionbitsIndexer>(
        &self,
        pos: DeploymentPos,
        prev: Option<BlockId>,
        indexer: &I,
    ) -> Option<DeploymentInfo> {
        let deployment = self.deployments.get(&pos)?;
        let mut info = DeploymentInfo::from(*deployment);
        info.state = self.versionbits_state(pos, prev, indexer)?.into();
        info.since = self.versionbits_state_since_height(pos, prev, indexer)?;
        Some(info)
    }

    /// Drops every cached threshold state.
    ///
    /// Required after rewinding or reorganizing past any cached period
    /// boundary.
    pub fn clear_versionbits_caches(&self) {
        self.versionbits_caches.clear();
    }
}

/// Builder for [`Consensus`]; `build` validates the deployment table.
#[derive(Default)]
pub struct ConsensusBuilder {
    inner: Consensus,
}

impl ConsensusBuilder {
    /// Names the chain the parameters belong to.
    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.inner.id = id.into();
        self
    }

    /// Replaces the soft fork deployment table.
    pub fn softfork_deployments(
        mut self,
        deployments: HashMap<DeploymentPos, Deployment>,
    ) -> Self {
        self.inner.deployments = deployments;
        self
    }

    /// Validates the configuration and finishes the build.
    pub fn build(self) -> Result<Consensus, SpecError> {
        for (pos, deployment) in &self.inner.deployments {
            deployment.validate(*pos)?;
        }
        Ok(self.inner)
    }
}
