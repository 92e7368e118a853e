use crate::versionbits::{Deployment, ThresholdState};
use keel_types::core::BlockNumber;
use serde::{Deserialize, Serialize};

/// Deployment state as shown to RPC consumers.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// First state that each softfork starts.
    Defined,
    /// For blocks past the start height.
    Started,
    /// For the last period before the timeout, when signalling is forced.
    MustSignal,
    /// For one period after the first period that reached the threshold.
    LockedIn,
    /// For all blocks after the locked-in period.
    Active,
    /// For all blocks past the timeout, if lock-in was not reached.
    Failed,
}

/// Deployment information an RPC layer reports for one soft fork.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DeploymentInfo {
    /// The bit used to signal the softfork.
    pub bit: u8,
    /// The first height at which the bit gains meaning.
    pub start: BlockNumber,
    /// The height at which miner signalling ends.
    pub timeout: BlockNumber,
    /// The height at which the softfork is allowed to become active.
    pub min_activation_height: BlockNumber,
    /// The length in blocks of the signalling period.
    pub period: BlockNumber,
    /// The number of signalling blocks required for lock-in.
    pub threshold: BlockNumber,
    /// Whether the deployment forces signalling instead of failing at timeout.
    pub lockin_on_timeout: bool,
    /// The current threshold state.
    pub state: DeploymentState,
    /// The first height to which the current state applies.
    pub since: BlockNumber,
}

impl From<ThresholdState> for DeploymentState {
    fn from(state: ThresholdState) -> Self {
        match state {
            ThresholdState::Defined => DeploymentState::Defined,
            ThresholdState::Started => DeploymentState::Started,
            ThresholdState::MustSignal => DeploymentState::MustSignal,
            ThresholdState::LockedIn => DeploymentState::LockedIn,
            ThresholdState::Active => DeploymentState::Active,
            ThresholdState::Failed => DeploymentState::Failed,
        }
    }
}

impl From<Deployment> for DeploymentInfo {
    fn from(deployment: Deployment) -> Self {
        DeploymentInfo {
            bit: deployment.bit,
            start: deployment.start,
            timeout: deployment.timeout,
            min_activation_height: deployment.min_activation_height,
            period: deployment.period,
            threshold: deployment.threshold,
            lockin_on_timeout: deployment.lockin_on_timeout,
            state: DeploymentState::Defined,
            since: 0,
        }
    }
}
