//! Versionbits defines a finite-state-machine to deploy a soft fork in multiple stages.
//!

mod convert;

pub use convert::{DeploymentInfo, DeploymentState};

use crate::consensus::Consensus;
use crate::error::SpecError;
use keel_types::core::{BlockId, BlockNumber, HeaderChain, Version};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{hash_map, HashMap};
use std::sync::Arc;

/// What bits to set in version for versionbits blocks.
pub const VERSIONBITS_TOP_BITS: Version = 0x2000_0000;
/// What bitmask determines whether versionbits is in use.
pub const VERSIONBITS_TOP_MASK: Version = 0xE000_0000;
/// Total bits available for versionbits.
pub const VERSIONBITS_NUM_BITS: u32 = 29;

/// Start height sentinel marking a deployment as never active.
pub const NEVER_ACTIVE: BlockNumber = i32::MAX as BlockNumber;
/// Start height sentinel marking a deployment as active from genesis.
pub const ALWAYS_ACTIVE: BlockNumber = NEVER_ACTIVE - 1;
/// Timeout sentinel for deployments that keep signalling until lock-in.
pub const NO_TIMEOUT: BlockNumber = NEVER_ACTIVE;

/// The state machine deploying a soft fork in multiple stages.
///
/// State transitions happen at period boundaries if conditions are met. In
/// case of reorg, transitions can go backward. Without transition, state is
/// inherited between periods. All blocks of a period share the same state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThresholdState {
    /// First state that each softfork starts.
    /// The genesis block is by definition in this state for each deployment.
    Defined,
    /// For blocks past the `start` height.
    Started,
    /// For the last period before the `timeout` height, when
    /// `lockin_on_timeout` is set and the threshold was not reached earlier.
    MustSignal,
    /// For one period after the first period with `Started` blocks of which
    /// at least `threshold` has the associated bit set in `version`.
    LockedIn,
    /// For all blocks after the `LockedIn` period (final state).
    Active,
    /// For all blocks once the first period after the `timeout` height is
    /// hit, if `LockedIn` was not reached (final state).
    Failed,
}

/// Soft fork deployment identifier.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum DeploymentPos {
    /// Dummy deployment exercised by tests and integration harnesses.
    Testdummy,
    /// Reserved header extension field.
    HeaderExtension,
}

/// Number of deployment slots; sizes the per-deployment cache array.
pub const MAX_VERSIONBITS_DEPLOYMENTS: usize = 2;

impl DeploymentPos {
    fn cache_index(self) -> usize {
        self as usize
    }
}

/// Read-only view of the block tree the state machine runs against.
pub trait VersionbitsIndexer {
    /// Gets the height of a block.
    fn block_number(&self, block: BlockId) -> Option<BlockNumber>;
    /// Gets the header version of a block.
    fn block_version(&self, block: BlockId) -> Option<Version>;
    /// Gets the parent of a block, `None` for a height-0 block.
    fn parent(&self, block: BlockId) -> Option<BlockId>;
    /// Gets the ancestor of `block` at height `target`.
    fn ancestor(&self, block: BlockId, target: BlockNumber) -> Option<BlockId> {
        let mut number = self.block_number(block)?;
        if target > number {
            return None;
        }
        let mut walk = block;
        while number > target {
            walk = self.parent(walk)?;
            number -= 1;
        }
        Some(walk)
    }
}

impl VersionbitsIndexer for HeaderChain {
    fn block_number(&self, block: BlockId) -> Option<BlockNumber> {
        HeaderChain::number(self, block)
    }

    fn block_version(&self, block: BlockId) -> Option<Version> {
        HeaderChain::version(self, block)
    }

    fn parent(&self, block: BlockId) -> Option<BlockId> {
        HeaderChain::parent(self, block)
    }

    fn ancestor(&self, block: BlockId, target: BlockNumber) -> Option<BlockId> {
        HeaderChain::ancestor(self, block, target)
    }
}

/// Struct for each individual consensus rule change using soft fork.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Deployment {
    /// Determines which bit in the `version` field of the block is to be used
    /// to signal the softfork lock-in and activation. It is chosen from the
    /// set {0,1,2,...,28}.
    pub bit: u8,
    /// Specifies the height of the first block at which the bit gains
    /// meaning, or one of the `ALWAYS_ACTIVE` / `NEVER_ACTIVE` sentinels.
    pub start: BlockNumber,
    /// Specifies the height at which the miner signalling ends. Once this
    /// height has been reached, if the softfork has not yet locked in, the
    /// deployment is considered failed on all descendants of the block.
    /// `NO_TIMEOUT` keeps the deployment signalling until lock-in.
    pub timeout: BlockNumber,
    /// Specifies the height at which the softfork is allowed to become
    /// active.
    #[serde(default)]
    pub min_activation_height: BlockNumber,
    /// Specifies the length in blocks of the signalling period.
    pub period: BlockNumber,
    /// Specifies the number of blocks within one period that must signal to
    /// lock the softfork in.
    pub threshold: BlockNumber,
    /// If set, failure to reach the threshold before `timeout` forces the
    /// last period to signal instead of failing the deployment.
    #[serde(default)]
    pub lockin_on_timeout: bool,
}

impl Deployment {
    /// Checks the configuration against the limits the state machine assumes.
    pub fn validate(&self, pos: DeploymentPos) -> Result<(), SpecError> {
        if self.period == 0 {
            return Err(SpecError::InvalidPeriod { pos });
        }
        if self.threshold > self.period {
            return Err(SpecError::InvalidThreshold {
                pos,
                threshold: self.threshold,
                period: self.period,
            });
        }
        if u32::from(self.bit) >= VERSIONBITS_NUM_BITS {
            return Err(SpecError::InvalidBit { pos, bit: self.bit });
        }
        let window_ok = match (self.start, self.timeout) {
            (ALWAYS_ACTIVE, NO_TIMEOUT) => true,
            (NEVER_ACTIVE, NEVER_ACTIVE) => true,
            (start, timeout) => {
                start < ALWAYS_ACTIVE && (timeout < ALWAYS_ACTIVE || timeout == NO_TIMEOUT)
            }
        };
        if !window_ok {
            return Err(SpecError::InvalidWindow { pos });
        }
        Ok(())
    }
}

/// Per-deployment memo table keyed by the previous block of a period
/// boundary; the `None` key is the parent of genesis.
pub type Cache = Mutex<HashMap<Option<BlockId>, ThresholdState>>;

/// Soft forks can be deployed in parallel. We cache per-period state for
/// every one of them, one fixed slot per deployment.
#[derive(Clone, Debug)]
pub struct VersionbitsCache {
    caches: Arc<[Cache; MAX_VERSIONBITS_DEPLOYMENTS]>,
}

impl Default for VersionbitsCache {
    fn default() -> Self {
        VersionbitsCache {
            caches: Arc::new(std::array::from_fn(|_| Cache::default())),
        }
    }
}

impl VersionbitsCache {
    /// Returns a reference to the cache slot of the deployment.
    pub fn cache(&self, pos: DeploymentPos) -> &Cache {
        &self.caches[pos.cache_index()]
    }

    /// Empties every slot.
    ///
    /// Must be called whenever previously queried blocks may no longer be on
    /// the best chain; cached keys are block identities whose meaning depends
    /// on the chain they were minted by.
    pub fn clear(&self) {
        debug!("clearing versionbits caches");
        for cache in self.caches.iter() {
            cache.lock().clear();
        }
    }
}

/// Signalling progress within one period.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VersionbitsStats {
    /// Length of the signalling period.
    pub period: BlockNumber,
    /// Number of signalling blocks required for lock-in.
    pub threshold: BlockNumber,
    /// Number of blocks mined in the period so far, excluding its first.
    pub elapsed: BlockNumber,
    /// Number of those blocks whose version signals the deployment.
    pub count: BlockNumber,
    /// Whether the threshold can still be met in this period. Only meaningful
    /// while the state is `Started` or `MustSignal`.
    pub possible: bool,
}

/// Trait that implements versionbits threshold logic, and caches results.
pub trait VersionbitsConditionChecker {
    /// Specifies the height of the first block at which the bit gains meaning.
    fn start(&self) -> BlockNumber;
    /// Specifies the height at which the miner signalling ends.
    fn timeout(&self) -> BlockNumber;
    /// Specifies the height at which the softfork is allowed to become active.
    fn min_activation_height(&self) -> BlockNumber;
    /// The period over which signals are counted.
    fn period(&self) -> BlockNumber;
    /// Specifies the number of signalling blocks within one period required
    /// for lock-in.
    fn threshold(&self) -> BlockNumber;
    /// Whether the deployment forces signalling instead of failing at timeout.
    fn lockin_on_timeout(&self) -> bool;
    /// Determines whether the block signals the deployment.
    fn condition<I: VersionbitsIndexer>(&self, block: BlockId, indexer: &I) -> bool;

    /// Returns the state for the block built on top of `prev`. Applies any
    /// state transition if conditions are present. Caches state at period
    /// boundaries.
    fn get_state<I: VersionbitsIndexer>(
        &self,
        prev: Option<BlockId>,
        cache: &Cache,
        indexer: &I,
    ) -> Option<ThresholdState> {
        let period = self.period();
        let threshold = self.threshold();
        let start = self.start();
        let timeout = self.timeout();
        let min_activation_height = self.min_activation_height();
        let lockin_on_timeout = self.lockin_on_timeout();

        if start == ALWAYS_ACTIVE {
            return Some(ThresholdState::Active);
        }
        if start == NEVER_ACTIVE && timeout == NEVER_ACTIVE {
            return Some(ThresholdState::Defined);
        }

        // A block's state equals the state of the first block of its period,
        // so the walk runs over previous-blocks whose next height is a
        // multiple of the period.
        let mut walk = match prev {
            Some(block) => {
                let number = indexer.block_number(block)?;
                match number.checked_sub((number + 1) % period) {
                    Some(target) => Some(indexer.ancestor(block, target)?),
                    // The boundary lies below genesis.
                    None => None,
                }
            }
            None => None,
        };

        let mut g_cache = cache.lock();
        let mut to_compute = Vec::new();

        let mut state = loop {
            match g_cache.entry(walk) {
                hash_map::Entry::Occupied(entry) => break *entry.get(),
                hash_map::Entry::Vacant(entry) => {
                    let block = match walk {
                        // The parent of genesis is by definition defined.
                        None => {
                            entry.insert(ThresholdState::Defined);
                            break ThresholdState::Defined;
                        }
                        Some(block) => block,
                    };
                    let number = indexer.block_number(block)?;
                    // Every earlier block is below the start height as well,
                    // so the walk can stop here instead of at genesis.
                    if number + 1 < start {
                        entry.insert(ThresholdState::Defined);
                        break ThresholdState::Defined;
                    }
                    to_compute.push(block);
                    walk = match number.checked_sub(period) {
                        Some(target) => Some(indexer.ancestor(block, target)?),
                        None => None,
                    };
                }
            }
        };

        // Walk forward and compute the state of the descendant periods.
        while let Some(block) = to_compute.pop() {
            let number = indexer.block_number(block)?;
            // State is tracked by previous-block, so the height under
            // evaluation is one above the boundary block.
            let height = number + 1;
            let mut next_state = state;

            match state {
                ThresholdState::Defined => {
                    if height >= start {
                        next_state = ThresholdState::Started;
                    }
                }
                ThresholdState::Started => {
                    // We need to count
                    let mut count = 0;
                    let mut cursor = Some(block);
                    for _ in 0..period {
                        let current = cursor?;
                        if self.condition(current, indexer) {
                            count += 1;
                        }
                        cursor = indexer.parent(current);
                    }
                    if count >= threshold {
                        next_state = ThresholdState::LockedIn;
                    } else if lockin_on_timeout && height.saturating_add(period) >= timeout {
                        next_state = ThresholdState::MustSignal;
                    } else if height >= timeout {
                        next_state = ThresholdState::Failed;
                    }
                }
                ThresholdState::MustSignal => {
                    // Always progresses into LockedIn.
                    next_state = ThresholdState::LockedIn;
                }
                ThresholdState::LockedIn => {
                    if height >= min_activation_height {
                        next_state = ThresholdState::Active;
                    }
                }
                ThresholdState::Failed | ThresholdState::Active => {
                    // Nothing happens, these are terminal states.
                }
            }

            state = next_state;
            g_cache.insert(Some(block), state);
        }

        Some(state)
    }

    /// Returns the height of the first block to which the current state
    /// applies.
    fn get_state_since_height<I: VersionbitsIndexer>(
        &self,
        prev: Option<BlockId>,
        cache: &Cache,
        indexer: &I,
    ) -> Option<BlockNumber> {
        if self.start() == ALWAYS_ACTIVE {
            return Some(0);
        }

        let init_state = self.get_state(prev, cache, indexer)?;
        // The genesis block is by definition defined, so the state has
        // applied from the bottom of the chain.
        if init_state == ThresholdState::Defined {
            return Some(0);
        }

        let period = self.period();

        // A non-Defined state implies the period boundary exists.
        let block = prev?;
        let number = indexer.block_number(block)?;
        let target = number.checked_sub((number + 1) % period)?;
        let mut boundary = indexer.ancestor(block, target)?;

        // Walk backwards in strides of one period while the previous period
        // still carried the same state.
        loop {
            let boundary_number = indexer.block_number(boundary)?;
            let previous = match boundary_number.checked_sub(period) {
                Some(target) => indexer.ancestor(boundary, target)?,
                None => break,
            };
            if self.get_state(Some(previous), cache, indexer)? != init_state {
                break;
            }
            boundary = previous;
        }

        let boundary_number = indexer.block_number(boundary)?;
        Some(boundary_number + 1)
    }

    /// Signalling statistics over the period `block` sits in, counted from
    /// the first block of the period up to `block` inclusive.
    ///
    /// Computed without the cache. The raw counts are returned for any state;
    /// `possible` is only meaningful while the state is `Started` or
    /// `MustSignal`.
    fn get_statistics<I: VersionbitsIndexer>(
        &self,
        block: Option<BlockId>,
        indexer: &I,
    ) -> Option<VersionbitsStats> {
        let period = self.period();
        let threshold = self.threshold();

        let mut stats = VersionbitsStats {
            period,
            threshold,
            elapsed: 0,
            count: 0,
            possible: threshold <= period,
        };

        let block = match block {
            Some(block) => block,
            None => return Some(stats),
        };

        let number = indexer.block_number(block)?;
        let elapsed = (number + 1) % period;

        // Count back from `block` to the first block of its period.
        let mut count = 0;
        let mut cursor = Some(block);
        for _ in 0..elapsed {
            let current = cursor?;
            if self.condition(current, indexer) {
                count += 1;
            }
            cursor = indexer.parent(current);
        }

        stats.elapsed = elapsed;
        stats.count = count;
        stats.possible = period - threshold >= elapsed - count;
        Some(stats)
    }
}

/// Versionbits threshold logic for one configured deployment.
pub struct Versionbits<'a> {
    id: DeploymentPos,
    consensus: &'a Consensus,
}

impl<'a> Versionbits<'a> {
    /// Constructs a new Versionbits wrapper.
    pub fn new(id: DeploymentPos, consensus: &'a Consensus) -> Self {
        Versionbits { id, consensus }
    }

    fn deployment(&self) -> &Deployment {
        &self.consensus.deployments[&self.id]
    }

    /// Returns the bit mask corresponding to the deployment.
    pub fn mask(&self) -> Version {
        1u32 << u32::from(self.deployment().bit)
    }
}

impl<'a> VersionbitsConditionChecker for Versionbits<'a> {
    fn start(&self) -> BlockNumber {
        self.deployment().start
    }

    fn timeout(&self) -> BlockNumber {
        self.deployment().timeout
    }

    fn min_activation_height(&self) -> BlockNumber {
        self.deployment().min_activation_height
    }

    fn period(&self) -> BlockNumber {
        self.deployment().period
    }

    fn threshold(&self) -> BlockNumber {
        self.deployment().threshold
    }

    fn lockin_on_timeout(&self) -> bool {
        self.deployment().lockin_on_timeout
    }

    fn condition<I: VersionbitsIndexer>(&self, block: BlockId, indexer: &I) -> bool {
        indexer
            .block_version(block)
            .map(|version| {
                (version & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS
                    && (version & self.mask()) != 0
            })
            .unwrap_or(false)
    }
}
