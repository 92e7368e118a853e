use crate::core::{BlockNumber, Version};

/// Stable handle to a block record inside a [`HeaderChain`].
///
/// A handle is only meaningful for the chain that minted it and stays valid
/// for the whole lifetime of that chain; records are never moved or dropped.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BlockId(u32);

#[derive(Copy, Clone, Debug)]
struct HeaderRecord {
    number: BlockNumber,
    version: Version,
    parent: Option<BlockId>,
    skip: Option<BlockId>,
}

/// Append-only arena of block headers forming a tree rooted at genesis.
///
/// Besides its parent link, every record keeps a skip link to a farther
/// ancestor, so [`HeaderChain::ancestor`] runs in O(log n) instead of walking
/// every parent. Forks are representable; `insert` accepts any stored block
/// as parent.
#[derive(Clone, Debug, Default)]
pub struct HeaderChain {
    records: Vec<HeaderRecord>,
}

/// Height the skip link of a block at `height` points to.
///
/// Clearing the lowest set bits of the height yields link lengths that
/// roughly double at each hop back, which keeps ancestor walks logarithmic.
fn skip_height(height: BlockNumber) -> BlockNumber {
    if height < 2 {
        return 0;
    }

    let invert_lowest_one = |n: BlockNumber| n & (n - 1);

    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height)) + 1
    } else {
        invert_lowest_one(height)
    }
}

impl HeaderChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        HeaderChain::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no block has been inserted yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends a block under `parent` and returns its handle.
    ///
    /// `parent == None` starts a tree at height 0. The skip link is resolved
    /// here, while the whole parent chain is already indexed.
    pub fn insert(&mut self, parent: Option<BlockId>, version: Version) -> BlockId {
        let number = parent
            .and_then(|block| self.number(block))
            .map(|number| number + 1)
            .unwrap_or(0);
        let skip = parent.and_then(|block| self.ancestor(block, skip_height(number)));
        let id = BlockId(self.records.len() as u32);
        self.records.push(HeaderRecord {
            number,
            version,
            parent,
            skip,
        });
        id
    }

    /// Height of `block`.
    pub fn number(&self, block: BlockId) -> Option<BlockNumber> {
        self.records.get(block.0 as usize).map(|record| record.number)
    }

    /// Header version of `block`.
    pub fn version(&self, block: BlockId) -> Option<Version> {
        self.records
            .get(block.0 as usize)
            .map(|record| record.version)
    }

    /// Parent of `block`, `None` for a height-0 block.
    pub fn parent(&self, block: BlockId) -> Option<BlockId> {
        self.records
            .get(block.0 as usize)
            .and_then(|record| record.parent)
    }

    fn skip(&self, block: BlockId) -> Option<BlockId> {
        self.records
            .get(block.0 as usize)
            .and_then(|record| record.skip)
    }

    /// Ancestor of `block` at height `target`, or `None` if `target` lies
    /// above the block.
    pub fn ancestor(&self, block: BlockId, target: BlockNumber) -> Option<BlockId> {
        let mut walk = block;
        let mut number = self.number(walk)?;
        if target > number {
            return None;
        }

        while number > target {
            let height_skip = skip_height(number);
            let height_skip_prev = skip_height(number - 1);
            match self.skip(walk) {
                // Follow the skip link unless the parent's own skip link
                // would land us deep enough while staying closer to target.
                Some(skip)
                    if height_skip == target
                        || (height_skip > target
                            && !(height_skip_prev + 2 < height_skip
                                && height_skip_prev >= target)) =>
                {
                    walk = skip;
                    number = height_skip;
                }
                _ => {
                    walk = self.parent(walk)?;
                    number -= 1;
                }
            }
        }

        Some(walk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn build_chain(len: usize) -> (HeaderChain, Vec<BlockId>) {
        let mut chain = HeaderChain::new();
        let mut ids = Vec::with_capacity(len);
        let mut parent = None;
        for _ in 0..len {
            let id = chain.insert(parent, 0);
            ids.push(id);
            parent = Some(id);
        }
        (chain, ids)
    }

    fn naive_ancestor(
        chain: &HeaderChain,
        block: BlockId,
        target: BlockNumber,
    ) -> Option<BlockId> {
        let mut number = chain.number(block)?;
        if target > number {
            return None;
        }
        let mut walk = block;
        while number > target {
            walk = chain.parent(walk)?;
            number -= 1;
        }
        Some(walk)
    }

    #[test]
    fn insert_assigns_consecutive_numbers() {
        let (chain, ids) = build_chain(5);
        for (expected, id) in ids.iter().enumerate() {
            assert_eq!(chain.number(*id), Some(expected as BlockNumber));
        }
        assert_eq!(chain.parent(ids[0]), None);
        assert_eq!(chain.parent(ids[3]), Some(ids[2]));
        assert_eq!(chain.len(), 5);
    }

    #[test]
    fn ancestor_identity_and_bounds() {
        let (chain, ids) = build_chain(10);
        let tip = ids[9];
        assert_eq!(chain.ancestor(tip, 9), Some(tip));
        assert_eq!(chain.ancestor(tip, 0), Some(ids[0]));
        assert_eq!(chain.ancestor(tip, 4), Some(ids[4]));
        assert_eq!(chain.ancestor(tip, 10), None);
        assert_eq!(chain.ancestor(ids[0], 0), Some(ids[0]));
    }

    #[test]
    fn ancestor_stays_on_its_branch() {
        let mut chain = HeaderChain::new();
        let genesis = chain.insert(None, 0);
        let a1 = chain.insert(Some(genesis), 1);
        let b1 = chain.insert(Some(genesis), 2);
        let mut a_tip = a1;
        let mut b_tip = b1;
        for _ in 0..20 {
            a_tip = chain.insert(Some(a_tip), 1);
            b_tip = chain.insert(Some(b_tip), 2);
        }
        assert_eq!(chain.ancestor(a_tip, 1), Some(a1));
        assert_eq!(chain.ancestor(b_tip, 1), Some(b1));
        assert_eq!(chain.ancestor(a_tip, 0), Some(genesis));
        assert_eq!(chain.ancestor(b_tip, 0), Some(genesis));
    }

    proptest! {
        #[test]
        fn ancestor_matches_parent_walk(
            len in 1usize..300,
            queries in proptest::collection::vec(
                (any::<prop::sample::Index>(), any::<prop::sample::Index>()),
                1..32,
            ),
        ) {
            let (chain, ids) = build_chain(len);
            for (from, to) in queries {
                let from = ids[from.index(len)];
                let target = to.index(len) as BlockNumber;
                prop_assert_eq!(
                    chain.ancestor(from, target),
                    naive_ancestor(&chain, from, target)
                );
            }
        }
    }
}
