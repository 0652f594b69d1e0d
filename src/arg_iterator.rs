//! The ARG iterator collaborator: yields genomic blocks in order, and
//! supports reverse iteration for backward traceback.
//!
//! Mirrors the crate's own streaming-iterator-over-trees idiom: the
//! iterator owns the tree/operators/emissions for the block currently under
//! the cursor, and callers must not retain references past the next
//! `advance`/`advance_back` call.

use bitflags::bitflags;
use streaming_iterator::{DoubleEndedStreamingIterator, StreamingIterator};

use crate::local_tree::LocalTree;
use crate::states::States;
use crate::transition::{SwitchOperator, TransitionOperator};

bitflags! {
    /// Cheap per-block diagnostic bits, surfaced to `tracing` at block
    /// entry instead of threading several separate booleans through the
    /// log call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        /// This is the first block the iterator yields (no switch operator
        /// is expected, per the ARG iterator contract).
        const FIRST        = 1 << 0;
        /// A switch operator to the previous block is present.
        const HAS_SWITCH   = 1 << 1;
        /// The block's state set is empty (the degenerate one-state case).
        const DEGENERATE   = 1 << 2;
    }
}

/// One genomic block: a local tree, its admissible coalescence states, the
/// within-block transition operator, an optional switch operator to the
/// *previous* block (`None` only for the first block the iterator yields),
/// and the precomputed emission matrix (`block_len` rows by `states.len()`
/// columns).
#[derive(Clone)]
pub struct ArgBlock<Tree: LocalTree, Trans: TransitionOperator, Switch: SwitchOperator> {
    pub block_start: i64,
    pub block_len: usize,
    pub tree: Tree,
    pub states: States,
    pub minage: usize,
    pub transition: Trans,
    pub switch: Option<Switch>,
    /// `emit[site_offset][state]`.
    pub emit: Vec<Vec<f64>>,
}

impl<Tree: LocalTree, Trans: TransitionOperator, Switch: SwitchOperator> ArgBlock<Tree, Trans, Switch> {
    /// Diagnostic flags for this block. Does not set [`BlockFlags::FIRST`]
    /// — only the iterator driving this block knows its position in the
    /// sequence, so callers OR that bit in separately when it applies.
    pub fn flags(&self) -> BlockFlags {
        let mut flags = BlockFlags::empty();
        if self.switch.is_some() {
            flags |= BlockFlags::HAS_SWITCH;
        }
        if self.states.is_empty() {
            flags |= BlockFlags::DEGENERATE;
        }
        flags
    }
}

/// One genomic block as handed to the driver by an ARG/SPR walker: a local
/// tree and the within-block/switch operators, but no admissible-state
/// enumeration or emission matrix yet. The driver materializes those two
/// (component A) before running the forward/backward engines (components
/// C/D) — see `driver::materialize_block`.
#[derive(Clone)]
pub struct RawBlock<Tree: LocalTree, Trans: TransitionOperator, Switch: SwitchOperator> {
    pub block_start: i64,
    pub block_len: usize,
    pub tree: Tree,
    pub transition: Trans,
    pub switch: Option<Switch>,
}

/// A `Vec`-backed double-ended [`ArgBlock`] cursor.
///
/// Not a claim about how a production ARG/SPR store is organized (that
/// storage, and the SPR bookkeeping between blocks, is this trait's entire
/// reason for being an external collaborator) — a concrete, simple
/// implementation for exercising the forward/backward engines and for
/// callers who already have their blocks materialized.
pub struct VecArgIterator<Tree: LocalTree, Trans: TransitionOperator, Switch: SwitchOperator> {
    blocks: Vec<ArgBlock<Tree, Trans, Switch>>,
    /// Half-open range `[front, back)` of not-yet-yielded blocks.
    front: usize,
    back: usize,
    /// Index last handed out by `advance`/`advance_back`, if any.
    current: Option<usize>,
}

impl<Tree: LocalTree, Trans: TransitionOperator, Switch: SwitchOperator> VecArgIterator<Tree, Trans, Switch> {
    pub fn new(blocks: Vec<ArgBlock<Tree, Trans, Switch>>) -> Self {
        let back = blocks.len();
        VecArgIterator {
            blocks,
            front: 0,
            back,
            current: None,
        }
    }
}

impl<Tree: LocalTree, Trans: TransitionOperator, Switch: SwitchOperator> StreamingIterator
    for VecArgIterator<Tree, Trans, Switch>
{
    type Item = ArgBlock<Tree, Trans, Switch>;

    fn advance(&mut self) {
        if self.front < self.back {
            self.current = Some(self.front);
            self.front += 1;
        } else {
            self.current = None;
        }
    }

    fn get(&self) -> Option<&Self::Item> {
        self.current.map(|i| &self.blocks[i])
    }
}

impl<Tree: LocalTree, Trans: TransitionOperator, Switch: SwitchOperator> DoubleEndedStreamingIterator
    for VecArgIterator<Tree, Trans, Switch>
{
    fn advance_back(&mut self) {
        if self.front < self.back {
            self.back -= 1;
            self.current = Some(self.back);
        } else {
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_tree::{LocalTreeData, Node, NULL_NODE};
    use crate::states::get_coal_states;
    use crate::transition::{SimpleTransition, SwitchMatrix};

    fn one_leaf_block(block_start: i64, block_len: usize) -> ArgBlock<LocalTreeData, SimpleTransition, SwitchMatrix> {
        let tree = LocalTreeData::new(
            vec![
                Node { parent: 1, child: [NULL_NODE, NULL_NODE], age: 0 },
                Node { parent: NULL_NODE, child: [0, NULL_NODE], age: 1 },
            ],
            1,
        );
        let states = get_coal_states(&tree, 3, 0, false, NULL_NODE, None);
        let n = states.len();
        ArgBlock {
            block_start,
            block_len,
            tree,
            states,
            minage: 0,
            transition: SimpleTransition::new(3, 0.5, 0.1),
            switch: None,
            emit: vec![vec![1.0; n]; block_len],
        }
    }

    #[test]
    fn forward_then_backward_visits_every_block_once() {
        let blocks = vec![one_leaf_block(0, 2), one_leaf_block(2, 3)];
        let mut it = VecArgIterator::new(blocks);
        let mut starts = Vec::new();
        while let Some(b) = it.next() {
            starts.push(b.block_start);
        }
        assert_eq!(starts, vec![0, 2]);

        let blocks = vec![one_leaf_block(0, 2), one_leaf_block(2, 3)];
        let mut it = VecArgIterator::new(blocks);
        let mut starts = Vec::new();
        while let Some(b) = it.next_back() {
            starts.push(b.block_start);
        }
        assert_eq!(starts, vec![2, 0]);
    }
}
