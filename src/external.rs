//! The two collaborators that sit downstream of a sampled state path: the
//! recombination-position sampler and the ARG splicer. Both are fully
//! external — this crate only declares the contracts it calls through.

use streaming_iterator::DoubleEndedStreamingIterator;

use crate::arg_iterator::ArgBlock;
use crate::local_tree::{LocalTree, NodeId};
use crate::model::Model;
use crate::transition::{SwitchOperator, TransitionOperator};

/// A point on a branch: the node below the point and the time index at
/// which a recombination or recoalescence event occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePoint {
    pub node: NodeId,
    pub time: usize,
}

/// Samples recombination breakpoints consistent with a coalescence-state
/// path, emitting `(position, NodePoint)` pairs the splicer turns into SPR
/// operations.
pub trait RecombinationSampler<Tree: LocalTree, Trans: TransitionOperator, Switch: SwitchOperator> {
    /// `path[i]` is the state index (into that site's `ArgBlock::states`)
    /// chosen by traceback at genomic position `start + i`.
    fn sample_recombinations(
        &mut self,
        model: &Model,
        iter: &mut dyn DoubleEndedStreamingIterator<Item = ArgBlock<Tree, Trans, Switch>>,
        path: &[usize],
        internal: bool,
    ) -> Vec<(i64, NodePoint)>;
}

/// Splices a new lineage into an ARG along a sampled state path and
/// recombination list, or removes a previously threaded chromosome.
pub trait ArgSplicer<Tree: LocalTree, Trans: TransitionOperator, Switch: SwitchOperator> {
    /// External-threading splice: `new_chrom` attaches as a new leaf.
    fn add_arg_thread(
        &mut self,
        model: &Model,
        path: &[usize],
        new_chrom: usize,
        recombs: &[(i64, NodePoint)],
    );

    /// Internal-threading splice: the already-present subtree rooted at
    /// `subtree_root` is regrafted along `path` instead of attaching a new
    /// leaf.
    fn add_arg_thread_path(&mut self, model: &Model, path: &[usize], subtree_root: NodeId, recombs: &[(i64, NodePoint)]);

    /// Detaches `chrom`'s lineage from the ARG, in preparation for
    /// resampling it back in.
    fn remove_arg_thread(&mut self, chrom: usize);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A no-op test double: records calls instead of mutating any ARG
    /// storage, enough to exercise the threading driver's call sequence.
    #[derive(Default)]
    pub struct RecordingSplicer {
        pub added: Vec<(usize, usize)>,
        pub removed: Vec<usize>,
    }

    impl<Tree: LocalTree, Trans: TransitionOperator, Switch: SwitchOperator> ArgSplicer<Tree, Trans, Switch>
        for RecordingSplicer
    {
        fn add_arg_thread(&mut self, _model: &Model, path: &[usize], new_chrom: usize, recombs: &[(i64, NodePoint)]) {
            self.added.push((new_chrom, recombs.len()));
            let _ = path;
        }

        fn add_arg_thread_path(&mut self, _model: &Model, path: &[usize], subtree_root: NodeId, recombs: &[(i64, NodePoint)]) {
            self.added.push((subtree_root as usize, recombs.len()));
            let _ = path;
        }

        fn remove_arg_thread(&mut self, chrom: usize) {
            self.removed.push(chrom);
        }
    }

    #[test]
    fn recording_splicer_tracks_calls() {
        let mut splicer = RecordingSplicer::default();
        let m = Model {
            ntimes: 2,
            times: vec![0.0, 1.0],
            popsizes: vec![1.0],
            rho: 1e-8,
            mu: 1e-8,
            mintime: 1e-6,
            removed_root_time: 1.0,
        };
        ArgSplicer::<crate::local_tree::LocalTreeData, crate::transition::SimpleTransition, crate::transition::SwitchMatrix>::add_arg_thread(
            &mut splicer, &m, &[0, 0], 3, &[],
        );
        splicer.remove_arg_thread(3);
        assert_eq!(splicer.added, vec![(3, 0)]);
        assert_eq!(splicer.removed, vec![3]);
    }
}
