//! The threading driver: orchestrates the coalescence-state enumeration,
//! emission engine, forward engine, and backward traceback over a complete
//! ARG, then hands the sampled coalescence-state path to the external
//! recombination sampler and ARG splicer.
//!
//! A "thread one new chromosome" invocation is, per the design: materialize
//! each raw block's admissible states and emission matrix (the bookkeeping
//! an ARG/SPR walker doesn't do itself), allocate a forward table and path
//! buffer sized to the genome, run forward over every block, traceback
//! (stochastic or Viterbi) honoring any pinned endpoints, sample
//! recombination positions from the path, then splice.

use rand::Rng;
use tracing::info;

use crate::arg_iterator::{ArgBlock, RawBlock, VecArgIterator};
use crate::emission::{calc_emissions_external, calc_emissions_internal};
use crate::error::{Result, ThreadingError};
use crate::external::{ArgSplicer, RecombinationSampler};
use crate::forward::{forward_alg, ForwardTable};
use crate::local_tree::{identity_leaf_row, LocalTree, NodeId, NULL_NODE};
use crate::model::Model;
use crate::sequences::Sequences;
use crate::states::{get_coal_states, CoalState};
use crate::traceback::{stochastic_traceback, viterbi_traceback};
use crate::transition::{SwitchOperator, TransitionOperator};

/// Endpoint conditioning for one threading run: pin the coalescence state
/// at the genome's first and/or last site, or leave either to be
/// sampled/maximized by passing `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointConditioning {
    pub start_state: Option<CoalState>,
    pub end_state: Option<CoalState>,
}

impl EndpointConditioning {
    pub fn none() -> Self {
        EndpointConditioning::default()
    }

    pub fn pin(start_state: CoalState, end_state: CoalState) -> Self {
        EndpointConditioning {
            start_state: Some(start_state),
            end_state: Some(end_state),
        }
    }
}

/// Which collaborator (component A) the driver calls to materialize a raw
/// block's admissible states and emissions: a fresh leaf chromosome being
/// attached (external threading) or an already-present subtree being
/// regrafted (internal threading).
enum ThreadingMode {
    External { new_chrom_row: usize },
    Internal,
}

impl ThreadingMode {
    fn is_internal(&self) -> bool {
        matches!(self, ThreadingMode::Internal)
    }
}

/// Turn one [`RawBlock`] (tree + operators, as an ARG/SPR walker hands it
/// over) into a fully materialized [`ArgBlock`] by running component A:
/// enumerate the block's admissible coalescence states, then compute its
/// emission matrix under `mode`.
fn materialize_block<Tree, Trans, Switch, S>(
    model: &Model,
    mode: &ThreadingMode,
    sequences: &S,
    raw: RawBlock<Tree, Trans, Switch>,
) -> ArgBlock<Tree, Trans, Switch>
where
    Tree: LocalTree,
    Trans: TransitionOperator,
    Switch: SwitchOperator,
    S: Sequences,
{
    let mut local_model = model.clone();
    model.get_local_model(raw.block_start, &mut local_model);

    let internal = mode.is_internal();
    let subtree_root = if internal { raw.tree.subtree_root() } else { NULL_NODE };
    let minage = local_model.min_time_index();
    let removed_root_ceiling = internal.then(|| local_model.removed_root_age_index());

    let states = get_coal_states(&raw.tree, local_model.ntimes, minage, internal, subtree_root, removed_root_ceiling);

    let block_start = raw.block_start.max(0) as usize;
    let emit = match mode {
        ThreadingMode::External { new_chrom_row } => calc_emissions_external(
            &raw.tree,
            &states,
            sequences,
            &identity_leaf_row,
            *new_chrom_row,
            &local_model,
            block_start,
            raw.block_len,
            false,
        ),
        ThreadingMode::Internal => calc_emissions_internal(
            &raw.tree,
            &states,
            sequences,
            &identity_leaf_row,
            subtree_root,
            raw.tree.maintree_root(),
            &local_model,
            block_start,
            raw.block_len,
        ),
    };

    ArgBlock {
        block_start: raw.block_start,
        block_len: raw.block_len,
        tree: raw.tree,
        states,
        minage,
        transition: raw.transition,
        switch: raw.switch,
        emit,
    }
}

fn materialize_blocks<Tree, Trans, Switch, S>(
    model: &Model,
    mode: &ThreadingMode,
    sequences: &S,
    raw_blocks: Vec<RawBlock<Tree, Trans, Switch>>,
) -> Vec<ArgBlock<Tree, Trans, Switch>>
where
    Tree: LocalTree,
    Trans: TransitionOperator,
    Switch: SwitchOperator,
    S: Sequences,
{
    raw_blocks.into_iter().map(|raw| materialize_block(model, mode, sequences, raw)).collect()
}

/// Locate a pinned coalescence state among a block's enumerated states, or
/// fail with [`ThreadingError::StateNotFound`] — the caller mis-specified
/// conditioning.
fn locate_pinned_state<Tree, Trans, Switch>(block: &ArgBlock<Tree, Trans, Switch>, state: CoalState) -> Result<usize>
where
    Tree: LocalTree,
    Trans: TransitionOperator,
    Switch: SwitchOperator,
{
    block.states.find(state).ok_or(ThreadingError::StateNotFound {
        state: (state.node, state.time),
    })
}

/// One-hot prior over `states.len()` entries at `idx`, or `None` when no
/// start state was pinned (falls back to the transition operator's own
/// state prior).
fn pinned_prior<Tree, Trans, Switch>(
    blocks: &[ArgBlock<Tree, Trans, Switch>],
    start_state: Option<CoalState>,
) -> Result<Option<Vec<f64>>>
where
    Tree: LocalTree,
    Trans: TransitionOperator,
    Switch: SwitchOperator,
{
    let Some(state) = start_state else {
        return Ok(None);
    };
    let first = blocks.first().expect("threading a chromosome requires at least one block");
    let idx = locate_pinned_state(first, state)?;
    let mut prior = vec![0.0; first.states.len().max(1)];
    if !first.states.is_empty() {
        prior[idx] = 1.0;
    }
    Ok(Some(prior))
}

fn genome_extent<Tree, Trans, Switch>(blocks: &[ArgBlock<Tree, Trans, Switch>]) -> (i64, usize)
where
    Tree: LocalTree,
    Trans: TransitionOperator,
    Switch: SwitchOperator,
{
    let start = blocks.first().map(|b| b.block_start).unwrap_or(0);
    let len = blocks.iter().map(|b| b.block_len).sum();
    (start, len)
}

/// Orchestrates components C-D over a fully materialized ARG (one
/// [`ArgBlock`] per genomic block, in order). The blocks are cloned
/// internally once for the forward pass and once for the backward pass,
/// since the forward pass must complete (and its table must outlive) the
/// whole backward pass (see the design's concurrency model), and both
/// passes need their own cursor over the same block data.
pub struct ThreadingDriver;

impl ThreadingDriver {
    /// Run the forward pass over `blocks`, seeding the first column from
    /// `start_state` if pinned, otherwise from the transition operator's
    /// state prior. Returns the filled table.
    pub fn forward<Tree, Trans, Switch>(
        blocks: &[ArgBlock<Tree, Trans, Switch>],
        start_state: Option<CoalState>,
    ) -> Result<ForwardTable>
    where
        Tree: LocalTree + Clone,
        Trans: TransitionOperator + Clone,
        Switch: SwitchOperator + Clone,
    {
        let (start, len) = genome_extent(blocks);
        let prior = pinned_prior(blocks, start_state)?;
        let mut table = ForwardTable::new(start, len);
        let mut iter = VecArgIterator::new(blocks.to_vec());
        info!(start, len, "running forward pass");
        forward_alg(&mut iter, &mut table, prior.as_deref())?;
        Ok(table)
    }

    /// Sample a coalescence-state path by stochastic traceback over an
    /// already-filled `table`, honoring `end_state` if pinned. Returns the
    /// path and the traceback's log-likelihood proxy.
    pub fn sample_path<Tree, Trans, Switch>(
        blocks: &[ArgBlock<Tree, Trans, Switch>],
        table: &ForwardTable,
        end_state: Option<CoalState>,
        rng: &mut impl Rng,
    ) -> Result<(Vec<usize>, f64)>
    where
        Tree: LocalTree + Clone,
        Trans: TransitionOperator + Clone,
        Switch: SwitchOperator + Clone,
    {
        let last_state_given = match end_state {
            Some(state) => {
                let last = blocks.last().expect("threading a chromosome requires at least one block");
                Some(locate_pinned_state(last, state)?)
            }
            None => None,
        };
        let mut path = vec![0usize; table.len()];
        let mut iter = VecArgIterator::new(blocks.to_vec());
        let lnl = stochastic_traceback(&mut iter, table, &mut path, last_state_given, rng)?;
        Ok((path, lnl))
    }

    /// Maximize the coalescence-state path by Viterbi over an
    /// already-filled `table`, honoring `end_state` if pinned.
    pub fn max_path<Tree, Trans, Switch>(
        blocks: &[ArgBlock<Tree, Trans, Switch>],
        table: &ForwardTable,
        end_state: Option<CoalState>,
    ) -> Result<Vec<usize>>
    where
        Tree: LocalTree + Clone,
        Trans: TransitionOperator + Clone,
        Switch: SwitchOperator + Clone,
    {
        let last_state_given = match end_state {
            Some(state) => {
                let last = blocks.last().expect("threading a chromosome requires at least one block");
                Some(locate_pinned_state(last, state)?)
            }
            None => None,
        };
        let mut path = vec![0usize; table.len()];
        let mut iter = VecArgIterator::new(blocks.to_vec());
        viterbi_traceback(&mut iter, table, &mut path, last_state_given)?;
        Ok(path)
    }
}

/// `sample_arg_thread`: thread a new leaf chromosome into the ARG by
/// stochastic sampling, with no endpoint pinned. Returns the traceback's
/// log-likelihood proxy.
#[allow(clippy::too_many_arguments)]
pub fn sample_arg_thread<Tree, Trans, Switch, S, Samp, Splice>(
    model: &Model,
    sequences: &S,
    raw_blocks: Vec<RawBlock<Tree, Trans, Switch>>,
    new_chrom: usize,
    rng: &mut impl Rng,
    recomb_sampler: &mut Samp,
    splicer: &mut Splice,
) -> Result<f64>
where
    Tree: LocalTree + Clone,
    Trans: TransitionOperator + Clone,
    Switch: SwitchOperator + Clone,
    S: Sequences,
    Samp: RecombinationSampler<Tree, Trans, Switch>,
    Splice: ArgSplicer<Tree, Trans, Switch>,
{
    cond_sample_arg_thread(
        model,
        sequences,
        raw_blocks,
        new_chrom,
        EndpointConditioning::none(),
        rng,
        recomb_sampler,
        splicer,
    )
}

/// `cond_sample_arg_thread`: as [`sample_arg_thread`], but with the path's
/// start and/or end coalescence state pinned (used by conditional
/// resampling).
#[allow(clippy::too_many_arguments)]
pub fn cond_sample_arg_thread<Tree, Trans, Switch, S, Samp, Splice>(
    model: &Model,
    sequences: &S,
    raw_blocks: Vec<RawBlock<Tree, Trans, Switch>>,
    new_chrom: usize,
    conditioning: EndpointConditioning,
    rng: &mut impl Rng,
    recomb_sampler: &mut Samp,
    splicer: &mut Splice,
) -> Result<f64>
where
    Tree: LocalTree + Clone,
    Trans: TransitionOperator + Clone,
    Switch: SwitchOperator + Clone,
    S: Sequences,
    Samp: RecombinationSampler<Tree, Trans, Switch>,
    Splice: ArgSplicer<Tree, Trans, Switch>,
{
    let blocks = materialize_blocks(model, &ThreadingMode::External { new_chrom_row: new_chrom }, sequences, raw_blocks);
    let table = ThreadingDriver::forward(&blocks, conditioning.start_state)?;
    let (path, lnl) = ThreadingDriver::sample_path(&blocks, &table, conditioning.end_state, rng)?;
    let mut iter = VecArgIterator::new(blocks);
    let recombs = recomb_sampler.sample_recombinations(model, &mut iter, &path, false);
    splicer.add_arg_thread(model, &path, new_chrom, &recombs);
    Ok(lnl)
}

/// `max_arg_thread`: thread a new leaf chromosome into the ARG by Viterbi
/// maximization, with no endpoint pinned.
pub fn max_arg_thread<Tree, Trans, Switch, S, Samp, Splice>(
    model: &Model,
    sequences: &S,
    raw_blocks: Vec<RawBlock<Tree, Trans, Switch>>,
    new_chrom: usize,
    recomb_sampler: &mut Samp,
    splicer: &mut Splice,
) -> Result<()>
where
    Tree: LocalTree + Clone,
    Trans: TransitionOperator + Clone,
    Switch: SwitchOperator + Clone,
    S: Sequences,
    Samp: RecombinationSampler<Tree, Trans, Switch>,
    Splice: ArgSplicer<Tree, Trans, Switch>,
{
    let blocks = materialize_blocks(model, &ThreadingMode::External { new_chrom_row: new_chrom }, sequences, raw_blocks);
    let table = ThreadingDriver::forward(&blocks, None)?;
    let path = ThreadingDriver::max_path(&blocks, &table, None)?;
    let mut iter = VecArgIterator::new(blocks);
    let recombs = recomb_sampler.sample_recombinations(model, &mut iter, &path, false);
    splicer.add_arg_thread(model, &path, new_chrom, &recombs);
    Ok(())
}

/// `resample_arg_thread`: detach `chrom` from the ARG, then thread it back
/// in with the standard stochastic driver.
pub fn resample_arg_thread<Tree, Trans, Switch, S, Samp, Splice>(
    model: &Model,
    sequences: &S,
    raw_blocks: Vec<RawBlock<Tree, Trans, Switch>>,
    chrom: usize,
    rng: &mut impl Rng,
    recomb_sampler: &mut Samp,
    splicer: &mut Splice,
) -> Result<f64>
where
    Tree: LocalTree + Clone,
    Trans: TransitionOperator + Clone,
    Switch: SwitchOperator + Clone,
    S: Sequences,
    Samp: RecombinationSampler<Tree, Trans, Switch>,
    Splice: ArgSplicer<Tree, Trans, Switch>,
{
    splicer.remove_arg_thread(chrom);
    sample_arg_thread(model, sequences, raw_blocks, chrom, rng, recomb_sampler, splicer)
}

/// `sample_arg_thread` / internal-branch variant: the new lineage is an
/// already-present subtree (rooted at `subtree_root`) being regrafted,
/// not a fresh leaf. Spliced back in via
/// [`ArgSplicer::add_arg_thread_path`] instead of `add_arg_thread`.
pub fn sample_arg_thread_internal<Tree, Trans, Switch, S, Samp, Splice>(
    model: &Model,
    sequences: &S,
    raw_blocks: Vec<RawBlock<Tree, Trans, Switch>>,
    subtree_root: NodeId,
    rng: &mut impl Rng,
    recomb_sampler: &mut Samp,
    splicer: &mut Splice,
) -> Result<f64>
where
    Tree: LocalTree + Clone,
    Trans: TransitionOperator + Clone,
    Switch: SwitchOperator + Clone,
    S: Sequences,
    Samp: RecombinationSampler<Tree, Trans, Switch>,
    Splice: ArgSplicer<Tree, Trans, Switch>,
{
    cond_sample_arg_thread_internal(
        model,
        sequences,
        raw_blocks,
        subtree_root,
        EndpointConditioning::none(),
        rng,
        recomb_sampler,
        splicer,
    )
}

/// `cond_sample_arg_thread` / internal-branch variant.
#[allow(clippy::too_many_arguments)]
pub fn cond_sample_arg_thread_internal<Tree, Trans, Switch, S, Samp, Splice>(
    model: &Model,
    sequences: &S,
    raw_blocks: Vec<RawBlock<Tree, Trans, Switch>>,
    subtree_root: NodeId,
    conditioning: EndpointConditioning,
    rng: &mut impl Rng,
    recomb_sampler: &mut Samp,
    splicer: &mut Splice,
) -> Result<f64>
where
    Tree: LocalTree + Clone,
    Trans: TransitionOperator + Clone,
    Switch: SwitchOperator + Clone,
    S: Sequences,
    Samp: RecombinationSampler<Tree, Trans, Switch>,
    Splice: ArgSplicer<Tree, Trans, Switch>,
{
    let blocks = materialize_blocks(model, &ThreadingMode::Internal, sequences, raw_blocks);
    let table = ThreadingDriver::forward(&blocks, conditioning.start_state)?;
    let (path, lnl) = ThreadingDriver::sample_path(&blocks, &table, conditioning.end_state, rng)?;
    let mut iter = VecArgIterator::new(blocks);
    let recombs = recomb_sampler.sample_recombinations(model, &mut iter, &path, true);
    splicer.add_arg_thread_path(model, &path, subtree_root, &recombs);
    Ok(lnl)
}

/// `max_arg_thread` / internal-branch variant.
pub fn max_arg_thread_internal<Tree, Trans, Switch, S, Samp, Splice>(
    model: &Model,
    sequences: &S,
    raw_blocks: Vec<RawBlock<Tree, Trans, Switch>>,
    subtree_root: NodeId,
    recomb_sampler: &mut Samp,
    splicer: &mut Splice,
) -> Result<()>
where
    Tree: LocalTree + Clone,
    Trans: TransitionOperator + Clone,
    Switch: SwitchOperator + Clone,
    S: Sequences,
    Samp: RecombinationSampler<Tree, Trans, Switch>,
    Splice: ArgSplicer<Tree, Trans, Switch>,
{
    let blocks = materialize_blocks(model, &ThreadingMode::Internal, sequences, raw_blocks);
    let table = ThreadingDriver::forward(&blocks, None)?;
    let path = ThreadingDriver::max_path(&blocks, &table, None)?;
    let mut iter = VecArgIterator::new(blocks);
    let recombs = recomb_sampler.sample_recombinations(model, &mut iter, &path, true);
    splicer.add_arg_thread_path(model, &path, subtree_root, &recombs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::tests::RecordingSplicer;
    use crate::local_tree::{LocalTreeData, Node, NULL_NODE};
    use crate::sequences::VecSequences;
    use crate::transition::{SimpleTransition, SwitchMatrix};
    use rand::SeedableRng;
    use streaming_iterator::DoubleEndedStreamingIterator;

    fn two_leaf_tree() -> LocalTreeData {
        LocalTreeData::new(
            vec![
                Node { parent: 2, child: [NULL_NODE, NULL_NODE], age: 0 },
                Node { parent: 2, child: [NULL_NODE, NULL_NODE], age: 0 },
                Node { parent: NULL_NODE, child: [0, 1], age: 1 },
            ],
            2,
        )
    }

    fn single_raw_block(len: usize) -> Vec<RawBlock<LocalTreeData, SimpleTransition, SwitchMatrix>> {
        vec![RawBlock {
            block_start: 0,
            block_len: len,
            tree: two_leaf_tree(),
            transition: SimpleTransition::new(4, 0.5, 0.2),
            switch: None,
        }]
    }

    fn sequences(len: usize) -> VecSequences {
        // Leaves 0,1 plus the new chromosome at row 2, all identical so the
        // invariant-site shortcut applies and every state gets a comparable
        // emission.
        VecSequences::from_strings(&["A".repeat(len), "A".repeat(len), "A".repeat(len)]).unwrap()
    }

    struct NoopRecombSampler;
    impl RecombinationSampler<LocalTreeData, SimpleTransition, SwitchMatrix> for NoopRecombSampler {
        fn sample_recombinations(
            &mut self,
            _model: &Model,
            iter: &mut dyn DoubleEndedStreamingIterator<Item = ArgBlock<LocalTreeData, SimpleTransition, SwitchMatrix>>,
            _path: &[usize],
            _internal: bool,
        ) -> Vec<(i64, crate::external::NodePoint)> {
            let mut n = 0;
            while iter.next().is_some() {
                n += 1;
            }
            assert!(n > 0, "driver must hand the recombination sampler a non-empty block sequence");
            Vec::new()
        }
    }

    fn model() -> Model {
        Model {
            ntimes: 4,
            times: vec![0.0, 10.0, 20.0, 30.0],
            popsizes: vec![1e4; 3],
            rho: 1e-8,
            mu: 1e-8,
            mintime: 1e-6,
            removed_root_time: 30.0,
        }
    }

    #[test]
    fn sample_arg_thread_splices_and_returns_finite_lnl() {
        let raw_blocks = single_raw_block(3);
        let m = model();
        let seqs = sequences(3);
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let mut samp = NoopRecombSampler;
        let mut splicer = RecordingSplicer::default();
        let lnl = sample_arg_thread(&m, &seqs, raw_blocks, 2, &mut rng, &mut samp, &mut splicer).unwrap();
        assert!(lnl.is_finite());
        assert_eq!(splicer.added, vec![(2, 0)]);
    }

    #[test]
    fn max_arg_thread_splices_without_rng() {
        let raw_blocks = single_raw_block(3);
        let m = model();
        let seqs = sequences(3);
        let mut samp = NoopRecombSampler;
        let mut splicer = RecordingSplicer::default();
        max_arg_thread(&m, &seqs, raw_blocks, 5, &mut samp, &mut splicer).unwrap();
        assert_eq!(splicer.added, vec![(5, 0)]);
    }

    #[test]
    fn cond_sample_arg_thread_pins_start_state() {
        let raw_blocks = single_raw_block(3);
        let m = model();
        let seqs = sequences(3);
        let tree = two_leaf_tree();
        let states = get_coal_states(&tree, m.ntimes, m.min_time_index(), false, NULL_NODE, None);
        let pinned = states.get(0);
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let mut samp = NoopRecombSampler;
        let mut splicer = RecordingSplicer::default();
        let conditioning = EndpointConditioning {
            start_state: Some(pinned),
            end_state: None,
        };
        let lnl =
            cond_sample_arg_thread(&m, &seqs, raw_blocks, 9, conditioning, &mut rng, &mut samp, &mut splicer).unwrap();
        assert!(lnl.is_finite());
    }

    #[test]
    fn cond_sample_arg_thread_rejects_unknown_pinned_state() {
        let raw_blocks = single_raw_block(3);
        let m = model();
        let seqs = sequences(3);
        let bogus = CoalState { node: 99, time: 0 };
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let mut samp = NoopRecombSampler;
        let mut splicer = RecordingSplicer::default();
        let conditioning = EndpointConditioning {
            start_state: Some(bogus),
            end_state: None,
        };
        let err =
            cond_sample_arg_thread(&m, &seqs, raw_blocks, 9, conditioning, &mut rng, &mut samp, &mut splicer).unwrap_err();
        assert!(matches!(err, ThreadingError::StateNotFound { .. }));
    }

    #[test]
    fn resample_arg_thread_removes_then_rethreads() {
        let raw_blocks = single_raw_block(3);
        let m = model();
        let seqs = sequences(3);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut samp = NoopRecombSampler;
        let mut splicer = RecordingSplicer::default();
        resample_arg_thread(&m, &seqs, raw_blocks, 7, &mut rng, &mut samp, &mut splicer).unwrap();
        assert_eq!(splicer.removed, vec![7]);
        assert_eq!(splicer.added, vec![(7, 0)]);
    }
}
