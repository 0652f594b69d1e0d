//! The forward engine: column-by-column HMM forward pass over an ARG,
//! normalized per site, block-wise with a switch step at block boundaries.

use streaming_iterator::StreamingIterator;
use tracing::{error, trace};

use crate::arg_iterator::ArgBlock;
use crate::error::{Result, ThreadingError};
use crate::local_tree::LocalTree;
use crate::states::States;
use crate::transition::{SwitchOperator, TransitionOperator};

/// The forward table: one column per genomic site, indexed relative to the
/// ARG's start coordinate. Owned by the driver; grows block-by-block as the
/// forward pass advances and is read-only during the backward pass.
#[derive(Debug, Clone, Default)]
pub struct ForwardTable {
    start: i64,
    columns: Vec<Vec<f64>>,
}

impl ForwardTable {
    /// Allocate an empty table of `len` sites starting at `start`.
    pub fn new(start: i64, len: usize) -> Self {
        ForwardTable {
            start,
            columns: vec![Vec::new(); len],
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn get(&self, site: i64) -> &[f64] {
        &self.columns[(site - self.start) as usize]
    }

    pub fn set(&mut self, site: i64, col: Vec<f64>) {
        self.columns[(site - self.start) as usize] = col;
    }
}

/// Normalize `col` in place so it sums to 1; fail if its mass is not
/// strictly positive (a degenerate column).
pub fn normalize_column(col: &mut [f64], site: i64, last_good_site: Option<i64>) -> Result<()> {
    let sum: f64 = col.iter().sum();
    let max = col.iter().cloned().fold(0.0_f64, f64::max);
    if !(max > 0.0) || !sum.is_finite() {
        error!(site, ?last_good_site, "degenerate forward column");
        return Err(ThreadingError::DegenerateColumn { site, last_good_site });
    }
    trace!(site, scale = sum, "normalized forward column");
    for v in col.iter_mut() {
        *v /= sum;
    }
    Ok(())
}

/// The degenerate one-state column used when a block's state set is empty
/// (a fully specified internal-threading subtree has nowhere else to go).
pub fn degenerate_column() -> Vec<f64> {
    vec![1.0]
}

/// The initial column for the very first block: the caller-supplied prior if
/// given, otherwise the transition operator's own state prior, multiplied by
/// the block's first emission column and normalized.
pub fn initial_column(
    states: &States,
    trans: &impl TransitionOperator,
    prior: Option<&[f64]>,
    emit_col: &[f64],
    site: i64,
) -> Result<Vec<f64>> {
    if states.is_empty() {
        return Ok(degenerate_column());
    }
    let mut col: Vec<f64> = match prior {
        Some(p) => p.to_vec(),
        None => trans.state_prior(states),
    };
    for (v, e) in col.iter_mut().zip(emit_col.iter()) {
        *v *= e;
    }
    normalize_column(&mut col, site, None)?;
    Ok(col)
}

/// One within-block factored column step: group-sum over source times,
/// time-only contraction, same-branch correction, multiply by emission,
/// normalize.
pub fn within_block_column(
    col1: &[f64],
    states: &States,
    trans: &impl TransitionOperator,
    emit_col: &[f64],
    minage: usize,
    site: i64,
    last_good_site: Option<i64>,
) -> Result<Vec<f64>> {
    if states.is_empty() {
        return Ok(degenerate_column());
    }
    let ntimes = trans.ntimes();

    let mut fg = vec![0.0; ntimes];
    for (j, s) in states.as_slice().iter().enumerate() {
        fg[s.time] += col1[j];
    }

    let mut tfg = vec![0.0; ntimes];
    for (b, slot) in tfg.iter_mut().enumerate() {
        *slot = (0..ntimes).map(|a| trans.time_only(a, b) * fg[a]).sum();
    }

    let mut col2 = vec![0.0; states.len()];
    for (k, s) in states.as_slice().iter().enumerate() {
        let mut val = tfg[s.time];
        if let Some(start) = states.start_index_for_node(s.node) {
            for j in start..states.len() {
                let src = states.get(j);
                if src.node != s.node {
                    break;
                }
                val += trans.time_node_delta(src.time, *s, minage) * col1[j];
            }
        }
        col2[k] = val * emit_col[k];
    }
    normalize_column(&mut col2, site, last_good_site)?;
    Ok(col2)
}

/// The cross-block switch step: `col1` (length `nstates1`) to `col2`
/// (length `nstates2`), per the deterministic-routing-plus-two-distinguished-
/// sources semantics of the switch operator.
pub fn switch_column(
    col1: &[f64],
    switch: &impl SwitchOperator,
    emit_first_col: &[f64],
    site: i64,
    last_good_site: Option<i64>,
) -> Result<Vec<f64>> {
    let mut col2 = vec![0.0; switch.nstates2()];
    for j in 0..switch.nstates1() {
        if Some(j) == switch.recombsrc() || Some(j) == switch.recoalsrc() {
            continue;
        }
        if let Some(k) = switch.determ(j) {
            col2[k] += col1[j] * switch.determ_log_prob(j).exp();
        }
    }
    if let Some(j) = switch.recombsrc() {
        for (k, slot) in col2.iter_mut().enumerate() {
            let lp = switch.recomb_log_prob(k);
            if lp > f64::NEG_INFINITY {
                *slot += col1[j] * lp.exp();
            }
        }
    }
    if let Some(j) = switch.recoalsrc() {
        for (k, slot) in col2.iter_mut().enumerate() {
            let lp = switch.recoal_log_prob(k);
            if lp > f64::NEG_INFINITY {
                *slot += col1[j] * lp.exp();
            }
        }
    }
    for (v, e) in col2.iter_mut().zip(emit_first_col.iter()) {
        *v *= e;
    }
    normalize_column(&mut col2, site, last_good_site)?;
    Ok(col2)
}

/// Run the forward pass over every block an iterator yields, filling
/// `table`. `prior` seeds the very first column (endpoint conditioning);
/// pass `None` to fall back to the transition operator's state prior.
///
/// Blocks whose `switch` is `None` (true only for the very first block, by
/// the iterator contract) start a fresh within-block run from `prior`/the
/// state prior; later blocks either apply a switch step at their first site
/// (when `switch` is `Some`) or, when the driver detects an unchanged
/// transition operator between adjacent blocks, simply continue the
/// previous block's within-block recurrence one more site.
pub fn forward_alg<Tree, Trans, Switch>(
    iter: &mut impl StreamingIterator<Item = ArgBlock<Tree, Trans, Switch>>,
    table: &mut ForwardTable,
    prior: Option<&[f64]>,
) -> Result<()>
where
    Tree: LocalTree,
    Trans: TransitionOperator,
    Switch: SwitchOperator,
{
    let mut last_good_site: Option<i64> = None;
    let mut first_block = true;

    while let Some(block) = iter.next() {
        let mut flags = block.flags();
        if first_block {
            flags |= crate::arg_iterator::BlockFlags::FIRST;
        }
        trace!(
            block_start = block.block_start,
            block_len = block.block_len,
            nstates = block.states.len(),
            flags = flags.bits(),
            "entering block"
        );
        for offset in 0..block.block_len {
            let site = block.block_start + offset as i64;
            let emit_col = &block.emit[offset];

            let col = if offset == 0 {
                if first_block {
                    initial_column(&block.states, &block.transition, prior, emit_col, site)?
                } else if let Some(switch) = &block.switch {
                    let prev_site = site - 1;
                    switch_column(table.get(prev_site), switch, emit_col, site, last_good_site)?
                } else {
                    // No-switch continuation: the state space is unchanged,
                    // so the within-block step simply extends across the
                    // boundary.
                    let prev_site = site - 1;
                    within_block_column(
                        table.get(prev_site),
                        &block.states,
                        &block.transition,
                        emit_col,
                        block.minage,
                        site,
                        last_good_site,
                    )?
                }
            } else {
                let prev_site = site - 1;
                within_block_column(
                    table.get(prev_site),
                    &block.states,
                    &block.transition,
                    emit_col,
                    block.minage,
                    site,
                    last_good_site,
                )?
            };

            table.set(site, col);
            last_good_site = Some(site);
        }
        first_block = false;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_tree::{LocalTreeData, Node, NULL_NODE};
    use crate::states::get_coal_states;
    use crate::transition::{SimpleTransition, SwitchMatrix};

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

    #[test]
    fn initial_column_sums_to_one() {
        let tree = two_leaf_tree();
        let trans = SimpleTransition::new(4, 0.5, 0.1);
        let states = get_coal_states(&tree, 4, 0, false, NULL_NODE, None);
        let emit = vec![1.0; states.len()];
        let col = initial_column(&states, &trans, None, &emit, 0).unwrap();
        let sum: f64 = col.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn within_block_column_sums_to_one_and_is_nonnegative() {
        let tree = two_leaf_tree();
        let trans = SimpleTransition::new(4, 0.5, 0.1);
        let states = get_coal_states(&tree, 4, 0, false, NULL_NODE, None);
        let emit = vec![1.0; states.len()];
        let col1 = initial_column(&states, &trans, None, &emit, 0).unwrap();
        let col2 = within_block_column(&col1, &states, &trans, &emit, 0, 1, Some(0)).unwrap();
        assert!(col2.iter().all(|&v| v >= 0.0));
        let sum: f64 = col2.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_column_is_a_single_unit_value() {
        let tree = two_leaf_tree();
        let trans = SimpleTransition::new(4, 0.5, 0.1);
        let states = States::default();
        let emit = vec![1.0];
        let col = initial_column(&states, &trans, None, &emit, 0).unwrap();
        assert_eq!(col, vec![1.0]);
        let col2 = within_block_column(&col, &states, &trans, &emit, 0, 1, Some(0)).unwrap();
        assert_eq!(col2, vec![1.0]);
        let _ = tree;
    }

    #[test]
    fn identity_switch_preserves_mass_distribution() {
        let tree = two_leaf_tree();
        let trans = SimpleTransition::new(4, 0.5, 0.1);
        let states = get_coal_states(&tree, 4, 0, false, NULL_NODE, None);
        let n = states.len();
        let emit = vec![1.0; n];
        let col1 = initial_column(&states, &trans, None, &emit, 0).unwrap();
        let sw = SwitchMatrix::identity(n);
        let col2 = switch_column(&col1, &sw, &emit, 1, Some(0)).unwrap();
        for i in 0..n {
            assert!((col1[i] - col2[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn degenerate_column_is_rejected() {
        let tree = two_leaf_tree();
        let trans = SimpleTransition::new(4, 0.5, 0.1);
        let states = get_coal_states(&tree, 4, 0, false, NULL_NODE, None);
        let emit = vec![0.0; states.len()];
        let err = initial_column(&states, &trans, None, &emit, 5).unwrap_err();
        assert!(matches!(err, ThreadingError::DegenerateColumn { site: 5, .. }));
        let _ = tree;
    }
}
