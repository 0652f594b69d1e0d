//! Backward traceback over a completed forward table: a stochastic sampler
//! and a Viterbi maximizer, both walking blocks in reverse genomic order.

use rand::Rng;
use streaming_iterator::DoubleEndedStreamingIterator;
use tracing::debug;

use crate::arg_iterator::ArgBlock;
use crate::error::{Result, ThreadingError};
use crate::forward::ForwardTable;
use crate::local_tree::LocalTree;
use crate::states::States;
use crate::transition::{SwitchOperator, TransitionOperator};

/// `switch(j -> k)` in log space, derived from the per-source routing rules
/// a [`SwitchOperator`] exposes: deterministic for ordinary sources, spread
/// over `recomb_log_prob`/`recoal_log_prob` for the two distinguished ones.
fn switch_log_prob(switch: &impl SwitchOperator, j: usize, k: usize) -> f64 {
    if Some(j) == switch.recombsrc() {
        switch.recomb_log_prob(k)
    } else if Some(j) == switch.recoalsrc() {
        switch.recoal_log_prob(k)
    } else if switch.determ(j) == Some(k) {
        switch.determ_log_prob(j)
    } else {
        f64::NEG_INFINITY
    }
}

fn sample_proportional(weights: &[f64], rng: &mut impl Rng, site: i64) -> Result<usize> {
    let sum: f64 = weights.iter().sum();
    if !(sum > 0.0) {
        return Err(ThreadingError::PathDeadEnd { site });
    }
    let mut r = rng.gen::<f64>() * sum;
    for (i, &w) in weights.iter().enumerate() {
        if r < w {
            return Ok(i);
        }
        r -= w;
    }
    Ok(weights.len() - 1)
}

/// Sample a predecessor state within a block, caching the transition row by
/// destination `target` (consecutive steps typically share the same
/// `target`, since paths run in long same-state stretches).
#[allow(clippy::too_many_arguments)]
fn sample_within_block(
    col: &[f64],
    states: &States,
    trans: &impl TransitionOperator,
    target: usize,
    rng: &mut impl Rng,
    site: i64,
    cached_k: &mut Option<usize>,
    cached_row: &mut Vec<f64>,
) -> Result<usize> {
    if *cached_k != Some(target) {
        cached_row.clear();
        cached_row.extend((0..states.len()).map(|j| trans.prob(states, j, target)));
        *cached_k = Some(target);
    }
    let weights: Vec<f64> = col.iter().zip(cached_row.iter()).map(|(c, t)| c * t).collect();
    sample_proportional(&weights, rng, site)
}

fn sample_switch_backward(
    col: &[f64],
    switch: &impl SwitchOperator,
    target: usize,
    rng: &mut impl Rng,
    site: i64,
) -> Result<usize> {
    let weights: Vec<f64> = (0..switch.nstates1())
        .map(|j| col[j] * switch_log_prob(switch, j, target).exp())
        .collect();
    sample_proportional(&weights, rng, site)
}

#[allow(clippy::too_many_arguments)]
fn argmax_within_block(
    col: &[f64],
    states: &States,
    trans: &impl TransitionOperator,
    target: usize,
    site: i64,
    cached_k: &mut Option<usize>,
    cached_row: &mut Vec<f64>,
) -> Result<usize> {
    if *cached_k != Some(target) {
        cached_row.clear();
        cached_row.extend((0..states.len()).map(|j| trans.log_prob(states, j, target)));
        *cached_k = Some(target);
    }
    argmax_log_scores(col, cached_row, site)
}

fn argmax_switch_backward(col: &[f64], switch: &impl SwitchOperator, target: usize, site: i64) -> Result<usize> {
    let row: Vec<f64> = (0..switch.nstates1()).map(|j| switch_log_prob(switch, j, target)).collect();
    argmax_log_scores(col, &row, site)
}

fn argmax_log_scores(col: &[f64], log_row: &[f64], site: i64) -> Result<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (j, &lt) in log_row.iter().enumerate() {
        let score = col[j].ln() + lt;
        match best {
            Some((_, b)) if !(score > b) => {}
            _ => best = Some((j, score)),
        }
    }
    match best {
        Some((j, score)) if score.is_finite() => Ok(j),
        _ => Err(ThreadingError::PathDeadEnd { site }),
    }
}

/// Sample a state path by stochastic traceback, walking blocks in reverse
/// genomic order. `last_state_given` pins `path[end-1]`; `None` samples it
/// from the final column. Returns a cumulative log-likelihood proxy (the sum
/// of `ln(col[site][chosen])` over every site visited, including switch
/// steps) — a diagnostic, not a normalized probability.
pub fn stochastic_traceback<Tree, Trans, Switch>(
    iter: &mut impl DoubleEndedStreamingIterator<Item = ArgBlock<Tree, Trans, Switch>>,
    table: &ForwardTable,
    path: &mut [usize],
    last_state_given: Option<usize>,
    rng: &mut impl Rng,
) -> Result<f64>
where
    Tree: LocalTree,
    Trans: TransitionOperator,
    Switch: SwitchOperator,
{
    debug!(table_start = table.start(), table_len = table.len(), "starting stochastic traceback");
    let mut lnl = 0.0;
    let mut cached_k: Option<usize> = None;
    let mut cached_row: Vec<f64> = Vec::new();
    let mut next_state: Option<usize> = last_state_given;
    let mut skip_last_offset = false;
    let mut first_block = true;

    while let Some(block) = iter.next_back() {
        let hi = if skip_last_offset {
            block.block_len.saturating_sub(1)
        } else {
            block.block_len
        };
        for offset in (0..hi).rev() {
            let site = block.block_start + offset as i64;
            let col = table.get(site);
            let is_final_site = first_block && offset == block.block_len - 1;

            let k = if block.states.is_empty() {
                // Degenerate one-state block: nothing to sample.
                0
            } else if is_final_site {
                match next_state {
                    Some(k) => k,
                    None => sample_proportional(col, rng, site)?,
                }
            } else {
                let target = next_state.expect("a non-final site always has a known successor state");
                sample_within_block(col, &block.states, &block.transition, target, rng, site, &mut cached_k, &mut cached_row)?
            };
            lnl += col[k].max(f64::MIN_POSITIVE).ln();
            path[(site - table.start()) as usize] = k;
            next_state = Some(k);
        }

        if block.block_start > table.start() {
            let prev_site = block.block_start - 1;
            let col = table.get(prev_site);
            let target = next_state.expect("a site was processed before reaching a boundary");
            let chosen = if block.switch.is_none() && block.states.is_empty() {
                0
            } else {
                match &block.switch {
                    Some(switch) => sample_switch_backward(col, switch, target, rng, prev_site)?,
                    None => sample_within_block(col, &block.states, &block.transition, target, rng, prev_site, &mut cached_k, &mut cached_row)?,
                }
            };
            lnl += col[chosen].max(f64::MIN_POSITIVE).ln();
            path[(prev_site - table.start()) as usize] = chosen;
            next_state = Some(chosen);
            cached_k = None;
            skip_last_offset = true;
        } else {
            skip_last_offset = false;
        }
        first_block = false;
    }
    debug!(lnl, "stochastic traceback finished");
    Ok(lnl)
}

/// Maximize the state path in log space (Viterbi), walking blocks in
/// reverse genomic order. `last_state_given` pins `path[end-1]`; `None`
/// picks the argmax of the final column.
pub fn viterbi_traceback<Tree, Trans, Switch>(
    iter: &mut impl DoubleEndedStreamingIterator<Item = ArgBlock<Tree, Trans, Switch>>,
    table: &ForwardTable,
    path: &mut [usize],
    last_state_given: Option<usize>,
) -> Result<()>
where
    Tree: LocalTree,
    Trans: TransitionOperator,
    Switch: SwitchOperator,
{
    debug!(table_start = table.start(), table_len = table.len(), "starting viterbi traceback");
    let mut cached_k: Option<usize> = None;
    let mut cached_row: Vec<f64> = Vec::new();
    let mut next_state: Option<usize> = last_state_given;
    let mut skip_last_offset = false;
    let mut first_block = true;

    while let Some(block) = iter.next_back() {
        let hi = if skip_last_offset {
            block.block_len.saturating_sub(1)
        } else {
            block.block_len
        };
        for offset in (0..hi).rev() {
            let site = block.block_start + offset as i64;
            let col = table.get(site);
            let is_final_site = first_block && offset == block.block_len - 1;

            let k = if block.states.is_empty() {
                0
            } else if is_final_site {
                match next_state {
                    Some(k) => k,
                    None => col
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                        .map(|(i, _)| i)
                        .ok_or(ThreadingError::PathDeadEnd { site })?,
                }
            } else {
                let target = next_state.expect("a non-final site always has a known successor state");
                argmax_within_block(col, &block.states, &block.transition, target, site, &mut cached_k, &mut cached_row)?
            };
            path[(site - table.start()) as usize] = k;
            next_state = Some(k);
        }

        if block.block_start > table.start() {
            let prev_site = block.block_start - 1;
            let col = table.get(prev_site);
            let target = next_state.expect("a site was processed before reaching a boundary");
            let chosen = if block.switch.is_none() && block.states.is_empty() {
                0
            } else {
                match &block.switch {
                    Some(switch) => argmax_switch_backward(col, switch, target, prev_site)?,
                    None => argmax_within_block(col, &block.states, &block.transition, target, prev_site, &mut cached_k, &mut cached_row)?,
                }
            };
            path[(prev_site - table.start()) as usize] = chosen;
            next_state = Some(chosen);
            cached_k = None;
            skip_last_offset = true;
        } else {
            skip_last_offset = false;
        }
        first_block = false;
    }
    debug!("viterbi traceback finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arg_iterator::VecArgIterator;
    use crate::forward::forward_alg;
    use crate::local_tree::{LocalTreeData, Node, NULL_NODE};
    use crate::states::get_coal_states;
    use crate::transition::{SimpleTransition, SwitchMatrix};
    use rand::SeedableRng;

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

    fn one_block(start: i64, len: usize) -> ArgBlock<LocalTreeData, SimpleTransition, SwitchMatrix> {
        let tree = two_leaf_tree();
        let states = get_coal_states(&tree, 4, 0, false, NULL_NODE, None);
        let n = states.len();
        ArgBlock {
            block_start: start,
            block_len: len,
            tree,
            states,
            minage: 0,
            transition: SimpleTransition::new(4, 0.5, 0.3),
            switch: None,
            emit: vec![vec![1.0; n]; len],
        }
    }

    #[test]
    fn viterbi_path_has_expected_length() {
        let mut it = VecArgIterator::new(vec![one_block(0, 4)]);
        let mut table = ForwardTable::new(0, 4);
        forward_alg(&mut it, &mut table, None).unwrap();

        let mut it = VecArgIterator::new(vec![one_block(0, 4)]);
        let mut path = vec![0usize; 4];
        viterbi_traceback(&mut it, &table, &mut path, None).unwrap();
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn stochastic_traceback_pins_given_endpoint() {
        let mut it = VecArgIterator::new(vec![one_block(0, 3)]);
        let mut table = ForwardTable::new(0, 3);
        forward_alg(&mut it, &mut table, None).unwrap();

        let mut it = VecArgIterator::new(vec![one_block(0, 3)]);
        let mut path = vec![0usize; 3];
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let lnl = stochastic_traceback(&mut it, &table, &mut path, Some(0), &mut rng).unwrap();
        assert_eq!(path[2], 0);
        assert!(lnl.is_finite());
    }

    fn two_block_pair(n: usize) -> Vec<ArgBlock<LocalTreeData, SimpleTransition, SwitchMatrix>> {
        let tree = two_leaf_tree();
        let states = get_coal_states(&tree, 4, 0, false, NULL_NODE, None);
        vec![
            ArgBlock {
                block_start: 0,
                block_len: 2,
                tree: two_leaf_tree(),
                states: get_coal_states(&two_leaf_tree(), 4, 0, false, NULL_NODE, None),
                minage: 0,
                transition: SimpleTransition::new(4, 0.5, 0.3),
                switch: None,
                emit: vec![vec![1.0; n]; 2],
            },
            ArgBlock {
                block_start: 2,
                block_len: 2,
                tree: two_leaf_tree(),
                states,
                minage: 0,
                transition: SimpleTransition::new(4, 0.5, 0.3),
                switch: Some(SwitchMatrix::identity(n)),
                emit: vec![vec![1.0; n]; 2],
            },
        ]
    }

    #[test]
    fn switch_boundary_is_walked_in_reverse() {
        let tree = two_leaf_tree();
        let n = get_coal_states(&tree, 4, 0, false, NULL_NODE, None).len();

        let mut it = VecArgIterator::new(two_block_pair(n));
        let mut table = ForwardTable::new(0, 4);
        forward_alg(&mut it, &mut table, None).unwrap();

        let mut it = VecArgIterator::new(two_block_pair(n));
        let mut path = vec![0usize; 4];
        viterbi_traceback(&mut it, &table, &mut path, None).unwrap();
        assert_eq!(path.len(), 4);
    }
}
