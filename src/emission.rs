//! The emission engine: per-site, per-state likelihoods under the
//! Jukes-Cantor substitution model, computed by Felsenstein pruning.

use std::collections::HashMap;

use crate::local_tree::{LocalTree, NodeId, NULL_NODE};
use crate::model::Model;
use crate::sequences::{Base, Sequences};
use crate::states::{CoalState, States};
use crate::time_grid::{branch_length, time_at};

const JC_F: f64 = 4.0 / 3.0;

/// JC69 transition kernel: probability of observing the same base at both
/// ends of a branch of length `t` under rate `mu`.
fn jc_no_mutation(t: f64, mu: f64) -> f64 {
    0.25 * (1.0 + 3.0 * (-JC_F * mu * t).exp())
}

/// JC69 transition kernel: probability of observing a *different* base at
/// the two ends of a branch of length `t` under rate `mu` (any one of the
/// three alternatives; the three sum to `1 - no_mutation`).
fn jc_mutation(t: f64, mu: f64) -> f64 {
    0.25 * (1.0 - (-JC_F * mu * t).exp())
}

/// `P(a -> b; t)` for an already-floored branch length `t`.
fn kernel(a: usize, b: usize, t: f64, mu: f64) -> f64 {
    if a == b {
        jc_no_mutation(t, mu)
    } else {
        jc_mutation(t, mu)
    }
}

/// Site likelihood = `1/4 * sum_a inner[root][a]`.
fn root_likelihood(inner_root: [f64; 4]) -> f64 {
    0.25 * inner_root.iter().sum::<f64>()
}

/// Fold one child's inner vector up through its branch kernel.
fn combine_child(child_inner: [f64; 4], len: f64, mu: f64) -> [f64; 4] {
    let mut out = [0.0; 4];
    for a in 0..4 {
        out[a] = (0..4).map(|b| kernel(a, b, len, mu) * child_inner[b]).sum();
    }
    out
}

fn mul4(a: [f64; 4], b: [f64; 4]) -> [f64; 4] {
    let mut out = [0.0; 4];
    for i in 0..4 {
        out[i] = a[i] * b[i];
    }
    out
}

/// The age to treat as "the top of the branch above `node`": its parent's
/// age, or the top of the time grid at the root.
fn parent_age_or_top<T: LocalTree>(tree: &T, node: NodeId, model: &Model) -> usize {
    let parent = tree.node(node).parent;
    if parent == NULL_NODE {
        model.ntimes - 1
    } else {
        tree.node(parent).age
    }
}

/// Standard postorder Felsenstein pruning over every node of `tree`, for one
/// site.
fn prune<T: LocalTree>(tree: &T, model: &Model, leaf_base: &impl Fn(NodeId) -> Base) -> HashMap<NodeId, [f64; 4]> {
    let mut postorder = Vec::new();
    tree.get_postorder(&mut postorder);
    let mut inner = HashMap::with_capacity(postorder.len());
    for &id in &postorder {
        let node = tree.node(id);
        if node.is_leaf() {
            inner.insert(id, leaf_base(id).indicator());
            continue;
        }
        let mut acc = [1.0; 4];
        for &c in &node.child {
            if c == NULL_NODE {
                continue;
            }
            let edge_len = model.floor_branch(tree.get_dist(c, &model.times));
            acc = mul4(acc, combine_child(inner[&c], edge_len, model.mu));
        }
        inner.insert(id, acc);
    }
    inner
}

/// Sum of floored branch lengths over the whole tree.
fn treelen<T: LocalTree>(tree: &T, model: &Model) -> f64 {
    let mut postorder = Vec::new();
    tree.get_postorder(&mut postorder);
    postorder
        .iter()
        .filter(|&&id| tree.node(id).parent != NULL_NODE)
        .map(|&id| model.floor_branch(tree.get_dist(id, &model.times)))
        .sum()
}

/// `true` if every non-`N` observed base at `site` agrees, across the given
/// sequence rows.
fn site_is_invariant<S: Sequences>(seqs: &S, rows: &[usize], site: usize) -> bool {
    let mut seen: Option<Base> = None;
    for &row in rows {
        let b = seqs.base(row, site);
        if b == Base::N {
            continue;
        }
        match seen {
            None => seen = Some(b),
            Some(s) if s != b => return false,
            _ => {}
        }
    }
    true
}

/// Ancestor chain from `node` up to and including the root.
fn ancestors_inclusive<T: LocalTree>(tree: &T, mut node: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    while node != NULL_NODE {
        out.push(node);
        node = tree.node(node).parent;
    }
    out
}

/// Per-state branch geometry for external threading: attaching the new
/// lineage onto `state.node` at `state.time` replaces that node's edge to
/// its parent with three edges (`lower`, `new_leaf`, `upper`) and changes
/// the tree's total length accordingly.
struct ExternalGeometry {
    lower: f64,
    upper: f64,
    new_leaf: f64,
    treelen: f64,
}

fn external_geometry<T: LocalTree>(tree: &T, model: &Model, base_treelen: f64, state: CoalState) -> ExternalGeometry {
    let node_age = tree.node(state.node).age;
    let parent_age = parent_age_or_top(tree, state.node, model);
    let old_branch = model.floor_branch(tree.get_dist(state.node, &model.times));
    let lower = branch_length(model, node_age, state.time);
    let upper = branch_length(model, state.time, parent_age);
    let new_leaf = time_at(model, state.time);
    ExternalGeometry {
        lower,
        upper,
        new_leaf,
        treelen: base_treelen - old_branch + lower + upper + new_leaf,
    }
}

/// Compute `emit[site][state]` for *external* threading: a new leaf
/// chromosome is attached onto each candidate `(node, time)` in turn.
///
/// `leaf_seq_row` maps an existing leaf node id to its row in `seqs`;
/// `new_chrom_row` is the new chromosome's row. When `slow` is `true`, every
/// node's inner value is rebuilt from scratch for every candidate state —
/// a reference path used to cross-check the fast path; when `false`, only
/// the dirty ancestor chain is recomputed per state, reusing one pruning
/// pass over the unaugmented tree.
pub fn calc_emissions_external<T: LocalTree, S: Sequences>(
    tree: &T,
    states: &States,
    seqs: &S,
    leaf_seq_row: &impl Fn(NodeId) -> usize,
    new_chrom_row: usize,
    model: &Model,
    block_start: usize,
    block_len: usize,
    slow: bool,
) -> Vec<Vec<f64>> {
    let mut postorder = Vec::new();
    tree.get_postorder(&mut postorder);

    let base_treelen = treelen(tree, model);
    let mut rows: Vec<usize> = postorder
        .iter()
        .filter(|&&id| tree.node(id).is_leaf())
        .map(|&id| leaf_seq_row(id))
        .collect();
    rows.push(new_chrom_row);

    let mut emit = vec![vec![0.0; states.len()]; block_len];

    for site_offset in 0..block_len {
        let site = block_start + site_offset;
        let invariant = site_is_invariant(seqs, &rows, site);
        let leaf_base = |id: NodeId| -> Base { seqs.base(leaf_seq_row(id), site) };
        let new_base = seqs.base(new_chrom_row, site);

        let base_inner = if invariant { None } else { Some(prune(tree, model, &leaf_base)) };

        for (k, emit_col) in emit[site_offset].iter_mut().enumerate() {
            let state = states.get(k);
            let geom = external_geometry(tree, model, base_treelen, state);

            if invariant {
                *emit_col = 0.25 * (-model.mu * model.floor_branch(geom.treelen)).exp();
                continue;
            }

            *emit_col = if slow {
                external_site_likelihood_full(tree, model, &leaf_base, state, new_base, &geom)
            } else {
                external_site_likelihood_dirty(tree, model, base_inner.as_ref().unwrap(), state, new_base, &geom)
            };
        }
    }
    emit
}

/// Recompute only the dirty ancestor chain: the virtual coalescence node
/// plus every ancestor of `state.node` up to the root, reusing `base_inner`
/// (the pruning table over the unaugmented tree) everywhere else.
fn external_site_likelihood_dirty<T: LocalTree>(
    tree: &T,
    model: &Model,
    base_inner: &HashMap<NodeId, [f64; 4]>,
    state: CoalState,
    new_base: Base,
    geom: &ExternalGeometry,
) -> f64 {
    let virtual_inner = mul4(
        combine_child(base_inner[&state.node], geom.lower, model.mu),
        combine_child(new_base.indicator(), geom.new_leaf, model.mu),
    );

    let parent_chain = ancestors_inclusive(tree, tree.node(state.node).parent);
    if parent_chain.is_empty() {
        // state.node was the tree's root: the virtual node is the new root.
        return root_likelihood(virtual_inner);
    }

    let mut recomputed: HashMap<NodeId, [f64; 4]> = HashMap::new();
    for &anc in &parent_chain {
        let node = tree.node(anc);
        let mut acc = [1.0; 4];
        for &c in &node.child {
            if c == NULL_NODE {
                continue;
            }
            let (len, child_val) = if c == state.node {
                (geom.upper, virtual_inner)
            } else {
                let edge_len = model.floor_branch(tree.get_dist(c, &model.times));
                let val = recomputed.get(&c).copied().unwrap_or_else(|| base_inner[&c]);
                (edge_len, val)
            };
            acc = mul4(acc, combine_child(child_val, len, model.mu));
        }
        recomputed.insert(anc, acc);
    }

    root_likelihood(recomputed[&tree.root()])
}

/// Rebuild every node's inner value from scratch, splicing the virtual
/// coalescence node in as we go. Used only for the slow reference path.
fn external_site_likelihood_full<T: LocalTree>(
    tree: &T,
    model: &Model,
    leaf_base: &impl Fn(NodeId) -> Base,
    state: CoalState,
    new_base: Base,
    geom: &ExternalGeometry,
) -> f64 {
    let mut postorder = Vec::new();
    tree.get_postorder(&mut postorder);
    let mut inner: HashMap<NodeId, [f64; 4]> = HashMap::with_capacity(postorder.len());

    for &id in &postorder {
        let node = tree.node(id);
        let mut value = if node.is_leaf() {
            leaf_base(id).indicator()
        } else {
            let mut acc = [1.0; 4];
            for &c in &node.child {
                if c == NULL_NODE {
                    continue;
                }
                let edge_len = model.floor_branch(tree.get_dist(c, &model.times));
                acc = mul4(acc, combine_child(inner[&c], edge_len, model.mu));
            }
            acc
        };
        if id == state.node {
            value = mul4(
                combine_child(value, geom.lower, model.mu),
                combine_child(new_base.indicator(), geom.new_leaf, model.mu),
            );
        }
        inner.insert(id, value);
    }

    if state.node == tree.root() {
        root_likelihood(inner[&state.node])
    } else {
        // The node above state.node's slot is now the virtual node; walk its
        // ancestors, substituting `geom.upper` for the one edge that used to
        // connect state.node directly to its parent.
        let mut prev_id = state.node;
        let mut current = inner[&state.node];
        let mut cursor = tree.node(state.node).parent;
        loop {
            let node = tree.node(cursor);
            let mut acc = [1.0; 4];
            for &c in &node.child {
                if c == NULL_NODE {
                    continue;
                }
                let (len, val) = if c == prev_id {
                    let edge_len = if prev_id == state.node {
                        geom.upper
                    } else {
                        model.floor_branch(tree.get_dist(c, &model.times))
                    };
                    (edge_len, current)
                } else {
                    let edge_len = model.floor_branch(tree.get_dist(c, &model.times));
                    (edge_len, inner[&c])
                };
                acc = mul4(acc, combine_child(val, len, model.mu));
            }
            current = acc;
            if cursor == tree.root() {
                return root_likelihood(current);
            }
            prev_id = cursor;
            cursor = tree.node(cursor).parent;
        }
    }
}

/// Compute `emit[site][state]` for *internal* threading: an existing
/// subtree (rooted at `subtree_root`) is regrafted onto each candidate
/// `(node, time)` within the maintree (rooted at `maintree_root`).
///
/// The likelihood factorizes via an inner/outer split: `inner_sub` is the
/// standard pruning value at `subtree_root`,
/// `inner_main` the pruning table over the maintree, and `outer` the
/// complementary "above the node" marginal, computed preorder from
/// `maintree_root`.
pub fn calc_emissions_internal<T: LocalTree, S: Sequences>(
    tree: &T,
    states: &States,
    seqs: &S,
    leaf_seq_row: &impl Fn(NodeId) -> usize,
    subtree_root: NodeId,
    maintree_root: NodeId,
    model: &Model,
    block_start: usize,
    block_len: usize,
) -> Vec<Vec<f64>> {
    // The bookkeeping root's two edges (to subtree_root and to maintree_root)
    // aren't real branches yet -- the regraft hasn't happened. The
    // pre-regraft total length is just the sum of edges within each piece.
    let base_treelen = treelen_restricted(tree, subtree_root, model) + treelen_restricted(tree, maintree_root, model);

    let mut sub_leaves = Vec::new();
    collect_leaves(tree, subtree_root, &mut sub_leaves);
    let mut main_leaves = Vec::new();
    collect_leaves(tree, maintree_root, &mut main_leaves);
    let mut rows: Vec<usize> = sub_leaves
        .iter()
        .chain(main_leaves.iter())
        .map(|&id| leaf_seq_row(id))
        .collect();
    rows.sort_unstable();
    rows.dedup();

    let mut emit = vec![vec![0.0; states.len()]; block_len];

    for site_offset in 0..block_len {
        let site = block_start + site_offset;
        let invariant = site_is_invariant(seqs, &rows, site);
        let leaf_base = |id: NodeId| -> Base { seqs.base(leaf_seq_row(id), site) };

        let inner_sub = prune_subtree(tree, subtree_root, model, &leaf_base);
        let inner_main = prune(tree, model, &leaf_base);
        let outer = compute_outer(tree, maintree_root, &inner_main, model);

        for (k, emit_col) in emit[site_offset].iter_mut().enumerate() {
            let state = states.get(k);
            let sub_edge = branch_length(model, tree.node(subtree_root).age, state.time);
            let lower = branch_length(model, tree.node(state.node).age, state.time);

            let sub_val = combine_child(inner_sub, sub_edge, model.mu);
            let node_val = combine_child(inner_main[&state.node], lower, model.mu);
            let coal = mul4(sub_val, node_val);

            if state.node == maintree_root {
                let state_treelen = base_treelen + sub_edge + lower;
                *emit_col = if invariant {
                    0.25 * (-model.mu * model.floor_branch(state_treelen)).exp()
                } else {
                    root_likelihood(coal)
                };
                continue;
            }

            let parent_age = tree.node(tree.node(state.node).parent).age;
            let old_branch = model.floor_branch(tree.get_dist(state.node, &model.times));
            let upper = branch_length(model, state.time, parent_age);
            let state_treelen = base_treelen - old_branch + sub_edge + lower + upper;

            *emit_col = if invariant {
                0.25 * (-model.mu * model.floor_branch(state_treelen)).exp()
            } else {
                let up = combine_child(coal, upper, model.mu);
                let outer_c = outer[&state.node];
                0.25 * (0..4).map(|c| outer_c[c] * up[c]).sum::<f64>()
            };
        }
    }
    emit
}

/// Sum of floored branch lengths strictly within `root`'s own subtree
/// (excludes any edge above `root` itself).
fn treelen_restricted<T: LocalTree>(tree: &T, root: NodeId, model: &Model) -> f64 {
    let node = tree.node(root);
    if node.is_leaf() {
        return 0.0;
    }
    node.child
        .iter()
        .filter(|&&c| c != NULL_NODE)
        .map(|&c| {
            let edge = model.floor_branch(tree.get_dist(c, &model.times));
            edge + treelen_restricted(tree, c, model)
        })
        .sum()
}

fn collect_leaves<T: LocalTree>(tree: &T, root: NodeId, out: &mut Vec<NodeId>) {
    let node = tree.node(root);
    if node.is_leaf() {
        out.push(root);
        return;
    }
    for &c in &node.child {
        if c != NULL_NODE {
            collect_leaves(tree, c, out);
        }
    }
}

/// Pruning value at `root`, restricted to its own descendants (used for the
/// detached subtree in internal threading).
fn prune_subtree<T: LocalTree>(tree: &T, root: NodeId, model: &Model, leaf_base: &impl Fn(NodeId) -> Base) -> [f64; 4] {
    let node = tree.node(root);
    if node.is_leaf() {
        return leaf_base(root).indicator();
    }
    let mut acc = [1.0; 4];
    for &c in &node.child {
        if c == NULL_NODE {
            continue;
        }
        let edge = model.floor_branch(tree.get_dist(c, &model.times));
        let child_val = prune_subtree(tree, c, model, leaf_base);
        acc = mul4(acc, combine_child(child_val, edge, model.mu));
    }
    acc
}

/// The standard complementary ("outer"/"up") marginal, keyed at each
/// non-root node of the maintree: `outer[v][a]` is the combined likelihood
/// of everything outside `v`'s subtree, as a function of the base
/// hypothesized to sit at `v` itself. `outer[maintree_root]` is `[1,1,1,1]`
/// — nothing constrains the base at the maintree root from above.
fn compute_outer<T: LocalTree>(
    tree: &T,
    maintree_root: NodeId,
    inner_main: &HashMap<NodeId, [f64; 4]>,
    model: &Model,
) -> HashMap<NodeId, [f64; 4]> {
    let mut outer = HashMap::new();
    outer.insert(maintree_root, [1.0; 4]);

    fn recurse<T: LocalTree>(
        tree: &T,
        v: NodeId,
        outer: &mut HashMap<NodeId, [f64; 4]>,
        inner_main: &HashMap<NodeId, [f64; 4]>,
        model: &Model,
    ) {
        let node = tree.node(v);
        for &child in &node.child {
            if child == NULL_NODE {
                continue;
            }
            let sib = tree.get_sibling(child);
            let len_sib = model.floor_branch(tree.get_dist(sib, &model.times));
            let len_child = model.floor_branch(tree.get_dist(child, &model.times));
            let outer_v = outer[&v];
            let sib_inner = inner_main[&sib];

            let mut outer_child = [0.0; 4];
            for a in 0..4 {
                let mut acc = 0.0;
                for c in 0..4 {
                    let sib_factor: f64 = (0..4).map(|b| kernel(c, b, len_sib, model.mu) * sib_inner[b]).sum();
                    acc += kernel(c, a, len_child, model.mu) * outer_v[c] * sib_factor;
                }
                outer_child[a] = acc;
            }
            outer.insert(child, outer_child);
            recurse(tree, child, outer, inner_main, model);
        }
    }
    recurse(tree, maintree_root, &mut outer, inner_main, model);
    outer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_tree::{LocalTreeData, Node};
    use crate::sequences::VecSequences;
    use crate::states::get_coal_states;

    fn model(ntimes: usize) -> Model {
        Model {
            ntimes,
            times: (0..ntimes).map(|i| i as f64 * 10.0).collect(),
            popsizes: vec![1e4; ntimes.saturating_sub(1)],
            rho: 1e-8,
            mu: 1e-3,
            mintime: 1e-6,
            removed_root_time: (ntimes as f64) * 10.0,
        }
    }

    fn two_leaf_tree() -> LocalTreeData {
        LocalTreeData::new(
            vec![
                Node { parent: 2, child: [NULL_NODE, NULL_NODE], age: 0 },
                Node { parent: 2, child: [NULL_NODE, NULL_NODE], age: 0 },
                Node { parent: NULL_NODE, child: [0, 1], age: 2 },
            ],
            2,
        )
    }

    #[test]
    fn invariant_site_matches_closed_form() {
        let tree = two_leaf_tree();
        let m = model(4);
        // S1-style scenario: one invariant site, all leaves + new leaf 'A'.
        let seqs = VecSequences::from_strings(&["A", "A", "A"]).unwrap();
        let states = get_coal_states(&tree, 4, 0, false, NULL_NODE, None);
        let leaf_row = |id: NodeId| id as usize;
        let emit = calc_emissions_external(&tree, &states, &seqs, &leaf_row, 2, &m, 0, 1, false);
        for k in 0..states.len() {
            assert!(emit[0][k] > 0.0);
            assert!(emit[0][k] <= 0.25 + 1e-9);
        }
    }

    #[test]
    fn dirty_set_matches_full_rebuild() {
        let tree = two_leaf_tree();
        let m = model(4);
        let seqs = VecSequences::from_strings(&["A", "C", "G"]).unwrap();
        let states = get_coal_states(&tree, 4, 0, false, NULL_NODE, None);
        let leaf_row = |id: NodeId| id as usize;
        let fast = calc_emissions_external(&tree, &states, &seqs, &leaf_row, 2, &m, 0, 1, false);
        let slow = calc_emissions_external(&tree, &states, &seqs, &leaf_row, 2, &m, 0, 1, true);
        for k in 0..states.len() {
            let diff = (fast[0][k] - slow[0][k]).abs();
            let rel = diff / slow[0][k].max(1e-300);
            assert!(rel < 1e-4 || diff < 1e-12, "state {k}: fast={} slow={}", fast[0][k], slow[0][k]);
        }
    }

    #[test]
    fn all_n_sequence_uses_invariant_shortcut_everywhere() {
        let tree = two_leaf_tree();
        let m = model(4);
        let seqs = VecSequences::from_strings(&["N", "N", "N"]).unwrap();
        let states = get_coal_states(&tree, 4, 0, false, NULL_NODE, None);
        let leaf_row = |id: NodeId| id as usize;
        let emit = calc_emissions_external(&tree, &states, &seqs, &leaf_row, 2, &m, 0, 1, false);
        for k in 0..states.len() {
            let expected = 0.25 * (-m.mu * external_geometry(&tree, &m, treelen(&tree, &m), states.get(k)).treelen.max(m.mintime)).exp();
            assert!((emit[0][k] - expected).abs() < 1e-12);
        }
    }
}
