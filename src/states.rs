//! Coalescence state enumeration.

use crate::local_tree::{LocalTree, NodeId};

/// A candidate attachment point for the new lineage: coalesce onto branch
/// `node` at time index `time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoalState {
    pub node: NodeId,
    pub time: usize,
}

/// The ordered, per-block set of admissible coalescence states.
///
/// Enumeration order is load-bearing: the factored column step relies on
/// same-branch states being contiguous so that `indexes[node]` can name a
/// single starting offset for a contiguous run.
#[derive(Debug, Clone, Default)]
pub struct States {
    states: Vec<CoalState>,
    /// For each node that appears in `states`, the index of its first state
    /// in `states` (the run of same-branch states is contiguous).
    indexes: std::collections::HashMap<NodeId, usize>,
}

impl States {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, i: usize) -> CoalState {
        self.states[i]
    }

    pub fn as_slice(&self) -> &[CoalState] {
        &self.states
    }

    /// Starting index of the contiguous run of states on `node`, if any.
    pub fn start_index_for_node(&self, node: NodeId) -> Option<usize> {
        self.indexes.get(&node).copied()
    }

    /// Locate the index of a specific `(node, time)` pair, used for pinning
    /// endpoint states.
    pub fn find(&self, state: CoalState) -> Option<usize> {
        self.states.iter().position(|s| *s == state)
    }
}

/// Enumerate the admissible coalescence states for `tree` under the given
/// time grid size and `minage` floor (`time_index >= age(node)` and
/// `time_index >= minage`).
///
/// When `internal` is `true`, only nodes in the "maintree" portion of the
/// augmented tree are eligible: every node inside the subtree being
/// regrafted (rooted at `subtree_root`, inclusive) is excluded, since
/// regrafting a subtree onto one of its own branches is not a valid
/// coalescence target, matching the internal-threading regraft semantics.
///
/// `removed_root_ceiling`, when given, overrides the coalescence ceiling for
/// the maintree root itself: under internal threading the bookkeeping root
/// above it is a synthetic node whose own `.age` carries no biological
/// meaning, so the true ceiling is wherever the original (now detached)
/// root used to sit — pass `Model::removed_root_age_index()` there. Ignored
/// when `internal` is `false`.
pub fn get_coal_states<T: LocalTree>(
    tree: &T,
    ntimes: usize,
    minage: usize,
    internal: bool,
    subtree_root: NodeId,
    removed_root_ceiling: Option<usize>,
) -> States {
    let mut states = Vec::new();
    let mut indexes = std::collections::HashMap::new();

    let mut postorder = Vec::new();
    tree.get_postorder(&mut postorder);

    let in_subtree = |node: NodeId| -> bool {
        if !internal {
            return false;
        }
        let mut cursor = node;
        loop {
            if cursor == subtree_root {
                return true;
            }
            if cursor == crate::local_tree::NULL_NODE {
                return false;
            }
            cursor = tree.node(cursor).parent;
        }
    };

    let maintree_root = if internal { tree.get_sibling(subtree_root) } else { crate::local_tree::NULL_NODE };

    for &node in &postorder {
        if in_subtree(node) {
            continue;
        }
        if internal && node == tree.root() {
            // The global root under internal threading is a bookkeeping
            // node (parent of subtree root and maintree root), not itself a
            // coalescence target.
            continue;
        }
        let age1 = tree.node(node).age.max(minage);
        let age2 = if internal && node == maintree_root {
            removed_root_ceiling.unwrap_or_else(|| {
                if tree.node(node).parent == crate::local_tree::NULL_NODE {
                    ntimes - 1
                } else {
                    tree.node(tree.node(node).parent).age
                }
            })
        } else if tree.node(node).parent == crate::local_tree::NULL_NODE {
            ntimes - 1
        } else {
            tree.node(tree.node(node).parent).age
        };
        if age1 > age2 {
            continue;
        }
        let start = states.len();
        for t in age1..=age2 {
            states.push(CoalState { node, time: t });
        }
        if states.len() > start {
            indexes.insert(node, start);
        }
    }

    States { states, indexes }
}
