//! The transition and switch operators.
//!
//! These are fully external collaborators: the forward/backward engines
//! only ever call through the traits below. We still need a concrete
//! instance to exercise the engines end-to-end, so this module also
//! provides [`SimpleTransition`] and [`SimpleSwitch`] — reference
//! implementations satisfying the factored-form contract, used by this
//! crate's own tests and available to callers who have not yet wired in
//! their own population-genetic transition model.

use crate::states::{CoalState, States};
use crate::time_grid::BranchAge;

/// The within-block transition operator contract.
pub trait TransitionOperator {
    fn ntimes(&self) -> usize;

    /// `T(tree, states, j, k)`: non-negative, rows sum to a positive
    /// constant (not necessarily 1).
    fn prob(&self, states: &States, j: usize, k: usize) -> f64;

    /// Log-space companion of [`TransitionOperator::prob`], used by Viterbi
    /// to avoid underflow.
    fn log_prob(&self, states: &States, j: usize, k: usize) -> f64;

    /// `time_only(a, b)`: the `ntimes x ntimes` baseline table, independent
    /// of which branch the source/destination states sit on.
    fn time_only(&self, a: usize, b: usize) -> f64;

    /// `time_node_delta(a, k, minage)`: the additional probability over the
    /// `time_only` baseline for a destination `k` on the same branch as the
    /// source, given the source time `a`.
    fn time_node_delta(&self, a: usize, k: CoalState, minage: usize) -> f64;

    /// `get_time(a, b, c, minage, same_branch)`: `c` is the
    /// destination node's own age when `same_branch` is set (ignored
    /// otherwise). A default implementation composes `time_only` and
    /// `time_node_delta`, keyed on node age rather than node identity,
    /// which is all the same-branch correction depends on for a
    /// time-homogeneous coalescent model.
    fn get_time(&self, a: usize, b: usize, c: usize, minage: usize, same_branch: bool) -> f64 {
        let base = self.time_only(a, b);
        if same_branch {
            base + self.time_node_delta(a, CoalState { node: 0, time: b }, minage.max(c))
        } else {
            base
        }
    }

    /// Branch-age metadata (`age1`, `age2`) for a node.
    fn branch_age(&self, node_age: usize, parent_age_or_top: usize, minage: usize) -> BranchAge {
        BranchAge::new(node_age, parent_age_or_top, minage)
    }

    /// A prior over the first block's states, used when the driver does not
    /// supply one.
    fn state_prior(&self, states: &States) -> Vec<f64>;
}

/// The cross-block switch operator contract.
pub trait SwitchOperator {
    fn nstates1(&self) -> usize;
    fn nstates2(&self) -> usize;

    /// The deterministic destination for source `j`, or `None` if `j` is
    /// one of the two distinguished sources.
    fn determ(&self, j: usize) -> Option<usize>;
    /// `ln(determprob[j])`, valid when `determ(j)` is `Some`.
    fn determ_log_prob(&self, j: usize) -> f64;

    fn recombsrc(&self) -> Option<usize>;
    fn recoalsrc(&self) -> Option<usize>;

    /// `recombrow[k]`, in log space; `f64::NEG_INFINITY` for excluded `k`.
    fn recomb_log_prob(&self, k: usize) -> f64;
    /// `recoalrow[k]`, in log space; `f64::NEG_INFINITY` for excluded `k`.
    fn recoal_log_prob(&self, k: usize) -> f64;
}

/// A reference [`TransitionOperator`]: the time-only baseline decays
/// geometrically with the time-index distance, and a same-branch bonus
/// favors staying on the source branch. Not a claim about the true
/// population-genetic transition density (that is this trait's entire
/// reason for existing as an external collaborator) — just a concrete,
/// well-behaved instance for exercising the forward/backward engines.
#[derive(Debug, Clone)]
pub struct SimpleTransition {
    ntimes: usize,
    /// Per-time-index decay factor in `(0, 1)`; larger means stickier.
    decay: f64,
    /// Extra same-branch weight added on top of the baseline.
    same_branch_bonus: f64,
}

impl SimpleTransition {
    pub fn new(ntimes: usize, decay: f64, same_branch_bonus: f64) -> Self {
        assert!((0.0..1.0).contains(&decay), "decay must be in [0, 1)");
        SimpleTransition {
            ntimes,
            decay,
            same_branch_bonus,
        }
    }
}

impl TransitionOperator for SimpleTransition {
    fn ntimes(&self) -> usize {
        self.ntimes
    }

    fn prob(&self, states: &States, j: usize, k: usize) -> f64 {
        let a = states.get(j).time;
        let b = states.get(k).time;
        let mut p = self.time_only(a, b);
        if states.get(j).node == states.get(k).node {
            p += self.time_node_delta(a, states.get(k), 0);
        }
        p
    }

    fn log_prob(&self, states: &States, j: usize, k: usize) -> f64 {
        self.prob(states, j, k).ln()
    }

    fn time_only(&self, a: usize, b: usize) -> f64 {
        let d = (a as isize - b as isize).unsigned_abs() as i32;
        self.decay.powi(d) * (1.0 - self.decay)
    }

    fn time_node_delta(&self, a: usize, k: CoalState, _minage: usize) -> f64 {
        if k.time == a {
            self.same_branch_bonus
        } else {
            self.same_branch_bonus * self.decay.powi((a as isize - k.time as isize).unsigned_abs() as i32)
        }
    }

    fn state_prior(&self, states: &States) -> Vec<f64> {
        // Uniform prior; rows need not sum to 1 (forward normalizes).
        vec![1.0; states.len()]
    }
}

/// A reference [`SwitchOperator`] built directly from its component parts.
#[derive(Debug, Clone)]
pub struct SwitchMatrix {
    nstates1: usize,
    nstates2: usize,
    determ: Vec<Option<usize>>,
    determ_log_prob: Vec<f64>,
    recombsrc: Option<usize>,
    recoalsrc: Option<usize>,
    recomb_row: Vec<f64>,
    recoal_row: Vec<f64>,
}

impl SwitchMatrix {
    /// `determ`/`determ_log_prob` are indexed by source; `recomb_row`/
    /// `recoal_row` are indexed by destination and default to
    /// `f64::NEG_INFINITY` when absent.
    pub fn new(
        nstates1: usize,
        nstates2: usize,
        determ: Vec<Option<usize>>,
        determ_log_prob: Vec<f64>,
        recombsrc: Option<usize>,
        recoalsrc: Option<usize>,
        recomb_row: Vec<f64>,
        recoal_row: Vec<f64>,
    ) -> Self {
        assert_eq!(determ.len(), nstates1);
        assert_eq!(determ_log_prob.len(), nstates1);
        assert_eq!(recomb_row.len(), nstates2);
        assert_eq!(recoal_row.len(), nstates2);
        SwitchMatrix {
            nstates1,
            nstates2,
            determ,
            determ_log_prob,
            recombsrc,
            recoalsrc,
            recomb_row,
            recoal_row,
        }
    }

    /// The identity switch used by scenario S3: every source maps
    /// deterministically to the same index, no distinguished sources.
    pub fn identity(nstates: usize) -> Self {
        SwitchMatrix::new(
            nstates,
            nstates,
            (0..nstates).map(Some).collect(),
            vec![0.0; nstates],
            None,
            None,
            vec![f64::NEG_INFINITY; nstates],
            vec![f64::NEG_INFINITY; nstates],
        )
    }
}

impl SwitchOperator for SwitchMatrix {
    fn nstates1(&self) -> usize {
        self.nstates1
    }

    fn nstates2(&self) -> usize {
        self.nstates2
    }

    fn determ(&self, j: usize) -> Option<usize> {
        self.determ[j]
    }

    fn determ_log_prob(&self, j: usize) -> f64 {
        self.determ_log_prob[j]
    }

    fn recombsrc(&self) -> Option<usize> {
        self.recombsrc
    }

    fn recoalsrc(&self) -> Option<usize> {
        self.recoalsrc
    }

    fn recomb_log_prob(&self, k: usize) -> f64 {
        self.recomb_row[k]
    }

    fn recoal_log_prob(&self, k: usize) -> f64 {
        self.recoal_row[k]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_only_is_symmetric_and_decays_with_distance() {
        let t = SimpleTransition::new(5, 0.5, 0.1);
        assert_eq!(t.time_only(1, 3), t.time_only(3, 1));
        assert!(t.time_only(1, 1) > t.time_only(1, 2));
    }

    #[test]
    fn identity_switch_routes_every_source_to_itself() {
        let sw = SwitchMatrix::identity(4);
        for j in 0..4 {
            assert_eq!(sw.determ(j), Some(j));
            assert_eq!(sw.determ_log_prob(j), 0.0);
        }
        assert_eq!(sw.recombsrc(), None);
        assert_eq!(sw.recoalsrc(), None);
    }
}
