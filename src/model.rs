//! Demographic / mutation model parameters.
//!
//! The model is owned entirely by the caller ("the core consumes
//! interfaces from those collaborators but does not reimplement them").
//! [`Model`] is a plain data container; the core only ever reads from it.

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    /// Number of discrete time points in the time grid.
    pub ntimes: usize,
    /// Ascending time grid; `times[0] == 0.0` by convention.
    pub times: Vec<f64>,
    /// Effective population size between consecutive time points.
    /// Length is `ntimes - 1` in the diploid-coalescent convention used by
    /// the local model; stored here as given by the caller.
    pub popsizes: Vec<f64>,
    /// Recombination rate per site per generation.
    pub rho: f64,
    /// Mutation rate per site per generation.
    pub mu: f64,
    /// Floor under any branch length, preventing zero-length branches.
    pub mintime: f64,
    /// Time at which a removed root (if any) is pinned; used by internal
    /// threading when the maintree root itself is the coalescence target.
    pub removed_root_time: f64,
}

impl Model {
    /// Floor a branch length at [`Model::mintime`].
    pub fn floor_branch(&self, length: f64) -> f64 {
        length.max(self.mintime)
    }

    /// The minimum admissible time index, i.e. 0 unless a floor pushes it up.
    pub fn min_time_index(&self) -> usize {
        0
    }

    /// The time-grid index closest to (at or above) [`Model::removed_root_time`].
    /// Internal threading uses this as the coalescence ceiling for the
    /// maintree root itself, since the bookkeeping root above it is a
    /// synthetic node whose own age carries no biological meaning.
    pub fn removed_root_age_index(&self) -> usize {
        self.times
            .iter()
            .position(|&t| t >= self.removed_root_time)
            .unwrap_or_else(|| self.ntimes.saturating_sub(1))
    }
}

/// Per-position model parameters a caller may want to vary along the
/// chromosome (recombination/mutation rate maps). `driver::materialize_block`
/// calls [`LocalModel::get_local_model`] once per block, at block entry,
/// before enumerating that block's coalescence states.
pub trait LocalModel {
    /// Populate `out` with the model parameters effective at `pos`.
    fn get_local_model(&self, pos: i64, out: &mut Model);
}

/// A model with no positional variation: `get_local_model` is a clone.
impl LocalModel for Model {
    fn get_local_model(&self, _pos: i64, out: &mut Model) {
        out.clone_from(self);
    }
}
