//! Error types for the ARG threading core.
//!
//! The core never retries or recovers from a fatal condition (see the
//! design): every public entry point returns a [`Result`] wrapping
//! [`ThreadingError`], and callers decide whether to restart with different
//! parameters or seeds.

/// Errors surfaced by the threading core.
///
/// Each variant corresponds to one of the fatal error kinds described in the
/// design: a degenerate forward column, a pinned endpoint state that cannot
/// be located, a `NaN` that leaked into a transition table, or a traceback
/// step that finds only zero-probability transitions.
#[derive(Debug, thiserror::Error)]
pub enum ThreadingError {
    /// A forward column's total probability mass was not strictly positive.
    #[error("degenerate forward column at site {site}: column sum/max <= 0 (last good column at site {last_good_site:?})")]
    DegenerateColumn {
        /// Genomic coordinate of the offending column.
        site: i64,
        /// Coordinate of the last column known to have positive mass, if any.
        last_good_site: Option<i64>,
    },

    /// A pinned start/end coalescence state was not present in the block's
    /// enumerated state set.
    #[error("pinned state {state:?} not found among this block's coalescence states")]
    StateNotFound {
        /// The `(node, time_index)` pair the caller attempted to pin.
        state: (i32, usize),
    },

    /// A transition table entry was `NaN`, signalling upstream parameter
    /// corruption (e.g. a malformed time grid or a zero population size).
    #[error("NaN encountered in transition table at {context}")]
    NanTransition {
        /// Where in the pipeline the NaN was observed.
        context: &'static str,
    },

    /// During traceback, every candidate predecessor had zero transition
    /// probability into the already-sampled successor state.
    #[error("path dead end at site {site}: no predecessor state transitions into the sampled successor")]
    PathDeadEnd {
        /// Genomic coordinate at which the dead end occurred.
        site: i64,
    },

    /// A numeric index did not fit the narrower integer type used downstream.
    #[error("index conversion failed: {0}")]
    Conversion(#[from] std::num::TryFromIntError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ThreadingError>;
