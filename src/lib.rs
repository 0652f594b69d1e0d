//! `argthread`: the emission / forward-backward HMM core of an
//! ancestral-recombination-graph threading engine.
//!
//! A chromosome is threaded into an existing ARG — represented as a
//! sequence of local trees connected by SPR operations — by computing, per
//! genomic block, the per-site likelihood of attaching the new lineage at
//! each candidate coalescence state (the emission engine, [`emission`]),
//! running a column-by-column HMM forward pass whose transition operator is
//! a factored (compressed) matrix exploiting the tree's structure
//! ([`forward`]), then sampling or maximizing a coalescence-point
//! trajectory by backward traceback ([`traceback`]). [`driver`] packages
//! these into the entry points a caller threads one chromosome through.
//!
//! The surrounding machinery — CLI, file I/O, statistical model fitting,
//! MCMC orchestration, ARG persistence and rendering — is out of scope; see
//! the crate's design notes. The local tree, sequences, model parameters,
//! transition/switch operators, and the ARG iterator are external
//! collaborators whose contracts this crate consumes as traits
//! ([`local_tree`], [`sequences`], [`model`], [`transition`],
//! [`arg_iterator`], [`external`]) without reimplementing their storage.

pub mod arg_iterator;
pub mod driver;
pub mod emission;
pub mod error;
pub mod external;
pub mod forward;
pub mod local_tree;
pub mod model;
pub mod sequences;
pub mod states;
pub mod time_grid;
pub mod traceback;
pub mod transition;

pub use driver::{
    cond_sample_arg_thread, cond_sample_arg_thread_internal, max_arg_thread, max_arg_thread_internal,
    resample_arg_thread, sample_arg_thread, sample_arg_thread_internal, EndpointConditioning, ThreadingDriver,
};
pub use error::{Result, ThreadingError};
