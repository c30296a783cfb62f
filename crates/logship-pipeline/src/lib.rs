//! logship pipeline
//!
//! The per-worker event pipeline (pull, enrich, dispatch, stash, retry),
//! the adapter registry, and the worker supervisor.

pub mod pipeline;
pub mod registry;
pub mod supervisor;

pub use pipeline::{EnrichSpec, Worker, WorkerInput};
pub use registry::{build_output, build_outputs, BuiltOutput};
pub use supervisor::Supervisor;
