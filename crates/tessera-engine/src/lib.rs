#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod exec;
pub mod execution;
pub mod graph;
pub mod interact;
pub mod prelude;
pub mod program;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod stream;

pub use error::{EngineError, EngineResult, FailureKind};
pub use interact::InteractionStore;
pub use program::ProgramLookup;
pub use service::{WorkflowService, WorkflowServiceBuilder};
pub use store::ExecutionStore;

/// Tracing target for engine operations.
pub const TRACING_TARGET: &str = "tessera_engine";
