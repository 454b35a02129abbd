//! Node execution and retry management.

mod executor;
mod retry;

pub use executor::{
    ENV_ACCESSORS, ENV_EXECUTION_ID, ENV_INPUTS, ENV_NODE_ID, NodeExecutor, classify,
};
pub use retry::{AttemptSummary, RetryPolicy, run_with_retry};
