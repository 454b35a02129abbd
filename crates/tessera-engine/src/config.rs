//! Engine and service configuration.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

#[cfg(feature = "config")]
use clap::Args;

use crate::exec::RetryPolicy;
use crate::stream::EventStreamer;

/// Configuration for the workflow execution engine.
///
/// Workflow-level settings (max concurrent nodes, global timeout) take
/// precedence per run; these values apply when a workflow leaves them
/// unset and to engine-internal concerns no workflow controls.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Fallback bound on concurrently running nodes per execution.
    #[builder(default = "5")]
    pub max_concurrent_nodes: usize,

    /// Fallback global wall-clock budget per execution.
    #[builder(default = "Duration::from_secs(3600)")]
    pub global_timeout: Duration,

    /// Retry policy applied to nodes that do not configure their own.
    #[builder(default)]
    pub default_retry: RetryPolicy,

    /// How often the interaction gate polls for resolution.
    #[builder(default = "Duration::from_millis(250)")]
    pub interaction_poll_interval: Duration,

    /// Attempts against the execution store before a persistence error
    /// surfaces. In-flight node results are held across these attempts.
    #[builder(default = "3")]
    pub persistence_attempts: u32,

    /// Delay between persistence attempts.
    #[builder(default = "Duration::from_millis(100)")]
    pub persistence_retry_delay: Duration,

    /// Recent-event history retained per execution.
    #[builder(default = "EventStreamer::DEFAULT_HISTORY_CAPACITY")]
    pub event_history_capacity: usize,

    /// Broadcast channel capacity per execution.
    #[builder(default = "EventStreamer::DEFAULT_CHANNEL_CAPACITY")]
    pub event_channel_capacity: usize,
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_nodes == Some(0) {
            return Err("max_concurrent_nodes must be at least 1".into());
        }
        if self.persistence_attempts == Some(0) {
            return Err("persistence_attempts must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 5,
            global_timeout: Duration::from_secs(3600),
            default_retry: RetryPolicy::default(),
            interaction_poll_interval: Duration::from_millis(250),
            persistence_attempts: 3,
            persistence_retry_delay: Duration::from_millis(100),
            event_history_capacity: EventStreamer::DEFAULT_HISTORY_CAPACITY,
            event_channel_capacity: EventStreamer::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Returns a builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Service-level configuration with environment/CLI wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
pub struct ServiceConfig {
    /// Hours to retain terminal executions before age-based purge.
    #[cfg_attr(
        feature = "config",
        arg(long = "engine-retention-hours", env = "ENGINE_RETENTION_HOURS")
    )]
    pub engine_retention_hours: Option<u64>,

    /// Fallback bound on concurrently running nodes per execution.
    #[cfg_attr(
        feature = "config",
        arg(long = "engine-max-concurrent-nodes", env = "ENGINE_MAX_CONCURRENT_NODES")
    )]
    pub engine_max_concurrent_nodes: Option<usize>,
}

// Default values
const DEFAULT_RETENTION_HOURS: u64 = 24 * 30;

impl ServiceConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine_retention_hours: None,
            engine_max_concurrent_nodes: None,
        }
    }

    /// Returns the retention window for terminal executions.
    #[inline]
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(
            self.engine_retention_hours
                .unwrap_or(DEFAULT_RETENTION_HOURS)
                * 3600,
        )
    }

    /// Validate the configuration and return any issues.
    pub fn validate(&self) -> Result<(), String> {
        if self.engine_max_concurrent_nodes == Some(0) {
            return Err("engine_max_concurrent_nodes cannot be zero".to_string());
        }
        Ok(())
    }

    /// Builds an [`EngineConfig`] applying any overrides set here.
    pub fn to_engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(max) = self.engine_max_concurrent_nodes {
            config.max_concurrent_nodes = max;
        }
        config
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new()
    }
}
