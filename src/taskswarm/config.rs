//! Environment contract and engine-wide settings.
//!
//! The core assumes exactly one environment-level contract: the provider API
//! key in [`API_KEY_ENV`]. Everything else is explicit configuration carried
//! by [`EngineSettings`].

use std::error::Error;
use std::fmt;

use crate::taskswarm::aggregator::{ConflictResolution, OutputType};

/// Well-known environment variable holding the provider API key.
pub const API_KEY_ENV: &str = "DASHSCOPE_API_KEY";

/// Configuration errors.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// The API key environment variable is absent or empty.
    MissingApiKey,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingApiKey => {
                write!(f, "environment variable {} is not set", API_KEY_ENV)
            }
        }
    }
}

impl Error for ConfigError {}

/// Read the provider API key from the environment.
pub fn api_key_from_env() -> Result<String, ConfigError> {
    match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(ConfigError::MissingApiKey),
    }
}

/// Engine-wide knobs consumed by the orchestrator.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Cap on simultaneously running workers; `None` means unbounded.
    pub max_concurrent_workers: Option<usize>,
    /// Outer wall-clock cap over all iterations of a single worker, seconds.
    pub agent_timeout_secs: u64,
    /// Per-job budget of tool invocations before workers are throttled.
    pub max_tool_calls: u64,
    /// Whether completed steps are scored by the quality gate.
    pub enable_quality_gate: bool,
    /// Minimum passing score for the quality gate.
    pub quality_threshold: f64,
    /// Quality-gate re-execution budget per step.
    pub max_retry_on_failure: u32,
    /// Strategy applied when duplicate results survive execution.
    pub conflict_resolution: ConflictResolution,
    /// Target shape of the aggregated output.
    pub output_type: OutputType,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_workers: Some(8),
            agent_timeout_secs: 600,
            max_tool_calls: 200,
            enable_quality_gate: true,
            quality_threshold: 6.0,
            max_retry_on_failure: 2,
            conflict_resolution: ConflictResolution::MajorityVote,
            output_type: OutputType::Report,
        }
    }
}

impl EngineSettings {
    /// Override the worker concurrency cap (builder pattern).
    pub fn with_worker_cap(mut self, cap: usize) -> Self {
        self.max_concurrent_workers = Some(cap);
        self
    }

    /// Remove the worker concurrency cap (builder pattern).
    pub fn without_worker_cap(mut self) -> Self {
        self.max_concurrent_workers = None;
        self
    }

    /// Override the per-worker wall-clock cap (builder pattern).
    pub fn with_agent_timeout_secs(mut self, secs: u64) -> Self {
        self.agent_timeout_secs = secs;
        self
    }

    /// Disable the quality gate entirely (builder pattern).
    pub fn without_quality_gate(mut self) -> Self {
        self.enable_quality_gate = false;
        self
    }

    /// Override the quality-gate pass threshold (builder pattern).
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    /// Override the conflict-resolution strategy (builder pattern).
    pub fn with_conflict_resolution(mut self, strategy: ConflictResolution) -> Self {
        self.conflict_resolution = strategy;
        self
    }

    /// Override the aggregated output type (builder pattern).
    pub fn with_output_type(mut self, output_type: OutputType) -> Self {
        self.output_type = output_type;
        self
    }
}
