// SPDX-License-Identifier: MIT

//! Engine configuration and YAML loading
//!
//! A graph is built once with a [`GraphConfig`]; the config bounds every run of
//! that graph.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{GraphError, Result};
use crate::helpdesk::STEPS_PER_ATTEMPT;
use crate::workflow::state::StateSchema;

fn default_max_steps() -> u64 {
    25
}

fn default_ceiling() -> u64 {
    3
}

/// What happens to a fan-out when one of its branches fails
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BranchFailurePolicy {
    /// Let started branches finish, launch nothing new, then fail (default)
    #[default]
    Drain,
    /// Cancel started branches immediately, then fail
    Abort,
}

/// Limits applied to every run of a graph
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GraphConfig {
    /// Hard bound on supersteps per run
    pub max_steps: u64,
    /// Wall-clock bound for one fan-out phase, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_out_timeout_ms: Option<u64>,
    /// Maximum branches of one fan-out running at the same time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    pub on_branch_failure: BranchFailurePolicy,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            fan_out_timeout_ms: None,
            max_concurrency: None,
            on_branch_failure: BranchFailurePolicy::default(),
        }
    }
}

impl GraphConfig {
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_fan_out_timeout(mut self, timeout: Duration) -> Self {
        self.fan_out_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_failure_policy(mut self, policy: BranchFailurePolicy) -> Self {
        self.on_branch_failure = policy;
        self
    }

    pub fn fan_out_timeout(&self) -> Option<Duration> {
        self.fan_out_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(GraphError::config("max_steps must be at least 1"));
        }
        if self.max_concurrency == Some(0) {
            return Err(GraphError::config("max_concurrency must be at least 1"));
        }
        if self.fan_out_timeout_ms == Some(0) {
            return Err(GraphError::config("fan_out_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Bounded retry loop settings for subgraphs
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Attempts after which the loop exits even if incomplete
    pub ceiling: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            ceiling: default_ceiling(),
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub subgraph: GraphConfig,
    #[serde(default)]
    pub retry: LoopConfig,
    #[serde(default)]
    pub state: StateSchema,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.graph.validate()?;
        self.subgraph.validate()?;
        if self.retry.ceiling == 0 {
            return Err(GraphError::config("retry ceiling must be at least 1"));
        }
        // The subtask loop must reach its ceiling before the step limit
        let needed = self.retry.ceiling.saturating_mul(STEPS_PER_ATTEMPT);
        if needed > self.subgraph.max_steps {
            return Err(GraphError::config(format!(
                "retry ceiling {} needs subgraph.max_steps of at least {} (got {})",
                self.retry.ceiling, needed, self.subgraph.max_steps
            )));
        }
        Ok(())
    }
}

/// Loads engine configuration from YAML files
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load and validate a configuration file
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<EngineConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        log::debug!("Loaded config from {}", path.display());
        Self::parse_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn parse_yaml(content: &str) -> Result<EngineConfig> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
