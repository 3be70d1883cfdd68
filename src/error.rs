// SPDX-License-Identifier: MIT

//! Typed error handling for kinetic-graph
//!
//! Construction errors are raised once, while a graph is being built and
//! compiled. Run errors abort a single invocation and are returned to the
//! invoker; the compiled graph stays usable for the next run.

use std::time::Duration;
use thiserror::Error;

/// Error raised by a node body or a branch function.
pub type NodeError = Box<dyn std::error::Error + Send + Sync>;

/// Convenience alias used throughout the crate
pub type Result<T, E = GraphError> = std::result::Result<T, E>;

/// Top-level error type for graph construction and execution
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node name was registered twice
    #[error("Node '{0}' is already registered")]
    DuplicateNode(String),

    /// A node name could not be resolved
    #[error("Node '{0}' not found")]
    UnknownNode(String),

    /// A node already has an outgoing edge
    #[error("Node '{0}' already has an outgoing edge")]
    DuplicateEdge(String),

    /// No entry point was designated before compiling
    #[error("Graph has no entry point")]
    MissingEntryPoint,

    /// A second entry point was designated
    #[error("Entry point already set to '{0}'")]
    EntryPointAlreadySet(String),

    /// A node has neither an outgoing edge nor a terminal designation
    #[error("Node '{0}' has no outgoing edge and is not a finish point")]
    DanglingNode(String),

    /// Fanned-out nodes do not share a single static successor
    #[error("Fan-out from '{from}' has no single convergence node: {successors:?}")]
    DivergentFanOut {
        from: String,
        successors: Vec<String>,
    },

    /// A partial update referenced a field missing from the schema
    #[error("Field '{0}' is not declared in the state schema")]
    UnknownField(String),

    /// A value does not fit the field's declared type or merge policy
    #[error("Type mismatch on field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    /// The superstep safety net tripped
    #[error("Step limit of {limit} exceeded")]
    StepLimitExceeded { limit: u64 },

    /// A fan-out phase did not finish within its wall-clock bound
    #[error("Fan-out from '{from}' did not complete within {timeout:?}")]
    FanOutTimeout { from: String, timeout: Duration },

    /// A node body failed
    #[error("Node '{node}' failed: {source}")]
    NodeExecution {
        node: String,
        #[source]
        source: NodeError,
    },

    /// Configuration errors (invalid limits, malformed files)
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl GraphError {
    /// Wrap a node failure
    pub fn node(node: impl Into<String>, source: impl Into<NodeError>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            source: source.into(),
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch(
        field: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            field: field.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// True for errors raised while building or compiling a graph
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNode(_)
                | Self::DuplicateEdge(_)
                | Self::MissingEntryPoint
                | Self::EntryPointAlreadySet(_)
                | Self::DanglingNode(_)
                | Self::InvalidConfig(_)
        )
    }
}
