// SPDX-License-Identifier: MIT

use crate::error::{GraphError, Result};
use crate::workflow::node::Node;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps node names to their callables. Frozen once the graph is compiled.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, node: Arc<dyn Node>) -> Result<()> {
        let name = name.into();
        if self.nodes.contains_key(&name) {
            return Err(GraphError::DuplicateNode(name));
        }
        self.nodes.insert(name, node);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Node>> {
        self.nodes
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
