// SPDX-License-Identifier: MIT

//! The single shared state of a run and its serialized merge point

use std::sync::Arc;
use tokio::sync::RwLock;

use super::store::{Update, WorkflowState};
use crate::error::Result;

/// Shared state of one run instance.
///
/// All writers go through [`SharedState::merge`], which holds the write lock
/// for the whole update. Readers take a snapshot under the read lock, so they
/// either see an update fully applied or not at all.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<RwLock<WorkflowState>>,
}

impl SharedState {
    pub fn new(state: WorkflowState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    /// Apply a partial update; concurrent callers are applied one at a time
    pub async fn merge(&self, update: &Update) -> Result<()> {
        let mut state = self.inner.write().await;
        state.apply(update)
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> WorkflowState {
        self.inner.read().await.clone()
    }

    /// Final state, cloning only if other handles are still alive
    pub async fn into_inner(self) -> WorkflowState {
        match Arc::try_unwrap(self.inner) {
            Ok(lock) => lock.into_inner(),
            Err(shared) => shared.read().await.clone(),
        }
    }
}
