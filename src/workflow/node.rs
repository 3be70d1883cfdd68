// SPDX-License-Identifier: MIT

//! Node trait and adapters for plain functions

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::error::NodeError;
use crate::workflow::state::{Update, WorkflowState};

/// A unit of work in a graph: reads a state snapshot, returns a partial update.
///
/// Nodes of one fan-out run concurrently, so implementations must not share
/// mutable data unless they synchronize it themselves.
#[async_trait]
pub trait Node: Send + Sync {
    async fn run(&self, state: WorkflowState) -> Result<Update, NodeError>;
}

/// Node backed by an async function
pub struct FnNode<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Node for FnNode<F>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Update, NodeError>> + Send,
{
    async fn run(&self, state: WorkflowState) -> Result<Update, NodeError> {
        (self.f)(state).await
    }
}

/// Node backed by a synchronous, possibly blocking function.
///
/// The function runs on tokio's blocking pool so it never stalls sibling
/// branches.
pub struct BlockingNode<F> {
    f: Arc<F>,
}

#[async_trait]
impl<F> Node for BlockingNode<F>
where
    F: Fn(WorkflowState) -> Result<Update, NodeError> + Send + Sync + 'static,
{
    async fn run(&self, state: WorkflowState) -> Result<Update, NodeError> {
        let f = self.f.clone();
        tokio::task::spawn_blocking(move || f(state)).await?
    }
}

/// Wrap an async function as a node
pub fn node_fn<F, Fut>(f: F) -> Arc<dyn Node>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Update, NodeError>> + Send + 'static,
{
    Arc::new(FnNode { f })
}

/// Wrap a blocking function as a node
pub fn blocking_fn<F>(f: F) -> Arc<dyn Node>
where
    F: Fn(WorkflowState) -> Result<Update, NodeError> + Send + Sync + 'static,
{
    Arc::new(BlockingNode { f: Arc::new(f) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::{FieldType, StateSchema};
    use serde_json::json;

    fn state() -> WorkflowState {
        WorkflowState::new(Arc::new(
            StateSchema::new().overwrite("question", FieldType::String),
        ))
    }

    #[tokio::test]
    async fn test_node_fn_sees_state() {
        let node = node_fn(|state: WorkflowState| async move {
            let q = state.get("question").cloned().unwrap_or_default();
            Ok::<_, NodeError>(
                Update::new().with("question", json!(format!("{}?", q.as_str().unwrap_or("")))),
            )
        });

        let mut s = state();
        s.apply(&Update::new().with("question", "why")).unwrap();
        let update = node.run(s).await.unwrap();
        assert_eq!(update.get("question"), Some(&json!("why?")));
    }

    #[tokio::test]
    async fn test_blocking_fn_runs_off_the_runtime() {
        let node = blocking_fn(|_state| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(Update::new().with("question", "done"))
        });
        let update = node.run(state()).await.unwrap();
        assert_eq!(update.get("question"), Some(&json!("done")));
    }

    #[tokio::test]
    async fn test_node_error_propagates() {
        let node = node_fn(|_state| async { Err::<Update, NodeError>("boom".into()) });
        let err = node.run(state()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
