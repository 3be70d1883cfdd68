//! Superstep scheduler
//!
//! A run walks the graph one superstep at a time. A superstep is either a
//! single node execution or one whole fan-out phase; after each superstep the
//! merged state is published to stream subscribers.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use super::edges::EdgeTable;
use super::types::{Dispatch, Transition, END};
use crate::config::{BranchFailurePolicy, GraphConfig};
use crate::error::{GraphError, Result};
use crate::workflow::node::Node;
use crate::workflow::registry::NodeRegistry;
use crate::workflow::state::{SharedState, StateSchema, Update, WorkflowState};

/// State published after each completed superstep
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// 1-based superstep number
    pub step: u64,
    /// Node(s) executed in this superstep, in dispatch order
    pub nodes: Vec<String>,
    pub state: WorkflowState,
    pub completed_at: DateTime<Utc>,
}

/// Stream of snapshots for one run; a failure is the last item
pub type GraphStream = ReceiverStream<Result<StepSnapshot>>;

type StepSink<'a> = Option<&'a mpsc::Sender<Result<StepSnapshot>>>;

/// Scheduler cursor
enum Cursor {
    Ready(String),
    AwaitingFanOut {
        from: String,
        branches: Vec<Dispatch>,
        converge: String,
    },
    Done,
}

pub(crate) struct GraphParts {
    pub name: String,
    pub schema: Arc<StateSchema>,
    pub registry: NodeRegistry,
    pub edges: EdgeTable,
    pub entry: String,
    pub config: GraphConfig,
}

/// An immutable, validated graph. Cloning is cheap; every clone shares the
/// same definition, and each `invoke` gets its own state.
#[derive(Clone)]
pub struct CompiledGraph {
    inner: Arc<GraphParts>,
}

impl CompiledGraph {
    pub(crate) fn from_parts(parts: GraphParts) -> Self {
        Self {
            inner: Arc::new(parts),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Arc<StateSchema> {
        &self.inner.schema
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    pub fn entry_point(&self) -> &str {
        &self.inner.entry
    }

    /// A fresh state holding the schema defaults
    pub fn new_state(&self) -> WorkflowState {
        WorkflowState::new(self.inner.schema.clone())
    }

    /// Run the graph to completion and return the final state
    pub async fn invoke(&self, input: Update) -> Result<WorkflowState> {
        self.run(input, None).await
    }

    /// Run the graph in the background, yielding a snapshot per superstep.
    ///
    /// Must be called from within a tokio runtime. Each call starts a new run.
    /// Dropping the stream stops the run before its next superstep.
    pub fn stream(&self, input: Update) -> GraphStream {
        let (tx, rx) = mpsc::channel(16);
        let graph = self.clone();
        tokio::spawn(async move {
            if let Err(e) = graph.run(input, Some(&tx)).await {
                if tx.send(Err(e)).await.is_err() {
                    log::debug!("Run error not delivered, stream closed");
                }
            }
        });
        ReceiverStream::new(rx)
    }

    async fn run(&self, input: Update, sink: StepSink<'_>) -> Result<WorkflowState> {
        let run_id = Uuid::new_v4();
        log::info!(
            "[{}] Starting graph '{}' at '{}'",
            run_id,
            self.inner.name,
            self.inner.entry
        );

        match self.run_steps(&run_id, input, sink).await {
            Ok(state) => {
                log::info!("[{}] Graph '{}' finished", run_id, self.inner.name);
                Ok(state)
            }
            Err(e) => {
                log::error!("[{}] Graph '{}' failed: {}", run_id, self.inner.name, e);
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        run_id: &Uuid,
        input: Update,
        sink: StepSink<'_>,
    ) -> Result<WorkflowState> {
        let mut initial = self.new_state();
        initial.apply(&input)?;
        let shared = SharedState::new(initial);

        let mut cursor = Cursor::Ready(self.inner.entry.clone());
        let mut step: u64 = 0;

        loop {
            if detached(sink) {
                log::info!("[{}] Stream closed, stopping after step {}", run_id, step);
                return Ok(shared.into_inner().await);
            }
            cursor = match cursor {
                Cursor::Done => return Ok(shared.into_inner().await),
                Cursor::Ready(node) => {
                    step = self.next_step(step)?;
                    log::info!("[{}] Step {}: executing node '{}'", run_id, step, node);

                    let executable = self.inner.registry.resolve(&node)?;
                    let update = run_node(&node, executable, shared.snapshot().await).await?;
                    shared.merge(&update).await?;
                    log::debug!("[{}] Merged {} keys from '{}'", run_id, update.len(), node);

                    let state = shared.snapshot().await;
                    publish(sink, step, vec![node.clone()], &state).await;

                    let transition =
                        Dispatcher::new(&self.inner.edges, &self.inner.registry).next(&node, &state)?;
                    self.advance(run_id, node, transition)
                }
                Cursor::AwaitingFanOut {
                    from,
                    branches,
                    converge,
                } => {
                    step = self.next_step(step)?;
                    log::info!(
                        "[{}] Step {}: fanning out {} branches from '{}'",
                        run_id,
                        step,
                        branches.len(),
                        from
                    );

                    let nodes: Vec<String> = branches.iter().map(|b| b.node.clone()).collect();
                    self.fan_out(run_id, &from, branches, &shared).await?;

                    let state = shared.snapshot().await;
                    publish(sink, step, nodes, &state).await;
                    follow(converge)
                }
            };
        }
    }

    fn next_step(&self, step: u64) -> Result<u64> {
        let limit = self.inner.config.max_steps;
        if step >= limit {
            return Err(GraphError::StepLimitExceeded { limit });
        }
        Ok(step + 1)
    }

    fn advance(&self, run_id: &Uuid, from: String, transition: Transition) -> Cursor {
        match transition {
            Transition::Next(target) => follow(target),
            Transition::FanOut { branches, converge } if branches.is_empty() => {
                log::info!(
                    "[{}] Empty fan-out from '{}', continuing at '{}'",
                    run_id,
                    from,
                    converge
                );
                follow(converge)
            }
            Transition::FanOut { branches, converge } => Cursor::AwaitingFanOut {
                from,
                branches,
                converge,
            },
        }
    }

    /// Run every branch of a fan-out and merge each result into `shared`
    async fn fan_out(
        &self,
        run_id: &Uuid,
        from: &str,
        branches: Vec<Dispatch>,
        shared: &SharedState,
    ) -> Result<()> {
        let base = shared.snapshot().await;
        let mut pending = VecDeque::with_capacity(branches.len());
        for dispatch in branches {
            let node = self.inner.registry.resolve(&dispatch.node)?;
            let mut state = base.clone();
            state.overlay(&dispatch.payload)?;
            pending.push_back(PendingBranch {
                name: dispatch.node,
                node,
                state,
            });
        }

        let config = &self.inner.config;
        let drive = drive_branches(
            *run_id,
            pending,
            config.max_concurrency.unwrap_or(usize::MAX),
            config.on_branch_failure,
            shared.clone(),
        );

        match config.fan_out_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, drive).await.map_err(|_| {
                GraphError::FanOutTimeout {
                    from: from.to_string(),
                    timeout,
                }
            })?,
            None => drive.await,
        }
    }
}

fn follow(target: String) -> Cursor {
    if target == END {
        Cursor::Done
    } else {
        Cursor::Ready(target)
    }
}

/// True once the consumer of a streamed run has gone away
fn detached(sink: StepSink<'_>) -> bool {
    sink.is_some_and(|tx| tx.is_closed())
}

async fn publish(sink: StepSink<'_>, step: u64, nodes: Vec<String>, state: &WorkflowState) {
    if let Some(tx) = sink {
        let snapshot = StepSnapshot {
            step,
            nodes,
            state: state.clone(),
            completed_at: Utc::now(),
        };
        if tx.send(Ok(snapshot)).await.is_err() {
            log::debug!("Snapshot for step {} not delivered, stream closed", step);
        }
    }
}

/// Execute one node body, turning failures and panics into `NodeExecution`
async fn run_node(name: &str, node: Arc<dyn Node>, state: WorkflowState) -> Result<Update> {
    match AssertUnwindSafe(node.run(state)).catch_unwind().await {
        Ok(Ok(update)) => Ok(update),
        Ok(Err(e)) => Err(GraphError::node(name, e)),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "node panicked".to_string());
            Err(GraphError::node(name, format!("panicked: {}", message)))
        }
    }
}

struct PendingBranch {
    name: String,
    node: Arc<dyn Node>,
    state: WorkflowState,
}

/// Launch branches up to `limit` at a time and merge each one as it completes.
///
/// After the first failure no further branch is launched. Under `Drain` the
/// branches already running finish; under `Abort` they are cancelled.
async fn drive_branches(
    run_id: Uuid,
    mut pending: VecDeque<PendingBranch>,
    limit: usize,
    policy: BranchFailurePolicy,
    shared: SharedState,
) -> Result<()> {
    // Dropping the set (e.g. on timeout) aborts whatever is still running.
    let mut tasks: JoinSet<Result<String>> = JoinSet::new();
    let mut failure: Option<GraphError> = None;

    loop {
        if failure.is_none() {
            while tasks.len() < limit {
                let Some(branch) = pending.pop_front() else {
                    break;
                };
                let shared = shared.clone();
                tasks.spawn(async move {
                    let update = run_node(&branch.name, branch.node, branch.state).await?;
                    shared.merge(&update).await?;
                    Ok::<_, GraphError>(branch.name)
                });
            }
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };

        match joined {
            Ok(Ok(name)) => log::debug!("[{}] Branch '{}' merged", run_id, name),
            Ok(Err(e)) if failure.is_none() => {
                log::error!("[{}] Branch failed: {}", run_id, e);
                if policy == BranchFailurePolicy::Abort {
                    tasks.abort_all();
                }
                if !pending.is_empty() {
                    log::warn!(
                        "[{}] Skipping {} branches that were not started",
                        run_id,
                        pending.len()
                    );
                }
                failure = Some(e);
            }
            Ok(Err(e)) => log::warn!("[{}] Additional branch failure: {}", run_id, e),
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                log::error!("[{}] Branch task failed: {}", run_id, join_err);
                failure.get_or_insert(GraphError::node("<branch>", join_err));
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use crate::workflow::graph::builder::GraphBuilder;
    use crate::workflow::graph::types::{Route, START};
    use crate::workflow::node::node_fn;
    use crate::workflow::state::FieldType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn schema() -> StateSchema {
        StateSchema::new()
            .overwrite("value", FieldType::String)
            .overwrite("count", FieldType::Number)
            .append("log")
    }

    /// Node that appends its own name to `log`
    fn logging_node(name: &'static str) -> Arc<dyn Node> {
        node_fn(move |_state| async move {
            Ok::<_, NodeError>(Update::new().with("log", json!([name])))
        })
    }

    #[tokio::test]
    async fn test_fixed_edges_run_in_order() {
        let mut builder = GraphBuilder::new("seq", schema());
        builder
            .add_node("a", logging_node("a"))
            .unwrap()
            .add_node("b", logging_node("b"))
            .unwrap()
            .add_node("c", logging_node("c"))
            .unwrap()
            .add_edge(START, "a")
            .unwrap()
            .add_edge("a", "b")
            .unwrap()
            .add_edge("b", "c")
            .unwrap()
            .set_finish_point("c")
            .unwrap();
        let graph = builder.compile().unwrap();

        let state = graph.invoke(Update::new()).await.unwrap();
        assert_eq!(state.get("log"), Some(&json!(["a", "b", "c"])));
    }

    #[tokio::test]
    async fn test_node_sees_previous_merge() {
        let mut builder = GraphBuilder::new("data-flow", schema());
        builder
            .add_node(
                "write",
                node_fn(|_s| async { Ok::<_, NodeError>(Update::new().with("value", "from write")) }),
            )
            .unwrap()
            .add_node(
                "read",
                node_fn(|s: WorkflowState| async move {
                    let seen = s.get("value").cloned().unwrap_or_default();
                    Ok::<_, NodeError>(Update::new().with("log", json!([seen])))
                }),
            )
            .unwrap()
            .set_entry_point("write")
            .unwrap()
            .add_edge("write", "read")
            .unwrap()
            .set_finish_point("read")
            .unwrap();
        let graph = builder.compile().unwrap();

        let state = graph.invoke(Update::new()).await.unwrap();
        assert_eq!(state.get("log"), Some(&json!(["from write"])));
    }

    #[tokio::test]
    async fn test_initial_input_is_merged() {
        let mut builder = GraphBuilder::new("input", schema());
        builder
            .add_node("a", logging_node("a"))
            .unwrap()
            .set_entry_point("a")
            .unwrap()
            .set_finish_point("a")
            .unwrap();
        let graph = builder.compile().unwrap();

        let state = graph
            .invoke(Update::new().with("value", "hello").with("log", json!(["seed"])))
            .await
            .unwrap();
        assert_eq!(state.get("value"), Some(&json!("hello")));
        assert_eq!(state.get("log"), Some(&json!(["seed", "a"])));

        let err = graph
            .invoke(Update::new().with("missing", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownField(_)));
    }

    #[tokio::test]
    async fn test_step_limit_exceeded() {
        let mut builder = GraphBuilder::new("loop", schema());
        builder
            .add_node("spin", logging_node("spin"))
            .unwrap()
            .set_entry_point("spin")
            .unwrap()
            .add_edge("spin", "spin")
            .unwrap();
        let graph = builder
            .with_config(GraphConfig::default().with_max_steps(5))
            .compile()
            .unwrap();

        let err = graph.invoke(Update::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::StepLimitExceeded { limit: 5 }));
    }

    #[tokio::test]
    async fn test_node_failure_is_wrapped() {
        let mut builder = GraphBuilder::new("fail", schema());
        builder
            .add_node(
                "broken",
                node_fn(|_s| async { Err::<Update, NodeError>("search backend down".into()) }),
            )
            .unwrap()
            .set_entry_point("broken")
            .unwrap()
            .set_finish_point("broken")
            .unwrap();
        let graph = builder.compile().unwrap();

        match graph.invoke(Update::new()).await.unwrap_err() {
            GraphError::NodeExecution { node, source } => {
                assert_eq!(node, "broken");
                assert_eq!(source.to_string(), "search backend down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_node_is_reported() {
        let mut builder = GraphBuilder::new("panic", schema());
        builder
            .add_node(
                "explode",
                node_fn(|_s| async {
                    if true {
                        panic!("kaboom");
                    }
                    Ok::<_, NodeError>(Update::new())
                }),
            )
            .unwrap()
            .set_entry_point("explode")
            .unwrap()
            .set_finish_point("explode")
            .unwrap();
        let graph = builder.compile().unwrap();

        let err = graph.invoke(Update::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::NodeExecution { ref node, .. } if node == "explode"));
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_bad_update_fails_the_run() {
        let mut builder = GraphBuilder::new("bad-update", schema());
        builder
            .add_node(
                "typo",
                node_fn(|_s| async { Ok::<_, NodeError>(Update::new().with("vaule", "x")) }),
            )
            .unwrap()
            .set_entry_point("typo")
            .unwrap()
            .set_finish_point("typo")
            .unwrap();
        let graph = builder.compile().unwrap();

        let err = graph.invoke(Update::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::UnknownField(ref f) if f == "vaule"));
    }

    fn fan_out_graph(names: Vec<&'static str>, config: GraphConfig) -> CompiledGraph {
        let mut builder = GraphBuilder::new("fan", schema());
        builder
            .add_node("plan", logging_node("plan"))
            .unwrap()
            .add_node(
                "work",
                node_fn(|s: WorkflowState| async move {
                    let value = s.get("value").cloned().unwrap_or_default();
                    Ok::<_, NodeError>(
                        Update::new()
                            .with("log", json!([value.clone()]))
                            .with("count", json!(1)),
                    )
                }),
            )
            .unwrap()
            .add_node("join", logging_node("join"))
            .unwrap()
            .set_entry_point("plan")
            .unwrap()
            .add_fan_out_edges(
                "plan",
                move |_: &WorkflowState| {
                    Route::Send(
                        names
                            .iter()
                            .map(|n| Dispatch::new("work", Update::new().with("value", *n)))
                            .collect(),
                    )
                },
                &["work"],
            )
            .unwrap()
            .add_edge("work", "join")
            .unwrap()
            .set_finish_point("join")
            .unwrap();
        builder.with_config(config).compile().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_out_merges_every_branch() {
        let graph = fan_out_graph(vec!["x", "y", "z"], GraphConfig::default());
        let state = graph.invoke(Update::new()).await.unwrap();

        let log: Vec<String> = state.get_as("log").unwrap();
        assert_eq!(log.first().map(String::as_str), Some("plan"));
        assert_eq!(log.last().map(String::as_str), Some("join"));
        let mut middle = log[1..log.len() - 1].to_vec();
        middle.sort();
        assert_eq!(middle, vec!["x", "y", "z"]);
        // Payload is branch-local and never written to the shared state
        assert_eq!(state.get("value"), None);
    }

    #[tokio::test]
    async fn test_empty_fan_out_reaches_convergence() {
        let graph = fan_out_graph(vec![], GraphConfig::default());
        let state = graph.invoke(Update::new()).await.unwrap();
        assert_eq!(state.get("log"), Some(&json!(["plan", "join"])));
        assert_eq!(state.get("count"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_branches_run_concurrently() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (r, p) = (running.clone(), peak.clone());
        let mut builder = GraphBuilder::new("parallel", schema());
        builder
            .add_node("plan", logging_node("plan"))
            .unwrap()
            .add_node(
                "slow",
                node_fn(move |_s| {
                    let (r, p) = (r.clone(), p.clone());
                    async move {
                        let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                        p.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        r.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, NodeError>(Update::new())
                    }
                }),
            )
            .unwrap()
            .add_node("join", logging_node("join"))
            .unwrap()
            .set_entry_point("plan")
            .unwrap()
            .add_conditional_edges(
                "plan",
                |_: &WorkflowState| Route::Many(vec!["slow".to_string(); 4]),
                None,
            )
            .unwrap()
            .add_edge("slow", "join")
            .unwrap()
            .set_finish_point("join")
            .unwrap();
        let graph = builder.compile().unwrap();

        graph.invoke(Update::new()).await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_concurrency_is_respected() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (r, p) = (running.clone(), peak.clone());
        let mut builder = GraphBuilder::new("capped", schema());
        builder
            .add_node("plan", logging_node("plan"))
            .unwrap()
            .add_node(
                "slow",
                node_fn(move |_s| {
                    let (r, p) = (r.clone(), p.clone());
                    async move {
                        let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                        p.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        r.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, NodeError>(Update::new().with("log", json!(["done"])))
                    }
                }),
            )
            .unwrap()
            .add_node("join", logging_node("join"))
            .unwrap()
            .set_entry_point("plan")
            .unwrap()
            .add_conditional_edges(
                "plan",
                |_: &WorkflowState| Route::Many(vec!["slow".to_string(); 6]),
                None,
            )
            .unwrap()
            .add_edge("slow", "join")
            .unwrap()
            .set_finish_point("join")
            .unwrap();
        let graph = builder
            .with_config(GraphConfig::default().with_max_concurrency(2))
            .compile()
            .unwrap();

        let state = graph.invoke(Update::new()).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        let log: Vec<String> = state.get_as("log").unwrap();
        assert_eq!(log.iter().filter(|l| *l == "done").count(), 6);
    }

    /// Graph whose `work` node fails for value "bad" and records every start
    fn failing_graph(values: Vec<&'static str>, config: GraphConfig) -> (CompiledGraph, Arc<Mutex<Vec<String>>>) {
        let started = Arc::new(Mutex::new(Vec::new()));
        let seen = started.clone();
        let mut builder = GraphBuilder::new("failing", schema());
        builder
            .add_node("plan", logging_node("plan"))
            .unwrap()
            .add_node(
                "work",
                node_fn(move |s: WorkflowState| {
                    let seen = seen.clone();
                    async move {
                        let value: String = s.get_as("value").unwrap_or_default();
                        seen.lock().unwrap().push(value.clone());
                        if value == "bad" {
                            return Err::<Update, NodeError>("bad input".into());
                        }
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(Update::new().with("log", json!([value])))
                    }
                }),
            )
            .unwrap()
            .add_node("join", logging_node("join"))
            .unwrap()
            .set_entry_point("plan")
            .unwrap()
            .add_conditional_edges(
                "plan",
                move |_: &WorkflowState| {
                    Route::Send(
                        values
                            .iter()
                            .map(|v| Dispatch::new("work", Update::new().with("value", *v)))
                            .collect(),
                    )
                },
                None,
            )
            .unwrap()
            .add_edge("work", "join")
            .unwrap()
            .set_finish_point("join")
            .unwrap();
        (builder.with_config(config).compile().unwrap(), started)
    }

    #[tokio::test]
    async fn test_failure_stops_launching_branches() {
        let (graph, started) = failing_graph(
            vec!["bad", "ok1", "ok2"],
            GraphConfig::default().with_max_concurrency(1),
        );

        let err = graph.invoke(Update::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::NodeExecution { ref node, .. } if node == "work"));
        assert_eq!(*started.lock().unwrap(), vec!["bad".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drain_lets_started_siblings_finish() {
        let (graph, started) = failing_graph(vec!["ok", "bad"], GraphConfig::default());

        let err = graph.invoke(Update::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::NodeExecution { .. }));
        assert_eq!(started.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fan_out_timeout() {
        let mut builder = GraphBuilder::new("timeout", schema());
        builder
            .add_node("plan", logging_node("plan"))
            .unwrap()
            .add_node(
                "hang",
                node_fn(|_s| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, NodeError>(Update::new())
                }),
            )
            .unwrap()
            .add_node("join", logging_node("join"))
            .unwrap()
            .set_entry_point("plan")
            .unwrap()
            .add_conditional_edges(
                "plan",
                |_: &WorkflowState| Route::Many(vec!["hang".to_string()]),
                None,
            )
            .unwrap()
            .add_edge("hang", "join")
            .unwrap()
            .set_finish_point("join")
            .unwrap();
        let graph = builder
            .with_config(GraphConfig::default().with_fan_out_timeout(Duration::from_millis(50)))
            .compile()
            .unwrap();

        let err = graph.invoke(Update::new()).await.unwrap_err();
        match err {
            GraphError::FanOutTimeout { from, timeout } => {
                assert_eq!(from, "plan");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stream_yields_each_superstep() {
        let graph = fan_out_graph(vec!["x", "y"], GraphConfig::default());
        let snapshots: Vec<StepSnapshot> = graph
            .stream(Update::new())
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(snapshots.len(), 3);
        assert_eq!(
            snapshots.iter().map(|s| s.step).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(snapshots[0].nodes, vec!["plan"]);
        assert_eq!(snapshots[1].nodes, vec!["work", "work"]);
        assert_eq!(snapshots[2].nodes, vec!["join"]);

        let last_log: Vec<String> = snapshots[2].state.get_as("log").unwrap();
        assert_eq!(last_log.len(), 4);
    }

    #[tokio::test]
    async fn test_stream_ends_with_error() {
        let (graph, _) = failing_graph(vec!["bad"], GraphConfig::default());
        let items: Vec<Result<StepSnapshot>> = graph.stream(Update::new()).collect().await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(GraphError::NodeExecution { .. })));
    }

    #[tokio::test]
    async fn test_dropped_stream_stops_the_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut builder = GraphBuilder::new("endless", schema());
        builder
            .add_node(
                "tick",
                node_fn(move |_s| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, NodeError>(Update::new())
                    }
                }),
            )
            .unwrap()
            .set_entry_point("tick")
            .unwrap()
            .add_edge("tick", "tick")
            .unwrap();
        let graph = builder
            .with_config(GraphConfig::default().with_max_steps(100))
            .compile()
            .unwrap();

        let mut stream = graph.stream(Update::new());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.step, 1);
        drop(stream);

        let at_drop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(calls.load(Ordering::SeqCst) <= at_drop + 1);
    }

    #[tokio::test]
    async fn test_graph_is_reusable() {
        let graph = fan_out_graph(vec!["x"], GraphConfig::default());
        let first = graph.invoke(Update::new()).await.unwrap();
        let second = graph.invoke(Update::new()).await.unwrap();
        assert_eq!(first, second);
    }
}
