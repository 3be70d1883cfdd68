// SPDX-License-Identifier: MIT

//! Help-desk workflow
//!
//! A question is split into subtasks by a planner. Every subtask runs in its
//! own subgraph (select tool, search, answer, reflect) that retries until the
//! reflection is satisfied or the retry ceiling is reached. The subtask
//! answers are then combined into a final answer.
//!
//! Node bodies are deterministic and search a small in-process knowledge base.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{GraphError, NodeError, Result};
use crate::workflow::graph::{CompiledGraph, Dispatch, GraphBuilder, Route, START};
use crate::workflow::node::{blocking_fn, node_fn};
use crate::workflow::state::{FieldType, StateSchema, Update, WorkflowState};
use crate::workflow::subgraph::{retry_branch, LoopDecision, RetryPolicy, SubgraphNode};

/// Supersteps one attempt of the subtask loop takes (select, execute, answer, reflect)
pub const STEPS_PER_ATTEMPT: u64 = 4;

const MANUAL_TOOL: &str = "search_manual";
const QA_TOOL: &str = "search_qa";

/// Knowledge base entry: (tool, title, content)
const KNOWLEDGE_BASE: &[(&str, &str, &str)] = &[
    (
        MANUAL_TOOL,
        "Error code ERR-404",
        "ERR-404 means the requested resource does not exist. Check the URL and the resource id.",
    ),
    (
        MANUAL_TOOL,
        "Error code ERR-500",
        "ERR-500 is an internal server error. Retry later and collect the request id for support.",
    ),
    (
        MANUAL_TOOL,
        "Backups",
        "Backups run nightly at 02:00 UTC and are kept for 30 days.",
    ),
    (
        QA_TOOL,
        "How do I reset my password?",
        "Open Settings, choose Security and click Reset password. A link is sent by email.",
    ),
    (
        QA_TOOL,
        "How do I fix ERR-404?",
        "Make sure the resource was not deleted and that your account can access it.",
    ),
    (
        QA_TOOL,
        "How do I change the language?",
        "Open Settings, choose Profile and pick a language from the list.",
    ),
];

/// One finished subtask, as recorded in the parent state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtaskResult {
    pub task_name: String,
    pub subtask_answer: String,
    pub is_completed: bool,
    pub challenge_count: u64,
}

/// One search hit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub content: String,
}

/// State of the top-level help-desk graph
pub fn parent_schema() -> StateSchema {
    StateSchema::new()
        .overwrite("question", FieldType::String)
        .overwrite("plan", FieldType::Array)
        .overwrite("current_step", FieldType::Number)
        .append("subtask_results")
        .overwrite("last_answer", FieldType::String)
}

/// Parent schema extended with the fields declared in `config.state`.
///
/// Extra fields are added after the built-in ones. A built-in field may be
/// redeclared (to give it a default) but must keep its type and reducer.
pub fn helpdesk_schema(config: &EngineConfig) -> Result<StateSchema> {
    let base = parent_schema();
    let mut schema = base.clone();
    for (name, def) in config.state.iter() {
        if let Some(expected) = base.get(name) {
            if def.field_type != expected.field_type || def.reducer != expected.reducer {
                return Err(GraphError::config(format!(
                    "state field '{}' must be {} with the {:?} reducer",
                    name,
                    expected.field_type.as_str(),
                    expected.reducer
                )));
            }
        }
        schema = schema.field(name, def.clone());
    }
    Ok(schema)
}

/// State of the per-subtask retry loop
pub fn subtask_schema() -> StateSchema {
    StateSchema::new()
        .overwrite("question", FieldType::String)
        .overwrite("subtask", FieldType::String)
        .overwrite("tool", FieldType::String)
        .overwrite("query", FieldType::String)
        .append("tool_results")
        .overwrite("subtask_answer", FieldType::String)
        .append("reflection_results")
        .overwrite("is_completed", FieldType::Boolean)
        .overwrite("challenge_count", FieldType::Number)
}

/// Split a question into subtasks, one per sentence
pub fn plan_subtasks(question: &str) -> Vec<String> {
    question
        .split(['?', '.', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

const STOPWORDS: &[&str] = &["what", "when", "where", "which", "does", "mean", "explain", "with"];

fn keywords(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| w.len() > 3)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Search one tool's entries. Strict mode requires every keyword to match.
pub fn search(tool: &str, query: &str, strict: bool) -> Vec<SearchHit> {
    let words = keywords(query);
    if words.is_empty() {
        return vec![];
    }
    KNOWLEDGE_BASE
        .iter()
        .filter(|(t, _, _)| *t == tool)
        .filter(|(_, title, content)| {
            let haystack = format!("{} {}", title, content).to_lowercase();
            if strict {
                words.iter().all(|w| haystack.contains(w.as_str()))
            } else {
                words.iter().any(|w| haystack.contains(w.as_str()))
            }
        })
        .map(|(_, title, content)| SearchHit {
            title: title.to_string(),
            content: content.to_string(),
        })
        .collect()
}

fn attempts(state: &WorkflowState) -> u64 {
    state.get_as("challenge_count").unwrap_or(0)
}

fn text(state: &WorkflowState, field: &str) -> String {
    state.get_as(field).unwrap_or_default()
}

/// Compile the per-subtask retry loop
pub fn build_subtask_graph(config: &EngineConfig) -> Result<CompiledGraph> {
    config.validate()?;
    let policy = RetryPolicy::from(&config.retry);
    let mut builder = GraphBuilder::new("execute_subtask", subtask_schema());

    builder
        .add_node(
            "select_tools",
            node_fn(|state: WorkflowState| async move {
                let subtask = text(&state, "subtask");
                // How-to questions go to the Q&A base, everything else to the
                // manual. From the third attempt on, every other try switches.
                let prefers_qa = subtask.to_lowercase().starts_with("how");
                let attempt = attempts(&state);
                let use_qa = prefers_qa ^ (attempt >= 2 && attempt % 2 == 0);
                let tool = if use_qa { QA_TOOL } else { MANUAL_TOOL };
                Ok::<_, NodeError>(
                    Update::new()
                        .with("tool", tool)
                        .with("query", subtask),
                )
            }),
        )?
        .add_node(
            "execute_tools",
            blocking_fn(|state: WorkflowState| {
                let tool = text(&state, "tool");
                let query = text(&state, "query");
                // First attempt is strict, later ones relax the match
                let hits = search(&tool, &query, attempts(&state) == 0);
                log::debug!("{} '{}' returned {} hits", tool, query, hits.len());
                Ok(Update::new().with("tool_results", json!([hits])))
            }),
        )?
        .add_node(
            "create_subtask_answer",
            node_fn(|state: WorkflowState| async move {
                let rounds: Vec<Vec<SearchHit>> = state.get_as("tool_results").unwrap_or_default();
                let answer = rounds
                    .last()
                    .filter(|hits| !hits.is_empty())
                    .map(|hits| {
                        hits.iter()
                            .map(|h| h.content.as_str())
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                Ok::<_, NodeError>(Update::new().with("subtask_answer", answer))
            }),
        )?
        .add_node(
            "reflect_subtask",
            node_fn(move |state: WorkflowState| async move {
                let challenge_count = attempts(&state) + 1;
                let answer = text(&state, "subtask_answer");
                let is_completed = !answer.is_empty();
                let reflection = if is_completed {
                    "answer is supported by search results".to_string()
                } else {
                    format!("no results from {}, retrying", text(&state, "tool"))
                };

                let mut update = Update::new()
                    .with("challenge_count", challenge_count)
                    .with("is_completed", is_completed)
                    .with("reflection_results", json!([reflection]));
                if !is_completed && policy.decide(false, challenge_count) == LoopDecision::End {
                    update.insert(
                        "subtask_answer",
                        format!("No answer found for '{}'.", text(&state, "subtask")),
                    );
                }
                Ok::<_, NodeError>(update)
            }),
        )?
        .add_edge(START, "select_tools")?
        .add_edge("select_tools", "execute_tools")?
        .add_edge("execute_tools", "create_subtask_answer")?
        .add_edge("create_subtask_answer", "reflect_subtask")?
        .add_conditional_edges(
            "reflect_subtask",
            retry_branch(policy, "is_completed", "challenge_count"),
            Some(RetryPolicy::mapping("select_tools")),
        )?;

    builder.with_config(config.subgraph.clone()).compile()
}

fn dispatch_subtasks(state: &WorkflowState) -> Route {
    let plan: Vec<String> = state.get_as("plan").unwrap_or_default();
    let question = state.get("question").cloned().unwrap_or_default();
    Route::Send(
        (0..plan.len())
            .map(|idx| {
                Dispatch::new(
                    "execute_subtasks",
                    Update::new()
                        .with("question", question.clone())
                        .with("current_step", idx),
                )
            })
            .collect(),
    )
}

/// Compile the full help-desk graph
pub fn build_helpdesk(config: &EngineConfig) -> Result<CompiledGraph> {
    let subtask_graph = build_subtask_graph(config)?;
    let schema = helpdesk_schema(config)?;

    let execute = SubgraphNode::new(
        subtask_graph,
        |parent: &WorkflowState| {
            let plan: Vec<String> = parent.get_as("plan").unwrap_or_default();
            let step: usize = parent.get_as("current_step").unwrap_or(0);
            let subtask = plan
                .get(step)
                .cloned()
                .ok_or_else(|| format!("plan has no step {}", step))?;
            Ok(Update::new()
                .with("question", text(parent, "question"))
                .with("subtask", subtask))
        },
        |child: WorkflowState| {
            let result = SubtaskResult {
                task_name: text(&child, "subtask"),
                subtask_answer: text(&child, "subtask_answer"),
                is_completed: child.get_as("is_completed").unwrap_or(false),
                challenge_count: attempts(&child),
            };
            Ok(Update::new().with("subtask_results", json!([result])))
        },
    );

    let mut builder = GraphBuilder::new("helpdesk", schema);
    builder
        .add_node(
            "create_plan",
            node_fn(|state: WorkflowState| async move {
                let plan = plan_subtasks(&text(&state, "question"));
                log::info!("Planned {} subtasks", plan.len());
                Ok::<_, NodeError>(Update::new().with("plan", json!(plan)))
            }),
        )?
        .add_node("execute_subtasks", Arc::new(execute))?
        .add_node(
            "create_answer",
            node_fn(|state: WorkflowState| async move {
                let results: Vec<SubtaskResult> =
                    state.get_as("subtask_results").unwrap_or_default();
                let answer = if results.is_empty() {
                    "No subtasks were planned for this question.".to_string()
                } else {
                    results
                        .iter()
                        .map(|r| format!("- {}: {}", r.task_name, r.subtask_answer))
                        .collect::<Vec<_>>()
                        .join("\n")
                };
                Ok::<_, NodeError>(Update::new().with("last_answer", answer))
            }),
        )?
        .add_edge(START, "create_plan")?
        .add_fan_out_edges("create_plan", dispatch_subtasks, &["execute_subtasks"])?
        .add_edge("execute_subtasks", "create_answer")?
        .set_finish_point("create_answer")?;

    builder.with_config(config.graph.clone()).compile()
}
