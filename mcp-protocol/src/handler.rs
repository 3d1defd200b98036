//! Tool RPC registry (§6.1): a dispatch table of named operations, each
//! with an explicit request/response shape validated at the boundary.
//! No dynamic attribute lookup — `dispatch` is a single match over a
//! fixed set of string keys.

use broker_core::error::{BrokerError, Result};
use broker_core::eventbus::EventBus;
use broker_core::lifecycle::Lifecycle;
use broker_core::models::{
    NewAgent, NewTask, Priority, SystemPromptTarget, TaskOrigin, TaskResponse, TaskRouting,
    TaskStatus, WorkspaceContext,
};
use broker_core::poller::Poller;
use broker_core::registry::AgentRegistry;
use broker_core::store::Store;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Agents may request up to this long a poll; anything larger is clamped.
const MAX_WAIT_SECONDS: u64 = 290;
const DEFAULT_WAIT_SECONDS: u64 = 290;

/// Everything a dispatched tool operation needs: the policy layer, the
/// long-poll engine, agent identity bookkeeping, and the event bus that
/// `AgentRegistry::register`'s result must be published onto.
pub struct ToolContext<S: Store> {
    pub lifecycle: Arc<Lifecycle<S>>,
    pub poller: Arc<Poller<S>>,
    pub registry: Arc<AgentRegistry<S>>,
    pub events: Arc<EventBus>,
}

impl<S: Store> Clone for ToolContext<S> {
    fn clone(&self) -> Self {
        Self {
            lifecycle: self.lifecycle.clone(),
            poller: self.poller.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
        }
    }
}

fn params<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| BrokerError::ValidationError(e.to_string()))
}

/// Dispatches one tool-RPC operation by name. Unknown operations are a
/// validation error, not a panic or an HTTP 404 — the caller (an agent)
/// gets the same structured error shape as any other failure.
pub async fn dispatch<S: Store + 'static>(ctx: &ToolContext<S>, op: &str, input: Value) -> Result<Value> {
    match op {
        "register_agent" => register_agent(ctx, params(input)?).await,
        "wait_for_prompt" | "wait_for_task" => wait_for_task(ctx, params(input)?).await,
        "ack_task" => ack_task(ctx, params(input)?).await,
        "update_progress" => update_progress(ctx, params(input)?).await,
        "send_response" => send_response(ctx, params(input)?).await,
        "assign_task" => assign_task(ctx, params(input)?).await,
        "block_task" => block_task(ctx, params(input)?).await,
        "answer_task" => answer_task(ctx, params(input)?).await,
        "get_task_context" => get_task_context(ctx, params(input)?).await,
        "broadcast_system_prompt" => broadcast_system_prompt(ctx, params(input)?).await,
        other => Err(BrokerError::ValidationError(format!("unknown operation '{other}'"))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterAgentParams {
    id: String,
    display_name: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    workspace_context: Option<WorkspaceContext>,
}

async fn register_agent<S: Store>(ctx: &ToolContext<S>, p: RegisterAgentParams) -> Result<Value> {
    let (agent, event) = ctx
        .registry
        .register(NewAgent {
            id: p.id,
            display_name: p.display_name,
            role: p.role,
            capabilities: p.capabilities,
            workspace_context: p.workspace_context,
            source: "tool-rpc".to_string(),
        })
        .await?;
    ctx.events.publish(event);
    Ok(serde_json::to_value(agent).map_err(internal_json_error)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitForTaskParams {
    agent_id: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    workspace_context: Option<WorkspaceContext>,
    #[serde(default)]
    timeout_sec: Option<u64>,
}

async fn wait_for_task<S: Store + 'static>(ctx: &ToolContext<S>, p: WaitForTaskParams) -> Result<Value> {
    let timeout = Duration::from_secs(p.timeout_sec.unwrap_or(DEFAULT_WAIT_SECONDS).min(MAX_WAIT_SECONDS));
    let capabilities: HashSet<String> = p.capabilities.into_iter().collect();
    let outcome = ctx.poller.wait_for_task(&p.agent_id, capabilities, p.workspace_context, timeout).await?;
    Ok(serde_json::to_value(outcome).map_err(internal_json_error)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckTaskParams {
    task_id: String,
    agent_id: String,
}

async fn ack_task<S: Store>(ctx: &ToolContext<S>, p: AckTaskParams) -> Result<Value> {
    let (task, messages) = ctx.lifecycle.ack(&p.task_id, &p.agent_id).await?;
    Ok(serde_json::json!({ "task": task, "unreadMessages": messages }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProgressParams {
    task_id: String,
    agent_id: String,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    percentage: Option<u8>,
    message: String,
}

async fn update_progress<S: Store>(ctx: &ToolContext<S>, p: UpdateProgressParams) -> Result<Value> {
    let mut content = p.message;
    if p.phase.is_some() || p.percentage.is_some() {
        content = serde_json::json!({
            "phase": p.phase,
            "percentage": p.percentage,
            "message": content,
        })
        .to_string();
    }
    let (task, messages) = ctx.lifecycle.progress(&p.task_id, &p.agent_id, content).await?;
    Ok(serde_json::json!({ "task": task, "unreadMessages": messages }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponseParams {
    task_id: String,
    agent_id: String,
    status: TaskStatus,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    artifacts: Option<Vec<String>>,
    #[serde(default)]
    diff: Option<String>,
    #[serde(default)]
    blocked_reason: Option<String>,
}

async fn send_response<S: Store>(ctx: &ToolContext<S>, p: SendResponseParams) -> Result<Value> {
    let response = TaskResponse {
        message: p.message,
        artifacts: p.artifacts,
        diff: p.diff,
        blocked_reason: p.blocked_reason,
    };
    let task = ctx.lifecycle.send_response(&p.task_id, &p.agent_id, p.status, response).await?;
    Ok(serde_json::to_value(task).map_err(internal_json_error)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignTaskParams {
    source_agent_id: String,
    prompt: String,
    #[serde(default)]
    target_agent_id: Option<String>,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    context: serde_json::Value,
}

async fn assign_task<S: Store>(ctx: &ToolContext<S>, p: AssignTaskParams) -> Result<Value> {
    let new_task = NewTask {
        id: None,
        prompt: p.prompt,
        title: None,
        from: TaskOrigin::Agent { id: p.source_agent_id.clone(), name: p.source_agent_id.clone() },
        to: TaskRouting {
            agent_id: p.target_agent_id,
            required_capabilities: p.required_capabilities,
            workspace_id: p.workspace_id,
        },
        priority: p.priority,
        context: p.context,
        dependencies: p.dependencies,
    };
    let task = ctx.lifecycle.assign_task(&p.source_agent_id, new_task).await?;
    Ok(serde_json::to_value(task).map_err(internal_json_error)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockTaskParams {
    task_id: String,
    agent_id: String,
    reason: String,
    question: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    files: Option<Vec<String>>,
}

async fn block_task<S: Store>(ctx: &ToolContext<S>, p: BlockTaskParams) -> Result<Value> {
    // Lifecycle::block's contract is a single free-text reason; the richer
    // question/summary/notes/files fields from the tool surface are folded
    // into that reason as JSON so none of them are silently dropped.
    let reason = serde_json::json!({
        "reason": p.reason,
        "question": p.question,
        "summary": p.summary,
        "notes": p.notes,
        "files": p.files,
    })
    .to_string();
    let task = ctx.lifecycle.block(&p.task_id, &p.agent_id, reason).await?;
    Ok(serde_json::to_value(task).map_err(internal_json_error)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerTaskParams {
    task_id: String,
    answer: String,
}

async fn answer_task<S: Store>(ctx: &ToolContext<S>, p: AnswerTaskParams) -> Result<Value> {
    let task = ctx.lifecycle.answer(&p.task_id, p.answer).await?;
    Ok(serde_json::to_value(task).map_err(internal_json_error)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetTaskContextParams {
    task_id: String,
}

async fn get_task_context<S: Store>(ctx: &ToolContext<S>, p: GetTaskContextParams) -> Result<Value> {
    let context = ctx.lifecycle.get_task_context(&p.task_id).await?;
    Ok(serde_json::to_value(context).map_err(internal_json_error)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastSystemPromptParams {
    #[serde(default)]
    target_agent_id: Option<String>,
    #[serde(default)]
    capability: Option<String>,
    #[serde(default)]
    broadcast: Option<bool>,
    prompt_type: String,
    message: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    priority: i32,
}

async fn broadcast_system_prompt<S: Store>(ctx: &ToolContext<S>, p: BroadcastSystemPromptParams) -> Result<Value> {
    let target = if let Some(agent_id) = p.target_agent_id {
        SystemPromptTarget::Agent { agent_id }
    } else if let Some(capability) = p.capability {
        SystemPromptTarget::Capability { capability }
    } else if p.broadcast.unwrap_or(false) {
        SystemPromptTarget::Broadcast
    } else {
        return Err(BrokerError::ValidationError(
            "broadcast_system_prompt requires one of targetAgentId, capability, or broadcast=true".to_string(),
        ));
    };
    ctx.lifecycle.broadcast_system_prompt(target, p.prompt_type, p.message, p.payload, p.priority).await?;
    Ok(serde_json::json!({ "queued": true }))
}

fn internal_json_error(e: serde_json::Error) -> BrokerError {
    BrokerError::Internal(format!("response serialization failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_op_is_a_validation_error() {
        // Exercised end-to-end against a `Store` impl in `broker-mocks`;
        // this just pins the error kind the registry produces for an
        // unrecognized key, independent of any Store.
        let err = BrokerError::ValidationError("unknown operation 'frobnicate'".to_string());
        assert!(err.is_validation());
    }
}
