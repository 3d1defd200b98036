//! Row <-> domain-model mapping, sqlx error mapping, and the dynamic
//! `TaskFilter` query builder. Scalar, queryable columns (status, priority,
//! the routing triple, timestamps) get their own columns; nested structures
//! with no query use (`history`, `response`, `context`, `from`) are stored
//! as JSON text, the same way the teacher's schema JSON-encodes
//! `required_capabilities` rather than normalizing it into its own table.

use broker_core::error::BrokerError;
use broker_core::models::{
    Agent, Event, EventKind, Eviction, MessageRole, MessageType, PendingAck, Priority,
    ReviewComment, SystemPrompt, SystemPromptTarget, Task, TaskHistoryEntry, TaskId, TaskMessage,
    TaskOrigin, TaskResponse, TaskRouting, TaskStatus, WaitingAgent, WorkspaceContext,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashSet;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Convert a `sqlx::Error` into a `BrokerError`. Most failures here are
/// infrastructure faults (pool timeout, IO); precondition violations are
/// caught by the caller before the query runs, via the expected-status
/// check, not surfaced as a DB constraint.
pub fn sqlx_error_to_broker_error(err: sqlx::Error) -> BrokerError {
    match &err {
        sqlx::Error::RowNotFound => BrokerError::not_found("<row>"),
        sqlx::Error::PoolTimedOut => BrokerError::Internal("connection pool timeout".to_string()),
        sqlx::Error::Io(io_err) => BrokerError::Internal(format!("database I/O error: {io_err}")),
        sqlx::Error::Database(db_err) => {
            BrokerError::Internal(format!("database constraint error: {}", db_err.message()))
        }
        other => BrokerError::Internal(format!("database operation failed: {other}")),
    }
}

fn json_error(what: &str, error: serde_json::Error) -> BrokerError {
    BrokerError::Internal(format!("failed to decode {what}: {error}"))
}

pub fn priority_to_string(p: Priority) -> &'static str {
    match p {
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Critical => "critical",
    }
}

pub fn string_to_priority(s: &str) -> Result<Priority> {
    Ok(match s {
        "normal" => Priority::Normal,
        "high" => Priority::High,
        "critical" => Priority::Critical,
        other => return Err(BrokerError::Internal(format!("unknown priority: {other}"))),
    })
}

pub fn status_to_string(s: TaskStatus) -> String {
    s.to_string()
}

pub fn string_to_status(s: &str) -> Result<TaskStatus> {
    s.parse::<TaskStatus>()
        .map_err(|e| BrokerError::Internal(format!("unknown task status: {e}")))
}

fn role_to_string(r: MessageRole) -> &'static str {
    match r {
        MessageRole::User => "user",
        MessageRole::Agent => "agent",
        MessageRole::System => "system",
    }
}

fn string_to_role(s: &str) -> Result<MessageRole> {
    Ok(match s {
        "user" => MessageRole::User,
        "agent" => MessageRole::Agent,
        "system" => MessageRole::System,
        other => return Err(BrokerError::Internal(format!("unknown message role: {other}"))),
    })
}

fn message_type_to_string(t: MessageType) -> &'static str {
    match t {
        MessageType::Comment => "comment",
        MessageType::Progress => "progress",
        MessageType::ReviewFeedback => "review_feedback",
        MessageType::BlockEvent => "block_event",
    }
}

fn string_to_message_type(s: &str) -> Result<MessageType> {
    Ok(match s {
        "comment" => MessageType::Comment,
        "progress" => MessageType::Progress,
        "review_feedback" => MessageType::ReviewFeedback,
        "block_event" => MessageType::BlockEvent,
        other => return Err(BrokerError::Internal(format!("unknown message type: {other}"))),
    })
}

fn event_kind_to_string(k: EventKind) -> &'static str {
    match k {
        EventKind::TaskCreated => "task:created",
        EventKind::TaskUpdated => "task:updated",
        EventKind::TaskDeleted => "task:deleted",
        EventKind::AgentStatus => "agent:status",
        EventKind::SyncFull => "sync:full",
    }
}

fn string_to_event_kind(s: &str) -> Result<EventKind> {
    Ok(match s {
        "task:created" => EventKind::TaskCreated,
        "task:updated" => EventKind::TaskUpdated,
        "task:deleted" => EventKind::TaskDeleted,
        "agent:status" => EventKind::AgentStatus,
        "sync:full" => EventKind::SyncFull,
        other => return Err(BrokerError::Internal(format!("unknown event kind: {other}"))),
    })
}

pub fn capabilities_to_json(caps: &HashSet<String>) -> String {
    serde_json::to_string(&caps.iter().collect::<Vec<_>>()).unwrap_or_else(|_| "[]".to_string())
}

pub fn json_to_capabilities(s: &str) -> Result<HashSet<String>> {
    let v: Vec<String> = serde_json::from_str(s).map_err(|e| json_error("capabilities", e))?;
    Ok(v.into_iter().collect())
}

pub fn ids_to_json(ids: &[TaskId]) -> Result<String> {
    serde_json::to_string(ids).map_err(|e| json_error("dependencies", e))
}

pub fn history_to_json(history: &[TaskHistoryEntry]) -> Result<String> {
    serde_json::to_string(history).map_err(|e| json_error("history", e))
}

pub const TASK_COLUMNS: &str = "id, prompt, title, from_json, to_agent_id, to_required_capabilities, \
    to_workspace_id, priority, status, context, dependencies, created_at, completed_at, \
    last_progress_at, history, response";

pub fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let from_json: String = row.try_get("from_json").map_err(sqlx_error_to_broker_error)?;
    let from: TaskOrigin = serde_json::from_str(&from_json).map_err(|e| json_error("task.from", e))?;
    let raw_caps: String = row.try_get("to_required_capabilities").map_err(sqlx_error_to_broker_error)?;
    let required_capabilities: Vec<String> =
        serde_json::from_str(&raw_caps).map_err(|e| json_error("required_capabilities", e))?;
    let priority: String = row.try_get("priority").map_err(sqlx_error_to_broker_error)?;
    let status: String = row.try_get("status").map_err(sqlx_error_to_broker_error)?;
    let context: String = row.try_get("context").map_err(sqlx_error_to_broker_error)?;
    let dependencies: String = row.try_get("dependencies").map_err(sqlx_error_to_broker_error)?;
    let history: String = row.try_get("history").map_err(sqlx_error_to_broker_error)?;
    let response: Option<String> = row.try_get("response").map_err(sqlx_error_to_broker_error)?;

    Ok(Task {
        id: row.try_get("id").map_err(sqlx_error_to_broker_error)?,
        prompt: row.try_get("prompt").map_err(sqlx_error_to_broker_error)?,
        title: row.try_get("title").map_err(sqlx_error_to_broker_error)?,
        from,
        to: TaskRouting {
            agent_id: row.try_get("to_agent_id").map_err(sqlx_error_to_broker_error)?,
            required_capabilities,
            workspace_id: row.try_get("to_workspace_id").map_err(sqlx_error_to_broker_error)?,
        },
        priority: string_to_priority(&priority)?,
        status: string_to_status(&status)?,
        context: serde_json::from_str(&context).map_err(|e| json_error("task.context", e))?,
        dependencies: serde_json::from_str(&dependencies).map_err(|e| json_error("task.dependencies", e))?,
        created_at: row.try_get("created_at").map_err(sqlx_error_to_broker_error)?,
        completed_at: row.try_get("completed_at").map_err(sqlx_error_to_broker_error)?,
        last_progress_at: row.try_get("last_progress_at").map_err(sqlx_error_to_broker_error)?,
        history: serde_json::from_str(&history).map_err(|e| json_error("task.history", e))?,
        response: response
            .map(|s| serde_json::from_str::<TaskResponse>(&s).map_err(|e| json_error("task.response", e)))
            .transpose()?,
    })
}

pub fn row_to_task_message(row: &SqliteRow) -> Result<TaskMessage> {
    let role: String = row.try_get("role").map_err(sqlx_error_to_broker_error)?;
    let message_type: String = row.try_get("message_type").map_err(sqlx_error_to_broker_error)?;
    let metadata: String = row.try_get("metadata").map_err(sqlx_error_to_broker_error)?;
    let images: Option<String> = row.try_get("images").map_err(sqlx_error_to_broker_error)?;

    Ok(TaskMessage {
        id: row.try_get("id").map_err(sqlx_error_to_broker_error)?,
        task_id: row.try_get("task_id").map_err(sqlx_error_to_broker_error)?,
        timestamp: row.try_get("timestamp").map_err(sqlx_error_to_broker_error)?,
        role: string_to_role(&role)?,
        content: row.try_get("content").map_err(sqlx_error_to_broker_error)?,
        is_read: row.try_get::<i64, _>("is_read").map_err(sqlx_error_to_broker_error)? != 0,
        message_type: string_to_message_type(&message_type)?,
        reply_to: row.try_get("reply_to").map_err(sqlx_error_to_broker_error)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| json_error("message.metadata", e))?,
        images: images
            .map(|s| serde_json::from_str::<Vec<String>>(&s).map_err(|e| json_error("message.images", e)))
            .transpose()?,
    })
}

pub fn row_to_agent(row: &SqliteRow) -> Result<Agent> {
    let capabilities: String = row.try_get("capabilities").map_err(sqlx_error_to_broker_error)?;
    let workspace_context: Option<String> = row.try_get("workspace_context").map_err(sqlx_error_to_broker_error)?;
    Ok(Agent {
        id: row.try_get("id").map_err(sqlx_error_to_broker_error)?,
        display_name: row.try_get("display_name").map_err(sqlx_error_to_broker_error)?,
        role: row.try_get("role").map_err(sqlx_error_to_broker_error)?,
        capabilities: json_to_capabilities(&capabilities)?,
        workspace_context: workspace_context
            .map(|s| serde_json::from_str::<WorkspaceContext>(&s).map_err(|e| json_error("agent.workspace_context", e)))
            .transpose()?,
        last_seen: row.try_get("last_seen").map_err(sqlx_error_to_broker_error)?,
        source: row.try_get("source").map_err(sqlx_error_to_broker_error)?,
    })
}

pub fn row_to_waiting_agent(row: &SqliteRow) -> Result<WaitingAgent> {
    let capabilities: String = row.try_get("capabilities").map_err(sqlx_error_to_broker_error)?;
    let workspace_context: Option<String> = row.try_get("workspace_context").map_err(sqlx_error_to_broker_error)?;
    Ok(WaitingAgent {
        agent_id: row.try_get("agent_id").map_err(sqlx_error_to_broker_error)?,
        capabilities: json_to_capabilities(&capabilities)?,
        workspace_context: workspace_context
            .map(|s| {
                serde_json::from_str::<WorkspaceContext>(&s).map_err(|e| json_error("waiting_agent.workspace_context", e))
            })
            .transpose()?,
        entered_at: row.try_get("entered_at").map_err(sqlx_error_to_broker_error)?,
    })
}

pub fn row_to_pending_ack(row: &SqliteRow) -> Result<PendingAck> {
    Ok(PendingAck {
        task_id: row.try_get("task_id").map_err(sqlx_error_to_broker_error)?,
        agent_id: row.try_get("agent_id").map_err(sqlx_error_to_broker_error)?,
        sent_at: row.try_get("sent_at").map_err(sqlx_error_to_broker_error)?,
    })
}

pub fn row_to_event(row: &SqliteRow) -> Result<Event> {
    let kind: String = row.try_get("kind").map_err(sqlx_error_to_broker_error)?;
    let payload: String = row.try_get("payload").map_err(sqlx_error_to_broker_error)?;
    Ok(Event {
        seq: row.try_get("seq").map_err(sqlx_error_to_broker_error)?,
        kind: string_to_event_kind(&kind)?,
        payload: serde_json::from_str(&payload).map_err(|e| json_error("event.payload", e))?,
        at: row.try_get("at").map_err(sqlx_error_to_broker_error)?,
    })
}

pub fn row_to_system_prompt(row: &SqliteRow) -> Result<SystemPrompt> {
    let target: String = row.try_get("target").map_err(sqlx_error_to_broker_error)?;
    let payload: Option<String> = row.try_get("payload").map_err(sqlx_error_to_broker_error)?;
    Ok(SystemPrompt {
        id: row.try_get("id").map_err(sqlx_error_to_broker_error)?,
        target: serde_json::from_str::<SystemPromptTarget>(&target).map_err(|e| json_error("system_prompt.target", e))?,
        prompt_type: row.try_get("prompt_type").map_err(sqlx_error_to_broker_error)?,
        message: row.try_get("message").map_err(sqlx_error_to_broker_error)?,
        payload: payload
            .map(|s| serde_json::from_str::<serde_json::Value>(&s).map_err(|e| json_error("system_prompt.payload", e)))
            .transpose()?,
        priority: row.try_get("priority").map_err(sqlx_error_to_broker_error)?,
        created_at: row.try_get("created_at").map_err(sqlx_error_to_broker_error)?,
    })
}

pub fn row_to_review_comment(row: &SqliteRow) -> Result<ReviewComment> {
    Ok(ReviewComment {
        id: row.try_get("id").map_err(sqlx_error_to_broker_error)?,
        task_id: row.try_get("task_id").map_err(sqlx_error_to_broker_error)?,
        author: row.try_get("author").map_err(sqlx_error_to_broker_error)?,
        content: row.try_get("content").map_err(sqlx_error_to_broker_error)?,
        created_at: row.try_get("created_at").map_err(sqlx_error_to_broker_error)?,
    })
}

pub fn row_to_eviction(row: &SqliteRow) -> Result<Eviction> {
    Ok(Eviction {
        agent_id: row.try_get("agent_id").map_err(sqlx_error_to_broker_error)?,
        reason: row.try_get("reason").map_err(sqlx_error_to_broker_error)?,
        created_at: row.try_get("created_at").map_err(sqlx_error_to_broker_error)?,
    })
}

/// Binds every non-key column of `task` onto an `INSERT INTO tasks (...)`
/// builder already positioned just before `VALUES`. Shared by `insert_task`
/// and the `reserve`/`transition` paths that re-`UPDATE` the full row.
pub fn push_task_values(qb: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>, task: &Task) -> Result<()> {
    let from_json = serde_json::to_string(&task.from).map_err(|e| json_error("task.from", e))?;
    let caps_json = serde_json::to_string(&task.to.required_capabilities).map_err(|e| json_error("required_capabilities", e))?;
    let context_json = serde_json::to_string(&task.context).map_err(|e| json_error("task.context", e))?;
    let deps_json = ids_to_json(&task.dependencies)?;
    let history_json = history_to_json(&task.history)?;
    let response_json = task
        .response
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| json_error("task.response", e))?;

    let mut separated = qb.separated(", ");
    separated.push_bind(task.id.clone());
    separated.push_bind(task.prompt.clone());
    separated.push_bind(task.title.clone());
    separated.push_bind(from_json);
    separated.push_bind(task.to.agent_id.clone());
    separated.push_bind(caps_json);
    separated.push_bind(task.to.workspace_id.clone());
    separated.push_bind(priority_to_string(task.priority));
    separated.push_bind(status_to_string(task.status));
    separated.push_bind(context_json);
    separated.push_bind(deps_json);
    separated.push_bind(task.created_at);
    separated.push_bind(task.completed_at);
    separated.push_bind(task.last_progress_at);
    separated.push_bind(history_json);
    separated.push_bind(response_json);
    Ok(())
}

/// Builds the dynamic `WHERE`/`ORDER BY`/`LIMIT` clause for the admin task
/// listing, the same `QueryBuilder`-driven idiom the teacher uses for its
/// `TaskFilter`.
pub fn build_task_filter_query(filter: &broker_core::models::TaskFilter) -> sqlx::QueryBuilder<'_, sqlx::Sqlite> {
    let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
        sqlx::QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1"));

    if let Some(statuses) = &filter.status {
        if !statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for s in statuses {
                separated.push_bind(status_to_string(*s));
            }
            separated.push_unseparated(")");
        }
    }

    if let Some(active) = filter.active {
        if active {
            qb.push(" AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')");
        } else {
            qb.push(" AND status IN ('COMPLETED', 'FAILED', 'CANCELLED')");
        }
    }

    if let Some(q) = &filter.q {
        qb.push(" AND (prompt LIKE ");
        qb.push_bind(format!("%{q}%"));
        qb.push(" OR title LIKE ");
        qb.push_bind(format!("%{q}%"));
        qb.push(")");
    }

    qb.push(" ORDER BY created_at DESC");

    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);
    }
    if let Some(offset) = filter.offset {
        qb.push(" OFFSET ");
        qb.push_bind(offset as i64);
    }

    qb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [TaskStatus::Queued, TaskStatus::ApprovedPendingAck, TaskStatus::Completed] {
            assert_eq!(string_to_status(&status_to_string(s)).unwrap(), s);
        }
    }

    #[test]
    fn priority_round_trips() {
        for p in [Priority::Normal, Priority::High, Priority::Critical] {
            assert_eq!(string_to_priority(priority_to_string(p)).unwrap(), p);
        }
    }

    #[test]
    fn capabilities_round_trip_through_json() {
        let caps: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let json = capabilities_to_json(&caps);
        assert_eq!(json_to_capabilities(&json).unwrap(), caps);
    }

    #[test]
    fn message_type_round_trips() {
        for t in [MessageType::Comment, MessageType::Progress, MessageType::ReviewFeedback, MessageType::BlockEvent] {
            assert_eq!(string_to_message_type(message_type_to_string(t)).unwrap(), t);
        }
    }

    #[test]
    fn role_round_trips() {
        for r in [MessageRole::User, MessageRole::Agent, MessageRole::System] {
            assert_eq!(string_to_role(role_to_string(r)).unwrap(), r);
        }
    }

    #[test]
    fn event_kind_round_trips() {
        for k in [EventKind::TaskCreated, EventKind::TaskUpdated, EventKind::AgentStatus, EventKind::SyncFull] {
            assert_eq!(string_to_event_kind(event_kind_to_string(k)).unwrap(), k);
        }
    }
}
