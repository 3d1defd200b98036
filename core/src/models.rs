//! Domain model for the task broker: tasks, messages, agents, and the
//! scheduler's own bookkeeping rows (waiting agents, pending acks, events).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub type TaskId = String;
pub type AgentId = String;
pub type MessageId = String;

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Who submitted a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskOrigin {
    Human { id: String },
    Agent { id: String, name: String },
}

/// Routing hints attached to a task: an explicit target agent, required
/// capabilities, and/or a workspace affinity.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TaskRouting {
    #[serde(default, rename = "agentId", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, rename = "requiredCapabilities")]
    pub required_capabilities: Vec<String>,
    #[serde(default, rename = "workspaceId", skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

impl TaskRouting {
    pub fn capability_set(&self) -> HashSet<&str> {
        self.required_capabilities.iter().map(String::as_str).collect()
    }
}

/// Queue priority. Ordinal order doubles as sort order: higher first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Task lifecycle status. See the transition table in `can_transition_to`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Queued,
    PendingAck,
    Assigned,
    InProgress,
    InReview,
    ApprovedQueued,
    ApprovedPendingAck,
    Blocked,
    PendingRes,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::PendingAck => "PENDING_ACK",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::InReview => "IN_REVIEW",
            TaskStatus::ApprovedQueued => "APPROVED_QUEUED",
            TaskStatus::ApprovedPendingAck => "APPROVED_PENDING_ACK",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::PendingRes => "PENDING_RES",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "QUEUED" => TaskStatus::Queued,
            "PENDING_ACK" => TaskStatus::PendingAck,
            "ASSIGNED" => TaskStatus::Assigned,
            "IN_PROGRESS" => TaskStatus::InProgress,
            "IN_REVIEW" => TaskStatus::InReview,
            "APPROVED_QUEUED" => TaskStatus::ApprovedQueued,
            "APPROVED_PENDING_ACK" => TaskStatus::ApprovedPendingAck,
            "BLOCKED" => TaskStatus::Blocked,
            "PENDING_RES" => TaskStatus::PendingRes,
            "COMPLETED" => TaskStatus::Completed,
            "FAILED" => TaskStatus::Failed,
            "CANCELLED" => TaskStatus::Cancelled,
            other => return Err(format!("unknown task status: {other}")),
        })
    }
}

impl TaskStatus {
    /// `true` for the three states no further transition can leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// `true` for a terminal state that counts as dependency-satisfying
    /// ("terminal-success" in spec language — only COMPLETED qualifies).
    pub fn is_terminal_success(self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    pub fn is_queued_like(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::ApprovedQueued)
    }

    pub fn is_pending_ack_like(self) -> bool {
        matches!(self, TaskStatus::PendingAck | TaskStatus::ApprovedPendingAck)
    }

    /// Encodes the transition graph from spec §4.2. Administrative `cancel`
    /// and `retry` are handled separately by Lifecycle since they apply to
    /// whole classes of source states rather than single edges.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, PendingAck)
                | (ApprovedQueued, ApprovedPendingAck)
                | (PendingAck, Queued) // ack-timeout
                | (PendingAck, Assigned)
                | (ApprovedPendingAck, Assigned) // reviewed-approved successor also lands in Assigned before re-running
                | (Assigned, InProgress)
                | (Assigned, InReview)
                | (InProgress, InReview)
                | (InReview, ApprovedQueued)
                | (InReview, Queued) // reject
                | (PendingRes, ApprovedQueued)
                | (PendingRes, Queued)
                | (InReview, Blocked)
                | (InProgress, Blocked)
                | (Assigned, Blocked)
                | (Blocked, Queued) // answer
                | (Assigned, Completed)
                | (InProgress, Completed)
                | (Assigned, Failed)
                | (InProgress, Failed)
        )
    }
}

/// One entry per successful transition; `Task::history` is append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(default, rename = "agentId", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The structured result an agent reports with `send_response`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TaskResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, rename = "blockedReason", skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

/// The durable task record. `messages` live in the Store keyed by `task_id`
/// (see `Store::list_messages`), not embedded here, to avoid denormalizing
/// an unbounded thread onto every task read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub from: TaskOrigin,
    #[serde(default)]
    pub to: TaskRouting,
    #[serde(default)]
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastProgressAt")]
    pub last_progress_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<TaskHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<TaskResponse>,
}

impl Task {
    /// Derives a title from the first line of the prompt, per spec: ≤80 chars.
    pub fn derive_title(prompt: &str) -> String {
        let first_line = prompt.lines().next().unwrap_or("").trim();
        if first_line.chars().count() > 80 {
            first_line.chars().take(77).collect::<String>() + "..."
        } else {
            first_line.to_string()
        }
    }

    pub fn is_delegation(&self) -> bool {
        self.context
            .get("isDelegation")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Whether `agent_capabilities` satisfies this task's routing requirement.
    pub fn capabilities_satisfied_by(&self, agent_capabilities: &HashSet<String>) -> bool {
        self.to
            .required_capabilities
            .iter()
            .all(|required| agent_capabilities.contains(required))
    }
}

/// Parameters for `Lifecycle::enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<TaskId>,
    pub prompt: String,
    #[serde(default)]
    pub title: Option<String>,
    pub from: TaskOrigin,
    #[serde(default)]
    pub to: TaskRouting,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
}

impl NewTask {
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        let id = self.id.unwrap_or_else(new_id);
        let title = self.title.or_else(|| {
            let derived = Task::derive_title(&self.prompt);
            if derived.is_empty() { None } else { Some(derived) }
        });
        Task {
            id,
            prompt: self.prompt,
            title,
            from: self.from,
            to: self.to,
            priority: self.priority,
            status: TaskStatus::Queued,
            context: if self.context.is_null() {
                serde_json::json!({})
            } else {
                self.context
            },
            dependencies: self.dependencies,
            created_at: now,
            completed_at: None,
            last_progress_at: now,
            history: vec![TaskHistoryEntry {
                timestamp: now,
                status: TaskStatus::Queued,
                agent_id: None,
                message: None,
            }],
            response: None,
        }
    }
}

/// Limited-field patch accepted by `Lifecycle::update` while non-terminal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, rename = "workspaceId", skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<Option<String>>,
    #[serde(default, rename = "requiredCapabilities", skip_serializing_if = "Option::is_none")]
    pub required_capabilities: Option<Vec<String>>,
}

/// Filter for the admin `GET /tasks` listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<Vec<TaskStatus>>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Role of the author of a `TaskMessage`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

/// What kind of event a `TaskMessage` represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Comment,
    Progress,
    ReviewFeedback,
    BlockEvent,
}

/// An entry in a task's message thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub id: MessageId,
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub role: MessageRole,
    pub content: String,
    #[serde(rename = "isRead")]
    pub is_read: bool,
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    #[serde(default, rename = "replyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl TaskMessage {
    pub fn new(
        task_id: TaskId,
        role: MessageRole,
        content: impl Into<String>,
        message_type: MessageType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            task_id,
            timestamp: now,
            role,
            content: content.into(),
            is_read: !matches!(role, MessageRole::User),
            message_type,
            reply_to: None,
            metadata: serde_json::json!({}),
            images: None,
        }
    }
}

/// Identifies a code repository (and optional branch/path) an agent is
/// operating in; used as a scheduler affinity constraint.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct WorkspaceContext {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, rename = "repoId", skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Derived, not stored: computed from whether the agent owns non-terminal
/// tasks or sits in the waiting set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Offline,
    Waiting,
    Processing,
}

/// A known worker process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: AgentId,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    #[serde(default, rename = "workspaceContext", skip_serializing_if = "Option::is_none")]
    pub workspace_context: Option<WorkspaceContext>,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
    pub source: String,
}

/// Parameters for `register_agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    pub id: AgentId,
    pub display_name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub workspace_context: Option<WorkspaceContext>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "unknown".to_string()
}

/// A durable row in the waiting-agent pool (§3.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitingAgent {
    pub agent_id: AgentId,
    pub capabilities: HashSet<String>,
    #[serde(default)]
    pub workspace_context: Option<WorkspaceContext>,
    pub entered_at: DateTime<Utc>,
}

/// A durable row tracking a reservation awaiting acknowledgment (§3.5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAck {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub sent_at: DateTime<Utc>,
}

/// Kinds of externally visible state changes (§4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[serde(rename = "task:created")]
    TaskCreated,
    #[serde(rename = "task:updated")]
    TaskUpdated,
    #[serde(rename = "task:deleted")]
    TaskDeleted,
    #[serde(rename = "agent:status")]
    AgentStatus,
    #[serde(rename = "sync:full")]
    SyncFull,
}

/// A sequenced, broadcastable state-change notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub seq: i64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Targeting for a queued system prompt (`broadcast_system_prompt`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemPromptTarget {
    Agent { agent_id: AgentId },
    Capability { capability: String },
    Broadcast,
}

/// A one-shot control message delivered to a polling agent ahead of any task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemPrompt {
    pub id: String,
    pub target: SystemPromptTarget,
    pub prompt_type: String,
    pub message: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// A pending forced-disconnect signal for an agent (§4.4 step 2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Eviction {
    pub agent_id: AgentId,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// A human review annotation on a task (persisted per §6.4; authoring UI is
/// out of scope — this crate only stores and lists them).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewComment {
    pub id: String,
    pub task_id: TaskId,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// What `Poller::wait_for_task` hands back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Task(Box<Task>),
    Eviction { reason: String },
    SystemPrompt(Box<SystemPrompt>),
    Idle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_derivation_truncates_long_first_line() {
        let long = "x".repeat(100);
        let title = Task::derive_title(&long);
        assert_eq!(title.chars().count(), 80);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn title_derivation_keeps_short_first_line() {
        assert_eq!(Task::derive_title("build X\nmore detail"), "build X");
    }

    #[test]
    fn status_transition_graph_allows_documented_edges() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::PendingAck));
        assert!(TaskStatus::PendingAck.can_transition_to(TaskStatus::Assigned));
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InReview.can_transition_to(TaskStatus::ApprovedQueued));
        assert!(TaskStatus::ApprovedQueued.can_transition_to(TaskStatus::ApprovedPendingAck));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn terminal_states_are_exactly_three() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::PendingRes.is_terminal());
    }

    #[test]
    fn capability_containment_is_set_based() {
        let task = Task {
            id: "t1".into(),
            prompt: "p".into(),
            title: None,
            from: TaskOrigin::Human { id: "u1".into() },
            to: TaskRouting {
                agent_id: None,
                required_capabilities: vec!["A".into()],
                workspace_id: None,
            },
            priority: Priority::Normal,
            status: TaskStatus::Queued,
            context: serde_json::json!({}),
            dependencies: vec![],
            created_at: Utc::now(),
            completed_at: None,
            last_progress_at: Utc::now(),
            history: vec![],
            response: None,
        };
        let caps_ab: HashSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();
        let caps_b: HashSet<String> = ["B"].iter().map(|s| s.to_string()).collect();
        assert!(task.capabilities_satisfied_by(&caps_ab));
        assert!(!task.capabilities_satisfied_by(&caps_b));
    }

    #[test]
    fn priority_ordering_places_critical_first() {
        let mut v = vec![Priority::Normal, Priority::Critical, Priority::High];
        v.sort();
        v.reverse();
        assert_eq!(v, vec![Priority::Critical, Priority::High, Priority::Normal]);
    }

    #[test]
    fn status_round_trips_through_string() {
        for s in [
            TaskStatus::Queued,
            TaskStatus::PendingAck,
            TaskStatus::ApprovedPendingAck,
            TaskStatus::Blocked,
            TaskStatus::Completed,
        ] {
            let parsed: TaskStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}
