//! Ready-made domain values for tests: a task or agent with sensible
//! defaults, one field away from whatever the test actually cares about.

use broker_core::models::{
    NewAgent, NewTask, Priority, Task, TaskOrigin, TaskRouting, TaskStatus, WorkspaceContext,
};
use chrono::Utc;

/// A freshly-queued task from a human, with no routing constraints.
pub fn create_test_task() -> Task {
    create_new_task().into_task(Utc::now())
}

/// A task in a specific status, with history left at a single QUEUED entry
/// (tests that care about history should append to it themselves).
pub fn create_test_task_with_state(status: TaskStatus) -> Task {
    let mut task = create_test_task();
    task.status = status;
    if status.is_terminal() {
        task.completed_at = Some(Utc::now());
    }
    task
}

/// A task already routed to `agent_id`.
pub fn create_test_task_with_owner(agent_id: impl Into<String>) -> Task {
    let mut task = create_test_task();
    task.to.agent_id = Some(agent_id.into());
    task
}

/// `count` distinct tasks, each with a unique id and prompt.
pub fn create_test_tasks(count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| {
            let mut task = create_new_task_with_id(format!("task-{i}")).into_task(Utc::now());
            task.prompt = format!("task number {i}");
            task
        })
        .collect()
}

/// One task per non-terminal/terminal status, useful for exercising filters.
pub fn create_tasks_in_all_states() -> Vec<Task> {
    [
        TaskStatus::Queued,
        TaskStatus::PendingAck,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::ApprovedQueued,
        TaskStatus::ApprovedPendingAck,
        TaskStatus::Blocked,
        TaskStatus::PendingRes,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ]
    .into_iter()
    .map(create_test_task_with_state)
    .collect()
}

/// A `NewTask` ready for `Lifecycle::enqueue`.
pub fn create_new_task() -> NewTask {
    NewTask {
        id: None,
        prompt: "implement the thing".to_string(),
        title: None,
        from: TaskOrigin::Human { id: "user-1".to_string() },
        to: TaskRouting::default(),
        priority: Priority::Normal,
        context: serde_json::json!({}),
        dependencies: vec![],
    }
}

fn create_new_task_with_id(id: impl Into<String>) -> NewTask {
    let mut task = create_new_task();
    task.id = Some(id.into());
    task
}

/// A `NewTask` that requires specific capabilities and a workspace.
pub fn create_new_task_with_routing(capabilities: Vec<String>, workspace_id: impl Into<String>) -> NewTask {
    let mut task = create_new_task();
    task.to = TaskRouting {
        agent_id: None,
        required_capabilities: capabilities,
        workspace_id: Some(workspace_id.into()),
    };
    task
}

/// A `NewAgent` ready for `AgentRegistry::register`.
pub fn create_new_agent(id: impl Into<String>) -> NewAgent {
    NewAgent {
        id: id.into(),
        display_name: "Test Agent".to_string(),
        role: None,
        capabilities: vec![],
        workspace_context: None,
        source: "test".to_string(),
    }
}

/// A `NewAgent` with a capability set and a workspace it is scoped to.
pub fn create_new_agent_with_capabilities(
    id: impl Into<String>,
    capabilities: Vec<String>,
    repo_id: impl Into<String>,
) -> NewAgent {
    let mut agent = create_new_agent(id);
    agent.capabilities = capabilities;
    agent.workspace_context = Some(WorkspaceContext {
        kind: Some("git".to_string()),
        repo_id: Some(repo_id.into()),
        branch: None,
        path: None,
    });
    agent
}
