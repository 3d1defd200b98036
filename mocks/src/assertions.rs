//! Specialized assertions for domain values, with error messages that show
//! the actual data instead of just `left != right`.

use broker_core::models::{Task, TaskStatus};

/// Assert tasks are equal ignoring timestamps and history.
pub fn assert_task_equals(actual: &Task, expected: &Task) {
    assert_eq!(actual.id, expected.id, "task ids don't match");
    assert_eq!(actual.prompt, expected.prompt, "task prompts don't match");
    assert_eq!(actual.status, expected.status, "task statuses don't match");
    assert_eq!(actual.to.agent_id, expected.to.agent_id, "task owners don't match");
}

/// Assert a state transition is legal per `TaskStatus::can_transition_to`.
pub fn assert_transition_valid(from: TaskStatus, to: TaskStatus) {
    assert!(
        from.can_transition_to(to),
        "expected transition from {from} to {to} to be valid, but it's not"
    );
}

/// Assert a state transition is illegal per `TaskStatus::can_transition_to`.
pub fn assert_transition_invalid(from: TaskStatus, to: TaskStatus) {
    assert!(
        !from.can_transition_to(to),
        "expected transition from {from} to {to} to be invalid, but it's allowed"
    );
}

/// Assert a task list contains a task with the given id.
pub fn assert_contains_task(tasks: &[Task], id: &str) {
    assert!(
        tasks.iter().any(|t| t.id == id),
        "expected to find task '{id}' in task list, but it wasn't there. Available ids: {:?}",
        tasks.iter().map(|t| &t.id).collect::<Vec<_>>()
    );
}

/// Assert tasks are ordered oldest-first by `created_at`.
pub fn assert_tasks_sorted_by_creation(tasks: &[Task]) {
    for window in tasks.windows(2) {
        assert!(
            window[0].created_at <= window[1].created_at,
            "tasks are not sorted by creation time: '{}' ({}) comes before '{}' ({})",
            window[0].id,
            window[0].created_at,
            window[1].id,
            window[1].created_at
        );
    }
}

/// Flexible partial matcher for tasks, for assertions that only care about
/// a handful of fields.
#[derive(Debug, Default)]
pub struct TaskMatcher {
    pub id: Option<String>,
    pub status: Option<TaskStatus>,
    pub agent_id: Option<Option<String>>,
}

impl TaskMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_agent_id(mut self, agent_id: Option<String>) -> Self {
        self.agent_id = Some(agent_id);
        self
    }
}

pub fn assert_task_matches(task: &Task, matcher: &TaskMatcher) {
    if let Some(expected_id) = &matcher.id {
        assert_eq!(&task.id, expected_id, "task id doesn't match expected");
    }
    if let Some(expected_status) = matcher.status {
        assert_eq!(task.status, expected_status, "task status doesn't match expected");
    }
    if let Some(expected_agent_id) = &matcher.agent_id {
        assert_eq!(&task.to.agent_id, expected_agent_id, "task agent id doesn't match expected");
    }
}
