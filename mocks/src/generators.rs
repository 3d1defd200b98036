//! Random test data generators for fuzz-ish unit tests and proptest
//! strategies for property tests.

use broker_core::models::{NewTask, Priority, Task, TaskOrigin, TaskRouting, TaskStatus};
use chrono::Utc;
use fake::faker::lorem::en::{Paragraph, Sentence};
use fake::Fake;
use proptest::prelude::*;
use rand::Rng;

/// Generate a realistic-looking task prompt.
pub fn generate_prompt() -> String {
    Sentence(5..15).fake()
}

/// Generate a realistic-looking multi-sentence task comment.
pub fn generate_comment() -> String {
    Paragraph(1..3).fake()
}

/// Generate a plausible agent capability name.
pub fn generate_capability() -> String {
    let capabilities = ["rust", "python", "frontend", "review", "devops", "security", "docs"];
    capabilities[rand::thread_rng().gen_range(0..capabilities.len())].to_string()
}

/// Generate a random task status, weighted toward the common active ones.
pub fn generate_random_task_status() -> TaskStatus {
    let statuses = [
        TaskStatus::Queued,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];
    statuses[rand::thread_rng().gen_range(0..statuses.len())]
}

/// Generate a random, fully-formed task.
pub fn generate_random_task() -> Task {
    let new_task = NewTask {
        id: None,
        prompt: generate_prompt(),
        title: None,
        from: TaskOrigin::Human { id: "user-1".to_string() },
        to: TaskRouting::default(),
        priority: generate_random_priority(),
        context: serde_json::json!({}),
        dependencies: vec![],
    };
    let mut task = new_task.into_task(Utc::now());
    task.status = generate_random_task_status();
    task
}

fn generate_random_priority() -> Priority {
    let priorities = [Priority::Normal, Priority::High, Priority::Critical];
    priorities[rand::thread_rng().gen_range(0..priorities.len())]
}

/// Configurable task generator: holds a fixed capability pool so generated
/// tasks route consistently within one test.
pub struct TaskGenerator {
    pub capability_pool: Vec<String>,
}

impl Default for TaskGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGenerator {
    pub fn new() -> Self {
        Self { capability_pool: vec!["rust".to_string(), "review".to_string(), "devops".to_string()] }
    }

    pub fn generate(&self) -> Task {
        let capability = &self.capability_pool[rand::thread_rng().gen_range(0..self.capability_pool.len())];
        let new_task = NewTask {
            id: None,
            prompt: generate_prompt(),
            title: None,
            from: TaskOrigin::Human { id: "user-1".to_string() },
            to: TaskRouting { agent_id: None, required_capabilities: vec![capability.clone()], workspace_id: None },
            priority: generate_random_priority(),
            context: serde_json::json!({}),
            dependencies: vec![],
        };
        new_task.into_task(Utc::now())
    }
}

/// Proptest strategy for `Priority`.
pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::Normal), Just(Priority::High), Just(Priority::Critical)]
}

/// Proptest strategy for the non-terminal subset of `TaskStatus` (the
/// states a queued/in-flight task can plausibly be generated in).
pub fn active_task_status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Queued),
        Just(TaskStatus::PendingAck),
        Just(TaskStatus::Assigned),
        Just(TaskStatus::InProgress),
        Just(TaskStatus::InReview),
        Just(TaskStatus::ApprovedQueued),
        Just(TaskStatus::ApprovedPendingAck),
        Just(TaskStatus::Blocked),
        Just(TaskStatus::PendingRes),
    ]
}

/// Proptest strategy for generating complete tasks with a random prompt,
/// priority and status.
pub fn task_strategy() -> impl Strategy<Value = Task> {
    ("[A-Za-z0-9 .,!?]{10,200}", priority_strategy(), active_task_status_strategy()).prop_map(
        |(prompt, priority, status)| {
            let new_task = NewTask {
                id: None,
                prompt,
                title: None,
                from: TaskOrigin::Human { id: "user-1".to_string() },
                to: TaskRouting::default(),
                priority,
                context: serde_json::json!({}),
                dependencies: vec![],
            };
            let mut task = new_task.into_task(Utc::now());
            task.status = status;
            task
        },
    )
}
