//! Fluent builders for constructing domain values in tests.

use broker_core::models::{NewAgent, NewTask, Priority, Task, TaskOrigin, TaskRouting, TaskStatus};
use chrono::Utc;

/// Builder for a fully-formed `Task` (as if already persisted).
pub struct TaskBuilder {
    new_task: NewTask,
    status: Option<TaskStatus>,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self { new_task: crate::fixtures::create_new_task(), status: None }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.new_task.id = Some(id.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.new_task.prompt = prompt.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.new_task.priority = priority;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.new_task.to.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_required_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.new_task.to.required_capabilities = capabilities;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.new_task.dependencies = dependencies;
        self
    }

    pub fn from_agent(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.new_task.from = TaskOrigin::Agent { id: id.into(), name: name.into() };
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn build(self) -> Task {
        let mut task = self.new_task.into_task(Utc::now());
        if let Some(status) = self.status {
            task.status = status;
            if status.is_terminal() {
                task.completed_at = Some(Utc::now());
            }
        }
        task
    }
}

/// Builder for a `NewTask` (the input side, before a `Task` exists).
pub struct NewTaskBuilder {
    new_task: NewTask,
}

impl Default for NewTaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NewTaskBuilder {
    pub fn new() -> Self {
        Self { new_task: crate::fixtures::create_new_task() }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.new_task.prompt = prompt.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.new_task.priority = priority;
        self
    }

    pub fn with_required_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.new_task.to.required_capabilities = capabilities;
        self
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.new_task.to.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn build(self) -> NewTask {
        self.new_task
    }
}

/// Builder for a `NewAgent`.
pub struct NewAgentBuilder {
    new_agent: NewAgent,
}

impl Default for NewAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NewAgentBuilder {
    pub fn new() -> Self {
        Self { new_agent: crate::fixtures::create_new_agent("agent-1") }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.new_agent.id = id.into();
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.new_agent.display_name = display_name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.new_agent.capabilities = capabilities;
        self
    }

    pub fn build(self) -> NewAgent {
        self.new_agent
    }
}
