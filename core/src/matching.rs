//! `MatchingService`: pure, read-only predicates over tasks and waiting
//! agents (§4.3). Actual reservation happens in `Lifecycle::reserve`, which
//! re-validates preconditions in a single transaction to close the TOCTOU
//! window between a match found here and the write landing.

use crate::models::{AgentId, Task, TaskStatus, WaitingAgent, WorkspaceContext};
use crate::store::workspace_matches;
use std::collections::HashMap;

pub struct MatchingService;

impl MatchingService {
    /// Given a task, pick the first eligible waiting agent (FIFO by
    /// `entered_at`, i.e. longest-waiting first).
    ///
    /// If the task names an explicit `to.agentId`, only that agent is
    /// considered, and only if currently waiting and workspace-eligible.
    pub fn reserve_agent_for_task<'a>(
        task: &Task,
        waiting: &'a [WaitingAgent],
    ) -> Option<&'a WaitingAgent> {
        if let Some(ref wanted) = task.to.agent_id {
            return waiting
                .iter()
                .find(|w| &w.agent_id == wanted)
                .filter(|w| workspace_matches(task.to.workspace_id.as_deref(), w.workspace_context.as_ref()));
        }

        let mut candidates: Vec<&WaitingAgent> = waiting
            .iter()
            .filter(|w| Self::capabilities_satisfied(&task.to.required_capabilities, w))
            .filter(|w| workspace_matches(task.to.workspace_id.as_deref(), w.workspace_context.as_ref()))
            .collect();
        candidates.sort_by_key(|w| w.entered_at);
        candidates.into_iter().next()
    }

    /// Given a waiting agent's capabilities/workspace, pick the first
    /// eligible queued task: `tasks` must already be pre-sorted
    /// priority-desc, createdAt-asc (the order `Store::list_ready_to_match`
    /// guarantees); dependency-gated tasks are skipped.
    pub fn reserve_task_for_agent<'a>(
        agent_id: &AgentId,
        capabilities: &std::collections::HashSet<String>,
        workspace: Option<&WorkspaceContext>,
        tasks: &'a [Task],
        dependency_statuses: &HashMap<String, TaskStatus>,
    ) -> Option<&'a Task> {
        tasks.iter().find(|task| {
            if let Some(ref wanted) = task.to.agent_id {
                if wanted != agent_id {
                    return false;
                }
            }
            if !Self::dependencies_satisfied(task, dependency_statuses) {
                return false;
            }
            if !task.capabilities_satisfied_by(capabilities) {
                return false;
            }
            workspace_matches(task.to.workspace_id.as_deref(), workspace)
        })
    }

    fn capabilities_satisfied(required: &[String], waiting: &WaitingAgent) -> bool {
        required.iter().all(|c| waiting.capabilities.contains(c))
    }

    /// A task is eligible for assignment only once every dependency has
    /// reached a terminal-success state (§3.1 invariant, §8 property 5).
    pub fn dependencies_satisfied(task: &Task, statuses: &HashMap<String, TaskStatus>) -> bool {
        task.dependencies.iter().all(|dep| {
            statuses
                .get(dep)
                .map(|s| s.is_terminal_success())
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, TaskOrigin, TaskRouting};
    use chrono::{Duration, Utc};
    use std::collections::HashSet;

    fn waiting(id: &str, caps: &[&str], entered_secs_ago: i64) -> WaitingAgent {
        WaitingAgent {
            agent_id: id.to_string(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            workspace_context: None,
            entered_at: Utc::now() - Duration::seconds(entered_secs_ago),
        }
    }

    fn task(caps: &[&str], agent_id: Option<&str>) -> Task {
        Task {
            id: "t1".into(),
            prompt: "do it".into(),
            title: None,
            from: TaskOrigin::Human { id: "u1".into() },
            to: TaskRouting {
                agent_id: agent_id.map(String::from),
                required_capabilities: caps.iter().map(|s| s.to_string()).collect(),
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
        }
    }

    #[test]
    fn capability_containment_excludes_missing_capability() {
        let t = task(&["A", "C"], None);
        let agents = vec![waiting("a1", &["A", "B"], 10)];
        assert!(MatchingService::reserve_agent_for_task(&t, &agents).is_none());
    }

    #[test]
    fn capability_containment_matches_superset() {
        let t = task(&["A"], None);
        let agents = vec![waiting("a1", &["A", "B"], 10)];
        assert_eq!(
            MatchingService::reserve_agent_for_task(&t, &agents).unwrap().agent_id,
            "a1"
        );
    }

    #[test]
    fn longest_waiting_wins_tie_break() {
        let t = task(&["A"], None);
        let agents = vec![waiting("late", &["A"], 5), waiting("early", &["A"], 50)];
        assert_eq!(
            MatchingService::reserve_agent_for_task(&t, &agents).unwrap().agent_id,
            "early"
        );
    }

    #[test]
    fn explicit_target_agent_only_considers_that_agent() {
        let t = task(&[], Some("a2"));
        let agents = vec![waiting("a1", &[], 1), waiting("a2", &[], 1)];
        assert_eq!(
            MatchingService::reserve_agent_for_task(&t, &agents).unwrap().agent_id,
            "a2"
        );
        let agents_without_a2 = vec![waiting("a1", &[], 1)];
        assert!(MatchingService::reserve_agent_for_task(&t, &agents_without_a2).is_none());
    }

    #[test]
    fn dependency_gating_blocks_until_terminal_success() {
        let mut t = task(&[], None);
        t.dependencies = vec!["D".to_string()];
        let mut statuses = HashMap::new();
        statuses.insert("D".to_string(), TaskStatus::InProgress);
        assert!(!MatchingService::dependencies_satisfied(&t, &statuses));
        statuses.insert("D".to_string(), TaskStatus::Completed);
        assert!(MatchingService::dependencies_satisfied(&t, &statuses));
    }

    #[test]
    fn reserve_task_for_agent_skips_unmet_dependency_and_capability() {
        let mut blocked = task(&[], None);
        blocked.id = "blocked".into();
        blocked.dependencies = vec!["D".into()];
        let mut needs_ml = task(&["ml"], None);
        needs_ml.id = "needs_ml".into();
        let mut ready = task(&["code"], None);
        ready.id = "ready".into();

        let tasks = vec![blocked, needs_ml, ready];
        let caps: HashSet<String> = ["code"].iter().map(|s| s.to_string()).collect();
        let statuses = HashMap::new();

        let found = MatchingService::reserve_task_for_agent(
            &"a1".to_string(),
            &caps,
            None,
            &tasks,
            &statuses,
        )
        .unwrap();
        assert_eq!(found.id, "ready");
    }
}
