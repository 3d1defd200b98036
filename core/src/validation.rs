//! Stateless input validation, mirroring the invariants of spec §3 and the
//! `enqueue`/`update` contracts of §4.2.

use crate::error::{BrokerError, Result};
use crate::models::NewTask;
use std::collections::{HashMap, HashSet};

/// Static validation functions for broker inputs. Holds no state; every
/// method takes exactly what it needs to validate.
pub struct Validator;

impl Validator {
    /// Non-empty, non-whitespace-only prompt text.
    pub fn validate_prompt(prompt: &str) -> Result<()> {
        if prompt.trim().is_empty() {
            return Err(BrokerError::empty_field("prompt"));
        }
        Ok(())
    }

    /// A capability is a free-form string from an open enum (spec §3.1), but
    /// must still be non-empty and reasonably sized to be useful as a set
    /// element and SQL column value.
    pub fn validate_capability(capability: &str) -> Result<()> {
        if capability.trim().is_empty() {
            return Err(BrokerError::empty_field("capability"));
        }
        if capability.len() > 64 {
            return Err(BrokerError::invalid_format("capability", capability));
        }
        Ok(())
    }

    pub fn validate_capabilities(capabilities: &[String]) -> Result<()> {
        capabilities.iter().try_for_each(|c| Self::validate_capability(c))
    }

    /// Agent/task ids: 1-128 chars, no surrounding whitespace. Explicit ids
    /// are accepted verbatim from callers (delegation, admin re-submission);
    /// generated ids are UUIDs and always pass this check.
    pub fn validate_id(field: &str, id: &str) -> Result<()> {
        if id.trim().is_empty() || id.len() > 128 || id != id.trim() {
            return Err(BrokerError::invalid_format(field, id));
        }
        Ok(())
    }

    pub fn validate_new_task(task: &NewTask) -> Result<()> {
        Self::validate_prompt(&task.prompt)?;
        Self::validate_capabilities(&task.to.required_capabilities)?;
        if let Some(ref id) = task.id {
            Self::validate_id("id", id)?;
        }
        Ok(())
    }

    /// Rejects dependency sets that would introduce a cycle if `task_id`
    /// depended on `dependencies`, given the dependency edges already known
    /// for other tasks (`existing`: task id -> its dependencies).
    ///
    /// A cycle exists iff, starting from any of `dependencies`, a DFS over
    /// `existing` edges can reach `task_id` again.
    pub fn detect_cycle(
        task_id: &str,
        dependencies: &[String],
        existing: &HashMap<String, Vec<String>>,
    ) -> bool {
        let mut stack: Vec<String> = dependencies.to_vec();
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == task_id {
                return true;
            }
            if !visited.insert(node.clone()) {
                continue;
            }
            if let Some(edges) = existing.get(&node) {
                stack.extend(edges.iter().cloned());
            }
        }
        false
    }
}
