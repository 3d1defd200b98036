use crate::common::{
    capabilities_to_json, history_to_json, ids_to_json, priority_to_string, push_task_values,
    row_to_agent, row_to_event, row_to_eviction, row_to_pending_ack, row_to_review_comment,
    row_to_system_prompt, row_to_task, row_to_task_message, row_to_waiting_agent,
    sqlx_error_to_broker_error, status_to_string, TASK_COLUMNS,
};
use async_trait::async_trait;
use broker_core::error::{BrokerError, Result};
use broker_core::models::{
    Agent, AgentStatus, Event, EventKind, Eviction, MessageId, MessageRole, NewAgent, PendingAck,
    ReviewComment, SystemPrompt, SystemPromptTarget, Task, TaskFilter, TaskHistoryEntry, TaskId,
    TaskMessage, TaskStatus, WaitingAgent,
};
use broker_core::store::{Patch, Store, StoreStats, TaskMutation};
use chrono::{DateTime, Utc};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};
use std::collections::{HashMap, HashSet};

/// SQLite implementation of the [`Store`] trait.
///
/// Connection pooling, WAL mode, and migration handling follow the
/// teacher's `SqliteTaskRepository`; the schema and the operations it backs
/// are this crate's own.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let db_url = if database_url.starts_with(":memory:") || database_url.starts_with("sqlite://") {
            database_url.to_string()
        } else {
            format!("sqlite://{database_url}")
        };

        if !db_url.contains(":memory:") && !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            Sqlite::create_database(&db_url)
                .await
                .map_err(|e| BrokerError::Internal(format!("failed to create database: {e}")))?;
        }

        let connect_options = if db_url.contains(":memory:") {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(db_url.trim_start_matches("sqlite://"))
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Memory)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        } else {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(db_url.trim_start_matches("sqlite://"))
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        };

        let pool = SqlitePool::connect_with(connect_options)
            .await
            .map_err(sqlx_error_to_broker_error)?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| BrokerError::Internal(format!("migration failed: {e}")))?;
        tracing::info!("database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

struct TaskFields {
    from_json: String,
    caps_json: String,
    context_json: String,
    deps_json: String,
    history_json: String,
    response_json: Option<String>,
}

fn serialize_task_fields(task: &Task) -> Result<TaskFields> {
    Ok(TaskFields {
        from_json: serde_json::to_string(&task.from)
            .map_err(|e| BrokerError::Internal(format!("failed to encode task.from: {e}")))?,
        caps_json: serde_json::to_string(&task.to.required_capabilities)
            .map_err(|e| BrokerError::Internal(format!("failed to encode required_capabilities: {e}")))?,
        context_json: serde_json::to_string(&task.context)
            .map_err(|e| BrokerError::Internal(format!("failed to encode task.context: {e}")))?,
        deps_json: ids_to_json(&task.dependencies)?,
        history_json: history_to_json(&task.history)?,
        response_json: task
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| BrokerError::Internal(format!("failed to encode task.response: {e}")))?,
    })
}

async fn insert_task_row(pool: &SqlitePool, task: &Task) -> Result<Task> {
    let mut qb: sqlx::QueryBuilder<Sqlite> =
        sqlx::QueryBuilder::new(format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES ("));
    push_task_values(&mut qb, task)?;
    qb.push(&format!(") RETURNING {TASK_COLUMNS}"));
    let row = qb.build().fetch_one(pool).await.map_err(sqlx_error_to_broker_error)?;
    row_to_task(&row)
}

async fn write_task_row<'e, E>(executor: E, task: &Task) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let f = serialize_task_fields(task)?;
    sqlx::query(
        "UPDATE tasks SET prompt=?, title=?, from_json=?, to_agent_id=?, to_required_capabilities=?, \
         to_workspace_id=?, priority=?, status=?, context=?, dependencies=?, completed_at=?, \
         last_progress_at=?, history=?, response=? WHERE id=?",
    )
    .bind(&task.prompt)
    .bind(&task.title)
    .bind(&f.from_json)
    .bind(&task.to.agent_id)
    .bind(&f.caps_json)
    .bind(&task.to.workspace_id)
    .bind(priority_to_string(task.priority))
    .bind(status_to_string(task.status))
    .bind(&f.context_json)
    .bind(&f.deps_json)
    .bind(task.completed_at)
    .bind(task.last_progress_at)
    .bind(&f.history_json)
    .bind(&f.response_json)
    .bind(&task.id)
    .execute(executor)
    .await
    .map_err(sqlx_error_to_broker_error)?;
    Ok(())
}

async fn fetch_task<'e, E>(executor: E, id: &str) -> Result<Task>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(sqlx_error_to_broker_error)?;
    match row {
        Some(row) => row_to_task(&row),
        None => Err(BrokerError::task_not_found(id)),
    }
}

/// Selects every unread user message for `task_id`, then marks them read,
/// returning the pre-mark snapshot — the set `ack`/`record_progress` hand
/// back to the caller.
async fn take_unread_user_messages(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    task_id: &str,
) -> Result<Vec<TaskMessage>> {
    let rows = sqlx::query(
        "SELECT id, task_id, timestamp, role, content, is_read, message_type, reply_to, metadata, images \
         FROM task_messages WHERE task_id = ? AND role = 'user' AND is_read = 0 ORDER BY timestamp ASC",
    )
    .bind(task_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(sqlx_error_to_broker_error)?;
    let messages: Result<Vec<TaskMessage>> = rows.iter().map(row_to_task_message).collect();
    let messages = messages?;

    sqlx::query("UPDATE task_messages SET is_read = 1 WHERE task_id = ? AND role = 'user' AND is_read = 0")
        .bind(task_id)
        .execute(&mut **tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

    Ok(messages)
}

#[async_trait]
impl Store for SqliteStore {
    // ---- Tasks ------------------------------------------------------------

    async fn insert_task(&self, task: Task) -> Result<Task> {
        insert_task_row(&self.pool, &task).await
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        fetch_task(&self.pool, id).await
    }

    async fn find_task(&self, id: &str) -> Result<Option<Task>> {
        match fetch_task(&self.pool, id).await {
            Ok(task) => Ok(Some(task)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut qb = crate::common::build_task_filter_query(filter);
        let rows = qb.build().fetch_all(&self.pool).await.map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn list_ready_to_match(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ('QUEUED', 'APPROVED_QUEUED') \
             ORDER BY CASE priority WHEN 'critical' THEN 0 WHEN 'high' THEN 1 ELSE 2 END ASC, created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn dependency_statuses(&self, ids: &[TaskId]) -> Result<HashMap<TaskId, TaskStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb: sqlx::QueryBuilder<Sqlite> = sqlx::QueryBuilder::new("SELECT id, status FROM tasks WHERE id IN (");
        {
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(id);
            }
        }
        qb.push(")");
        let rows = qb.build().fetch_all(&self.pool).await.map_err(sqlx_error_to_broker_error)?;
        let mut out = HashMap::new();
        for row in rows {
            let id: TaskId = row.try_get("id").map_err(sqlx_error_to_broker_error)?;
            let status: String = row.try_get("status").map_err(sqlx_error_to_broker_error)?;
            out.insert(id, crate::common::string_to_status(&status)?);
        }
        Ok(out)
    }

    async fn dependency_graph(&self) -> Result<HashMap<TaskId, Vec<TaskId>>> {
        let rows = sqlx::query("SELECT id, dependencies FROM tasks")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        let mut out = HashMap::new();
        for row in rows {
            let id: TaskId = row.try_get("id").map_err(sqlx_error_to_broker_error)?;
            let deps_json: String = row.try_get("dependencies").map_err(sqlx_error_to_broker_error)?;
            let deps: Vec<TaskId> = serde_json::from_str(&deps_json)
                .map_err(|e| BrokerError::Internal(format!("failed to decode dependencies: {e}")))?;
            out.insert(id, deps);
        }
        Ok(out)
    }

    async fn reserve_task(&self, task_id: &str, agent_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_broker_error)?;

        let mut task = fetch_task(&mut *tx, task_id).await?;
        if task.status != TaskStatus::Queued && task.status != TaskStatus::ApprovedQueued {
            return Err(BrokerError::precondition_drifted(task_id));
        }
        let already_pending: Option<i64> = sqlx::query_scalar("SELECT 1 FROM pending_acks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        if already_pending.is_some() {
            return Err(BrokerError::precondition_drifted(task_id));
        }
        if !task.dependencies.is_empty() {
            let mut qb: sqlx::QueryBuilder<Sqlite> =
                sqlx::QueryBuilder::new("SELECT id, status FROM tasks WHERE id IN (");
            {
                let mut separated = qb.separated(", ");
                for dep in &task.dependencies {
                    separated.push_bind(dep);
                }
            }
            qb.push(")");
            let rows = qb.build().fetch_all(&mut *tx).await.map_err(sqlx_error_to_broker_error)?;
            let mut statuses = HashMap::new();
            for row in rows {
                let id: TaskId = row.try_get("id").map_err(sqlx_error_to_broker_error)?;
                let status: String = row.try_get("status").map_err(sqlx_error_to_broker_error)?;
                statuses.insert(id, crate::common::string_to_status(&status)?);
            }
            let satisfied = task
                .dependencies
                .iter()
                .all(|dep| statuses.get(dep).map(|s| *s == TaskStatus::Completed).unwrap_or(false));
            if !satisfied {
                return Err(BrokerError::precondition_drifted(task_id));
            }
        }

        let new_status = if task.status == TaskStatus::Queued {
            TaskStatus::PendingAck
        } else {
            TaskStatus::ApprovedPendingAck
        };
        task.status = new_status;
        task.to.agent_id = Some(agent_id.to_string());
        task.history.push(TaskHistoryEntry {
            timestamp: now,
            status: new_status,
            agent_id: Some(agent_id.to_string()),
            message: None,
        });
        write_task_row(&mut *tx, &task).await?;

        sqlx::query("INSERT INTO pending_acks (task_id, agent_id, sent_at) VALUES (?, ?, ?)")
            .bind(task_id)
            .bind(agent_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;

        sqlx::query("DELETE FROM waiting_agents WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(task)
    }

    async fn ack_task(&self, task_id: &str, agent_id: &str, now: DateTime<Utc>) -> Result<(Task, Vec<TaskMessage>)> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_broker_error)?;

        let mut task = fetch_task(&mut *tx, task_id).await?;
        if (task.status != TaskStatus::PendingAck && task.status != TaskStatus::ApprovedPendingAck)
            || task.to.agent_id.as_deref() != Some(agent_id)
        {
            return Err(BrokerError::precondition_drifted(task_id));
        }

        task.status = TaskStatus::Assigned;
        task.history.push(TaskHistoryEntry {
            timestamp: now,
            status: TaskStatus::Assigned,
            agent_id: Some(agent_id.to_string()),
            message: None,
        });
        write_task_row(&mut *tx, &task).await?;

        sqlx::query("DELETE FROM pending_acks WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;

        let messages = take_unread_user_messages(&mut tx, task_id).await?;

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok((task, messages))
    }

    async fn record_progress(
        &self,
        task_id: &str,
        agent_id: &str,
        message: TaskMessage,
        now: DateTime<Utc>,
    ) -> Result<(Task, Vec<TaskMessage>)> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_broker_error)?;

        let mut task = fetch_task(&mut *tx, task_id).await?;
        if task.status.is_terminal() || task.to.agent_id.as_deref() != Some(agent_id) {
            return Err(BrokerError::precondition_drifted(task_id));
        }
        task.last_progress_at = now;
        write_task_row(&mut *tx, &task).await?;

        insert_message(&mut tx, &message).await?;
        let messages = take_unread_user_messages(&mut tx, task_id).await?;

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok((task, messages))
    }

    async fn transition_task(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        mutation: TaskMutation,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_broker_error)?;

        let mut task = fetch_task(&mut *tx, task_id).await?;
        if !expected.contains(&task.status) {
            return Err(BrokerError::precondition_drifted(task_id));
        }

        let new_status = mutation.new_status.unwrap_or(task.status);
        task.status = new_status;
        match mutation.set_agent_id {
            Patch::Keep => {}
            Patch::Set(v) => task.to.agent_id = v,
        }
        match mutation.response {
            Patch::Keep => {}
            Patch::Set(v) => task.response = v,
        }
        match mutation.workspace_id {
            Patch::Keep => {}
            Patch::Set(v) => task.to.workspace_id = v,
        }
        if let Some(caps) = mutation.required_capabilities {
            task.to.required_capabilities = caps;
        }
        if new_status.is_terminal() {
            task.completed_at = Some(now);
        }
        task.history.push(TaskHistoryEntry {
            timestamp: now,
            status: new_status,
            agent_id: task.to.agent_id.clone(),
            message: mutation.history_message,
        });
        write_task_row(&mut *tx, &task).await?;

        if let Some(message) = mutation.append_message {
            insert_message(&mut tx, &message).await?;
        }
        if mutation.clear_pending_ack {
            sqlx::query("DELETE FROM pending_acks WHERE task_id = ?")
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_broker_error)?;
        }

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(task)
    }

    async fn list_stale_pending_acks(&self, older_than: DateTime<Utc>) -> Result<Vec<PendingAck>> {
        let rows = sqlx::query("SELECT task_id, agent_id, sent_at FROM pending_acks WHERE sent_at < ?")
            .bind(older_than)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_pending_ack).collect()
    }

    async fn list_stale_progress(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ('ASSIGNED', 'IN_PROGRESS') AND last_progress_at < ?"
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_task).collect()
    }

    // ---- Messages -----------------------------------------------------------

    async fn append_message(&self, message: TaskMessage) -> Result<TaskMessage> {
        insert_message_pool(&self.pool, &message).await
    }

    async fn list_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        let rows = sqlx::query(
            "SELECT id, task_id, timestamp, role, content, is_read, message_type, reply_to, metadata, images \
             FROM task_messages WHERE task_id = ? ORDER BY timestamp ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_task_message).collect()
    }

    async fn unread_user_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        let rows = sqlx::query(
            "SELECT id, task_id, timestamp, role, content, is_read, message_type, reply_to, metadata, images \
             FROM task_messages WHERE task_id = ? AND role = 'user' AND is_read = 0 ORDER BY timestamp ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_task_message).collect()
    }

    async fn mark_messages_read(&self, ids: &[MessageId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut qb: sqlx::QueryBuilder<Sqlite> =
            sqlx::QueryBuilder::new("UPDATE task_messages SET is_read = 1 WHERE id IN (");
        {
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(id);
            }
        }
        qb.push(")");
        qb.build().execute(&self.pool).await.map_err(sqlx_error_to_broker_error)?;
        Ok(())
    }

    // ---- Agents ---------------------------------------------------------

    async fn upsert_agent(&self, agent: NewAgent, now: DateTime<Utc>) -> Result<Agent> {
        let capabilities: HashSet<String> = agent.capabilities.into_iter().collect();
        let caps_json = capabilities_to_json(&capabilities);
        let workspace_json = agent
            .workspace_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| BrokerError::Internal(format!("failed to encode workspace_context: {e}")))?;

        let row = sqlx::query(
            "INSERT INTO agents (id, display_name, role, capabilities, workspace_context, last_seen, source) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, role = excluded.role, \
             capabilities = excluded.capabilities, workspace_context = excluded.workspace_context, \
             last_seen = excluded.last_seen, source = excluded.source \
             RETURNING id, display_name, role, capabilities, workspace_context, last_seen, source",
        )
        .bind(&agent.id)
        .bind(&agent.display_name)
        .bind(&agent.role)
        .bind(&caps_json)
        .bind(&workspace_json)
        .bind(now)
        .bind(&agent.source)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        row_to_agent(&row)
    }

    async fn get_agent(&self, id: &str) -> Result<Agent> {
        match self.find_agent(id).await? {
            Some(agent) => Ok(agent),
            None => Err(BrokerError::agent_not_found(id)),
        }
    }

    async fn find_agent(&self, id: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, display_name, role, capabilities, workspace_context, last_seen, source FROM agents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT id, display_name, role, capabilities, workspace_context, last_seen, source FROM agents",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn touch_heartbeat(&self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE agents SET last_seen = ? WHERE id = ?")
            .bind(now)
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(())
    }

    async fn agent_status(&self, agent_id: &str) -> Result<AgentStatus> {
        let waiting: Option<i64> = sqlx::query_scalar("SELECT 1 FROM waiting_agents WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        if waiting.is_some() {
            return Ok(AgentStatus::Waiting);
        }
        let processing: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM tasks WHERE to_agent_id = ? AND status IN ('ASSIGNED', 'IN_PROGRESS', 'PENDING_ACK') LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(if processing.is_some() { AgentStatus::Processing } else { AgentStatus::Offline })
    }

    // ---- Waiting set ------------------------------------------------------

    async fn enter_waiting_set(&self, waiting: WaitingAgent) -> Result<()> {
        let caps_json = capabilities_to_json(&waiting.capabilities);
        let workspace_json = waiting
            .workspace_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| BrokerError::Internal(format!("failed to encode workspace_context: {e}")))?;
        sqlx::query(
            "INSERT INTO waiting_agents (agent_id, capabilities, workspace_context, entered_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(agent_id) DO UPDATE SET capabilities = excluded.capabilities, \
             workspace_context = excluded.workspace_context, entered_at = excluded.entered_at",
        )
        .bind(&waiting.agent_id)
        .bind(&caps_json)
        .bind(&workspace_json)
        .bind(waiting.entered_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(())
    }

    async fn remove_from_waiting_set(&self, agent_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM waiting_agents WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_waiting_agents(&self) -> Result<Vec<WaitingAgent>> {
        let rows = sqlx::query(
            "SELECT agent_id, capabilities, workspace_context, entered_at FROM waiting_agents ORDER BY entered_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_waiting_agent).collect()
    }

    async fn stale_waiting_agents(&self, older_than: DateTime<Utc>) -> Result<Vec<WaitingAgent>> {
        let rows = sqlx::query(
            "SELECT agent_id, capabilities, workspace_context, entered_at FROM waiting_agents WHERE entered_at < ?",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_waiting_agent).collect()
    }

    // ---- Evictions & system prompts ---------------------------------------

    async fn queue_eviction(&self, eviction: Eviction) -> Result<()> {
        sqlx::query(
            "INSERT INTO evictions (agent_id, reason, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(agent_id) DO UPDATE SET reason = excluded.reason, created_at = excluded.created_at",
        )
        .bind(&eviction.agent_id)
        .bind(&eviction.reason)
        .bind(eviction.created_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(())
    }

    async fn pop_eviction(&self, agent_id: &str) -> Result<Option<Eviction>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_broker_error)?;
        let row = sqlx::query("SELECT agent_id, reason, created_at FROM evictions WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        let eviction = row.as_ref().map(row_to_eviction).transpose()?;
        if eviction.is_some() {
            sqlx::query("DELETE FROM evictions WHERE agent_id = ?")
                .bind(agent_id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_broker_error)?;
        }
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(eviction)
    }

    async fn queue_system_prompt(&self, prompt: SystemPrompt) -> Result<()> {
        let target_json = serde_json::to_string(&prompt.target)
            .map_err(|e| BrokerError::Internal(format!("failed to encode system_prompt.target: {e}")))?;
        let payload_json = prompt
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| BrokerError::Internal(format!("failed to encode system_prompt.payload: {e}")))?;
        sqlx::query(
            "INSERT INTO system_prompts (id, target, prompt_type, message, payload, priority, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&prompt.id)
        .bind(&target_json)
        .bind(&prompt.prompt_type)
        .bind(&prompt.message)
        .bind(&payload_json)
        .bind(prompt.priority)
        .bind(prompt.created_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(())
    }

    async fn pop_system_prompt(&self, agent_id: &str, capabilities: &HashSet<String>) -> Result<Option<SystemPrompt>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_broker_error)?;
        let rows = sqlx::query(
            "SELECT id, target, prompt_type, message, payload, priority, created_at FROM system_prompts \
             ORDER BY priority DESC, created_at ASC",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let mut prompts = Vec::with_capacity(rows.len());
        for row in &rows {
            prompts.push(row_to_system_prompt(row)?);
        }

        let pick = prompts
            .iter()
            .find(|p| matches!(&p.target, SystemPromptTarget::Agent { agent_id: a } if a == agent_id))
            .or_else(|| {
                prompts.iter().find(|p| {
                    matches!(&p.target, SystemPromptTarget::Capability { capability } if capabilities.contains(capability))
                })
            })
            .or_else(|| prompts.iter().find(|p| matches!(p.target, SystemPromptTarget::Broadcast)))
            .cloned();

        if let Some(ref prompt) = pick {
            sqlx::query("DELETE FROM system_prompts WHERE id = ?")
                .bind(&prompt.id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_broker_error)?;
        }
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(pick)
    }

    // ---- Events -------------------------------------------------------------

    async fn append_event(&self, kind: EventKind, payload: serde_json::Value, now: DateTime<Utc>) -> Result<Event> {
        let kind_str = event_kind_str(kind);
        let payload_json = serde_json::to_string(&payload)
            .map_err(|e| BrokerError::Internal(format!("failed to encode event payload: {e}")))?;
        let row = sqlx::query(
            "INSERT INTO events (kind, payload, at) VALUES (?, ?, ?) RETURNING seq, kind, payload, at",
        )
        .bind(kind_str)
        .bind(payload_json)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        row_to_event(&row)
    }

    async fn list_events_since(&self, seq: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query("SELECT seq, kind, payload, at FROM events WHERE seq > ? ORDER BY seq ASC")
            .bind(seq)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_event).collect()
    }

    async fn max_event_seq(&self) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(seq)
    }

    // ---- Review comments & logs ---------------------------------------------

    async fn add_review_comment(&self, comment: ReviewComment) -> Result<ReviewComment> {
        let row = sqlx::query(
            "INSERT INTO review_comments (id, task_id, author, content, created_at) VALUES (?, ?, ?, ?, ?) \
             RETURNING id, task_id, author, content, created_at",
        )
        .bind(&comment.id)
        .bind(&comment.task_id)
        .bind(&comment.author)
        .bind(&comment.content)
        .bind(comment.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        row_to_review_comment(&row)
    }

    async fn list_review_comments(&self, task_id: &str) -> Result<Vec<ReviewComment>> {
        let rows = sqlx::query(
            "SELECT id, task_id, author, content, created_at FROM review_comments WHERE task_id = ? ORDER BY created_at ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_review_comment).collect()
    }

    async fn append_log(&self, level: &str, target: &str, message: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO logs (level, target, message, at) VALUES (?, ?, ?, ?)")
            .bind(level)
            .bind(target)
            .bind(message)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(())
    }

    // ---- Aggregate ----------------------------------------------------------

    async fn stats(&self) -> Result<StoreStats> {
        let (total, by_status, by_agent, waiting_agents, pending_acks, max_seq) = tokio::join!(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks").fetch_one(&self.pool),
            sqlx::query("SELECT status, COUNT(*) as n FROM tasks GROUP BY status").fetch_all(&self.pool),
            sqlx::query("SELECT to_agent_id, COUNT(*) as n FROM tasks WHERE to_agent_id IS NOT NULL GROUP BY to_agent_id")
                .fetch_all(&self.pool),
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM waiting_agents").fetch_one(&self.pool),
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pending_acks").fetch_one(&self.pool),
            sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(seq), 0) FROM events").fetch_one(&self.pool),
        );

        let mut stats = StoreStats {
            total_tasks: total.map_err(sqlx_error_to_broker_error)? as u64,
            waiting_agents: waiting_agents.map_err(sqlx_error_to_broker_error)? as u64,
            pending_acks: pending_acks.map_err(sqlx_error_to_broker_error)? as u64,
            max_event_seq: max_seq.map_err(sqlx_error_to_broker_error)?,
            ..Default::default()
        };

        for row in by_status.map_err(sqlx_error_to_broker_error)? {
            let status: String = row.try_get("status").map_err(sqlx_error_to_broker_error)?;
            let n: i64 = row.try_get("n").map_err(sqlx_error_to_broker_error)?;
            stats.tasks_by_status.insert(crate::common::string_to_status(&status)?, n as u64);
        }
        for row in by_agent.map_err(sqlx_error_to_broker_error)? {
            let agent_id: String = row.try_get("to_agent_id").map_err(sqlx_error_to_broker_error)?;
            let n: i64 = row.try_get("n").map_err(sqlx_error_to_broker_error)?;
            stats.tasks_by_agent.insert(agent_id, n as u64);
        }

        Ok(stats)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.map_err(sqlx_error_to_broker_error)?;
        Ok(())
    }

    async fn recover_from_restart(&self, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_broker_error)?;

        for (stale, restored) in [("PENDING_ACK", "QUEUED"), ("APPROVED_PENDING_ACK", "APPROVED_QUEUED")] {
            let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?"))
                .bind(stale)
                .fetch_all(&mut *tx)
                .await
                .map_err(sqlx_error_to_broker_error)?;
            for row in rows {
                let mut task = row_to_task(&row)?;
                task.status = crate::common::string_to_status(restored)?;
                task.to.agent_id = None;
                task.history.push(TaskHistoryEntry {
                    timestamp: now,
                    status: task.status,
                    agent_id: None,
                    message: Some("restart recovery: reservation reset".to_string()),
                });
                write_task_row(&mut *tx, &task).await?;
            }
        }

        sqlx::query("DELETE FROM waiting_agents").execute(&mut *tx).await.map_err(sqlx_error_to_broker_error)?;
        sqlx::query("DELETE FROM pending_acks").execute(&mut *tx).await.map_err(sqlx_error_to_broker_error)?;

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(())
    }
}

fn event_kind_str(kind: EventKind) -> &'static str {
    match kind {
        EventKind::TaskCreated => "task:created",
        EventKind::TaskUpdated => "task:updated",
        EventKind::TaskDeleted => "task:deleted",
        EventKind::AgentStatus => "agent:status",
        EventKind::SyncFull => "sync:full",
    }
}

fn message_role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Agent => "agent",
        MessageRole::System => "system",
    }
}

fn message_type_str(t: broker_core::models::MessageType) -> &'static str {
    match t {
        broker_core::models::MessageType::Comment => "comment",
        broker_core::models::MessageType::Progress => "progress",
        broker_core::models::MessageType::ReviewFeedback => "review_feedback",
        broker_core::models::MessageType::BlockEvent => "block_event",
    }
}

async fn insert_message(tx: &mut sqlx::Transaction<'_, Sqlite>, message: &TaskMessage) -> Result<()> {
    let metadata = serde_json::to_string(&message.metadata)
        .map_err(|e| BrokerError::Internal(format!("failed to encode message.metadata: {e}")))?;
    let images = message
        .images
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| BrokerError::Internal(format!("failed to encode message.images: {e}")))?;

    sqlx::query(
        "INSERT INTO task_messages (id, task_id, timestamp, role, content, is_read, message_type, reply_to, metadata, images) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.task_id)
    .bind(message.timestamp)
    .bind(message_role_str(message.role))
    .bind(&message.content)
    .bind(message.is_read as i64)
    .bind(message_type_str(message.message_type))
    .bind(&message.reply_to)
    .bind(&metadata)
    .bind(&images)
    .execute(&mut **tx)
    .await
    .map_err(sqlx_error_to_broker_error)?;
    Ok(())
}

async fn insert_message_pool(pool: &SqlitePool, message: &TaskMessage) -> Result<TaskMessage> {
    let metadata = serde_json::to_string(&message.metadata)
        .map_err(|e| BrokerError::Internal(format!("failed to encode message.metadata: {e}")))?;
    let images = message
        .images
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| BrokerError::Internal(format!("failed to encode message.images: {e}")))?;

    let row = sqlx::query(
        "INSERT INTO task_messages (id, task_id, timestamp, role, content, is_read, message_type, reply_to, metadata, images) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING id, task_id, timestamp, role, content, is_read, message_type, reply_to, metadata, images",
    )
    .bind(&message.id)
    .bind(&message.task_id)
    .bind(message.timestamp)
    .bind(message_role_str(message.role))
    .bind(&message.content)
    .bind(message.is_read as i64)
    .bind(message_type_str(message.message_type))
    .bind(&message.reply_to)
    .bind(&metadata)
    .bind(&images)
    .fetch_one(pool)
    .await
    .map_err(sqlx_error_to_broker_error)?;
    row_to_task_message(&row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::models::{NewTask, Priority, TaskOrigin, TaskRouting};

    async fn test_store(name: &str) -> SqliteStore {
        let store = SqliteStore::new(&format!(":memory:{name}")).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn sample_task(id: &str) -> Task {
        let now = Utc::now();
        NewTask {
            id: Some(id.to_string()),
            prompt: "do the thing".to_string(),
            title: None,
            from: TaskOrigin::Human { id: "u1".to_string() },
            to: TaskRouting::default(),
            priority: Priority::Normal,
            context: serde_json::json!({}),
            dependencies: vec![],
        }
        .into_task(now)
    }

    #[tokio::test]
    async fn insert_and_get_round_trips() {
        let store = test_store("insert_and_get").await;
        let task = sample_task("t1");
        store.insert_task(task.clone()).await.unwrap();
        let fetched = store.get_task("t1").await.unwrap();
        assert_eq!(fetched.id, "t1");
        assert_eq!(fetched.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn reserve_task_moves_to_pending_ack_and_clears_waiting_set() {
        let store = test_store("reserve_pending_ack").await;
        let task = sample_task("t2");
        store.insert_task(task).await.unwrap();
        store
            .enter_waiting_set(WaitingAgent {
                agent_id: "a1".to_string(),
                capabilities: HashSet::new(),
                workspace_context: None,
                entered_at: Utc::now(),
            })
            .await
            .unwrap();

        let reserved = store.reserve_task("t2", "a1", Utc::now()).await.unwrap();
        assert_eq!(reserved.status, TaskStatus::PendingAck);
        assert_eq!(reserved.to.agent_id.as_deref(), Some("a1"));
        assert!(store.list_waiting_agents().await.unwrap().is_empty());
        assert_eq!(
            store.list_stale_pending_acks(Utc::now() + chrono::Duration::seconds(1)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn reserve_task_rejects_non_queued_status() {
        let store = test_store("reserve_rejects").await;
        let mut task = sample_task("t3");
        task.status = TaskStatus::Completed;
        store.insert_task(task).await.unwrap();
        let result = store.reserve_task("t3", "a1", Utc::now()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ack_task_transitions_to_assigned_and_drops_pending_ack() {
        let store = test_store("ack_transitions").await;
        let task = sample_task("t4");
        store.insert_task(task).await.unwrap();
        store.reserve_task("t4", "a1", Utc::now()).await.unwrap();

        let (acked, _) = store.ack_task("t4", "a1", Utc::now()).await.unwrap();
        assert_eq!(acked.status, TaskStatus::Assigned);
        assert!(store
            .list_stale_pending_acks(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn agent_status_reflects_waiting_and_processing() {
        let store = test_store("agent_status").await;
        assert_eq!(store.agent_status("ghost").await.unwrap(), AgentStatus::Offline);

        store
            .enter_waiting_set(WaitingAgent {
                agent_id: "a1".to_string(),
                capabilities: HashSet::new(),
                workspace_context: None,
                entered_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(store.agent_status("a1").await.unwrap(), AgentStatus::Waiting);

        let task = sample_task("t5");
        store.insert_task(task).await.unwrap();
        store.reserve_task("t5", "a1", Utc::now()).await.unwrap();
        store.ack_task("t5", "a1", Utc::now()).await.unwrap();
        assert_eq!(store.agent_status("a1").await.unwrap(), AgentStatus::Processing);
    }

    #[tokio::test]
    async fn recover_from_restart_resets_pending_ack_tasks() {
        let store = test_store("recover_restart").await;
        let task = sample_task("t6");
        store.insert_task(task).await.unwrap();
        store.reserve_task("t6", "a1", Utc::now()).await.unwrap();

        store.recover_from_restart(Utc::now()).await.unwrap();

        let recovered = store.get_task("t6").await.unwrap();
        assert_eq!(recovered.status, TaskStatus::Queued);
        assert!(recovered.to.agent_id.is_none());
        assert!(store
            .list_stale_pending_acks(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .is_empty());
    }
}
