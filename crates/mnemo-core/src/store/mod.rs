//! Relational Store
//!
//! Rows that live beside the graph: per-config tuning, end users with their
//! cached insight/summary prose, short-term memory, task executions, and
//! workflow executions. Shares the SQLite file with the graph layer but owns
//! its own connections.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};

// ============================================================================
// RECORDS
// ============================================================================

/// End-user row with cached prose
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndUserRecord {
    pub id: String,
    pub workspace_id: Option<String>,
    pub memory_config_id: Option<String>,
    pub memory_insight: Option<String>,
    pub memory_insight_updated_at: Option<DateTime<Utc>>,
    pub summary_intro: Option<String>,
    pub summary_personality: Option<String>,
    pub summary_core_values: Option<String>,
    pub summary_one_sentence: Option<String>,
    pub summary_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Cached `{question, answer, retrieved_content}` row per end user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortTermMemoryRecord {
    pub end_user_id: String,
    pub message: String,
    pub answer: String,
    pub retrieved_content: String,
    pub search_switch: String,
    pub updated_at: DateTime<Utc>,
}

/// Task execution envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub kind: String,
    pub lane: String,
    pub status: String,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub elapsed_seconds: Option<f64>,
}

/// Workflow execution checkpoint row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionRecord {
    pub execution_id: String,
    pub conversation_id: Option<String>,
    pub app_id: Option<String>,
    pub status: String,
    pub conv_variables: serde_json::Value,
    pub messages: serde_json::Value,
    pub output: Option<String>,
    pub error: Option<String>,
    pub elapsed_seconds: Option<f64>,
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed relational store
pub struct RelationalStore {
    conn: Mutex<Connection>,
}

impl RelationalStore {
    /// Open at the given path, applying migrations when needed
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let conn = match db_path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        crate::graph::migrations_for_store(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MemoryError::Init("Relational lock poisoned".into()))
    }

    // ========================================================================
    // MEMORY CONFIGS
    // ========================================================================

    /// Save a config under an id
    pub fn save_config(&self, config_id: &str, name: &str, config: &MemoryConfig) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO memory_configs (id, config_name, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET config_name = ?2, body = ?3, updated_at = ?4",
            params![config_id, name, serde_json::to_string(config)?, now],
        )?;
        Ok(())
    }

    /// Load a config by id; a missing row is `ConfigMissing`
    pub fn load_config(&self, config_id: &str) -> Result<MemoryConfig> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM memory_configs WHERE id = ?1",
                params![config_id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(MemoryError::ConfigMissing(config_id.to_string())),
        }
    }

    /// Load a config by id, falling back to defaults when absent
    pub fn load_config_or_default(&self, config_id: Option<&str>) -> Result<MemoryConfig> {
        match config_id {
            Some(id) => match self.load_config(id) {
                Ok(config) => Ok(config),
                Err(MemoryError::ConfigMissing(_)) => Ok(MemoryConfig::default()),
                Err(e) => Err(e),
            },
            None => Ok(MemoryConfig::default()),
        }
    }

    // ========================================================================
    // END USERS
    // ========================================================================

    /// Create the end-user row when absent
    pub fn ensure_end_user(&self, end_user_id: &str, workspace_id: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO end_users (id, workspace_id, created_at) VALUES (?1, ?2, ?3)",
            params![end_user_id, workspace_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_end_user(&self, end_user_id: &str) -> Result<Option<EndUserRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT id, workspace_id, memory_config_id, memory_insight,
                        memory_insight_updated_at, summary_intro, summary_personality,
                        summary_core_values, summary_one_sentence, summary_updated_at, created_at
                 FROM end_users WHERE id = ?1",
                params![end_user_id],
                |row| {
                    Ok(EndUserRecord {
                        id: row.get(0)?,
                        workspace_id: row.get(1)?,
                        memory_config_id: row.get(2)?,
                        memory_insight: row.get(3)?,
                        memory_insight_updated_at: parse_opt_time(row.get(4)?),
                        summary_intro: row.get(5)?,
                        summary_personality: row.get(6)?,
                        summary_core_values: row.get(7)?,
                        summary_one_sentence: row.get(8)?,
                        summary_updated_at: parse_opt_time(row.get(9)?),
                        created_at: parse_opt_time(Some(row.get(10)?)).unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// All end users, optionally restricted to one workspace
    pub fn list_end_users(&self, workspace_id: Option<&str>) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut ids = Vec::new();
        match workspace_id {
            Some(workspace) => {
                let mut stmt =
                    conn.prepare("SELECT id FROM end_users WHERE workspace_id = ?1 ORDER BY id")?;
                for row in stmt.query_map(params![workspace], |row| row.get(0))? {
                    ids.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare("SELECT id FROM end_users ORDER BY id")?;
                for row in stmt.query_map([], |row| row.get(0))? {
                    ids.push(row?);
                }
            }
        }
        Ok(ids)
    }

    /// Distinct workspaces that have end users
    pub fn list_workspaces(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT workspace_id FROM end_users WHERE workspace_id IS NOT NULL ORDER BY workspace_id",
        )?;
        let mut workspaces = Vec::new();
        for row in stmt.query_map([], |row| row.get(0))? {
            workspaces.push(row?);
        }
        Ok(workspaces)
    }

    /// Cache the regenerated memory insight
    pub fn update_insight(&self, end_user_id: &str, insight: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE end_users SET memory_insight = ?1, memory_insight_updated_at = ?2 WHERE id = ?3",
            params![insight, Utc::now().to_rfc3339(), end_user_id],
        )?;
        if changed == 0 {
            return Err(MemoryError::NotFound(end_user_id.to_string()));
        }
        Ok(())
    }

    /// Cache the regenerated four-part user summary
    pub fn update_summary(
        &self,
        end_user_id: &str,
        intro: &str,
        personality: &str,
        core_values: &str,
        one_sentence: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE end_users SET
                summary_intro = ?1,
                summary_personality = ?2,
                summary_core_values = ?3,
                summary_one_sentence = ?4,
                summary_updated_at = ?5
             WHERE id = ?6",
            params![
                intro,
                personality,
                core_values,
                one_sentence,
                Utc::now().to_rfc3339(),
                end_user_id
            ],
        )?;
        if changed == 0 {
            return Err(MemoryError::NotFound(end_user_id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // SHORT-TERM MEMORY
    // ========================================================================

    /// Idempotent upsert of the per-user short-term memory row
    pub fn upsert_short_term_memory(&self, record: &ShortTermMemoryRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO short_term_memories
                (end_user_id, message, answer, retrieved_content, search_switch, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(end_user_id) DO UPDATE SET
                message = ?2, answer = ?3, retrieved_content = ?4,
                search_switch = ?5, updated_at = ?6",
            params![
                record.end_user_id,
                record.message,
                record.answer,
                record.retrieved_content,
                record.search_switch,
                record.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_short_term_memory(&self, end_user_id: &str) -> Result<Option<ShortTermMemoryRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT end_user_id, message, answer, retrieved_content, search_switch, updated_at
                 FROM short_term_memories WHERE end_user_id = ?1",
                params![end_user_id],
                |row| {
                    Ok(ShortTermMemoryRecord {
                        end_user_id: row.get(0)?,
                        message: row.get(1)?,
                        answer: row.get(2)?,
                        retrieved_content: row.get(3)?,
                        search_switch: row.get(4)?,
                        updated_at: parse_opt_time(Some(row.get(5)?)).unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ========================================================================
    // TASK EXECUTIONS
    // ========================================================================

    pub fn insert_task(&self, record: &TaskRecord) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO task_executions
                (task_id, kind, lane, status, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                record.task_id,
                record.kind,
                record.lane,
                record.status,
                serde_json::to_string(&record.payload)?,
                now
            ],
        )?;
        Ok(())
    }

    pub fn update_task(
        &self,
        task_id: &str,
        status: &str,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
        elapsed_seconds: Option<f64>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE task_executions SET
                status = ?1, result = ?2, error = ?3, elapsed_seconds = ?4, updated_at = ?5
             WHERE task_id = ?6",
            params![
                status,
                result.map(|r| r.to_string()),
                error,
                elapsed_seconds,
                Utc::now().to_rfc3339(),
                task_id
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT task_id, kind, lane, status, payload, result, error, elapsed_seconds
                 FROM task_executions WHERE task_id = ?1",
                params![task_id],
                Self::row_to_task,
            )
            .optional()?;
        Ok(record)
    }

    /// Pending tasks in submission order, for boot-time re-enqueue
    pub fn pending_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, kind, lane, status, payload, result, error, elapsed_seconds
             FROM task_executions WHERE status = 'pending' ORDER BY created_at",
        )?;
        let tasks = stmt
            .query_map([], Self::row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<TaskRecord> {
        Ok(TaskRecord {
            task_id: row.get(0)?,
            kind: row.get(1)?,
            lane: row.get(2)?,
            status: row.get(3)?,
            payload: serde_json::from_str(&row.get::<_, String>(4)?)
                .unwrap_or(serde_json::Value::Null),
            result: row
                .get::<_, Option<String>>(5)?
                .and_then(|s| serde_json::from_str(&s).ok()),
            error: row.get(6)?,
            elapsed_seconds: row.get(7)?,
        })
    }

    // ========================================================================
    // WORKFLOW EXECUTIONS
    // ========================================================================

    pub fn save_workflow_execution(&self, record: &WorkflowExecutionRecord) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO workflow_executions
                (execution_id, conversation_id, app_id, status, conv_variables, messages,
                 output, error, elapsed_seconds, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(execution_id) DO UPDATE SET
                status = ?4, conv_variables = ?5, messages = ?6,
                output = ?7, error = ?8, elapsed_seconds = ?9, updated_at = ?10",
            params![
                record.execution_id,
                record.conversation_id,
                record.app_id,
                record.status,
                record.conv_variables.to_string(),
                record.messages.to_string(),
                record.output,
                record.error,
                record.elapsed_seconds,
                now
            ],
        )?;
        Ok(())
    }

    /// Latest completed execution of a conversation (continuity seed)
    pub fn latest_completed_execution(
        &self,
        conversation_id: &str,
    ) -> Result<Option<WorkflowExecutionRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT execution_id, conversation_id, app_id, status, conv_variables, messages,
                        output, error, elapsed_seconds
                 FROM workflow_executions
                 WHERE conversation_id = ?1 AND status = 'completed'
                 ORDER BY updated_at DESC LIMIT 1",
                params![conversation_id],
                Self::row_to_execution,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_workflow_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecutionRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT execution_id, conversation_id, app_id, status, conv_variables, messages,
                        output, error, elapsed_seconds
                 FROM workflow_executions WHERE execution_id = ?1",
                params![execution_id],
                Self::row_to_execution,
            )
            .optional()?;
        Ok(record)
    }

    fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<WorkflowExecutionRecord> {
        Ok(WorkflowExecutionRecord {
            execution_id: row.get(0)?,
            conversation_id: row.get(1)?,
            app_id: row.get(2)?,
            status: row.get(3)?,
            conv_variables: serde_json::from_str(&row.get::<_, String>(4)?)
                .unwrap_or(serde_json::Value::Null),
            messages: serde_json::from_str(&row.get::<_, String>(5)?)
                .unwrap_or(serde_json::Value::Null),
            output: row.get(6)?,
            error: row.get(7)?,
            elapsed_seconds: row.get(8)?,
        })
    }

    // ========================================================================
    // MEMORY INCREMENTS
    // ========================================================================

    /// Record a workspace's memory total sweep
    pub fn write_memory_increment(&self, workspace_id: &str, total_num: i64) -> Result<String> {
        let conn = self.lock()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO memory_increments (id, workspace_id, total_num, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, workspace_id, total_num, Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }
}

fn parse_opt_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip_and_missing() {
        let store = RelationalStore::new(None).unwrap();
        let config = MemoryConfig {
            rerank_alpha: 0.7,
            ..Default::default()
        };
        store.save_config("cfg-1", "custom", &config).unwrap();

        let loaded = store.load_config("cfg-1").unwrap();
        assert!((loaded.rerank_alpha - 0.7).abs() < f64::EPSILON);

        assert!(matches!(
            store.load_config("nope"),
            Err(MemoryError::ConfigMissing(_))
        ));
        // Fallback path yields defaults
        let fallback = store.load_config_or_default(Some("nope")).unwrap();
        assert!((fallback.rerank_alpha - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_end_user_prose_caching() {
        let store = RelationalStore::new(None).unwrap();
        store.ensure_end_user("u1", Some("w1")).unwrap();
        store.ensure_end_user("u1", Some("w1")).unwrap();

        store.update_insight("u1", "remembers mostly travel plans").unwrap();
        store
            .update_summary("u1", "intro", "curious", "honesty", "a traveler")
            .unwrap();

        let user = store.get_end_user("u1").unwrap().unwrap();
        assert_eq!(user.memory_insight.as_deref(), Some("remembers mostly travel plans"));
        assert!(user.memory_insight_updated_at.is_some());
        assert_eq!(user.summary_one_sentence.as_deref(), Some("a traveler"));
        assert!(user.summary_updated_at.is_some());

        assert!(matches!(
            store.update_insight("ghost", "x"),
            Err(MemoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_short_term_memory_upsert_is_idempotent() {
        let store = RelationalStore::new(None).unwrap();
        let mut record = ShortTermMemoryRecord {
            end_user_id: "u1".to_string(),
            message: "where do I live?".to_string(),
            answer: "Berlin".to_string(),
            retrieved_content: "[]".to_string(),
            search_switch: "0".to_string(),
            updated_at: Utc::now(),
        };
        store.upsert_short_term_memory(&record).unwrap();

        record.answer = "Berlin, Germany".to_string();
        store.upsert_short_term_memory(&record).unwrap();

        let loaded = store.get_short_term_memory("u1").unwrap().unwrap();
        assert_eq!(loaded.answer, "Berlin, Germany");
    }

    #[test]
    fn test_task_lifecycle() {
        let store = RelationalStore::new(None).unwrap();
        let task = TaskRecord {
            task_id: "t1".to_string(),
            kind: "ingest".to_string(),
            lane: "u1".to_string(),
            status: "pending".to_string(),
            payload: serde_json::json!({"endUserId": "u1"}),
            result: None,
            error: None,
            elapsed_seconds: None,
        };
        store.insert_task(&task).unwrap();
        assert_eq!(store.pending_tasks().unwrap().len(), 1);

        store
            .update_task("t1", "success", Some(&serde_json::json!({"ok": true})), None, Some(0.5))
            .unwrap();
        let loaded = store.get_task("t1").unwrap().unwrap();
        assert_eq!(loaded.status, "success");
        assert_eq!(loaded.result.unwrap()["ok"], true);
        assert!(store.pending_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_workflow_execution_continuity() {
        let store = RelationalStore::new(None).unwrap();
        let record = WorkflowExecutionRecord {
            execution_id: "e1".to_string(),
            conversation_id: Some("c1".to_string()),
            app_id: Some("app".to_string()),
            status: "completed".to_string(),
            conv_variables: serde_json::json!({"counter": 2}),
            messages: serde_json::json!([{"role": "user", "content": "hi"}]),
            output: Some("hello".to_string()),
            error: None,
            elapsed_seconds: Some(1.2),
        };
        store.save_workflow_execution(&record).unwrap();

        let latest = store.latest_completed_execution("c1").unwrap().unwrap();
        assert_eq!(latest.execution_id, "e1");
        assert_eq!(latest.conv_variables["counter"], 2);

        assert!(store.latest_completed_execution("other").unwrap().is_none());
    }
}
