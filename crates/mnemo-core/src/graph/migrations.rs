//! Database Migrations
//!
//! Schema migration definitions for the graph and relational layers.

use rusqlite::Connection;

use crate::error::Result;

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Graph layer: node tables, edges, embeddings, FTS5 indexes",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Relational layer: configs, end users, short-term memory",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Execution layer: task and workflow execution records",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// Apply all pending migrations to the given connection
pub fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version > current {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            conn.execute_batch(migration.up)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                [migration.version],
            )?;
        }
    }

    Ok(())
}

/// V1: graph layer
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS dialogues (
    id TEXT PRIMARY KEY,
    end_user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_dialogues_user ON dialogues(end_user_id);
CREATE INDEX IF NOT EXISTS idx_dialogues_created ON dialogues(created_at);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    end_user_id TEXT NOT NULL,
    dialogue_id TEXT NOT NULL REFERENCES dialogues(id),
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_chunks_user ON chunks(end_user_id);
CREATE INDEX IF NOT EXISTS idx_chunks_dialogue ON chunks(dialogue_id);

CREATE TABLE IF NOT EXISTS statements (
    id TEXT PRIMARY KEY,
    end_user_id TEXT NOT NULL,
    chunk_id TEXT NOT NULL REFERENCES chunks(id),
    statement TEXT NOT NULL,
    stmt_type TEXT NOT NULL DEFAULT 'FACT',
    temporal_info TEXT NOT NULL DEFAULT 'ATEMPORAL',
    valid_at TEXT,
    invalid_at TEXT,
    emotion_type TEXT,
    emotion_intensity REAL,
    emotion_subject TEXT,
    emotion_keywords TEXT NOT NULL DEFAULT '[]',
    importance_score REAL NOT NULL DEFAULT 0.5,

    -- ACT-R activation state
    activation_value REAL,
    access_history TEXT NOT NULL DEFAULT '[]',
    access_count INTEGER NOT NULL DEFAULT 0,
    last_access_time TEXT,
    version INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_statements_user ON statements(end_user_id);
CREATE INDEX IF NOT EXISTS idx_statements_chunk ON statements(chunk_id);
CREATE INDEX IF NOT EXISTS idx_statements_created ON statements(created_at);
CREATE INDEX IF NOT EXISTS idx_statements_activation ON statements(activation_value);

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    end_user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    name_lower TEXT NOT NULL,
    entity_type TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    aliases TEXT NOT NULL DEFAULT '[]',
    connect_strength REAL NOT NULL DEFAULT 1.0,
    is_explicit_memory INTEGER NOT NULL DEFAULT 0,
    importance_score REAL NOT NULL DEFAULT 0.5,

    activation_value REAL,
    access_history TEXT NOT NULL DEFAULT '[]',
    access_count INTEGER NOT NULL DEFAULT 0,
    last_access_time TEXT,
    version INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,

    -- case-fold uniqueness within a user scope
    UNIQUE(end_user_id, name_lower)
);

CREATE INDEX IF NOT EXISTS idx_entities_user ON entities(end_user_id);
CREATE INDEX IF NOT EXISTS idx_entities_activation ON entities(activation_value);

CREATE TABLE IF NOT EXISTS summaries (
    id TEXT PRIMARY KEY,
    end_user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    importance_score REAL NOT NULL DEFAULT 0.5,

    activation_value REAL,
    access_history TEXT NOT NULL DEFAULT '[]',
    access_count INTEGER NOT NULL DEFAULT 0,
    last_access_time TEXT,
    version INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_summaries_user ON summaries(end_user_id);
CREATE INDEX IF NOT EXISTS idx_summaries_activation ON summaries(activation_value);

CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY,
    end_user_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    weight REAL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);
CREATE INDEX IF NOT EXISTS idx_edges_kind ON edges(kind);

-- Embeddings storage (binary blob for efficiency); one model per category index
CREATE TABLE IF NOT EXISTS embeddings (
    node_id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    vector BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_category ON embeddings(category);

-- FTS5 virtual tables, one per searchable category, kept in sync by triggers
CREATE VIRTUAL TABLE IF NOT EXISTS statements_fts USING fts5(
    id, end_user_id, statement,
    content='statements', content_rowid='rowid', tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS statements_ai AFTER INSERT ON statements BEGIN
    INSERT INTO statements_fts(rowid, id, end_user_id, statement)
    VALUES (NEW.rowid, NEW.id, NEW.end_user_id, NEW.statement);
END;

CREATE TRIGGER IF NOT EXISTS statements_ad AFTER DELETE ON statements BEGIN
    INSERT INTO statements_fts(statements_fts, rowid, id, end_user_id, statement)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.end_user_id, OLD.statement);
END;

CREATE TRIGGER IF NOT EXISTS statements_au AFTER UPDATE OF statement ON statements BEGIN
    INSERT INTO statements_fts(statements_fts, rowid, id, end_user_id, statement)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.end_user_id, OLD.statement);
    INSERT INTO statements_fts(rowid, id, end_user_id, statement)
    VALUES (NEW.rowid, NEW.id, NEW.end_user_id, NEW.statement);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    id, end_user_id, content,
    content='chunks', content_rowid='rowid', tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, id, end_user_id, content)
    VALUES (NEW.rowid, NEW.id, NEW.end_user_id, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, id, end_user_id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.end_user_id, OLD.content);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS entities_fts USING fts5(
    id, end_user_id, name, aliases,
    content='entities', content_rowid='rowid', tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS entities_ai AFTER INSERT ON entities BEGIN
    INSERT INTO entities_fts(rowid, id, end_user_id, name, aliases)
    VALUES (NEW.rowid, NEW.id, NEW.end_user_id, NEW.name, NEW.aliases);
END;

CREATE TRIGGER IF NOT EXISTS entities_ad AFTER DELETE ON entities BEGIN
    INSERT INTO entities_fts(entities_fts, rowid, id, end_user_id, name, aliases)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.end_user_id, OLD.name, OLD.aliases);
END;

CREATE TRIGGER IF NOT EXISTS entities_au AFTER UPDATE OF name, aliases ON entities BEGIN
    INSERT INTO entities_fts(entities_fts, rowid, id, end_user_id, name, aliases)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.end_user_id, OLD.name, OLD.aliases);
    INSERT INTO entities_fts(rowid, id, end_user_id, name, aliases)
    VALUES (NEW.rowid, NEW.id, NEW.end_user_id, NEW.name, NEW.aliases);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS summaries_fts USING fts5(
    id, end_user_id, content,
    content='summaries', content_rowid='rowid', tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS summaries_ai AFTER INSERT ON summaries BEGIN
    INSERT INTO summaries_fts(rowid, id, end_user_id, content)
    VALUES (NEW.rowid, NEW.id, NEW.end_user_id, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS summaries_ad AFTER DELETE ON summaries BEGIN
    INSERT INTO summaries_fts(summaries_fts, rowid, id, end_user_id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.end_user_id, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS summaries_au AFTER UPDATE OF content ON summaries BEGIN
    INSERT INTO summaries_fts(summaries_fts, rowid, id, end_user_id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.end_user_id, OLD.content);
    INSERT INTO summaries_fts(rowid, id, end_user_id, content)
    VALUES (NEW.rowid, NEW.id, NEW.end_user_id, NEW.content);
END;
"#;

/// V2: relational layer
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memory_configs (
    id TEXT PRIMARY KEY,
    config_name TEXT NOT NULL DEFAULT '',
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS end_users (
    id TEXT PRIMARY KEY,
    workspace_id TEXT,
    memory_config_id TEXT,
    memory_insight TEXT,
    memory_insight_updated_at TEXT,
    summary_intro TEXT,
    summary_personality TEXT,
    summary_core_values TEXT,
    summary_one_sentence TEXT,
    summary_updated_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS short_term_memories (
    end_user_id TEXT PRIMARY KEY,
    message TEXT NOT NULL,
    answer TEXT NOT NULL,
    retrieved_content TEXT NOT NULL DEFAULT '',
    search_switch TEXT NOT NULL DEFAULT '0',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memory_increments (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    total_num INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// V3: execution layer
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS task_executions (
    task_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    lane TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    payload TEXT NOT NULL DEFAULT '{}',
    result TEXT,
    error TEXT,
    elapsed_seconds REAL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON task_executions(status);
CREATE INDEX IF NOT EXISTS idx_tasks_lane ON task_executions(lane);

CREATE TABLE IF NOT EXISTS workflow_executions (
    execution_id TEXT PRIMARY KEY,
    conversation_id TEXT,
    app_id TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    conv_variables TEXT NOT NULL DEFAULT '{}',
    messages TEXT NOT NULL DEFAULT '[]',
    output TEXT,
    error TEXT,
    elapsed_seconds REAL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workflow_conversation ON workflow_executions(conversation_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_in_memory() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);

        // Re-applying is a no-op
        apply_migrations(&conn).unwrap();
    }

    #[test]
    fn test_entity_case_fold_unique_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO entities (id, end_user_id, name, name_lower, created_at)
             VALUES ('e1', 'u1', 'Rust', 'rust', datetime('now'))",
            [],
        )
        .unwrap();

        // Same name under a different case fold must be rejected in scope
        let dup = conn.execute(
            "INSERT INTO entities (id, end_user_id, name, name_lower, created_at)
             VALUES ('e2', 'u1', 'RUST', 'rust', datetime('now'))",
            [],
        );
        assert!(dup.is_err());

        // Same name for another user is fine
        conn.execute(
            "INSERT INTO entities (id, end_user_id, name, name_lower, created_at)
             VALUES ('e3', 'u2', 'rust', 'rust', datetime('now'))",
            [],
        )
        .unwrap();
    }
}
