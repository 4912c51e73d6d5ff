//! Versioned schema migrations.
//!
//! Each migration is a static SQL batch keyed by version number. Applied
//! versions are recorded in a `_migrations` table, so running the set is
//! idempotent; each pending migration executes inside its own
//! transaction together with its bookkeeping row.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Append only; never edit a shipped entry.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "orchestration schema — workers, tasks, subtasks, checkpoints, evaluations, corrections",
        sql: r#"
            CREATE TABLE workers (
                id              TEXT PRIMARY KEY,
                machine_id      TEXT NOT NULL UNIQUE,
                machine_name    TEXT NOT NULL,
                status          TEXT NOT NULL CHECK(status IN ('online','offline','busy','idle')),
                system_info     TEXT NOT NULL DEFAULT '{}',
                tools           TEXT NOT NULL DEFAULT '[]',
                cpu_percent     REAL NOT NULL DEFAULT 0,
                memory_percent  REAL NOT NULL DEFAULT 0,
                disk_percent    REAL NOT NULL DEFAULT 0,
                on_prem         BOOLEAN NOT NULL DEFAULT 0,
                last_heartbeat  INTEGER,
                version         INTEGER NOT NULL DEFAULT 1,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            );
            CREATE INDEX idx_workers_status ON workers(status);

            CREATE TABLE tasks (
                id                   TEXT PRIMARY KEY,
                description          TEXT NOT NULL,
                task_type            TEXT NOT NULL,
                status               TEXT NOT NULL CHECK(status IN
                    ('pending','initializing','in_progress','checkpoint','completed','failed','cancelled')),
                progress             INTEGER NOT NULL DEFAULT 0,
                priority             INTEGER NOT NULL DEFAULT 0,
                checkpoint_frequency TEXT NOT NULL DEFAULT 'medium',
                privacy_level        TEXT NOT NULL DEFAULT 'normal',
                tool_preferences     TEXT NOT NULL DEFAULT '[]',
                metadata             TEXT NOT NULL DEFAULT '{}',
                version              INTEGER NOT NULL DEFAULT 1,
                created_at           INTEGER NOT NULL,
                updated_at           INTEGER NOT NULL,
                started_at           INTEGER,
                completed_at         INTEGER
            );
            CREATE INDEX idx_tasks_status ON tasks(status);

            CREATE TABLE subtasks (
                id               TEXT PRIMARY KEY,
                task_id          TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                name             TEXT NOT NULL,
                description      TEXT NOT NULL,
                subtask_type     TEXT NOT NULL,
                status           TEXT NOT NULL CHECK(status IN
                    ('pending','queued','in_progress','completed','failed','cancelled','correcting')),
                progress         INTEGER NOT NULL DEFAULT 0,
                dependencies     TEXT NOT NULL DEFAULT '[]',
                recommended_tool TEXT,
                assigned_worker  TEXT REFERENCES workers(id),
                assigned_tool    TEXT,
                complexity       INTEGER NOT NULL DEFAULT 3,
                priority         INTEGER NOT NULL DEFAULT 0,
                output           TEXT,
                error            TEXT,
                version          INTEGER NOT NULL DEFAULT 1,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL,
                started_at       INTEGER,
                completed_at     INTEGER
            );
            CREATE INDEX idx_subtasks_task ON subtasks(task_id);
            CREATE INDEX idx_subtasks_status ON subtasks(status);
            CREATE INDEX idx_subtasks_worker ON subtasks(assigned_worker);

            CREATE TABLE checkpoints (
                id                 TEXT PRIMARY KEY,
                task_id            TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                trigger_reason     TEXT NOT NULL,
                status             TEXT NOT NULL CHECK(status IN
                    ('pending_review','approved','rejected','corrected')),
                subtasks_completed TEXT NOT NULL DEFAULT '[]',
                user_decision      TEXT,
                user_feedback      TEXT,
                version            INTEGER NOT NULL DEFAULT 1,
                created_at         INTEGER NOT NULL,
                updated_at         INTEGER NOT NULL,
                resolved_at        INTEGER
            );
            CREATE INDEX idx_checkpoints_task ON checkpoints(task_id);

            CREATE TABLE evaluations (
                id            TEXT PRIMARY KEY,
                subtask_id    TEXT NOT NULL REFERENCES subtasks(id) ON DELETE CASCADE,
                code_quality  REAL,
                completeness  REAL,
                security      REAL,
                architecture  REAL,
                testability   REAL,
                overall_score REAL NOT NULL,
                details       TEXT NOT NULL DEFAULT '{}',
                evaluated_at  INTEGER NOT NULL
            );
            CREATE INDEX idx_evaluations_subtask ON evaluations(subtask_id);

            CREATE TABLE corrections (
                id              TEXT PRIMARY KEY,
                checkpoint_id   TEXT NOT NULL REFERENCES checkpoints(id) ON DELETE CASCADE,
                subtask_id      TEXT NOT NULL REFERENCES subtasks(id) ON DELETE CASCADE,
                correction_type TEXT NOT NULL,
                description     TEXT NOT NULL,
                result          TEXT NOT NULL DEFAULT 'pending' CHECK(result IN ('pending','applied','failed')),
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            );
            CREATE INDEX idx_corrections_checkpoint ON corrections(checkpoint_id);
            CREATE INDEX idx_corrections_subtask ON corrections(subtask_id);
        "#,
    },
    Migration {
        version: 2,
        description: "workflow template registry — templates and ordered steps",
        sql: r#"
            CREATE TABLE workflow_templates (
                id                           TEXT PRIMARY KEY,
                name                         TEXT NOT NULL UNIQUE,
                description                  TEXT,
                category                     TEXT,
                default_checkpoint_frequency TEXT NOT NULL DEFAULT 'medium',
                default_privacy_level        TEXT NOT NULL DEFAULT 'normal',
                preferred_tools              TEXT NOT NULL DEFAULT '[]',
                usage_count                  INTEGER NOT NULL DEFAULT 0,
                created_at                   INTEGER NOT NULL,
                updated_at                   INTEGER NOT NULL
            );

            CREATE TABLE template_steps (
                id               TEXT PRIMARY KEY,
                template_id      TEXT NOT NULL REFERENCES workflow_templates(id) ON DELETE CASCADE,
                step_index       INTEGER NOT NULL,
                name             TEXT NOT NULL,
                description      TEXT NOT NULL,
                subtask_type     TEXT NOT NULL,
                recommended_tool TEXT,
                complexity       INTEGER NOT NULL DEFAULT 3,
                priority         INTEGER NOT NULL DEFAULT 0,
                parallel         BOOLEAN NOT NULL DEFAULT 0,
                depends_on       TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX idx_template_steps_template ON template_steps(template_id);
        "#,
    },
    Migration {
        version: 3,
        description: "audit trail and edge-owned tables — activity_logs, users, worker_api_keys",
        sql: r#"
            CREATE TABLE activity_logs (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                entity     TEXT NOT NULL,
                entity_id  TEXT NOT NULL,
                action     TEXT NOT NULL,
                detail     TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX idx_activity_logs_entity ON activity_logs(entity, entity_id);

            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                username      TEXT NOT NULL UNIQUE,
                display_name  TEXT,
                password_hash TEXT NOT NULL,
                role          TEXT NOT NULL DEFAULT 'user',
                active        BOOLEAN NOT NULL DEFAULT 1,
                created_at    INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL
            );

            CREATE TABLE worker_api_keys (
                id           TEXT PRIMARY KEY,
                worker_id    TEXT NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
                key_hash     TEXT NOT NULL,
                label        TEXT,
                revoked      BOOLEAN NOT NULL DEFAULT 0,
                created_at   INTEGER NOT NULL,
                last_used_at INTEGER
            );
            CREATE INDEX idx_worker_api_keys_worker ON worker_api_keys(worker_id);
        "#,
    },
];

/// Apply every migration newer than the recorded schema version.
pub fn run_all(conn: &mut Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        debug!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                chrono::Utc::now().timestamp()
            ],
        )?;
        tx.commit()?;

        info!(version = migration.version, "migration applied");
    }

    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────
