//! Worker registry persistence.
//!
//! Registration is idempotent on `machine_id`: a machine that comes back
//! after a restart reclaims its existing worker row (and id) instead of
//! accumulating duplicates. The health checker's offline sweep and the
//! orphan requeue run in one transaction so a crashing worker's subtasks
//! are never observable as both assigned and requeued.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    from_unix, from_unix_opt, Heartbeat, SystemInfo, Worker, WorkerRegistration, WorkerStatus,
};

const WORKER_COLUMNS: &str = "id, machine_id, machine_name, status, system_info, tools, \
     cpu_percent, memory_percent, disk_percent, on_prem, last_heartbeat, version, \
     created_at, updated_at";

/// CRUD and heartbeat operations on workers.
#[derive(Clone)]
pub struct WorkerStore {
    db: Database,
}

impl WorkerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a worker, reusing the existing row when the machine is
    /// already known. Either way the worker comes back `online` with a
    /// fresh heartbeat.
    #[instrument(skip(self, reg), fields(machine_id = %reg.machine_id))]
    pub async fn register(&self, reg: WorkerRegistration) -> StoreResult<Worker> {
        let now = Utc::now().timestamp();
        let system_info = serde_json::to_string(&reg.system_info)?;
        let tools = serde_json::to_string(&reg.tools)?;
        let machine_id = reg.machine_id.clone();

        let worker = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                let existing: Option<String> = tx
                    .query_row(
                        "SELECT id FROM workers WHERE machine_id = ?1",
                        rusqlite::params![reg.machine_id],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(StoreError::Sqlite(other)),
                    })?;

                let id = match existing {
                    Some(id) => {
                        tx.execute(
                            "UPDATE workers SET machine_name = ?2, system_info = ?3, tools = ?4, \
                             on_prem = ?5, status = 'online', last_heartbeat = ?6, \
                             version = version + 1, updated_at = ?6 WHERE id = ?1",
                            rusqlite::params![
                                id,
                                reg.machine_name,
                                system_info,
                                tools,
                                reg.on_prem,
                                now
                            ],
                        )?;
                        id
                    }
                    None => {
                        let id = Uuid::now_v7().to_string();
                        tx.execute(
                            "INSERT INTO workers (id, machine_id, machine_name, status, \
                             system_info, tools, on_prem, last_heartbeat, version, created_at, \
                             updated_at) \
                             VALUES (?1, ?2, ?3, 'online', ?4, ?5, ?6, ?7, 1, ?7, ?7)",
                            rusqlite::params![
                                id,
                                reg.machine_id,
                                reg.machine_name,
                                system_info,
                                tools,
                                reg.on_prem,
                                now
                            ],
                        )?;
                        id
                    }
                };

                let worker = tx
                    .query_row(
                        &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                        rusqlite::params![id],
                        WorkerRow::from_row,
                    )?
                    .into_worker()?;

                tx.commit()?;
                Ok(worker)
            })
            .await?;

        info!(worker_id = %worker.id, machine_id = %machine_id, "worker registered");
        Ok(worker)
    }

    /// Fetch a worker by id, `None` when missing.
    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> StoreResult<Option<Worker>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                    rusqlite::params![id],
                    WorkerRow::from_row,
                );
                match result {
                    Ok(row) => row.into_worker().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Apply a heartbeat: status, resource pressures, `last_heartbeat`.
    #[instrument(skip(self, beat))]
    pub async fn heartbeat(&self, id: Uuid, beat: Heartbeat) -> StoreResult<Worker> {
        let id_str = id.to_string();
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE workers SET status = ?2, cpu_percent = ?3, memory_percent = ?4, \
                     disk_percent = ?5, last_heartbeat = ?6, version = version + 1, \
                     updated_at = ?6 WHERE id = ?1",
                    rusqlite::params![
                        id_str,
                        beat.status.as_str(),
                        beat.cpu_percent,
                        beat.memory_percent,
                        beat.disk_percent,
                        now
                    ],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "worker",
                        id: id_str,
                    });
                }

                conn.query_row(
                    &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                    rusqlite::params![id_str],
                    WorkerRow::from_row,
                )?
                .into_worker()
            })
            .await
    }

    /// Mark a worker offline (graceful unregister path).
    #[instrument(skip(self))]
    pub async fn mark_offline(&self, id: Uuid) -> StoreResult<Worker> {
        let id_str = id.to_string();
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE workers SET status = 'offline', version = version + 1, \
                     updated_at = ?2 WHERE id = ?1",
                    rusqlite::params![id_str, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "worker",
                        id: id_str,
                    });
                }

                conn.query_row(
                    &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                    rusqlite::params![id_str],
                    WorkerRow::from_row,
                )?
                .into_worker()
            })
            .await
    }

    /// Dead-worker failover: in one transaction, mark the worker offline
    /// and reset every in-progress subtask it held back to `pending`
    /// with the binding cleared. Returns the orphaned subtask ids for
    /// the caller to requeue in the cache.
    #[instrument(skip(self))]
    pub async fn mark_offline_and_requeue(&self, id: Uuid) -> StoreResult<Vec<Uuid>> {
        let id_str = id.to_string();
        let now = Utc::now().timestamp();

        let orphans = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                let updated = tx.execute(
                    "UPDATE workers SET status = 'offline', version = version + 1, \
                     updated_at = ?2 WHERE id = ?1",
                    rusqlite::params![id_str, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "worker",
                        id: id_str,
                    });
                }

                let mut stmt = tx.prepare(
                    "SELECT id FROM subtasks \
                     WHERE assigned_worker = ?1 AND status = 'in_progress'",
                )?;
                let orphans: Vec<String> = stmt
                    .query_map(rusqlite::params![id_str], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                drop(stmt);

                tx.execute(
                    "UPDATE subtasks SET status = 'pending', assigned_worker = NULL, \
                     started_at = NULL, version = version + 1, updated_at = ?2 \
                     WHERE assigned_worker = ?1 AND status = 'in_progress'",
                    rusqlite::params![id_str, now],
                )?;

                tx.commit()?;

                orphans
                    .iter()
                    .map(|s| {
                        Uuid::parse_str(s).map_err(|_| {
                            StoreError::InvalidArgument(format!("bad subtask id {s}"))
                        })
                    })
                    .collect::<StoreResult<Vec<_>>>()
            })
            .await?;

        debug!(worker_id = %id, orphans = orphans.len(), "worker failed over");
        Ok(orphans)
    }

    /// List workers, optionally filtered by status.
    #[instrument(skip(self))]
    pub async fn list(&self, status: Option<WorkerStatus>) -> StoreResult<Vec<Worker>> {
        self.db
            .execute(move |conn| {
                let rows = match status {
                    Some(status) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {WORKER_COLUMNS} FROM workers WHERE status = ?1 \
                             ORDER BY machine_name ASC"
                        ))?;
                        let result = stmt
                            .query_map(rusqlite::params![status.as_str()], WorkerRow::from_row)?
                            .collect::<Result<Vec<_>, _>>()?;
                        result
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {WORKER_COLUMNS} FROM workers ORDER BY machine_name ASC"
                        ))?;
                        let result = stmt
                            .query_map([], WorkerRow::from_row)?
                            .collect::<Result<Vec<_>, _>>()?;
                        result
                    }
                };
                rows.into_iter().map(WorkerRow::into_worker).collect()
            })
            .await
    }

    /// Allocation candidates: online/idle workers together with their
    /// current in-progress load, least loaded first, id as the final
    /// deterministic tie-break.
    #[instrument(skip(self))]
    pub async fn available_with_load(&self) -> StoreResult<Vec<(Worker, i64)>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {WORKER_COLUMNS}, \
                     (SELECT count(*) FROM subtasks s \
                      WHERE s.assigned_worker = workers.id AND s.status = 'in_progress') AS load \
                     FROM workers WHERE status IN ('online', 'idle') \
                     ORDER BY load ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map([], |row| {
                        let worker = WorkerRow::from_row(row)?;
                        let load: i64 = row.get(14)?;
                        Ok((worker, load))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|(row, load)| Ok((row.into_worker()?, load)))
                    .collect()
            })
            .await
    }

    /// Workers that should be heartbeating but have not since `cutoff`
    /// (or never have). Heartbeats are stored at second granularity, so
    /// a beat in the cutoff second already counts as stale.
    #[instrument(skip(self))]
    pub async fn stale_workers(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Worker>> {
        let cutoff = cutoff.timestamp();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {WORKER_COLUMNS} FROM workers \
                     WHERE status IN ('online', 'busy', 'idle') \
                     AND (last_heartbeat IS NULL OR last_heartbeat <= ?1)"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![cutoff], WorkerRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(WorkerRow::into_worker).collect()
            })
            .await
    }

    /// Worker counts per status, for gauge refresh.
    pub async fn count_by_status(&self) -> StoreResult<Vec<(WorkerStatus, i64)>> {
        self.db
            .execute(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, count(*) FROM workers GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|(status, count)| Ok((WorkerStatus::parse(&status)?, count)))
                    .collect()
            })
            .await
    }
}

// ── row mapping ──────────────────────────────────────────────────────

struct WorkerRow {
    id: String,
    machine_id: String,
    machine_name: String,
    status: String,
    system_info: String,
    tools: String,
    cpu_percent: f64,
    memory_percent: f64,
    disk_percent: f64,
    on_prem: bool,
    last_heartbeat: Option<i64>,
    version: i64,
    created_at: i64,
    updated_at: i64,
}

impl WorkerRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            machine_id: row.get(1)?,
            machine_name: row.get(2)?,
            status: row.get(3)?,
            system_info: row.get(4)?,
            tools: row.get(5)?,
            cpu_percent: row.get(6)?,
            memory_percent: row.get(7)?,
            disk_percent: row.get(8)?,
            on_prem: row.get(9)?,
            last_heartbeat: row.get(10)?,
            version: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_worker(self) -> StoreResult<Worker> {
        let system_info: SystemInfo = serde_json::from_str(&self.system_info)?;
        Ok(Worker {
            id: Uuid::parse_str(&self.id)
                .map_err(|_| StoreError::InvalidArgument(format!("bad worker id {}", self.id)))?,
            machine_id: self.machine_id,
            machine_name: self.machine_name,
            status: WorkerStatus::parse(&self.status)?,
            system_info,
            tools: serde_json::from_str(&self.tools)?,
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            disk_percent: self.disk_percent,
            on_prem: self.on_prem,
            last_heartbeat: from_unix_opt(self.last_heartbeat),
            version: self.version,
            created_at: from_unix(self.created_at),
            updated_at: from_unix(self.updated_at),
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store() -> WorkerStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        WorkerStore::new(db)
    }

    fn registration(machine_id: &str) -> WorkerRegistration {
        WorkerRegistration {
            machine_id: machine_id.into(),
            machine_name: format!("box-{machine_id}"),
            system_info: SystemInfo {
                os: "linux".into(),
                cpu_cores: 8,
                memory_gb: 32.0,
                disk_gb: 512.0,
            },
            tools: vec!["claude_code".into(), "gemini_cli".into()],
            on_prem: false,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_on_machine_id() {
        let store = store().await;

        let first = store.register(registration("m-1")).await.unwrap();
        let mut again = registration("m-1");
        again.machine_name = "renamed-box".into();
        again.tools = vec!["codex_cli".into()];
        let second = store.register(again).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.machine_name, "renamed-box");
        assert_eq!(second.tools, vec!["codex_cli".to_string()]);
        assert!(second.version > first.version);

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_updates_pressures() {
        let store = store().await;
        let worker = store.register(registration("m-2")).await.unwrap();

        let updated = store
            .heartbeat(
                worker.id,
                Heartbeat {
                    status: WorkerStatus::Idle,
                    cpu_percent: 42.5,
                    memory_percent: 61.0,
                    disk_percent: 13.0,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, WorkerStatus::Idle);
        assert!((updated.cpu_percent - 42.5).abs() < f64::EPSILON);
        assert!(updated.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_worker_fails() {
        let store = store().await;
        let err = store
            .heartbeat(
                Uuid::now_v7(),
                Heartbeat {
                    status: WorkerStatus::Online,
                    cpu_percent: 0.0,
                    memory_percent: 0.0,
                    disk_percent: 0.0,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn stale_detection_uses_cutoff() {
        let store = store().await;
        let fresh = store.register(registration("m-3")).await.unwrap();
        let _ = store.register(registration("m-4")).await.unwrap();

        // Everyone heartbeated just now; nothing is stale one minute ago.
        let cutoff = Utc::now() - Duration::seconds(60);
        assert!(store.stale_workers(cutoff).await.unwrap().is_empty());

        // A cutoff in the future makes every live worker stale.
        let cutoff = Utc::now() + Duration::seconds(60);
        let stale = store.stale_workers(cutoff).await.unwrap();
        assert_eq!(stale.len(), 2);

        // Offline workers are never reported.
        store.mark_offline(fresh.id).await.unwrap();
        let stale = store.stale_workers(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn available_excludes_busy_and_offline() {
        let store = store().await;
        let a = store.register(registration("m-5")).await.unwrap();
        let b = store.register(registration("m-6")).await.unwrap();

        store.mark_offline(b.id).await.unwrap();

        let available = store.available_with_load().await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].0.id, a.id);
        assert_eq!(available[0].1, 0);
    }
}
