//! Durable observation store: schema bootstrap, batched upsert with
//! history-on-change, and the scheduler's chunk table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tokio::task;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::types::{Analysis, ChunkStatus, Observation, ScanChunk};

const INIT_SCRIPT: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
    ip TEXT PRIMARY KEY,
    country TEXT,
    city TEXT,
    lat REAL,
    lon REAL,
    first_seen DATETIME,
    last_seen DATETIME
);

CREATE TABLE IF NOT EXISTS services (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip TEXT,
    port INTEGER,
    protocol TEXT,
    state TEXT,
    service_type TEXT,
    vendor TEXT,
    product TEXT,
    version TEXT,
    banner TEXT,
    confidence INTEGER,
    tags TEXT,
    first_seen DATETIME,
    last_seen DATETIME,
    FOREIGN KEY(ip) REFERENCES hosts(ip),
    UNIQUE(ip, port, protocol)
);

CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_id INTEGER,
    timestamp DATETIME,
    banner TEXT,
    state TEXT,
    FOREIGN KEY(service_id) REFERENCES services(id)
);

CREATE TABLE IF NOT EXISTS scan_state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cidr TEXT,
    chunk_start TEXT,
    chunk_end TEXT,
    status TEXT,
    priority INTEGER DEFAULT 1,
    retry_count INTEGER DEFAULT 0,
    last_error TEXT,
    created_at DATETIME,
    updated_at DATETIME
);
"#;

/// Predicate the export/dashboard collaborator reuses verbatim: services
/// currently open, restricted to the protocols worth surfacing and excluding
/// HTTP services that just answered with a 403/404 page.
pub const EXPORT_QUERY: &str = "SELECT ip, port, protocol, service_type, vendor, product, version, banner, confidence \
     FROM services \
     WHERE state = 'open' \
       AND (service_type IN ('ssh', 'vnc', 'rtsp', 'ftp') \
            OR (service_type LIKE '%http%' \
                AND (banner IS NULL OR (banner NOT LIKE '%403 Forbidden%' AND banner NOT LIKE '%404 Not Found%'))))";

const BUSY_BACKOFF_MS: [u64; 5] = [20, 40, 80, 160, 320];

fn epoch_to_iso(ts: f64) -> String {
    chrono::DateTime::from_timestamp(ts as i64, 0)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

/// Durable store handle. Cloning shares the same writer connection.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    writer: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`, enable WAL, and bootstrap the
    /// schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let conn = task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let conn = Connection::open(&open_path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.execute_batch(INIT_SCRIPT)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))??;

        info!(path = %path.display(), "store schema bootstrapped (WAL mode)");
        Ok(Self { path, writer: Arc::new(Mutex::new(conn)) })
    }

    async fn with_writer<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let writer = self.writer.clone();
        task::spawn_blocking(move || {
            let mut conn = writer.blocking_lock();
            f(&mut conn).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))?
    }

    /// Run a read-only query against a short-lived second connection,
    /// retrying on `SQLITE_BUSY` with the backoff in §4.3.1.
    async fn with_reader<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            for (attempt, backoff) in BUSY_BACKOFF_MS.iter().enumerate() {
                match f(&conn) {
                    Ok(v) => return Ok(v),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::DatabaseBusy =>
                    {
                        warn!(attempt, "store busy, backing off");
                        std::thread::sleep(Duration::from_millis(*backoff));
                    }
                    Err(e) => return Err(StoreError::from(e)),
                }
            }
            f(&conn).map_err(|e| match e {
                rusqlite::Error::SqliteFailure(code, _) if code.code == rusqlite::ErrorCode::DatabaseBusy => {
                    StoreError::Busy
                }
                other => StoreError::from(other),
            })
        })
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))?
    }

    // --- Batched observation persistence ---

    /// Upsert hosts, upsert/insert services, and append history rows for any
    /// service whose state or banner changed, all in one transaction.
    pub async fn save_observation_batch(&self, batch: Vec<(Observation, Analysis)>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        self.with_writer(move |conn| {
            let tx = conn.transaction()?;

            for (obs, _) in &batch {
                let ts = epoch_to_iso(obs.timestamp);
                tx.execute(
                    "INSERT INTO hosts (ip, first_seen, last_seen) VALUES (?1, ?2, ?2) \
                     ON CONFLICT(ip) DO UPDATE SET last_seen = excluded.last_seen",
                    params![obs.ip, ts],
                )?;
            }

            let mut existing: HashMap<(String, u16, String), (i64, Option<String>, String)> = HashMap::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT ip, port, protocol, id, banner, state FROM services WHERE ip = ?1 AND port = ?2 AND protocol = ?3",
                )?;
                for (obs, _) in &batch {
                    let row = stmt
                        .query_row(params![obs.ip, obs.port, obs.protocol], |row| {
                            Ok((
                                row.get::<_, i64>(3)?,
                                row.get::<_, Option<String>>(4)?,
                                row.get::<_, String>(5)?,
                            ))
                        })
                        .optional()?;
                    if let Some((id, banner, state)) = row {
                        existing.insert((obs.ip.clone(), obs.port, obs.protocol.clone()), (id, banner, state));
                    }
                }
            }

            for (obs, analysis) in &batch {
                let ts = epoch_to_iso(obs.timestamp);
                let key = (obs.ip.clone(), obs.port, obs.protocol.clone());
                let new_banner = obs.banner.clone().unwrap_or_default();
                let new_state = obs.status.as_str().to_string();
                let tags = serde_json::to_string(&analysis.tags).unwrap_or_default();

                if let Some((svc_id, old_banner, old_state)) = existing.get(&key) {
                    tx.execute(
                        "UPDATE services SET \
                            last_seen = ?1, \
                            banner = ?2, \
                            service_type = ?3, \
                            vendor = ?4, \
                            product = ?5, \
                            version = COALESCE(?6, version), \
                            confidence = COALESCE(?7, confidence), \
                            tags = COALESCE(?8, tags), \
                            state = ?9 \
                         WHERE id = ?10",
                        params![
                            ts,
                            new_banner,
                            analysis.service_type,
                            analysis.vendor,
                            analysis.product,
                            analysis.version,
                            (analysis.confidence > 0).then_some(analysis.confidence),
                            (!analysis.tags.is_empty()).then_some(tags.clone()),
                            new_state,
                            svc_id,
                        ],
                    )?;

                    let banner_changed = !new_banner.is_empty() && old_banner.as_deref() != Some(new_banner.as_str());
                    if banner_changed || new_state != *old_state {
                        tx.execute(
                            "INSERT INTO history (service_id, timestamp, banner, state) VALUES (?1, ?2, ?3, ?4)",
                            params![svc_id, ts, new_banner, new_state],
                        )?;
                    }
                } else {
                    tx.execute(
                        "INSERT INTO services (ip, port, protocol, state, banner, service_type, vendor, product, version, confidence, tags, first_seen, last_seen) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                        params![
                            obs.ip,
                            obs.port,
                            obs.protocol,
                            new_state,
                            new_banner,
                            analysis.service_type,
                            analysis.vendor,
                            analysis.product,
                            analysis.version,
                            analysis.confidence,
                            tags,
                            ts,
                        ],
                    )?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    // --- Scheduler state CRUD ---

    pub async fn create_scan_chunk(&self, cidr: String, start: String, end: String, priority: i64) -> Result<i64, StoreError> {
        self.with_writer(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO scan_state (cidr, chunk_start, chunk_end, status, priority, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, 'QUEUED', ?4, ?5, ?5)",
                params![cidr, start, end, priority, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// `(id, chunk_start, chunk_end, retry_count)` for the highest-priority,
    /// oldest QUEUED/RETRYING chunk, if any.
    pub async fn get_next_chunk(&self) -> Result<Option<(i64, String, String, i64)>, StoreError> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT id, chunk_start, chunk_end, retry_count FROM scan_state \
                 WHERE status IN ('QUEUED', 'RETRYING') \
                 ORDER BY priority DESC, created_at ASC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
        })
        .await
    }

    pub async fn update_chunk_status(&self, chunk_id: i64, status: ChunkStatus, error: Option<String>) -> Result<(), StoreError> {
        self.with_writer(move |conn| {
            let now = Utc::now().to_rfc3339();
            match &error {
                Some(err) => conn.execute(
                    "UPDATE scan_state SET status = ?1, last_error = ?2, updated_at = ?3, retry_count = retry_count + 1 WHERE id = ?4",
                    params![status.as_str(), err, now, chunk_id],
                )?,
                None => conn.execute(
                    "UPDATE scan_state SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), now, chunk_id],
                )?,
            };
            Ok(())
        })
        .await
    }

    pub async fn get_chunk(&self, chunk_id: i64) -> Result<Option<ScanChunk>, StoreError> {
        self.with_reader(move |conn| {
            conn.query_row(
                "SELECT id, cidr, chunk_start, chunk_end, status, priority, retry_count, last_error, created_at, updated_at \
                 FROM scan_state WHERE id = ?1",
                params![chunk_id],
                |row| {
                    let status: String = row.get(4)?;
                    Ok(ScanChunk {
                        id: row.get(0)?,
                        cidr: row.get(1)?,
                        chunk_start: row.get(2)?,
                        chunk_end: row.get(3)?,
                        status: ChunkStatus::from_str(&status).unwrap_or(ChunkStatus::Failed),
                        priority: row.get(5)?,
                        retry_count: row.get(6)?,
                        last_error: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    // --- Maintenance ---

    pub async fn promote_ignored_chunks(&self, age_hours: i64) -> Result<usize, StoreError> {
        self.with_writer(move |conn| {
            let now = Utc::now();
            let cutoff = (now - chrono::Duration::hours(age_hours)).to_rfc3339();
            let changed = conn.execute(
                "UPDATE scan_state SET priority = priority + 1, updated_at = ?1 \
                 WHERE status = 'QUEUED' AND created_at < ?2 AND priority < 10",
                params![now.to_rfc3339(), cutoff],
            )?;
            Ok(changed)
        })
        .await
    }

    pub async fn get_stale_chunks(&self, limit: i64, high_priority: bool, min_age_hours: i64) -> Result<Vec<i64>, StoreError> {
        self.with_reader(move |conn| {
            let cutoff = (Utc::now() - chrono::Duration::hours(min_age_hours)).to_rfc3339();
            let priority_filter = if high_priority { "priority >= 5" } else { "priority < 5" };
            let sql = format!(
                "SELECT id FROM scan_state WHERE status = 'COMPLETED' AND updated_at < ?1 AND {priority_filter} \
                 ORDER BY updated_at ASC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![cutoff, limit], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    pub async fn reset_stale_chunk(&self, chunk_id: i64) -> Result<(), StoreError> {
        self.with_writer(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE scan_state SET status = 'QUEUED', updated_at = ?1, retry_count = 0 WHERE id = ?2",
                params![now, chunk_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Startup recovery: any chunk left SCANNING by a prior engine that died
    /// mid-run is swept back to QUEUED instead of aging into the stale-rescan
    /// window. Called once by `Engine::bootstrap`.
    pub async fn reset_orphaned_scanning_chunks(&self) -> Result<usize, StoreError> {
        self.with_writer(move |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE scan_state SET status = 'QUEUED', updated_at = ?1 WHERE status = 'SCANNING'",
                params![now],
            )?;
            Ok(changed)
        })
        .await
    }

    pub async fn prune_old_data(&self, history_days: i64, service_days: i64) -> Result<(usize, usize), StoreError> {
        self.with_writer(move |conn| {
            let history_cutoff = (Utc::now() - chrono::Duration::days(history_days)).to_rfc3339();
            let service_cutoff = (Utc::now() - chrono::Duration::days(service_days)).to_rfc3339();
            let pruned_history = conn.execute("DELETE FROM history WHERE timestamp < ?1", params![history_cutoff])?;
            let pruned_services = conn.execute("DELETE FROM services WHERE last_seen < ?1", params![service_cutoff])?;
            Ok((pruned_history, pruned_services))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObservationStatus;

    async fn open_temp() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn new_observation_creates_service_without_history() {
        let (store, _dir) = open_temp().await;
        let obs = Observation::new("10.0.0.1".into(), 80, "http", ObservationStatus::Open, 5).with_banner("nginx");
        let analysis = Analysis { confidence: 90, ..Default::default() };
        store.save_observation_batch(vec![(obs, analysis)]).await.unwrap();

        let count: i64 = store
            .with_reader(|conn| conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn state_change_writes_history() {
        let (store, _dir) = open_temp().await;
        let obs1 = Observation::new("10.0.0.2".into(), 22, "ssh", ObservationStatus::Open, 5).with_banner("SSH-2.0-OpenSSH");
        store.save_observation_batch(vec![(obs1, Analysis::default())]).await.unwrap();

        let obs2 = Observation::new("10.0.0.2".into(), 22, "ssh", ObservationStatus::Closed, 5);
        store.save_observation_batch(vec![(obs2, Analysis::default())]).await.unwrap();

        let count: i64 = store
            .with_reader(|conn| conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn orphaned_scanning_chunks_reset_to_queued() {
        let (store, _dir) = open_temp().await;
        let id = store.create_scan_chunk("10.0.0.0/24".into(), "10.0.0.0".into(), "10.0.0.255".into(), 1).await.unwrap();
        store.update_chunk_status(id, ChunkStatus::Scanning, None).await.unwrap();

        let changed = store.reset_orphaned_scanning_chunks().await.unwrap();
        assert_eq!(changed, 1);

        let chunk = store.get_chunk(id).await.unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Queued);
    }

    #[tokio::test]
    async fn scheduler_queue_orders_by_priority_then_age() {
        let (store, _dir) = open_temp().await;
        store.create_scan_chunk("10.0.1.0/24".into(), "10.0.1.0".into(), "10.0.1.255".into(), 1).await.unwrap();
        let high_id = store.create_scan_chunk("10.0.2.0/24".into(), "10.0.2.0".into(), "10.0.2.255".into(), 5).await.unwrap();

        let (next_id, ..) = store.get_next_chunk().await.unwrap().unwrap();
        assert_eq!(next_id, high_id);
    }
}
