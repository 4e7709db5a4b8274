//! Persistence layer over a single SQLite file (WAL journaling).
//!
//! Every public operation is one short transaction. Ready-transitions commit
//! the payload row, the artifact transition, and the task transition
//! together, so readers never observe a `ready` artifact without its payload.

pub mod schema;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use crate::constants::{codes, ERROR_MESSAGE_MAX};
use crate::paths::{LibraryPaths, PathError};
use schema::{MIGRATIONS, SCHEMA, SCHEMA_VERSION};

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to back up database before migration: {0}")]
    Backup(#[source] std::io::Error),
    #[error("database schema version {found} is newer than supported {supported}")]
    SchemaMismatch { found: i64, supported: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Text,
    Thumb,
    TextVec,
    ImgVec,
    Bm25,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Text,
        ArtifactKind::Thumb,
        ArtifactKind::TextVec,
        ArtifactKind::ImgVec,
        ArtifactKind::Bm25,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Text => "text",
            ArtifactKind::Thumb => "thumb",
            ArtifactKind::TextVec => "text_vec",
            ArtifactKind::ImgVec => "img_vec",
            ArtifactKind::Bm25 => "bm25",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ArtifactKind::Text),
            "thumb" => Some(ArtifactKind::Thumb),
            "text_vec" => Some(ArtifactKind::TextVec),
            "img_vec" => Some(ArtifactKind::ImgVec),
            "bm25" => Some(ArtifactKind::Bm25),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Missing,
    Queued,
    Running,
    Ready,
    Skipped,
    Error,
    Cancelled,
}

impl ArtifactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactStatus::Missing => "missing",
            ArtifactStatus::Queued => "queued",
            ArtifactStatus::Running => "running",
            ArtifactStatus::Ready => "ready",
            ArtifactStatus::Skipped => "skipped",
            ArtifactStatus::Error => "error",
            ArtifactStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing" => Some(ArtifactStatus::Missing),
            "queued" => Some(ArtifactStatus::Queued),
            "running" => Some(ArtifactStatus::Running),
            "ready" => Some(ArtifactStatus::Ready),
            "skipped" => Some(ArtifactStatus::Skipped),
            "error" => Some(ArtifactStatus::Error),
            "cancelled" => Some(ArtifactStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Planning,
    Running,
    Paused,
    CancelRequested,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Planning => "planning",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::CancelRequested => "cancel_requested",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(JobStatus::Created),
            "planning" => Some(JobStatus::Planning),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            "cancel_requested" => Some(JobStatus::CancelRequested),
            "cancelled" => Some(JobStatus::Cancelled),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Completed | JobStatus::Failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct FileRow {
    pub file_id: i64,
    pub size_bytes: i64,
    pub mtime_epoch: i64,
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_id: String,
    pub library_root: String,
    pub status: JobStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub options_json: String,
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub task_id: i64,
    pub kind: String,
    pub status: String,
    pub page_id: Option<i64>,
    pub file_id: Option<i64>,
    pub heartbeat_at: Option<i64>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ArtifactRow {
    pub status: ArtifactStatus,
    pub error_code: Option<String>,
    pub attempts: i64,
}

#[derive(Debug, Clone)]
pub struct TextTask {
    pub task_id: i64,
    pub page_id: i64,
    pub page_no: u32,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct PdfTask {
    pub task_id: i64,
    pub file_id: i64,
    pub path: String,
    pub aspect: String,
}

#[derive(Debug, Clone)]
pub struct ThumbTask {
    pub task_id: i64,
    pub page_id: i64,
    pub page_no: u32,
    pub aspect: String,
}

#[derive(Debug, Clone)]
pub struct TextVecTask {
    pub task_id: i64,
    pub page_id: i64,
    pub norm_text: Option<String>,
    pub text_sig: Option<String>,
    pub text_status: Option<ArtifactStatus>,
}

#[derive(Debug, Clone)]
pub struct ImgVecTask {
    pub task_id: i64,
    pub page_id: i64,
    pub thumb_path: Option<String>,
    pub thumb_status: Option<ArtifactStatus>,
}

#[derive(Debug, Clone)]
pub struct RunningTaskRow {
    pub task_id: i64,
    pub job_id: String,
    pub kind: String,
    pub page_id: Option<i64>,
    pub heartbeat_at: Option<i64>,
    pub started_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KindCounters {
    pub queued: u64,
    pub running: u64,
    pub ready: u64,
    pub error: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobCounters {
    pub text: KindCounters,
    pub thumb: KindCounters,
    pub text_vec: KindCounters,
    pub img_vec: KindCounters,
    pub bm25: KindCounters,
}

impl JobCounters {
    fn kind_mut(&mut self, kind: ArtifactKind) -> &mut KindCounters {
        match kind {
            ArtifactKind::Text => &mut self.text,
            ArtifactKind::Thumb => &mut self.thumb,
            ArtifactKind::TextVec => &mut self.text_vec,
            ArtifactKind::ImgVec => &mut self.img_vec,
            ArtifactKind::Bm25 => &mut self.bm25,
        }
    }

    pub fn ready_total(&self) -> u64 {
        self.text.ready + self.thumb.ready + self.text_vec.ready + self.img_vec.ready
            + self.bm25.ready
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NowRunning {
    pub task_id: i64,
    pub kind: String,
    pub page_no: Option<i64>,
    pub path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub dim: i64,
    pub blob_len: i64,
}

/// Handle to the library's index database. Cheap to share behind an `Arc`;
/// the connection is guarded internally so every call is a short critical
/// section.
pub struct Store {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Store {
    pub fn open(paths: &LibraryPaths) -> Result<Self, StoreError> {
        Self::open_at(&paths.db_path()?)
    }

    pub fn open_at(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        store.apply_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply_schema(&self) -> Result<(), StoreError> {
        let found = {
            let conn = self.conn();
            let has_meta: Option<String> = conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name='meta'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            match has_meta {
                None => None,
                Some(_) => conn
                    .query_row(
                        "SELECT value FROM meta WHERE key='schema_version'",
                        [],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?
                    .and_then(|v| v.parse::<i64>().ok()),
            }
        };

        match found {
            None => {
                let conn = self.conn();
                conn.execute_batch(SCHEMA)?;
                conn.execute(
                    "INSERT OR REPLACE INTO meta(key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) if v < SCHEMA_VERSION => {
                // Keep the raw file around before touching anything.
                let backup = self.db_path.with_extension("sqlite.bak");
                fs::copy(&self.db_path, &backup).map_err(StoreError::Backup)?;
                let conn = self.conn();
                for migration in MIGRATIONS {
                    conn.execute_batch(migration)?;
                }
                conn.execute_batch(SCHEMA)?;
                conn.execute(
                    "INSERT OR REPLACE INTO meta(key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) => {
                return Err(StoreError::SchemaMismatch {
                    found: v,
                    supported: SCHEMA_VERSION,
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Files & pages
    // ------------------------------------------------------------------

    pub fn get_file_by_path(&self, path: &str) -> Result<Option<FileRow>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT file_id, size_bytes, mtime_epoch FROM files WHERE path = ?1",
                params![path],
                |row| {
                    Ok(FileRow {
                        file_id: row.get(0)?,
                        size_bytes: row.get(1)?,
                        mtime_epoch: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Insert or refresh a file row; `file_id` is stable across updates.
    pub fn upsert_file(&self, path: &str, size_bytes: i64, mtime_epoch: i64) -> Result<i64, StoreError> {
        let now = now_epoch();
        let conn = self.conn();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT file_id FROM files WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(file_id) => {
                conn.execute(
                    "UPDATE files SET size_bytes = ?1, mtime_epoch = ?2, last_scanned_at = ?3, scan_error = NULL WHERE file_id = ?4",
                    params![size_bytes, mtime_epoch, now, file_id],
                )?;
                Ok(file_id)
            }
            None => {
                conn.execute(
                    "INSERT INTO files(path, size_bytes, mtime_epoch, last_scanned_at) VALUES (?1, ?2, ?3, ?4)",
                    params![path, size_bytes, mtime_epoch, now],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn set_file_aspect(&self, file_id: i64, aspect: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE files SET slide_aspect = ?1 WHERE file_id = ?2",
            params![aspect, file_id],
        )?;
        Ok(())
    }

    pub fn set_file_slide_count(&self, file_id: i64, slide_count: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE files SET slide_count = ?1 WHERE file_id = ?2",
            params![slide_count, file_id],
        )?;
        Ok(())
    }

    pub fn set_file_scan_error(&self, file_id: i64, message: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE files SET scan_error = ?1 WHERE file_id = ?2",
            params![truncate(message), file_id],
        )?;
        Ok(())
    }

    /// Create (or refresh) exactly `slide_count` page rows and five artifact
    /// rows per page. Idempotent: reruns on an unchanged file change nothing
    /// beyond the refreshed source columns.
    pub fn ensure_pages_rows(
        &self,
        file_id: i64,
        slide_count: u32,
        aspect: &str,
        size_bytes: i64,
        mtime_epoch: i64,
    ) -> Result<Vec<i64>, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut page_ids = Vec::with_capacity(slide_count as usize);
        for page_no in 1..=slide_count {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT page_id FROM pages WHERE file_id = ?1 AND page_no = ?2",
                    params![file_id, page_no],
                    |row| row.get(0),
                )
                .optional()?;
            let page_id = match existing {
                Some(page_id) => {
                    tx.execute(
                        "UPDATE pages SET aspect = ?1, source_size_bytes = ?2, source_mtime_epoch = ?3 WHERE page_id = ?4",
                        params![aspect, size_bytes, mtime_epoch, page_id],
                    )?;
                    page_id
                }
                None => {
                    tx.execute(
                        "INSERT INTO pages(file_id, page_no, aspect, source_size_bytes, source_mtime_epoch, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![file_id, page_no, aspect, size_bytes, mtime_epoch, now],
                    )?;
                    tx.last_insert_rowid()
                }
            };
            for kind in ArtifactKind::ALL {
                tx.execute(
                    "INSERT OR IGNORE INTO artifacts(page_id, kind, status, updated_at, attempts) VALUES (?1, ?2, 'missing', ?3, 0)",
                    params![page_id, kind.as_str(), now],
                )?;
            }
            page_ids.push(page_id);
        }
        tx.commit()?;
        Ok(page_ids)
    }

    pub fn page_ids_for_file(&self, file_id: i64) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT page_id FROM pages WHERE file_id = ?1 ORDER BY page_no")?;
        let ids = stmt
            .query_map(params![file_id], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Artifacts & queueing
    // ------------------------------------------------------------------

    pub fn artifact_statuses(
        &self,
        page_id: i64,
    ) -> Result<HashMap<ArtifactKind, ArtifactStatus>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT kind, status FROM artifacts WHERE page_id = ?1")?;
        let rows = stmt.query_map(params![page_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (kind, status) = row?;
            if let (Some(kind), Some(status)) =
                (ArtifactKind::parse(&kind), ArtifactStatus::parse(&status))
            {
                map.insert(kind, status);
            }
        }
        Ok(map)
    }

    pub fn artifact_row(
        &self,
        page_id: i64,
        kind: ArtifactKind,
    ) -> Result<Option<ArtifactRow>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT status, error_code, attempts FROM artifacts WHERE page_id = ?1 AND kind = ?2",
                params![page_id, kind.as_str()],
                |row| {
                    let status: String = row.get(0)?;
                    Ok(ArtifactRow {
                        status: ArtifactStatus::parse(&status)
                            .unwrap_or(ArtifactStatus::Missing),
                        error_code: row.get(1)?,
                        attempts: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Transition one artifact to `queued` and insert its task row.
    pub fn queue_artifact(
        &self,
        job_id: &str,
        page_id: i64,
        kind: ArtifactKind,
        params_json: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        debug_assert!(!job_id.is_empty());
        debug_assert!(page_id > 0);

        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE artifacts SET status = 'queued', updated_at = ?1, params_json = ?2, error_code = NULL, error_message = NULL WHERE page_id = ?3 AND kind = ?4",
            params![now, params_json.to_string(), page_id, kind.as_str()],
        )?;
        tx.execute(
            "INSERT INTO tasks(job_id, page_id, kind, status, priority) VALUES (?1, ?2, ?3, 'queued', 0)",
            params![job_id, page_id, kind.as_str()],
        )?;
        let task_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(task_id)
    }

    /// File-scoped PDF conversion task (no artifact row of its own; it gates
    /// the per-page thumb artifacts).
    pub fn queue_file_pdf_task(
        &self,
        job_id: &str,
        file_id: i64,
        priority: i64,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks(job_id, file_id, kind, status, priority) VALUES (?1, ?2, 'pdf', 'queued', ?3)",
            params![job_id, file_id, priority],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// Mark a task running; for page-scoped tasks the owning artifact moves
    /// to `running` in the same transaction.
    pub fn task_start(
        &self,
        task_id: i64,
        page: Option<(i64, ArtifactKind)>,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tasks SET status = 'running', started_at = COALESCE(started_at, ?1), heartbeat_at = ?1, message = 'start' WHERE task_id = ?2 AND status = 'queued'",
            params![now, task_id],
        )?;
        if changed > 0 {
            if let Some((page_id, kind)) = page {
                tx.execute(
                    "UPDATE artifacts SET status = 'running', updated_at = ?1 WHERE page_id = ?2 AND kind = ?3",
                    params![now, page_id, kind.as_str()],
                )?;
            }
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    pub fn task_heartbeat(&self, task_id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE tasks SET heartbeat_at = ?1 WHERE task_id = ?2 AND status = 'running'",
            params![now_epoch(), task_id],
        )?;
        Ok(())
    }

    /// Successful completion of a file-scoped task (no artifact payload).
    pub fn finish_file_task(&self, task_id: i64) -> Result<(), StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        finish_task(&tx, task_id, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Terminal failure of a file-scoped task.
    pub fn fail_task(&self, task_id: i64, code: &str, message: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE tasks SET status = 'error', finished_at = ?1, heartbeat_at = ?1, error_code = ?2, error_message = ?3 WHERE task_id = ?4 AND status IN ('queued', 'running')",
            params![now_epoch(), code, truncate(message), task_id],
        )?;
        Ok(())
    }

    /// Page-scoped failure: artifact and task move to `error` together. The
    /// guard on the task status keeps a cancelled task from resurfacing.
    pub fn fail_page_task(
        &self,
        task_id: i64,
        page_id: i64,
        kind: ArtifactKind,
        code: &str,
        message: &str,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tasks SET status = 'error', finished_at = ?1, heartbeat_at = ?1, error_code = ?2, error_message = ?3 WHERE task_id = ?4 AND status IN ('queued', 'running')",
            params![now, code, truncate(message), task_id],
        )?;
        if changed > 0 {
            tx.execute(
                "UPDATE artifacts SET status = 'error', updated_at = ?1, error_code = ?2, error_message = ?3, attempts = attempts + 1 WHERE page_id = ?4 AND kind = ?5",
                params![now, code, truncate(message), page_id, kind.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Text extraction failure also fails the page's `bm25` (which is
    /// derived from the same extraction) when it was queued.
    pub fn fail_text_cascade(
        &self,
        task_id: i64,
        page_id: i64,
        code: &str,
        message: &str,
        with_bm25: bool,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tasks SET status = 'error', finished_at = ?1, heartbeat_at = ?1, error_code = ?2, error_message = ?3 WHERE task_id = ?4 AND status IN ('queued', 'running')",
            params![now, code, truncate(message), task_id],
        )?;
        if changed > 0 {
            tx.execute(
                "UPDATE artifacts SET status = 'error', updated_at = ?1, error_code = ?2, error_message = ?3, attempts = attempts + 1 WHERE page_id = ?4 AND kind = 'text'",
                params![now, code, truncate(message), page_id],
            )?;
            if with_bm25 {
                tx.execute(
                    "UPDATE artifacts SET status = 'error', updated_at = ?1, error_code = ?2, error_message = ?3 WHERE page_id = ?4 AND kind = 'bm25' AND status IN ('queued', 'running')",
                    params![now, code, truncate(message), page_id],
                )?;
                tx.execute(
                    "UPDATE tasks SET status = 'error', finished_at = ?1, error_code = ?2, error_message = ?3 WHERE page_id = ?4 AND kind = 'bm25' AND status = 'queued'",
                    params![now, code, truncate(message), page_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Thumb failure also fails the page's `img_vec` (its only consumer).
    pub fn fail_thumb_cascade(
        &self,
        task_id: i64,
        page_id: i64,
        code: &str,
        message: &str,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tasks SET status = 'error', finished_at = ?1, heartbeat_at = ?1, error_code = ?2, error_message = ?3 WHERE task_id = ?4 AND status IN ('queued', 'running')",
            params![now, code, truncate(message), task_id],
        )?;
        if changed > 0 {
            tx.execute(
                "UPDATE artifacts SET status = 'error', updated_at = ?1, error_code = ?2, error_message = ?3, attempts = attempts + 1 WHERE page_id = ?4 AND kind IN ('thumb', 'img_vec') AND status != 'ready'",
                params![now, code, truncate(message), page_id],
            )?;
            tx.execute(
                "UPDATE tasks SET status = 'error', finished_at = ?1, error_code = ?2, error_message = ?3 WHERE page_id = ?4 AND kind = 'img_vec' AND status = 'queued'",
                params![now, code, truncate(message), page_id],
            )?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    /// PDF conversion failed or timed out: every page of the file loses its
    /// `thumb` and (transitively) `img_vec` artifacts in one sweep. Returns
    /// the affected page ids.
    pub fn fail_file_thumb_pipeline(
        &self,
        job_id: &str,
        file_id: i64,
        code: &str,
        message: &str,
    ) -> Result<Vec<i64>, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let page_ids: Vec<i64> = {
            let mut stmt =
                tx.prepare("SELECT page_id FROM pages WHERE file_id = ?1 ORDER BY page_no")?;
            let ids = stmt
                .query_map(params![file_id], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            ids
        };
        tx.execute(
            "UPDATE artifacts SET status = 'error', updated_at = ?1, error_code = ?2, error_message = ?3 WHERE kind IN ('thumb', 'img_vec') AND status != 'ready' AND page_id IN (SELECT page_id FROM pages WHERE file_id = ?4)",
            params![now, code, truncate(message), file_id],
        )?;
        tx.execute(
            "UPDATE tasks SET status = 'error', finished_at = ?1, error_code = ?2, error_message = ?3 WHERE job_id = ?4 AND kind IN ('thumb', 'img_vec') AND status IN ('queued', 'running') AND page_id IN (SELECT page_id FROM pages WHERE file_id = ?5)",
            params![now, code, truncate(message), job_id, file_id],
        )?;
        tx.commit()?;
        Ok(page_ids)
    }

    // ------------------------------------------------------------------
    // Per-page checkpoints (payload + artifact + task, one transaction)
    // ------------------------------------------------------------------

    /// Text extraction succeeded. Returns false (and writes nothing) when the
    /// task is no longer running, e.g. swept by a cancel.
    pub fn checkpoint_text_ready(
        &self,
        task_id: i64,
        page_id: i64,
        raw_text: &str,
        norm_text: &str,
        text_sig: &str,
        with_bm25: bool,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if !task_is_running(&tx, task_id)? {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO page_text(page_id, raw_text, norm_text, text_sig, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(page_id) DO UPDATE SET raw_text = excluded.raw_text, norm_text = excluded.norm_text, text_sig = excluded.text_sig, updated_at = excluded.updated_at",
            params![page_id, raw_text, norm_text, text_sig, now],
        )?;
        mark_artifact_ready(&tx, page_id, ArtifactKind::Text, now)?;
        if with_bm25 {
            tx.execute("DELETE FROM fts_pages WHERE page_id = ?1", params![page_id])?;
            tx.execute(
                "INSERT INTO fts_pages(page_id, norm_text) VALUES (?1, ?2)",
                params![page_id, norm_text],
            )?;
            mark_artifact_ready(&tx, page_id, ArtifactKind::Bm25, now)?;
            // The bm25 task rides on the text worker; close it out here.
            tx.execute(
                "UPDATE tasks SET status = 'finished', finished_at = ?1, progress = 1.0, message = 'ok' WHERE page_id = ?2 AND kind = 'bm25' AND status IN ('queued', 'running')",
                params![now, page_id],
            )?;
        }
        finish_task(&tx, task_id, now)?;
        tx.commit()?;
        Ok(true)
    }

    /// Insert or replace the FTS row for a page. Empty text is stored as
    /// empty so deletion counts stay coherent.
    pub fn upsert_fts_page(&self, page_id: i64, norm_text: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM fts_pages WHERE page_id = ?1", params![page_id])?;
        tx.execute(
            "INSERT INTO fts_pages(page_id, norm_text) VALUES (?1, ?2)",
            params![page_id, norm_text],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn checkpoint_thumb_ready(
        &self,
        task_id: i64,
        page_id: i64,
        aspect: &str,
        width: u32,
        height: u32,
        image_path: &str,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if !task_is_running(&tx, task_id)? {
            return Ok(false);
        }
        tx.execute(
            "INSERT OR REPLACE INTO thumbnails(page_id, aspect, width, height, image_path, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![page_id, aspect, width, height, image_path, now],
        )?;
        mark_artifact_ready(&tx, page_id, ArtifactKind::Thumb, now)?;
        finish_task(&tx, task_id, now)?;
        tx.commit()?;
        Ok(true)
    }

    /// Text embedding ready. `vector` carries `(dim, blob)` when a fresh
    /// cache row must be written; `None` links against an existing row.
    pub fn checkpoint_text_vec_ready(
        &self,
        task_id: i64,
        page_id: i64,
        model: &str,
        text_sig: &str,
        vector: Option<(usize, &[u8])>,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if !task_is_running(&tx, task_id)? {
            return Ok(false);
        }
        if let Some((dim, blob)) = vector {
            tx.execute(
                "INSERT OR REPLACE INTO embedding_cache_text(model, text_sig, dim, vector_blob, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![model, text_sig, dim as i64, blob, now],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO page_text_embedding(page_id, model, text_sig, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![page_id, model, text_sig, now],
        )?;
        mark_artifact_ready(&tx, page_id, ArtifactKind::TextVec, now)?;
        finish_task(&tx, task_id, now)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn checkpoint_img_vec_ready(
        &self,
        task_id: i64,
        page_id: i64,
        model: &str,
        dim: usize,
        blob: &[u8],
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if !task_is_running(&tx, task_id)? {
            return Ok(false);
        }
        tx.execute(
            "INSERT OR REPLACE INTO page_image_embedding(page_id, model, dim, vector_blob, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![page_id, model, dim as i64, blob, now],
        )?;
        mark_artifact_ready(&tx, page_id, ArtifactKind::ImgVec, now)?;
        finish_task(&tx, task_id, now)?;
        tx.commit()?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Embedding cache
    // ------------------------------------------------------------------

    pub fn text_cache_lookup(
        &self,
        model: &str,
        text_sig: &str,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT dim, length(vector_blob) FROM embedding_cache_text WHERE model = ?1 AND text_sig = ?2",
                params![model, text_sig],
                |row| {
                    Ok(CacheEntry {
                        dim: row.get(0)?,
                        blob_len: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Most recently persisted dimension for a model, used to size zero
    /// vectors before any remote call has been observed.
    pub fn last_model_dim(&self, model: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn();
        let dim = conn
            .query_row(
                "SELECT dim FROM embedding_cache_text WHERE model = ?1 ORDER BY created_at DESC LIMIT 1",
                params![model],
                |row| row.get(0),
            )
            .optional()?;
        Ok(dim)
    }

    pub fn text_embedding_link(
        &self,
        page_id: i64,
        model: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        let sig = conn
            .query_row(
                "SELECT text_sig FROM page_text_embedding WHERE page_id = ?1 AND model = ?2",
                params![page_id, model],
                |row| row.get(0),
            )
            .optional()?;
        Ok(sig)
    }

    pub fn text_cache_count(&self, model: &str) -> Result<i64, StoreError> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM embedding_cache_text WHERE model = ?1",
            params![model],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub fn insert_job(
        &self,
        job_id: &str,
        library_root: &str,
        options_json: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO jobs(job_id, library_root, created_at, status, options_json) VALUES (?1, ?2, ?3, 'created', ?4)",
            params![job_id, library_root, now_epoch(), options_json],
        )?;
        Ok(())
    }

    pub fn job_row(&self, job_id: &str) -> Result<Option<JobRow>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT job_id, library_root, status, created_at, started_at, finished_at, options_json FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| {
                    let status: String = row.get(2)?;
                    Ok(JobRow {
                        job_id: row.get(0)?,
                        library_root: row.get(1)?,
                        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
                        created_at: row.get(3)?,
                        started_at: row.get(4)?,
                        finished_at: row.get(5)?,
                        options_json: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Transition a job's status. Terminal states stick: a finished job is
    /// never moved back. Returns whether the row changed.
    pub fn set_job_status(&self, job_id: &str, status: JobStatus) -> Result<bool, StoreError> {
        let now = now_epoch();
        let conn = self.conn();
        let changed = match status {
            JobStatus::Planning | JobStatus::Running => conn.execute(
                "UPDATE jobs SET status = ?1, started_at = COALESCE(started_at, ?2) WHERE job_id = ?3 AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![status.as_str(), now, job_id],
            )?,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => conn.execute(
                "UPDATE jobs SET status = ?1, finished_at = ?2 WHERE job_id = ?3 AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![status.as_str(), now, job_id],
            )?,
            _ => conn.execute(
                "UPDATE jobs SET status = ?1 WHERE job_id = ?2 AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![status.as_str(), job_id],
            )?,
        };
        Ok(changed > 0)
    }

    pub fn set_job_summary(&self, job_id: &str, summary_json: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE jobs SET summary_json = ?1 WHERE job_id = ?2",
            params![summary_json, job_id],
        )?;
        Ok(())
    }

    /// Artifact counters over the pages this job touched, per kind × status.
    pub fn job_counters(&self, job_id: &str) -> Result<JobCounters, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT a.kind, a.status, COUNT(*) FROM artifacts a
             WHERE a.page_id IN (SELECT DISTINCT page_id FROM tasks WHERE job_id = ?1 AND page_id IS NOT NULL)
             GROUP BY a.kind, a.status",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u64>(2)?,
            ))
        })?;
        let mut counters = JobCounters::default();
        for row in rows {
            let (kind, status, count) = row?;
            let Some(kind) = ArtifactKind::parse(&kind) else {
                continue;
            };
            let slot = counters.kind_mut(kind);
            match status.as_str() {
                "queued" => slot.queued += count,
                "running" => slot.running += count,
                "ready" => slot.ready += count,
                "error" => slot.error += count,
                "cancelled" => slot.cancelled += count,
                _ => {}
            }
        }
        Ok(counters)
    }

    pub fn now_running(&self, job_id: &str) -> Result<Option<NowRunning>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT t.task_id, t.kind, p.page_no, f.path
                 FROM tasks t
                 LEFT JOIN pages p ON p.page_id = t.page_id
                 LEFT JOIN files f ON f.file_id = COALESCE(t.file_id, p.file_id)
                 WHERE t.job_id = ?1 AND t.status = 'running'
                 ORDER BY t.started_at ASC LIMIT 1",
                params![job_id],
                |row| {
                    Ok(NowRunning {
                        task_id: row.get(0)?,
                        kind: row.get(1)?,
                        page_no: row.get(2)?,
                        path: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn errors_summary(&self, job_id: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT error_code, COUNT(*) FROM tasks WHERE job_id = ?1 AND error_code IS NOT NULL GROUP BY error_code ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, i64)>, _>>()?;
        Ok(rows)
    }

    pub fn task_counts_by_kind(&self, job_id: &str) -> Result<HashMap<String, i64>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT kind, COUNT(*) FROM tasks WHERE job_id = ?1 GROUP BY kind")?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (kind, count) = row?;
            map.insert(kind, count);
        }
        Ok(map)
    }

    pub fn tasks_for_job(&self, job_id: &str) -> Result<Vec<TaskRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, kind, status, page_id, file_id, heartbeat_at, error_code FROM tasks WHERE job_id = ?1 ORDER BY task_id",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(TaskRow {
                    task_id: row.get(0)?,
                    kind: row.get(1)?,
                    status: row.get(2)?,
                    page_id: row.get(3)?,
                    file_id: row.get(4)?,
                    heartbeat_at: row.get(5)?,
                    error_code: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<TaskRow>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Worker queues
    // ------------------------------------------------------------------

    pub fn queued_text_tasks(&self, job_id: &str) -> Result<Vec<TextTask>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.task_id, t.page_id, p.page_no, f.path
             FROM tasks t
             JOIN pages p ON p.page_id = t.page_id
             JOIN files f ON f.file_id = p.file_id
             WHERE t.job_id = ?1 AND t.kind = 'text' AND t.status = 'queued'
             ORDER BY f.file_id, p.page_no",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(TextTask {
                    task_id: row.get(0)?,
                    page_id: row.get(1)?,
                    page_no: row.get(2)?,
                    path: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<TextTask>, _>>()?;
        Ok(rows)
    }

    pub fn queued_pdf_tasks(&self, job_id: &str) -> Result<Vec<PdfTask>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.task_id, t.file_id, f.path, f.slide_aspect
             FROM tasks t
             JOIN files f ON f.file_id = t.file_id
             WHERE t.job_id = ?1 AND t.kind = 'pdf' AND t.status = 'queued'
             ORDER BY t.priority DESC, t.task_id ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(PdfTask {
                    task_id: row.get(0)?,
                    file_id: row.get(1)?,
                    path: row.get(2)?,
                    aspect: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<PdfTask>, _>>()?;
        Ok(rows)
    }

    pub fn queued_thumb_tasks(
        &self,
        job_id: &str,
        file_id: i64,
    ) -> Result<Vec<ThumbTask>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.task_id, t.page_id, p.page_no, p.aspect
             FROM tasks t
             JOIN pages p ON p.page_id = t.page_id
             WHERE t.job_id = ?1 AND t.kind = 'thumb' AND t.status = 'queued' AND p.file_id = ?2
             ORDER BY p.page_no",
        )?;
        let rows = stmt
            .query_map(params![job_id, file_id], |row| {
                Ok(ThumbTask {
                    task_id: row.get(0)?,
                    page_id: row.get(1)?,
                    page_no: row.get(2)?,
                    aspect: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<ThumbTask>, _>>()?;
        Ok(rows)
    }

    pub fn queued_text_vec_tasks(&self, job_id: &str) -> Result<Vec<TextVecTask>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.task_id, t.page_id, pt.norm_text, pt.text_sig, a.status
             FROM tasks t
             LEFT JOIN page_text pt ON pt.page_id = t.page_id
             LEFT JOIN artifacts a ON a.page_id = t.page_id AND a.kind = 'text'
             WHERE t.job_id = ?1 AND t.kind = 'text_vec' AND t.status = 'queued'
             ORDER BY t.task_id ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                let status: Option<String> = row.get(4)?;
                Ok(TextVecTask {
                    task_id: row.get(0)?,
                    page_id: row.get(1)?,
                    norm_text: row.get(2)?,
                    text_sig: row.get(3)?,
                    text_status: status.as_deref().and_then(ArtifactStatus::parse),
                })
            })?
            .collect::<Result<Vec<TextVecTask>, _>>()?;
        Ok(rows)
    }

    pub fn queued_img_vec_tasks(&self, job_id: &str) -> Result<Vec<ImgVecTask>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.task_id, t.page_id, th.image_path, a.status
             FROM tasks t
             LEFT JOIN thumbnails th ON th.page_id = t.page_id
             LEFT JOIN artifacts a ON a.page_id = t.page_id AND a.kind = 'thumb'
             WHERE t.job_id = ?1 AND t.kind = 'img_vec' AND t.status = 'queued'
             ORDER BY t.task_id ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                let status: Option<String> = row.get(3)?;
                Ok(ImgVecTask {
                    task_id: row.get(0)?,
                    page_id: row.get(1)?,
                    thumb_path: row.get(2)?,
                    thumb_status: status.as_deref().and_then(ArtifactStatus::parse),
                })
            })?
            .collect::<Result<Vec<ImgVecTask>, _>>()?;
        Ok(rows)
    }

    /// Remaining queued text_vec work swept to `error` in one pass (used when
    /// the embedding provider rejects our credentials). Returns the affected
    /// (task_id, page_id) pairs.
    pub fn sweep_text_vec_errors(
        &self,
        job_id: &str,
        code: &str,
        message: &str,
    ) -> Result<Vec<(i64, i64)>, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let pairs: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT task_id, page_id FROM tasks WHERE job_id = ?1 AND kind = 'text_vec' AND status = 'queued'",
            )?;
            let pairs = stmt
                .query_map(params![job_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<(i64, i64)>, _>>()?;
            pairs
        };
        tx.execute(
            "UPDATE tasks SET status = 'error', finished_at = ?1, error_code = ?2, error_message = ?3 WHERE job_id = ?4 AND kind = 'text_vec' AND status = 'queued'",
            params![now, code, truncate(message), job_id],
        )?;
        tx.execute(
            "UPDATE artifacts SET status = 'error', updated_at = ?1, error_code = ?2, error_message = ?3 WHERE kind = 'text_vec' AND status IN ('queued', 'running') AND page_id IN (SELECT page_id FROM tasks WHERE job_id = ?4 AND kind = 'text_vec')",
            params![now, code, truncate(message), job_id],
        )?;
        tx.commit()?;
        Ok(pairs)
    }

    // ------------------------------------------------------------------
    // Terminal sweeps & watchdog
    // ------------------------------------------------------------------

    /// Cancel sweep: queued/running tasks and artifacts become `cancelled`,
    /// the job becomes `cancelled`. Idempotent; returns whether the job row
    /// transitioned (first caller wins).
    pub fn cancel_sweep(&self, job_id: &str) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE artifacts SET status = 'cancelled', updated_at = ?1 WHERE status IN ('queued', 'running') AND page_id IN (SELECT page_id FROM tasks WHERE job_id = ?2 AND page_id IS NOT NULL)",
            params![now, job_id],
        )?;
        tx.execute(
            "UPDATE tasks SET status = 'cancelled', finished_at = ?1 WHERE job_id = ?2 AND status IN ('queued', 'running')",
            params![now, job_id],
        )?;
        let changed = tx.execute(
            "UPDATE jobs SET status = 'cancelled', finished_at = ?1 WHERE job_id = ?2 AND status NOT IN ('completed', 'failed', 'cancelled')",
            params![now, job_id],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Safety net at job completion: anything still queued (a phase that was
    /// disabled mid-flight) becomes `skipped` so no non-terminal rows remain.
    pub fn finalize_sweep(&self, job_id: &str) -> Result<(), StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE artifacts SET status = 'skipped', updated_at = ?1 WHERE status IN ('queued', 'running') AND page_id IN (SELECT page_id FROM tasks WHERE job_id = ?2 AND status IN ('queued', 'running') AND page_id IS NOT NULL)",
            params![now, job_id],
        )?;
        tx.execute(
            "UPDATE tasks SET status = 'skipped', finished_at = ?1 WHERE job_id = ?2 AND status IN ('queued', 'running')",
            params![now, job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn running_tasks(&self) -> Result<Vec<RunningTaskRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, job_id, kind, page_id, heartbeat_at, started_at FROM tasks WHERE status = 'running'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RunningTaskRow {
                    task_id: row.get(0)?,
                    job_id: row.get(1)?,
                    kind: row.get(2)?,
                    page_id: row.get(3)?,
                    heartbeat_at: row.get(4)?,
                    started_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<RunningTaskRow>, _>>()?;
        Ok(rows)
    }

    /// Force a stalled task to `error` with `WATCHDOG_TIMEOUT`. Guarded on
    /// the task still being `running` so a racing finish wins.
    pub fn expire_task(
        &self,
        task_id: i64,
        page: Option<(i64, ArtifactKind)>,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tasks SET status = 'error', finished_at = ?1, error_code = ?2, error_message = 'task heartbeat timeout' WHERE task_id = ?3 AND status = 'running'",
            params![now, codes::WATCHDOG_TIMEOUT, task_id],
        )?;
        if changed > 0 {
            if let Some((page_id, kind)) = page {
                tx.execute(
                    "UPDATE artifacts SET status = 'error', updated_at = ?1, error_code = ?2, error_message = 'task heartbeat timeout' WHERE page_id = ?3 AND kind = ?4 AND status != 'ready'",
                    params![now, codes::WATCHDOG_TIMEOUT, page_id, kind.as_str()],
                )?;
            }
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn append_event(
        &self,
        job_id: &str,
        seq: u64,
        ts: i64,
        kind: &str,
        payload_json: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO events(job_id, seq, ts, type, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id, seq as i64, ts, kind, payload_json],
        )?;
        Ok(())
    }

    pub fn event_count(&self, job_id: &str) -> Result<i64, StoreError> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM events WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Payload reads (used by the UI surface and by tests)
    // ------------------------------------------------------------------

    pub fn page_text_row(
        &self,
        page_id: i64,
    ) -> Result<Option<(String, String, String)>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT raw_text, norm_text, text_sig FROM page_text WHERE page_id = ?1",
                params![page_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn thumbnail_path(&self, page_id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT image_path FROM thumbnails WHERE page_id = ?1 ORDER BY updated_at DESC LIMIT 1",
                params![page_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn image_embedding(
        &self,
        page_id: i64,
        model: &str,
    ) -> Result<Option<(i64, Vec<u8>)>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT dim, vector_blob FROM page_image_embedding WHERE page_id = ?1 AND model = ?2",
                params![page_id, model],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn text_embedding_blob(
        &self,
        page_id: i64,
        model: &str,
    ) -> Result<Option<(i64, Vec<u8>)>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT c.dim, c.vector_blob FROM page_text_embedding l
                 JOIN embedding_cache_text c ON c.model = l.model AND c.text_sig = l.text_sig
                 WHERE l.page_id = ?1 AND l.model = ?2",
                params![page_id, model],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }
}

fn task_is_running(tx: &rusqlite::Transaction<'_>, task_id: i64) -> Result<bool, StoreError> {
    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM tasks WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status.as_deref() == Some("running"))
}

fn mark_artifact_ready(
    tx: &rusqlite::Transaction<'_>,
    page_id: i64,
    kind: ArtifactKind,
    now: i64,
) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE artifacts SET status = 'ready', updated_at = ?1, error_code = NULL, error_message = NULL, attempts = attempts + 1 WHERE page_id = ?2 AND kind = ?3",
        params![now, page_id, kind.as_str()],
    )?;
    Ok(())
}

fn finish_task(tx: &rusqlite::Transaction<'_>, task_id: i64, now: i64) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE tasks SET status = 'finished', finished_at = ?1, heartbeat_at = ?1, progress = 1.0, message = 'ok' WHERE task_id = ?2",
        params![now, task_id],
    )?;
    Ok(())
}

fn truncate(message: &str) -> &str {
    if message.len() <= ERROR_MESSAGE_MAX {
        return message;
    }
    let mut end = ERROR_MESSAGE_MAX;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}
