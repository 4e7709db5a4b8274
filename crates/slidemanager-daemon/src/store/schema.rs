//! SQL schema for the per-library index database.

/// Bump when the schema changes; openers migrate forward after taking a
/// `.bak` copy of the database file.
pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    file_id INTEGER PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    size_bytes INTEGER NOT NULL,
    mtime_epoch INTEGER NOT NULL,
    slide_count INTEGER,
    slide_aspect TEXT NOT NULL DEFAULT 'unknown',
    last_scanned_at INTEGER,
    scan_error TEXT
);

CREATE TABLE IF NOT EXISTS pages (
    page_id INTEGER PRIMARY KEY,
    file_id INTEGER NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
    page_no INTEGER NOT NULL,
    aspect TEXT NOT NULL DEFAULT 'unknown',
    source_size_bytes INTEGER NOT NULL,
    source_mtime_epoch INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (file_id, page_no)
);

CREATE TABLE IF NOT EXISTS artifacts (
    page_id INTEGER NOT NULL REFERENCES pages(page_id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    params_json TEXT,
    error_code TEXT,
    error_message TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (page_id, kind)
);

CREATE TABLE IF NOT EXISTS page_text (
    page_id INTEGER PRIMARY KEY REFERENCES pages(page_id) ON DELETE CASCADE,
    raw_text TEXT NOT NULL,
    norm_text TEXT NOT NULL,
    text_sig TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS thumbnails (
    page_id INTEGER NOT NULL REFERENCES pages(page_id) ON DELETE CASCADE,
    aspect TEXT NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    image_path TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (page_id, aspect, width, height)
);

CREATE TABLE IF NOT EXISTS embedding_cache_text (
    model TEXT NOT NULL,
    text_sig TEXT NOT NULL,
    dim INTEGER NOT NULL,
    vector_blob BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (model, text_sig)
);

CREATE TABLE IF NOT EXISTS page_text_embedding (
    page_id INTEGER NOT NULL REFERENCES pages(page_id) ON DELETE CASCADE,
    model TEXT NOT NULL,
    text_sig TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (page_id, model),
    FOREIGN KEY (model, text_sig) REFERENCES embedding_cache_text(model, text_sig)
);

CREATE TABLE IF NOT EXISTS page_image_embedding (
    page_id INTEGER NOT NULL REFERENCES pages(page_id) ON DELETE CASCADE,
    model TEXT NOT NULL,
    dim INTEGER NOT NULL,
    vector_blob BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (page_id, model)
);

CREATE VIRTUAL TABLE IF NOT EXISTS fts_pages USING fts5(
    page_id UNINDEXED,
    norm_text
);

CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    library_root TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    status TEXT NOT NULL,
    options_json TEXT NOT NULL,
    summary_json TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    task_id INTEGER PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    page_id INTEGER REFERENCES pages(page_id) ON DELETE CASCADE,
    file_id INTEGER REFERENCES files(file_id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER,
    heartbeat_at INTEGER,
    finished_at INTEGER,
    progress REAL,
    message TEXT,
    error_code TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_job_status ON tasks(job_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_page ON tasks(page_id);

CREATE TABLE IF NOT EXISTS events (
    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    ts INTEGER NOT NULL,
    type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    PRIMARY KEY (job_id, seq)
);
"#;

/// Forward migrations from older schema versions, applied in order after the
/// database file has been copied aside. Empty at version 1.
pub const MIGRATIONS: &[&str] = &[];
