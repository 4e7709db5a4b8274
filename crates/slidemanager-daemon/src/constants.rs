//! Shared constants: stable error codes and pipeline defaults.

/// Error codes persisted on task/artifact rows and consumed by the UI.
/// These strings are part of the on-disk contract; never rename them.
pub mod codes {
    pub const TEXT_EXTRACT_FAIL: &str = "TEXT_EXTRACT_FAIL";
    pub const PDF_CONVERT_TIMEOUT: &str = "PDF_CONVERT_TIMEOUT";
    pub const PDF_CONVERT_FAIL: &str = "PDF_CONVERT_FAIL";
    pub const THUMB_RENDER_FAIL: &str = "THUMB_RENDER_FAIL";
    pub const EMBED_FAIL: &str = "EMBED_FAIL";
    pub const OPENAI_RATE_LIMIT: &str = "OPENAI_RATE_LIMIT";
    pub const OPENAI_AUTH: &str = "OPENAI_AUTH";
    pub const EMBED_DIM_MISMATCH: &str = "EMBED_DIM_MISMATCH";
    pub const WATCHDOG_TIMEOUT: &str = "WATCHDOG_TIMEOUT";
    pub const STORE_CONFLICT: &str = "STORE_CONFLICT";
    pub const JSON_CORRUPTED: &str = "JSON_CORRUPTED";
    pub const FILE_MISSING: &str = "FILE_MISSING";
}

/// Fallback dimension for `text-embedding-3-large` when no remote response
/// has been observed yet (zero-vector pages indexed before any real call).
pub const DEFAULT_TEXT_EMBED_DIM: usize = 3072;

/// Watchdog threshold applied to tasks of jobs recovered after a restart,
/// when no live handle carries the job's own option.
pub const DEFAULT_WATCHDOG_THRESHOLD_SEC: i64 = 30;

/// Interval between watchdog scans.
pub const WATCHDOG_TICK_SEC: u64 = 2;

/// Error messages stored on rows are truncated to this many bytes.
pub const ERROR_MESSAGE_MAX: usize = 500;
