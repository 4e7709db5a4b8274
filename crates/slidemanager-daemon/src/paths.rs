//! Filesystem layout under `<library_root>/.slidemanager/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

const DATA_DIR_NAME: &str = ".slidemanager";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("library root {path} does not exist or is not a directory")]
    InvalidRoot { path: PathBuf },
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Paths for one library root. Everything the daemon writes lives inside
/// `<root>/.slidemanager/`; the library's own files are never touched.
#[derive(Debug, Clone)]
pub struct LibraryPaths {
    root: PathBuf,
}

impl LibraryPaths {
    /// Bind to an existing library root. The `.slidemanager/` directory is
    /// created lazily by the accessors below.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, PathError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(PathError::InvalidRoot { path: root });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> Result<PathBuf, PathError> {
        ensure_dir(self.root.join(DATA_DIR_NAME))
    }

    /// `index.sqlite` under the data directory; parent is created, the file
    /// itself is owned by the store.
    pub fn db_path(&self) -> Result<PathBuf, PathError> {
        Ok(self.data_dir()?.join("index.sqlite"))
    }

    /// Directory holding one converted PDF per file (`pdf/<file_id>.pdf`).
    pub fn pdf_dir(&self) -> Result<PathBuf, PathError> {
        ensure_dir(self.data_dir()?.join("pdf"))
    }

    pub fn pdf_path(&self, file_id: i64) -> Result<PathBuf, PathError> {
        Ok(self.pdf_dir()?.join(format!("{file_id}.pdf")))
    }

    /// Per-file thumbnail directory (`thumbs/<file_id>/`).
    pub fn thumbs_dir(&self, file_id: i64) -> Result<PathBuf, PathError> {
        ensure_dir(self.data_dir()?.join("thumbs").join(file_id.to_string()))
    }

    pub fn thumb_path(
        &self,
        file_id: i64,
        page_no: u32,
        aspect: &str,
        width: u32,
        height: u32,
    ) -> Result<PathBuf, PathError> {
        let aspect_slug = aspect.replace(':', "x");
        Ok(self
            .thumbs_dir(file_id)?
            .join(format!("{page_no}_{aspect_slug}_{width}x{height}.jpg")))
    }

    /// Append-only jsonl event log for one job.
    pub fn job_log_path(&self, job_id: &str) -> Result<PathBuf, PathError> {
        let dir = ensure_dir(self.data_dir()?.join("logs").join("jobs"))?;
        Ok(dir.join(format!("{job_id}.log.jsonl")))
    }
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf, PathError> {
    if let Err(source) = fs::create_dir_all(&path) {
        if source.kind() != io::ErrorKind::AlreadyExists {
            return Err(PathError::CreateDir { path, source });
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rejects_missing_root() {
        let err = LibraryPaths::new("/definitely/not/a/real/dir").expect_err("must reject");
        assert!(matches!(err, PathError::InvalidRoot { .. }));
    }

    #[test]
    fn thumb_path_encodes_aspect_and_size() {
        let temp = TempDir::new().expect("temp dir");
        let paths = LibraryPaths::new(temp.path()).expect("paths");
        let p = paths
            .thumb_path(7, 3, "16:9", 320, 180)
            .expect("thumb path");
        assert!(p.ends_with("thumbs/7/3_16x9_320x180.jpg"), "got {p:?}");
    }

    #[test]
    fn data_layout_lives_under_dot_slidemanager() {
        let temp = TempDir::new().expect("temp dir");
        let paths = LibraryPaths::new(temp.path()).expect("paths");
        let db = paths.db_path().expect("db path");
        assert!(db.starts_with(temp.path().join(".slidemanager")));
        assert!(paths.pdf_dir().expect("pdf dir").is_dir());
    }
}
