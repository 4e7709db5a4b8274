//! Presentation → PDF conversion through a supervised external process.
//!
//! Each invocation runs headless LibreOffice inside a disposable user
//! profile directory so parallel conversions cannot clobber each other's
//! lock files. The wall-clock timeout is mandatory; on expiry the entire
//! process tree is killed, not just the direct child.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const STDERR_TAIL: usize = 500;

#[derive(Debug, Error)]
pub enum PdfConvertError {
    #[error("conversion timed out after {timeout_sec}s: {path}")]
    Timeout { path: PathBuf, timeout_sec: u64 },
    #[error("converter exited with {code:?}: {stderr_tail}")]
    Failed {
        code: Option<i32>,
        stderr_tail: String,
    },
    #[error("converter reported success but produced no PDF at {expected}")]
    MissingOutput { expected: PathBuf },
    #[error("failed to spawn converter `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error during conversion: {0}")]
    Io(#[from] std::io::Error),
}

impl PdfConvertError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PdfConvertError::Timeout { .. })
    }
}

/// Seam for the external conversion tool; the job manager only sees this
/// trait, so tests supply hanging or failing converters.
#[async_trait]
pub trait PdfConvert: Send + Sync {
    async fn convert(
        &self,
        pptx_path: &Path,
        out_pdf: &Path,
        timeout: Duration,
    ) -> Result<(), PdfConvertError>;
}

pub struct LibreOfficeConverter {
    soffice: String,
}

impl LibreOfficeConverter {
    pub fn new(soffice: impl Into<String>) -> Self {
        Self {
            soffice: soffice.into(),
        }
    }
}

impl Default for LibreOfficeConverter {
    fn default() -> Self {
        Self::new("soffice")
    }
}

#[async_trait]
impl PdfConvert for LibreOfficeConverter {
    async fn convert(
        &self,
        pptx_path: &Path,
        out_pdf: &Path,
        timeout: Duration,
    ) -> Result<(), PdfConvertError> {
        let out_dir = out_pdf
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&out_dir)?;

        // Disposable profile; dropped (and deleted) when conversion ends.
        let profile = tempfile::Builder::new().prefix("lo_profile_").tempdir()?;
        let user_install = format!("-env:UserInstallation={}", file_url(profile.path()));

        let mut cmd = Command::new(&self.soffice);
        cmd.arg("--headless")
            .arg("--nologo")
            .arg("--norestore")
            .arg("--nofirststartwizard")
            .arg(user_install)
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(&out_dir)
            .arg(pptx_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| PdfConvertError::Spawn {
            program: self.soffice.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);

        let waited = tokio::time::timeout(timeout, async {
            let mut stderr = String::new();
            if let Some(pipe) = child.stderr.as_mut() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            let status = child.wait().await;
            (status, stderr)
        })
        .await;

        let (status, stderr) = match waited {
            Err(_) => {
                kill_process_tree(pid);
                let _ = child.wait().await;
                return Err(PdfConvertError::Timeout {
                    path: pptx_path.to_path_buf(),
                    timeout_sec: timeout.as_secs(),
                });
            }
            Ok((status, stderr)) => (status?, stderr),
        };

        if !status.success() {
            return Err(PdfConvertError::Failed {
                code: status.code(),
                stderr_tail: tail(&stderr),
            });
        }

        let stem = pptx_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let expected = out_dir.join(format!("{stem}.pdf"));
        if !expected.exists() {
            return Err(PdfConvertError::MissingOutput { expected });
        }
        if expected != out_pdf {
            if out_pdf.exists() {
                std::fs::remove_file(out_pdf)?;
            }
            // Same directory, so the rename is atomic.
            std::fs::rename(&expected, out_pdf)?;
        }
        Ok(())
    }
}

fn file_url(path: &Path) -> String {
    let p = path.to_string_lossy().replace('\\', "/");
    if p.starts_with('/') {
        format!("file://{p}")
    } else {
        format!("file:///{p}")
    }
}

fn tail(stderr: &str) -> String {
    if stderr.len() <= STDERR_TAIL {
        return stderr.to_string();
    }
    let mut start = stderr.len() - STDERR_TAIL;
    while start < stderr.len() && !stderr.is_char_boundary(start) {
        start += 1;
    }
    stderr[start..].to_string()
}

/// Kill a process and everything it spawned. The child is started in its
/// own process group on unix, so the group id equals its pid.
#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    if pid == 0 {
        return;
    }
    // SAFETY: killpg with SIGKILL on the child's own group; no memory is
    // shared with the callee.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) {
    if pid == 0 {
        return;
    }
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}
