#![allow(dead_code)]

//! Shared fixtures for the pipeline and HTTP integration specs.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use slidemanager_daemon::config::JobOptions;
use slidemanager_daemon::paths::LibraryPaths;
use slidemanager_daemon::services::{
    EmbedApiError, EventBus, ImageEmbedClient, JobManager, PdfConvert, PdfConvertError,
    TextEmbedClient, ThumbRender, ThumbRenderError,
};
use slidemanager_daemon::store::{JobStatus, Store};

pub const EVENT_CAPACITY: usize = 4096;

pub struct TestRig {
    pub manager: Arc<JobManager>,
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub root: TempDir,
}

pub fn build_rig(
    pdf: Arc<dyn PdfConvert>,
    thumbs: Arc<dyn ThumbRender>,
    text_embed: Arc<dyn TextEmbedClient>,
    image_embed: Arc<dyn ImageEmbedClient>,
) -> TestRig {
    let root = TempDir::new().expect("library root");
    let paths = LibraryPaths::new(root.path()).expect("paths");
    let store = Arc::new(Store::open(&paths).expect("open store"));
    let bus = Arc::new(EventBus::new(EVENT_CAPACITY));
    let manager = JobManager::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        pdf,
        thumbs,
        text_embed,
        image_embed,
    );
    TestRig {
        manager,
        store,
        bus,
        root,
    }
}

pub fn default_rig() -> TestRig {
    build_rig(
        Arc::new(MockPdfConverter::succeeding()),
        Arc::new(MockThumbRenderer),
        Arc::new(CountingEmbedClient::new(8)),
        Arc::new(CountingImageClient::new(8)),
    )
}

/// Text-only options: the common baseline most specs start from.
pub fn text_only_options() -> JobOptions {
    JobOptions {
        enable_thumb: false,
        enable_text_vec: false,
        enable_img_vec: false,
        ..JobOptions::default()
    }
}

pub async fn wait_for_terminal(store: &Store, job_id: &str) -> JobStatus {
    for _ in 0..300 {
        if let Ok(Some(job)) = store.job_row(job_id) {
            if job.status.is_terminal() {
                return job.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {job_id} did not reach a terminal status in time");
}

// ----------------------------------------------------------------------
// PPTX fixtures
// ----------------------------------------------------------------------

pub fn slide_xml(texts: &[&str]) -> String {
    let runs: String = texts
        .iter()
        .map(|t| format!("<a:r><a:t>{t}</a:t></a:r>"))
        .collect();
    format!(
        r#"<?xml version="1.0"?><p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"><p:txBody>{runs}</p:txBody></p:sld>"#
    )
}

pub fn presentation_xml_16x9() -> &'static str {
    r#"<?xml version="1.0"?><p:presentation xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"><p:sldSz cx="12192000" cy="6858000"/></p:presentation>"#
}

/// Write a minimal pptx with one entry per slide body (raw XML).
pub fn write_pptx_raw(dir: &Path, name: &str, slide_bodies: &[String]) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).expect("create pptx");
    let mut zw = zip::ZipWriter::new(file);
    let opts = zip::write::SimpleFileOptions::default();
    zw.start_file("ppt/presentation.xml", opts)
        .expect("presentation entry");
    zw.write_all(presentation_xml_16x9().as_bytes())
        .expect("write presentation");
    for (idx, body) in slide_bodies.iter().enumerate() {
        zw.start_file(format!("ppt/slides/slide{}.xml", idx + 1), opts)
            .expect("slide entry");
        zw.write_all(body.as_bytes()).expect("write slide");
    }
    zw.finish().expect("finish zip");
    path
}

/// Write a pptx whose slides each carry one line of text.
pub fn write_pptx(dir: &Path, name: &str, slide_texts: &[&str]) -> PathBuf {
    let bodies: Vec<String> = slide_texts.iter().map(|t| slide_xml(&[t])).collect();
    write_pptx_raw(dir, name, &bodies)
}

// ----------------------------------------------------------------------
// Mock clients
// ----------------------------------------------------------------------

/// Succeeds with constant vectors; counts remote calls.
pub struct CountingEmbedClient {
    pub calls: AtomicU32,
    dim: usize,
    delay: Duration,
}

impl CountingEmbedClient {
    pub fn new(dim: usize) -> Self {
        Self {
            calls: AtomicU32::new(0),
            dim,
            delay: Duration::ZERO,
        }
    }

    /// Per-call delay, to widen race windows in pause/cancel specs.
    pub fn with_delay(dim: usize, delay: Duration) -> Self {
        Self {
            calls: AtomicU32::new(0),
            dim,
            delay,
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextEmbedClient for CountingEmbedClient {
    async fn create_embeddings(
        &self,
        _model: &str,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        Ok(inputs.iter().map(|_| vec![0.25; self.dim]).collect())
    }
}

/// Always rejects with an auth error.
pub struct AuthFailingEmbedClient;

#[async_trait]
impl TextEmbedClient for AuthFailingEmbedClient {
    async fn create_embeddings(
        &self,
        _model: &str,
        _inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedApiError> {
        Err(EmbedApiError::Auth {
            status: 401,
            message: "invalid api key".to_string(),
        })
    }
}

pub struct CountingImageClient {
    pub calls: AtomicU32,
    dim: usize,
}

impl CountingImageClient {
    pub fn new(dim: usize) -> Self {
        Self {
            calls: AtomicU32::new(0),
            dim,
        }
    }
}

#[async_trait]
impl ImageEmbedClient for CountingImageClient {
    async fn embed_image(
        &self,
        _model: &str,
        _image_path: &Path,
    ) -> Result<Vec<f32>, EmbedApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0.5; self.dim])
    }
}

pub enum MockPdfBehavior {
    /// Write a placeholder pdf at the target path.
    Succeed,
    /// Honor the contract of a conversion that never finishes: burn the
    /// whole timeout, then report it.
    TimeOut,
}

pub struct MockPdfConverter {
    behavior: MockPdfBehavior,
}

impl MockPdfConverter {
    pub fn succeeding() -> Self {
        Self {
            behavior: MockPdfBehavior::Succeed,
        }
    }

    pub fn timing_out() -> Self {
        Self {
            behavior: MockPdfBehavior::TimeOut,
        }
    }
}

#[async_trait]
impl PdfConvert for MockPdfConverter {
    async fn convert(
        &self,
        pptx_path: &Path,
        out_pdf: &Path,
        timeout: Duration,
    ) -> Result<(), PdfConvertError> {
        match self.behavior {
            MockPdfBehavior::Succeed => {
                if let Some(parent) = out_pdf.parent() {
                    std::fs::create_dir_all(parent).map_err(PdfConvertError::Io)?;
                }
                std::fs::write(out_pdf, b"%PDF-1.4 fake").map_err(PdfConvertError::Io)?;
                Ok(())
            }
            MockPdfBehavior::TimeOut => {
                tokio::time::sleep(timeout).await;
                Err(PdfConvertError::Timeout {
                    path: pptx_path.to_path_buf(),
                    timeout_sec: timeout.as_secs(),
                })
            }
        }
    }
}

/// Writes a real image of the requested size so dimension assertions can
/// re-open it.
pub struct MockThumbRenderer;

#[async_trait]
impl ThumbRender for MockThumbRenderer {
    async fn render(
        &self,
        _pdf_path: &Path,
        _page_index: u16,
        out_path: &Path,
        width: u32,
        height: u32,
    ) -> Result<(), ThumbRenderError> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([240, 240, 240]));
        img.save(out_path)
            .map_err(|source| ThumbRenderError::Write {
                path: out_path.to_path_buf(),
                source,
            })?;
        Ok(())
    }
}
