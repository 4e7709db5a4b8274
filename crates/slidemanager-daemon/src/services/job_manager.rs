//! The orchestration core: planning, worker pools, per-page checkpoints,
//! pause/resume/cancel, the watchdog, and the per-job stats ticker.
//!
//! Ownership rule: within one job this manager is the only writer of the
//! job's task and artifact rows. Workers hold ids, never row objects, and
//! all durable state flows through the store's short transactions.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{stream, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::JobOptions;
use crate::constants::{
    codes, DEFAULT_TEXT_EMBED_DIM, DEFAULT_WATCHDOG_THRESHOLD_SEC, WATCHDOG_TICK_SEC,
};
use crate::paths::{LibraryPaths, PathError};
use crate::services::aspect::{detect_aspect_from_pptx, Aspect};
use crate::services::embedder::{
    embed_text_batch, pack_f32, zero_vector, EmbedApiError, ImageEmbedClient, TextEmbedClient,
};
use crate::services::event_bus::{Event, EventBus};
use crate::services::pdf_convert::PdfConvert;
use crate::services::planner::{file_changed, scan_files_under, scan_specific_files, slide_count, FileScan};
use crate::services::rate_limit::DualTokenBucket;
use crate::services::text_extract::extract_page_text;
use crate::services::thumb_render::{thumb_size, ThumbRender};
use crate::store::{
    now_epoch, ArtifactKind, ArtifactStatus, JobStatus, Store, StoreError,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const PDF_TASK_PRIORITY: i64 = 10;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid library root: {path}")]
    InvalidRoot { path: PathBuf },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to encode job options: {0}")]
    Options(#[from] serde_json::Error),
}

/// Worker-side cancellation error; pause is absorbed inside `checkpoint`.
struct Cancelled;

enum PhaseError {
    Cancelled,
    Store(StoreError),
    Scan(std::io::Error),
}

impl From<StoreError> for PhaseError {
    fn from(err: StoreError) -> Self {
        PhaseError::Store(err)
    }
}

impl From<Cancelled> for PhaseError {
    fn from(_: Cancelled) -> Self {
        PhaseError::Cancelled
    }
}

/// Cooperative control token checked before dequeuing, before external IO,
/// and at every page boundary.
#[derive(Clone)]
struct ControlToken {
    cancel: watch::Receiver<bool>,
    pause: watch::Receiver<bool>,
}

impl ControlToken {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Wait out a pause; error out on cancel.
    async fn checkpoint(&mut self) -> Result<(), Cancelled> {
        loop {
            if *self.cancel.borrow() {
                return Err(Cancelled);
            }
            if !*self.pause.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = self.pause.changed() => {}
                _ = self.cancel.changed() => {}
            }
        }
    }
}

struct JobHandle {
    cancel_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
    paths: LibraryPaths,
    watchdog_threshold_sec: i64,
}

pub struct JobManager {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    pdf: Arc<dyn PdfConvert>,
    thumbs: Arc<dyn ThumbRender>,
    text_embed: Arc<dyn TextEmbedClient>,
    image_embed: Arc<dyn ImageEmbedClient>,
    jobs: Mutex<HashMap<String, JobHandle>>,
    job_counter: AtomicU64,
}

impl JobManager {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        pdf: Arc<dyn PdfConvert>,
        thumbs: Arc<dyn ThumbRender>,
        text_embed: Arc<dyn TextEmbedClient>,
        image_embed: Arc<dyn ImageEmbedClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            pdf,
            thumbs,
            text_embed,
            image_embed,
            jobs: Mutex::new(HashMap::new()),
            job_counter: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    /// Validate the root, persist the job row, and spawn the run task.
    pub fn create_job(
        self: &Arc<Self>,
        library_root: &Path,
        options: JobOptions,
    ) -> Result<String, JobError> {
        let paths = LibraryPaths::new(library_root).map_err(|_| JobError::InvalidRoot {
            path: library_root.to_path_buf(),
        })?;
        let seq = self.job_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let job_id = format!("J{}_{}_{}", now_epoch(), std::process::id(), seq);
        let options_json = serde_json::to_string(&options)?;
        self.store
            .insert_job(&job_id, &library_root.to_string_lossy(), &options_json)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        let token = ControlToken {
            cancel: cancel_rx,
            pause: pause_rx,
        };
        self.lock_jobs().insert(
            job_id.clone(),
            JobHandle {
                cancel_tx,
                pause_tx,
                paths: paths.clone(),
                watchdog_threshold_sec: options.watchdog_threshold_sec,
            },
        );
        self.emit(
            &job_id,
            "job_created",
            json!({ "library_root": library_root.to_string_lossy() }),
        );

        let manager = Arc::clone(self);
        let spawn_id = job_id.clone();
        tokio::spawn(async move {
            manager.run_job(spawn_id, paths, options, token).await;
        });
        Ok(job_id)
    }

    /// Pause: workers may finish the page in flight but start no new one.
    pub fn pause_job(&self, job_id: &str) -> Result<(), StoreError> {
        if let Some(handle) = self.lock_jobs().get(job_id) {
            let _ = handle.pause_tx.send(true);
        }
        if self.store.set_job_status(job_id, JobStatus::Paused)? {
            self.emit(job_id, "job_state_changed", json!({ "status": "paused" }));
        }
        Ok(())
    }

    /// Resume: clear the pause flag; workers pick up from the persistent
    /// queue, never from any in-memory pending set.
    pub fn resume_job(&self, job_id: &str) -> Result<(), StoreError> {
        if let Some(handle) = self.lock_jobs().get(job_id) {
            let _ = handle.pause_tx.send(false);
        }
        if self.store.set_job_status(job_id, JobStatus::Running)? {
            self.emit(job_id, "job_state_changed", json!({ "status": "running" }));
        }
        Ok(())
    }

    /// Cancel: flag the token, then sweep queued/running work to
    /// `cancelled`. Idempotent — cancelling a terminal or unknown job is a
    /// successful no-op.
    pub fn cancel_job(&self, job_id: &str) -> Result<(), StoreError> {
        let Some(job) = self.store.job_row(job_id)? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        if let Some(handle) = self.lock_jobs().get(job_id) {
            let _ = handle.cancel_tx.send(true);
            // Unblock anything parked on the pause condition.
            let _ = handle.pause_tx.send(false);
        }
        if self
            .store
            .set_job_status(job_id, JobStatus::CancelRequested)?
        {
            self.emit(
                job_id,
                "job_state_changed",
                json!({ "status": "cancel_requested" }),
            );
        }
        if self.store.cancel_sweep(job_id)? {
            self.emit(job_id, "job_finished", json!({ "status": "cancelled" }));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Watchdog
    // ------------------------------------------------------------------

    pub fn spawn_watchdog(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(WATCHDOG_TICK_SEC));
            loop {
                ticker.tick().await;
                if let Err(err) = manager.watchdog_tick() {
                    tracing::warn!(%err, "watchdog tick failed");
                }
            }
        })
    }

    /// One watchdog pass: any `running` task whose heartbeat is older than
    /// its job's threshold is forced to `error` with `WATCHDOG_TIMEOUT`.
    /// Returns the expired task ids.
    pub fn watchdog_tick(&self) -> Result<Vec<i64>, StoreError> {
        self.watchdog_tick_at(now_epoch())
    }

    /// Watchdog pass against an explicit clock, so staleness is testable
    /// without backdating rows.
    pub fn watchdog_tick_at(&self, now: i64) -> Result<Vec<i64>, StoreError> {
        let mut expired = Vec::new();
        for row in self.store.running_tasks()? {
            let threshold = self
                .lock_jobs()
                .get(&row.job_id)
                .map(|handle| handle.watchdog_threshold_sec)
                .unwrap_or(DEFAULT_WATCHDOG_THRESHOLD_SEC);
            let heartbeat = row.heartbeat_at.or(row.started_at).unwrap_or(now);
            if now - heartbeat <= threshold {
                continue;
            }
            let page = match (row.page_id, ArtifactKind::parse(&row.kind)) {
                (Some(page_id), Some(kind)) => Some((page_id, kind)),
                _ => None,
            };
            if self.store.expire_task(row.task_id, page)? {
                tracing::warn!(
                    task_id = row.task_id,
                    job_id = %row.job_id,
                    kind = %row.kind,
                    "watchdog expired a stalled task"
                );
                self.emit(
                    &row.job_id,
                    "task_error",
                    json!({
                        "task_id": row.task_id,
                        "kind": row.kind,
                        "error_code": codes::WATCHDOG_TIMEOUT,
                    }),
                );
                expired.push(row.task_id);
            }
        }
        Ok(expired)
    }

    // ------------------------------------------------------------------
    // Job run loop
    // ------------------------------------------------------------------

    async fn run_job(
        self: Arc<Self>,
        job_id: String,
        paths: LibraryPaths,
        options: JobOptions,
        mut token: ControlToken,
    ) {
        if self
            .store
            .set_job_status(&job_id, JobStatus::Planning)
            .unwrap_or(false)
        {
            self.emit(&job_id, "job_state_changed", json!({ "status": "planning" }));
        }
        let ticker = self.spawn_stats_ticker(job_id.clone());

        let planned = self.plan(&job_id, &paths, &options, &mut token).await;
        let outcome: Result<(), PhaseError> = match planned {
            Err(err) => Err(err),
            Ok(()) => {
                if self
                    .store
                    .set_job_status(&job_id, JobStatus::Running)
                    .unwrap_or(false)
                {
                    self.emit(&job_id, "job_state_changed", json!({ "status": "running" }));
                }
                self.run_phases(&job_id, &paths, &options, &token).await
            }
        };

        match outcome {
            Ok(()) if token.cancelled() => self.finish_cancelled(&job_id),
            Ok(()) => self.finish_completed(&job_id),
            Err(PhaseError::Cancelled) => self.finish_cancelled(&job_id),
            Err(PhaseError::Store(err)) => self.finish_failed(&job_id, &err.to_string()),
            Err(PhaseError::Scan(err)) => self.finish_failed(&job_id, &err.to_string()),
        }

        ticker.abort();
        self.lock_jobs().remove(&job_id);
    }

    /// Phase DAG: text (+bm25) first, then the pdf → thumbs → img_vec chain
    /// and the text_vec pipeline run concurrently. text_vec only needs the
    /// text payloads; the image side only needs the converted PDFs.
    async fn run_phases(
        &self,
        job_id: &str,
        paths: &LibraryPaths,
        options: &JobOptions,
        token: &ControlToken,
    ) -> Result<(), PhaseError> {
        self.run_text_phase(job_id, options, token).await?;
        let image_chain = async {
            self.run_pdf_phase(job_id, paths, options, token).await?;
            self.run_img_vec_phase(job_id, options, token).await
        };
        tokio::try_join!(image_chain, self.run_text_vec_phase(job_id, options, token))?;
        Ok(())
    }

    fn finish_completed(&self, job_id: &str) {
        if let Err(err) = self.store.finalize_sweep(job_id) {
            tracing::warn!(%err, job_id, "finalize sweep failed");
        }
        let counters = self.store.job_counters(job_id).unwrap_or_default();
        let summary = json!({ "counters": &counters });
        if let Err(err) = self.store.set_job_summary(job_id, &summary.to_string()) {
            tracing::warn!(%err, job_id, "failed to persist job summary");
        }
        if self
            .store
            .set_job_status(job_id, JobStatus::Completed)
            .unwrap_or(false)
        {
            self.emit(
                job_id,
                "job_finished",
                json!({ "status": "completed", "counters": &counters }),
            );
        }
    }

    fn finish_failed(&self, job_id: &str, message: &str) {
        tracing::error!(job_id, message, "job failed");
        if self
            .store
            .set_job_status(job_id, JobStatus::Failed)
            .unwrap_or(false)
        {
            self.emit(
                job_id,
                "job_finished",
                json!({ "status": "failed", "error": message }),
            );
        }
    }

    fn finish_cancelled(&self, job_id: &str) {
        match self.store.cancel_sweep(job_id) {
            Ok(true) => self.emit(job_id, "job_finished", json!({ "status": "cancelled" })),
            Ok(false) => {}
            Err(err) => tracing::warn!(%err, job_id, "cancel sweep failed"),
        }
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    async fn plan(
        &self,
        job_id: &str,
        paths: &LibraryPaths,
        options: &JobOptions,
        token: &mut ControlToken,
    ) -> Result<(), PhaseError> {
        let root = paths.root().to_path_buf();
        let mut skipped_outside_root = 0usize;

        let scans: Vec<FileScan> = if options.file_paths.is_empty() {
            let recursive = options.recursive;
            let scan_root = root.clone();
            tokio::task::spawn_blocking(move || scan_files_under(&scan_root, recursive))
                .await
                .map_err(|err| PhaseError::Scan(std::io::Error::other(err)))?
                .map_err(PhaseError::Scan)?
        } else {
            let canonical_root = root.canonicalize().unwrap_or(root.clone());
            scan_specific_files(&options.file_paths)
                .into_iter()
                .filter(|scan| {
                    let inside = scan.path.starts_with(&canonical_root);
                    if !inside {
                        skipped_outside_root += 1;
                        tracing::warn!(path = %scan.path.display(), "skipping file outside the library root");
                    }
                    inside
                })
                .collect()
        };

        let total = scans.len();
        for (index, scan) in scans.iter().enumerate() {
            token.checkpoint().await?;
            self.plan_file(job_id, options, scan).await?;
            self.emit(
                job_id,
                "planning_progress",
                json!({
                    "current": index + 1,
                    "total": total,
                    "path": scan.path.to_string_lossy(),
                }),
            );
        }

        let task_counts = self.store.task_counts_by_kind(job_id)?;
        let task_total: i64 = task_counts.values().sum();
        if task_total == 0 {
            tracing::warn!(job_id, files = total, "planning produced no tasks");
        }
        self.emit(
            job_id,
            "planning_finished",
            json!({
                "files": total,
                "task_counts": task_counts,
                "task_total": task_total,
                "skipped": { "outside_root": skipped_outside_root },
            }),
        );
        Ok(())
    }

    async fn plan_file(
        &self,
        job_id: &str,
        options: &JobOptions,
        scan: &FileScan,
    ) -> Result<(), PhaseError> {
        let path_str = scan.path.to_string_lossy().into_owned();
        let prev = self.store.get_file_by_path(&path_str)?;
        let changed = file_changed(prev.as_ref(), scan) || options.force_rebuild;
        let file_id = self
            .store
            .upsert_file(&path_str, scan.size_bytes, scan.mtime_epoch)?;

        let probe_path = scan.path.clone();
        let probed = tokio::task::spawn_blocking(move || {
            let aspect = detect_aspect_from_pptx(&probe_path);
            let slides = slide_count(&probe_path);
            (aspect, slides)
        })
        .await;
        let (aspect, slides) = match probed {
            Ok(result) => result,
            Err(err) => {
                self.store.set_file_scan_error(file_id, &err.to_string())?;
                return Ok(());
            }
        };
        self.store.set_file_aspect(file_id, aspect.as_str())?;
        let slides = match slides {
            Ok(count) => count,
            Err(err) => {
                // Unreadable package: record and move on, the job survives.
                tracing::warn!(path = %path_str, %err, "slide count failed");
                self.store.set_file_scan_error(file_id, &err.to_string())?;
                return Ok(());
            }
        };
        self.store.set_file_slide_count(file_id, i64::from(slides))?;

        let page_ids = self.store.ensure_pages_rows(
            file_id,
            slides,
            aspect.as_str(),
            scan.size_bytes,
            scan.mtime_epoch,
        )?;

        let mut need_pdf = false;
        for page_id in page_ids {
            let statuses = self.store.artifact_statuses(page_id)?;
            let needs = |kind: ArtifactKind| -> bool {
                if changed {
                    return true;
                }
                match statuses.get(&kind) {
                    None => true,
                    Some(ArtifactStatus::Ready) | Some(ArtifactStatus::Skipped) => false,
                    Some(_) => true,
                }
            };

            if options.enable_text && needs(ArtifactKind::Text) {
                self.store
                    .queue_artifact(job_id, page_id, ArtifactKind::Text, &json!({ "v": 1 }))?;
            }
            if options.enable_bm25 && needs(ArtifactKind::Bm25) {
                self.store
                    .queue_artifact(job_id, page_id, ArtifactKind::Bm25, &json!({ "v": 1 }))?;
            }
            if options.enable_thumb && needs(ArtifactKind::Thumb) {
                let (width, height) = thumb_size(aspect, &options.thumb);
                self.store.queue_artifact(
                    job_id,
                    page_id,
                    ArtifactKind::Thumb,
                    &json!({ "v": 1, "w": width, "h": height, "aspect": aspect.as_str() }),
                )?;
                need_pdf = true;
            }
            if options.enable_text_vec && needs(ArtifactKind::TextVec) {
                self.store.queue_artifact(
                    job_id,
                    page_id,
                    ArtifactKind::TextVec,
                    &json!({ "v": 1, "model": options.embed.model_text }),
                )?;
            }
            if options.enable_img_vec && options.enable_thumb && needs(ArtifactKind::ImgVec) {
                self.store.queue_artifact(
                    job_id,
                    page_id,
                    ArtifactKind::ImgVec,
                    &json!({ "v": 1, "model": options.embed.model_image }),
                )?;
            }
        }

        if need_pdf {
            self.store
                .queue_file_pdf_task(job_id, file_id, PDF_TASK_PRIORITY)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase 1: text extraction (+ bm25)
    // ------------------------------------------------------------------

    async fn run_text_phase(
        &self,
        job_id: &str,
        options: &JobOptions,
        token: &ControlToken,
    ) -> Result<(), PhaseError> {
        if !options.enable_text {
            return Ok(());
        }
        let tasks = self.store.queued_text_tasks(job_id)?;
        let with_bm25 = options.enable_bm25;

        stream::iter(tasks)
            .for_each_concurrent(options.text_concurrency.max(1), |task| {
                let mut token = token.clone();
                async move {
                    if token.checkpoint().await.is_err() {
                        return;
                    }
                    let started = self
                        .store
                        .task_start(task.task_id, Some((task.page_id, ArtifactKind::Text)));
                    if !matches!(started, Ok(true)) {
                        return;
                    }
                    self.emit(
                        job_id,
                        "task_started",
                        json!({ "task_id": task.task_id, "kind": "text", "page_no": task.page_no }),
                    );

                    let path = PathBuf::from(&task.path);
                    let page_no = task.page_no;
                    let extracted = tokio::task::spawn_blocking(move || {
                        extract_page_text(&path, page_no)
                    })
                    .await;

                    match extracted {
                        Ok(Ok(text)) => {
                            match self.store.checkpoint_text_ready(
                                task.task_id,
                                task.page_id,
                                &text.raw,
                                &text.norm,
                                &text.sig,
                                with_bm25,
                            ) {
                                Ok(true) => {
                                    self.emit_artifact_ready(job_id, task.page_id, "text", &task.path, task.page_no);
                                    if with_bm25 {
                                        self.emit_artifact_ready(job_id, task.page_id, "bm25", &task.path, task.page_no);
                                    }
                                    self.emit(
                                        job_id,
                                        "task_progress",
                                        json!({ "task_id": task.task_id, "progress": 1.0 }),
                                    );
                                }
                                Ok(false) => {}
                                Err(err) => {
                                    tracing::error!(%err, task_id = task.task_id, "text checkpoint failed")
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            self.fail_text_task(job_id, &task, with_bm25, &err.to_string());
                        }
                        Err(join_err) => {
                            self.fail_text_task(job_id, &task, with_bm25, &join_err.to_string());
                        }
                    }
                }
            })
            .await;
        Ok(())
    }

    fn fail_text_task(
        &self,
        job_id: &str,
        task: &crate::store::TextTask,
        with_bm25: bool,
        message: &str,
    ) {
        tracing::warn!(task_id = task.task_id, page_no = task.page_no, %message, "text extraction failed");
        match self.store.fail_text_cascade(
            task.task_id,
            task.page_id,
            codes::TEXT_EXTRACT_FAIL,
            message,
            with_bm25,
        ) {
            Ok(true) => self.emit(
                job_id,
                "task_error",
                json!({
                    "task_id": task.task_id,
                    "kind": "text",
                    "page_no": task.page_no,
                    "error_code": codes::TEXT_EXTRACT_FAIL,
                }),
            ),
            Ok(false) => {}
            Err(err) => tracing::error!(%err, "failed to record text error"),
        }
    }

    // ------------------------------------------------------------------
    // Phase 2: PDF conversion, thumbnails
    // ------------------------------------------------------------------

    async fn run_pdf_phase(
        &self,
        job_id: &str,
        paths: &LibraryPaths,
        options: &JobOptions,
        token: &ControlToken,
    ) -> Result<(), PhaseError> {
        if !options.enable_thumb {
            return Ok(());
        }
        let pdf_tasks = self.store.queued_pdf_tasks(job_id)?;
        let timeout = Duration::from_secs(options.pdf.timeout_sec);

        stream::iter(pdf_tasks)
            .for_each_concurrent(options.pdf.max_concurrency.max(1), |pdf_task| {
                let mut token = token.clone();
                async move {
                    if token.checkpoint().await.is_err() {
                        return;
                    }
                    if !matches!(self.store.task_start(pdf_task.task_id, None), Ok(true)) {
                        return;
                    }
                    self.emit(
                        job_id,
                        "task_started",
                        json!({ "task_id": pdf_task.task_id, "kind": "pdf", "path": &pdf_task.path }),
                    );

                    let out_pdf = match paths.pdf_path(pdf_task.file_id) {
                        Ok(path) => path,
                        Err(err) => {
                            let _ = self.store.fail_task(
                                pdf_task.task_id,
                                codes::PDF_CONVERT_FAIL,
                                &err.to_string(),
                            );
                            return;
                        }
                    };

                    let converted = self
                        .with_heartbeat(
                            pdf_task.task_id,
                            self.pdf
                                .convert(Path::new(&pdf_task.path), &out_pdf, timeout),
                        )
                        .await;

                    match converted {
                        Ok(()) => {
                            if let Err(err) = self.store.finish_file_task(pdf_task.task_id) {
                                tracing::error!(%err, "failed to finish pdf task");
                                return;
                            }
                            self.run_thumbs_for_file(job_id, paths, options, &token, &pdf_task, &out_pdf)
                                .await;
                        }
                        Err(err) => {
                            let code = if err.is_timeout() {
                                codes::PDF_CONVERT_TIMEOUT
                            } else {
                                codes::PDF_CONVERT_FAIL
                            };
                            tracing::warn!(path = %pdf_task.path, %err, "pdf conversion failed");
                            let _ = self
                                .store
                                .fail_task(pdf_task.task_id, code, &err.to_string());
                            match self.store.fail_file_thumb_pipeline(
                                job_id,
                                pdf_task.file_id,
                                code,
                                &err.to_string(),
                            ) {
                                Ok(pages) => self.emit(
                                    job_id,
                                    "task_error",
                                    json!({
                                        "task_id": pdf_task.task_id,
                                        "kind": "pdf",
                                        "error_code": code,
                                        "failed_pages": pages.len(),
                                    }),
                                ),
                                Err(err) => {
                                    tracing::error!(%err, "failed to sweep thumb pipeline")
                                }
                            }
                        }
                    }
                }
            })
            .await;
        Ok(())
    }

    async fn run_thumbs_for_file(
        &self,
        job_id: &str,
        paths: &LibraryPaths,
        options: &JobOptions,
        token: &ControlToken,
        pdf_task: &crate::store::PdfTask,
        pdf_path: &Path,
    ) {
        let thumb_tasks = match self.store.queued_thumb_tasks(job_id, pdf_task.file_id) {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!(%err, "failed to list thumb tasks");
                return;
            }
        };

        stream::iter(thumb_tasks)
            .for_each_concurrent(options.thumb_concurrency.max(1), |thumb| {
                let mut token = token.clone();
                async move {
                    if token.checkpoint().await.is_err() {
                        return;
                    }
                    let started = self
                        .store
                        .task_start(thumb.task_id, Some((thumb.page_id, ArtifactKind::Thumb)));
                    if !matches!(started, Ok(true)) {
                        return;
                    }
                    self.emit(
                        job_id,
                        "task_started",
                        json!({ "task_id": thumb.task_id, "kind": "thumb", "page_no": thumb.page_no }),
                    );

                    let aspect = Aspect::parse(&thumb.aspect);
                    let (width, height) = thumb_size(aspect, &options.thumb);
                    let out_path = match paths.thumb_path(
                        pdf_task.file_id,
                        thumb.page_no,
                        aspect.as_str(),
                        width,
                        height,
                    ) {
                        Ok(path) => path,
                        Err(err) => {
                            let _ = self.store.fail_thumb_cascade(
                                thumb.task_id,
                                thumb.page_id,
                                codes::THUMB_RENDER_FAIL,
                                &err.to_string(),
                            );
                            return;
                        }
                    };

                    let rendered = self
                        .with_heartbeat(
                            thumb.task_id,
                            self.thumbs.render(
                                pdf_path,
                                thumb.page_no.saturating_sub(1) as u16,
                                &out_path,
                                width,
                                height,
                            ),
                        )
                        .await;

                    match rendered {
                        Ok(()) => {
                            match self.store.checkpoint_thumb_ready(
                                thumb.task_id,
                                thumb.page_id,
                                aspect.as_str(),
                                width,
                                height,
                                &out_path.to_string_lossy(),
                            ) {
                                Ok(true) => {
                                    self.emit_artifact_ready(
                                        job_id,
                                        thumb.page_id,
                                        "thumb",
                                        &pdf_task.path,
                                        thumb.page_no,
                                    );
                                    self.emit(
                                        job_id,
                                        "task_progress",
                                        json!({ "task_id": thumb.task_id, "progress": 1.0 }),
                                    );
                                }
                                Ok(false) => {}
                                Err(err) => {
                                    tracing::error!(%err, "thumb checkpoint failed")
                                }
                            }
                        }
                        Err(err) => {
                            tracing::warn!(page_no = thumb.page_no, %err, "thumbnail render failed");
                            match self.store.fail_thumb_cascade(
                                thumb.task_id,
                                thumb.page_id,
                                codes::THUMB_RENDER_FAIL,
                                &err.to_string(),
                            ) {
                                Ok(true) => self.emit(
                                    job_id,
                                    "task_error",
                                    json!({
                                        "task_id": thumb.task_id,
                                        "kind": "thumb",
                                        "page_no": thumb.page_no,
                                        "error_code": codes::THUMB_RENDER_FAIL,
                                    }),
                                ),
                                Ok(false) => {}
                                Err(err) => tracing::error!(%err, "failed to record thumb error"),
                            }
                        }
                    }
                }
            })
            .await;
    }

    // ------------------------------------------------------------------
    // Phase 3: text embeddings
    // ------------------------------------------------------------------

    async fn run_text_vec_phase(
        &self,
        job_id: &str,
        options: &JobOptions,
        token: &ControlToken,
    ) -> Result<(), PhaseError> {
        if !options.enable_text_vec {
            return Ok(());
        }
        let model = options.embed.model_text.as_str();
        let limiter = DualTokenBucket::new(options.embed.req_per_min, options.embed.tok_per_min);
        let rows = self.store.queued_text_vec_tasks(job_id)?;
        let mut token = token.clone();

        // Resolve cache hits and zero-vector pages first; collect the rest.
        let mut pending: Vec<(i64, i64, String, String)> = Vec::new();
        for row in rows {
            token.checkpoint().await?;

            if row.text_status != Some(ArtifactStatus::Ready) {
                if matches!(
                    self.store.fail_page_task(
                        row.task_id,
                        row.page_id,
                        ArtifactKind::TextVec,
                        codes::TEXT_EXTRACT_FAIL,
                        "text artifact is not ready",
                    ),
                    Ok(true)
                ) {
                    self.emit(
                        job_id,
                        "task_error",
                        json!({
                            "task_id": row.task_id,
                            "kind": "text_vec",
                            "error_code": codes::TEXT_EXTRACT_FAIL,
                        }),
                    );
                }
                continue;
            }

            let norm = row.norm_text.unwrap_or_default();
            let sig = row.text_sig.unwrap_or_default();

            if norm.trim().is_empty() {
                if !matches!(
                    self.store
                        .task_start(row.task_id, Some((row.page_id, ArtifactKind::TextVec))),
                    Ok(true)
                ) {
                    continue;
                }
                let dim = self.zero_dim(model);
                let blob = zero_vector(dim);
                let sentinel = format!("__zero__:{}:{}", row.page_id, now_epoch());
                match self.store.checkpoint_text_vec_ready(
                    row.task_id,
                    row.page_id,
                    model,
                    &sentinel,
                    Some((dim, &blob)),
                ) {
                    Ok(true) => self.emit(
                        job_id,
                        "artifact_state_changed",
                        json!({ "page_id": row.page_id, "kind": "text_vec", "status": "ready" }),
                    ),
                    Ok(false) => {}
                    Err(err) => tracing::error!(%err, "zero-vector checkpoint failed"),
                }
                continue;
            }

            match self.store.text_cache_lookup(model, &sig) {
                Ok(Some(hit)) => {
                    if !matches!(
                        self.store
                            .task_start(row.task_id, Some((row.page_id, ArtifactKind::TextVec))),
                        Ok(true)
                    ) {
                        continue;
                    }
                    if hit.blob_len != hit.dim * 4 {
                        let _ = self.store.fail_page_task(
                            row.task_id,
                            row.page_id,
                            ArtifactKind::TextVec,
                            codes::EMBED_DIM_MISMATCH,
                            "cached vector length disagrees with its dim",
                        );
                        self.emit(
                            job_id,
                            "task_error",
                            json!({
                                "task_id": row.task_id,
                                "kind": "text_vec",
                                "error_code": codes::EMBED_DIM_MISMATCH,
                            }),
                        );
                        continue;
                    }
                    match self.store.checkpoint_text_vec_ready(
                        row.task_id,
                        row.page_id,
                        model,
                        &sig,
                        None,
                    ) {
                        Ok(true) => self.emit(
                            job_id,
                            "artifact_state_changed",
                            json!({ "page_id": row.page_id, "kind": "text_vec", "status": "ready" }),
                        ),
                        Ok(false) => {}
                        Err(err) => tracing::error!(%err, "cache-link checkpoint failed"),
                    }
                }
                Ok(None) => pending.push((row.task_id, row.page_id, norm, sig)),
                Err(err) => tracing::error!(%err, "cache lookup failed"),
            }
        }

        // Dedup by signature before going remote: a signature shared by N
        // pages costs exactly one upstream input, and the extra pages just
        // link against the fresh cache row.
        let mut sig_order: Vec<String> = Vec::new();
        let mut by_sig: HashMap<String, (String, Vec<(i64, i64)>)> = HashMap::new();
        for (task_id, page_id, norm, sig) in pending {
            match by_sig.get_mut(&sig) {
                Some((_, holders)) => holders.push((task_id, page_id)),
                None => {
                    by_sig.insert(sig.clone(), (norm, vec![(task_id, page_id)]));
                    sig_order.push(sig);
                }
            }
        }

        let mut session_dim: Option<usize> = None;
        let batch_size = options.embed.batch_size.max(1);
        let mut index = 0;
        while index < sig_order.len() {
            token.checkpoint().await?;
            let batch_sigs = &sig_order[index..(index + batch_size).min(sig_order.len())];
            index += batch_sigs.len();

            let mut inputs = Vec::with_capacity(batch_sigs.len());
            for sig in batch_sigs {
                let (norm, holders) = &by_sig[sig];
                inputs.push(norm.clone());
                for (task_id, page_id) in holders {
                    if matches!(
                        self.store
                            .task_start(*task_id, Some((*page_id, ArtifactKind::TextVec))),
                        Ok(true)
                    ) {
                        self.emit(
                            job_id,
                            "task_started",
                            json!({ "task_id": task_id, "kind": "text_vec" }),
                        );
                    }
                }
            }

            let fallback_dim = session_dim.unwrap_or_else(|| self.zero_dim(model));
            let embedded = embed_text_batch(
                self.text_embed.as_ref(),
                model,
                &inputs,
                &limiter,
                options.embed.max_retries,
                fallback_dim,
            )
            .await;

            match embedded {
                Ok(vectors) => {
                    for (sig, vector) in batch_sigs.iter().zip(vectors) {
                        let (_, holders) = &by_sig[sig];
                        if let Some(expected) = session_dim {
                            if vector.len() != expected {
                                for (task_id, page_id) in holders {
                                    let _ = self.store.fail_page_task(
                                        *task_id,
                                        *page_id,
                                        ArtifactKind::TextVec,
                                        codes::EMBED_DIM_MISMATCH,
                                        &format!("expected dim {expected}, got {}", vector.len()),
                                    );
                                    self.emit(
                                        job_id,
                                        "task_error",
                                        json!({
                                            "task_id": task_id,
                                            "kind": "text_vec",
                                            "error_code": codes::EMBED_DIM_MISMATCH,
                                        }),
                                    );
                                }
                                continue;
                            }
                        } else {
                            session_dim = Some(vector.len());
                        }
                        let blob = pack_f32(&vector);
                        for (position, (task_id, page_id)) in holders.iter().enumerate() {
                            let fresh_row = if position == 0 {
                                Some((vector.len(), blob.as_slice()))
                            } else {
                                None
                            };
                            match self.store.checkpoint_text_vec_ready(
                                *task_id,
                                *page_id,
                                model,
                                sig,
                                fresh_row,
                            ) {
                                Ok(true) => self.emit(
                                    job_id,
                                    "artifact_state_changed",
                                    json!({ "page_id": page_id, "kind": "text_vec", "status": "ready" }),
                                ),
                                Ok(false) => {}
                                Err(err) => tracing::error!(%err, "text_vec checkpoint failed"),
                            }
                        }
                    }
                }
                Err(err) => {
                    let code = embed_error_code(&err);
                    tracing::warn!(%err, code, "text embedding batch failed");
                    for sig in batch_sigs {
                        let (_, holders) = &by_sig[sig];
                        for (task_id, page_id) in holders {
                            if matches!(
                                self.store.fail_page_task(
                                    *task_id,
                                    *page_id,
                                    ArtifactKind::TextVec,
                                    code,
                                    &err.to_string(),
                                ),
                                Ok(true)
                            ) {
                                self.emit(
                                    job_id,
                                    "task_error",
                                    json!({ "task_id": task_id, "kind": "text_vec", "error_code": code }),
                                );
                            }
                        }
                    }
                    if err.is_auth() {
                        // Credentials will not heal mid-job: abort this
                        // pipeline, leave the others running.
                        match self.store.sweep_text_vec_errors(
                            job_id,
                            codes::OPENAI_AUTH,
                            "embedding credentials rejected",
                        ) {
                            Ok(swept) => {
                                for (task_id, _) in swept {
                                    self.emit(
                                        job_id,
                                        "task_error",
                                        json!({
                                            "task_id": task_id,
                                            "kind": "text_vec",
                                            "error_code": codes::OPENAI_AUTH,
                                        }),
                                    );
                                }
                            }
                            Err(err) => tracing::error!(%err, "auth sweep failed"),
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Dimension for zero vectors before any remote response has been seen:
    /// last persisted dim for the model, then the model default.
    fn zero_dim(&self, model: &str) -> usize {
        self.store
            .last_model_dim(model)
            .ok()
            .flatten()
            .map(|dim| dim as usize)
            .unwrap_or(DEFAULT_TEXT_EMBED_DIM)
    }

    // ------------------------------------------------------------------
    // Phase 4: image embeddings
    // ------------------------------------------------------------------

    async fn run_img_vec_phase(
        &self,
        job_id: &str,
        options: &JobOptions,
        token: &ControlToken,
    ) -> Result<(), PhaseError> {
        if !options.enable_img_vec {
            return Ok(());
        }
        let model = options.embed.model_image.clone();
        let rows = self.store.queued_img_vec_tasks(job_id)?;

        stream::iter(rows)
            .for_each_concurrent(options.img_vec_concurrency.max(1), |row| {
                let mut token = token.clone();
                let model = model.clone();
                async move {
                    if token.checkpoint().await.is_err() {
                        return;
                    }
                    let thumb_ready = row.thumb_status == Some(ArtifactStatus::Ready);
                    let Some(thumb_path) = row.thumb_path.filter(|_| thumb_ready) else {
                        if matches!(
                            self.store.fail_page_task(
                                row.task_id,
                                row.page_id,
                                ArtifactKind::ImgVec,
                                codes::THUMB_RENDER_FAIL,
                                "thumbnail is not ready",
                            ),
                            Ok(true)
                        ) {
                            self.emit(
                                job_id,
                                "task_error",
                                json!({
                                    "task_id": row.task_id,
                                    "kind": "img_vec",
                                    "error_code": codes::THUMB_RENDER_FAIL,
                                }),
                            );
                        }
                        return;
                    };
                    let started = self
                        .store
                        .task_start(row.task_id, Some((row.page_id, ArtifactKind::ImgVec)));
                    if !matches!(started, Ok(true)) {
                        return;
                    }
                    self.emit(
                        job_id,
                        "task_started",
                        json!({ "task_id": row.task_id, "kind": "img_vec" }),
                    );

                    let embedded = self
                        .with_heartbeat(
                            row.task_id,
                            self.image_embed.embed_image(&model, Path::new(&thumb_path)),
                        )
                        .await;

                    match embedded {
                        Ok(vector) => {
                            let blob = pack_f32(&vector);
                            match self.store.checkpoint_img_vec_ready(
                                row.task_id,
                                row.page_id,
                                &model,
                                vector.len(),
                                &blob,
                            ) {
                                Ok(true) => self.emit(
                                    job_id,
                                    "artifact_state_changed",
                                    json!({ "page_id": row.page_id, "kind": "img_vec", "status": "ready" }),
                                ),
                                Ok(false) => {}
                                Err(err) => tracing::error!(%err, "img_vec checkpoint failed"),
                            }
                        }
                        Err(err) => {
                            let code = embed_error_code(&err);
                            if matches!(
                                self.store.fail_page_task(
                                    row.task_id,
                                    row.page_id,
                                    ArtifactKind::ImgVec,
                                    code,
                                    &err.to_string(),
                                ),
                                Ok(true)
                            ) {
                                self.emit(
                                    job_id,
                                    "task_error",
                                    json!({ "task_id": row.task_id, "kind": "img_vec", "error_code": code }),
                                );
                            }
                        }
                    }
                }
            })
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Run a future while refreshing the task heartbeat so the watchdog
    /// keeps its distance from healthy long-running work.
    async fn with_heartbeat<T>(
        &self,
        task_id: i64,
        work: impl std::future::Future<Output = T>,
    ) -> T {
        tokio::pin!(work);
        let mut beat = tokio::time::interval(HEARTBEAT_INTERVAL);
        beat.tick().await;
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = beat.tick() => {
                    if let Err(err) = self.store.task_heartbeat(task_id) {
                        tracing::warn!(%err, task_id, "heartbeat update failed");
                    }
                }
            }
        }
    }

    fn spawn_stats_ticker(self: &Arc<Self>, job_id: String) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let mut last_ready: u64 = 0;
            loop {
                ticker.tick().await;
                let job = match manager.store.job_row(&job_id) {
                    Ok(Some(job)) => job,
                    _ => break,
                };
                if job.status.is_terminal() {
                    break;
                }
                let counters = manager.store.job_counters(&job_id).unwrap_or_default();
                let now_running = manager.store.now_running(&job_id).ok().flatten();
                let ready = counters.ready_total();
                let pages_per_sec = ready.saturating_sub(last_ready);
                last_ready = ready;
                manager.emit(
                    &job_id,
                    "stats_snapshot",
                    json!({
                        "counters": counters,
                        "now_running": now_running,
                        "rates": { "artifacts_per_sec": pages_per_sec },
                    }),
                );
            }
        })
    }

    fn emit_artifact_ready(&self, job_id: &str, page_id: i64, kind: &str, path: &str, page_no: u32) {
        self.emit(
            job_id,
            "artifact_state_changed",
            json!({
                "page_id": page_id,
                "kind": kind,
                "status": "ready",
                "file": path,
                "page_no": page_no,
            }),
        );
    }

    /// Publish to the bus, persist the event row, and append to the job's
    /// jsonl log. The bus never blocks; the durable writes are best-effort.
    fn emit(&self, job_id: &str, kind: &str, payload: serde_json::Value) {
        let ts = now_epoch();
        let event = self.bus.publish(job_id, kind, payload, ts);
        if let Err(err) =
            self.store
                .append_event(job_id, event.seq, ts, kind, &event.payload.to_string())
        {
            tracing::warn!(%err, job_id, kind, "failed to persist event");
        }
        self.append_job_log(&event);
    }

    fn append_job_log(&self, event: &Event) {
        let paths = self
            .lock_jobs()
            .get(&event.job_id)
            .map(|handle| handle.paths.clone());
        let Some(paths) = paths else {
            return;
        };
        let Ok(path) = paths.job_log_path(&event.job_id) else {
            return;
        };
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{line}");
        }
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobHandle>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn embed_error_code(err: &EmbedApiError) -> &'static str {
    match err {
        EmbedApiError::Auth { .. } => codes::OPENAI_AUTH,
        EmbedApiError::RateLimited(_) => codes::OPENAI_RATE_LIMIT,
        _ => codes::EMBED_FAIL,
    }
}
