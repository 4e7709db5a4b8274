//! End-to-end pipeline specs: incremental reindex, dedup, poisoned pages,
//! PDF failure sweeps, pause/resume, cancel idempotency, and the watchdog.

mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{
    build_rig, default_rig, slide_xml, text_only_options, wait_for_terminal, write_pptx,
    write_pptx_raw, AuthFailingEmbedClient, CountingEmbedClient, CountingImageClient,
    MockPdfConverter, MockThumbRenderer,
};
use slidemanager_daemon::config::JobOptions;
use slidemanager_daemon::store::{now_epoch, ArtifactKind, ArtifactStatus, JobStatus, Store};

fn page_ids(store: &Store, pptx: &std::path::Path) -> Vec<i64> {
    let canonical = pptx.canonicalize().expect("canonicalize fixture");
    let file = store
        .get_file_by_path(&canonical.to_string_lossy())
        .expect("file query")
        .expect("file row");
    store.page_ids_for_file(file.file_id).expect("page ids")
}

fn assert_all_tasks_terminal(store: &Store, job_id: &str) {
    for task in store.tasks_for_job(job_id).expect("tasks") {
        assert!(
            matches!(task.status.as_str(), "finished" | "error" | "cancelled" | "skipped"),
            "task {} ({}) left in non-terminal status {}",
            task.task_id,
            task.kind,
            task.status
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_incremental_reindex_reuses_the_embedding_cache() {
    let text_embed = Arc::new(CountingEmbedClient::new(8));
    let rig = build_rig(
        Arc::new(MockPdfConverter::succeeding()),
        Arc::new(MockThumbRenderer),
        text_embed.clone(),
        Arc::new(CountingImageClient::new(8)),
    );
    let pptx = write_pptx(
        rig.root.path(),
        "deck.pptx",
        &["alpha slide", "beta slide", "gamma slide"],
    );
    let options = JobOptions {
        enable_thumb: false,
        enable_img_vec: false,
        ..JobOptions::default()
    };

    let first = rig
        .manager
        .create_job(rig.root.path(), options.clone())
        .expect("first job");
    assert_eq!(wait_for_terminal(&rig.store, &first).await, JobStatus::Completed);
    assert_eq!(text_embed.call_count(), 1, "one batch for three fresh pages");

    // Same bytes, newer mtime: the planner must treat the file as changed.
    let file = std::fs::OpenOptions::new()
        .append(true)
        .open(&pptx)
        .expect("reopen fixture");
    file.set_modified(SystemTime::now() + Duration::from_secs(120))
        .expect("bump mtime");

    let second = rig
        .manager
        .create_job(rig.root.path(), options)
        .expect("second job");
    assert_eq!(wait_for_terminal(&rig.store, &second).await, JobStatus::Completed);

    assert_eq!(
        text_embed.call_count(),
        1,
        "unchanged text signatures must be answered from the cache"
    );
    for page_id in page_ids(&rig.store, &pptx) {
        for kind in [ArtifactKind::Text, ArtifactKind::Bm25, ArtifactKind::TextVec] {
            let artifact = rig
                .store
                .artifact_row(page_id, kind)
                .expect("artifact")
                .expect("row");
            assert_eq!(artifact.status, ArtifactStatus::Ready, "kind {kind:?}");
        }
        let text = rig
            .store
            .artifact_row(page_id, ArtifactKind::Text)
            .expect("artifact")
            .expect("row");
        assert!(text.attempts >= 2, "text was re-extracted on the second run");
    }
    assert_all_tasks_terminal(&rig.store, &second);
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_shared_text_costs_exactly_one_remote_call() {
    let text_embed = Arc::new(CountingEmbedClient::new(8));
    let rig = build_rig(
        Arc::new(MockPdfConverter::succeeding()),
        Arc::new(MockThumbRenderer),
        text_embed.clone(),
        Arc::new(CountingImageClient::new(8)),
    );
    let pptx = write_pptx(rig.root.path(), "twins.pptx", &["hello world", "hello world"]);
    let mut options = JobOptions {
        enable_thumb: false,
        enable_img_vec: false,
        enable_bm25: false,
        ..JobOptions::default()
    };
    // Batch size 1 would betray naive per-page batching; dedup must still
    // collapse the identical signatures into one upstream input.
    options.embed.batch_size = 1;

    let job = rig
        .manager
        .create_job(rig.root.path(), options)
        .expect("job");
    assert_eq!(wait_for_terminal(&rig.store, &job).await, JobStatus::Completed);

    assert_eq!(text_embed.call_count(), 1, "identical text embeds once");
    let pages = page_ids(&rig.store, &pptx);
    let model = JobOptions::default().embed.model_text;
    let first_link = rig
        .store
        .text_embedding_link(pages[0], &model)
        .expect("link")
        .expect("page 1 linked");
    let second_link = rig
        .store
        .text_embedding_link(pages[1], &model)
        .expect("link")
        .expect("page 2 linked");
    assert_eq!(first_link, second_link, "both pages share one cached sig");
    assert_eq!(rig.store.text_cache_count(&model).expect("count"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_poisoned_page_fails_alone_and_the_job_completes() {
    let rig = default_rig();
    let bodies = vec![
        slide_xml(&["first slide"]),
        // Unknown entity: the XML reader rejects this slide only.
        "<p:sld><a:t>bad &nosuchentity; text</a:t></p:sld>".to_string(),
        slide_xml(&["third slide"]),
    ];
    let pptx = write_pptx_raw(rig.root.path(), "poisoned.pptx", &bodies);

    let job = rig
        .manager
        .create_job(rig.root.path(), text_only_options())
        .expect("job");
    assert_eq!(wait_for_terminal(&rig.store, &job).await, JobStatus::Completed);

    let pages = page_ids(&rig.store, &pptx);
    assert_eq!(pages.len(), 3);
    let expectations = [
        (pages[0], ArtifactStatus::Ready, None),
        (pages[1], ArtifactStatus::Error, Some("TEXT_EXTRACT_FAIL")),
        (pages[2], ArtifactStatus::Ready, None),
    ];
    for (page_id, status, code) in expectations {
        let artifact = rig
            .store
            .artifact_row(page_id, ArtifactKind::Text)
            .expect("artifact")
            .expect("row");
        assert_eq!(artifact.status, status, "page {page_id}");
        assert_eq!(artifact.error_code.as_deref(), code, "page {page_id}");
    }
    assert_all_tasks_terminal(&rig.store, &job);
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_pdf_timeout_fails_thumbs_and_img_vecs_but_not_text() {
    let rig = build_rig(
        Arc::new(MockPdfConverter::timing_out()),
        Arc::new(MockThumbRenderer),
        Arc::new(CountingEmbedClient::new(8)),
        Arc::new(CountingImageClient::new(8)),
    );
    let pptx = write_pptx(rig.root.path(), "slow.pptx", &["one", "two", "three"]);
    let mut options = JobOptions {
        enable_text_vec: false,
        ..JobOptions::default()
    };
    options.pdf.timeout_sec = 1;

    let job = rig
        .manager
        .create_job(rig.root.path(), options)
        .expect("job");
    assert_eq!(wait_for_terminal(&rig.store, &job).await, JobStatus::Completed);

    let pdf_task = rig
        .store
        .tasks_for_job(&job)
        .expect("tasks")
        .into_iter()
        .find(|t| t.kind == "pdf")
        .expect("pdf task exists");
    assert_eq!(pdf_task.status, "error");
    assert_eq!(pdf_task.error_code.as_deref(), Some("PDF_CONVERT_TIMEOUT"));

    for page_id in page_ids(&rig.store, &pptx) {
        for kind in [ArtifactKind::Thumb, ArtifactKind::ImgVec] {
            let artifact = rig
                .store
                .artifact_row(page_id, kind)
                .expect("artifact")
                .expect("row");
            assert_eq!(artifact.status, ArtifactStatus::Error, "kind {kind:?}");
            assert_eq!(
                artifact.error_code.as_deref(),
                Some("PDF_CONVERT_TIMEOUT"),
                "kind {kind:?}"
            );
        }
        let text = rig
            .store
            .artifact_row(page_id, ArtifactKind::Text)
            .expect("artifact")
            .expect("row");
        assert_eq!(text.status, ArtifactStatus::Ready, "text is unaffected");
    }
    assert_all_tasks_terminal(&rig.store, &job);
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_pause_freezes_ready_counts_and_resume_completes() {
    let page_count = 12usize;
    let text_embed = Arc::new(CountingEmbedClient::with_delay(
        8,
        Duration::from_millis(100),
    ));
    let rig = build_rig(
        Arc::new(MockPdfConverter::succeeding()),
        Arc::new(MockThumbRenderer),
        text_embed,
        Arc::new(CountingImageClient::new(8)),
    );
    let texts: Vec<String> = (0..page_count).map(|i| format!("slide number {i}")).collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    write_pptx(rig.root.path(), "long.pptx", &refs);
    let mut options = JobOptions {
        enable_thumb: false,
        enable_img_vec: false,
        enable_bm25: false,
        ..JobOptions::default()
    };
    options.embed.batch_size = 1;

    let job = rig
        .manager
        .create_job(rig.root.path(), options)
        .expect("job");

    // Wait until at least one text_vec artifact is ready, then pause.
    let mut saw_progress = false;
    for _ in 0..200 {
        let counters = rig.store.job_counters(&job).expect("counters");
        if counters.text_vec.ready >= 1 {
            saw_progress = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_progress, "job never produced a ready text_vec artifact");
    rig.manager.pause_job(&job).expect("pause");

    // Allow the in-flight page to land, then the count must freeze.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let frozen = rig.store.job_counters(&job).expect("counters").text_vec.ready;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let still = rig.store.job_counters(&job).expect("counters").text_vec.ready;
    assert_eq!(frozen, still, "no artifact reaches ready while paused");
    assert!(
        (still as usize) < page_count,
        "pause landed before the job finished"
    );

    rig.manager.resume_job(&job).expect("resume");
    assert_eq!(wait_for_terminal(&rig.store, &job).await, JobStatus::Completed);
    let counters = rig.store.job_counters(&job).expect("counters");
    assert_eq!(counters.text.ready as usize, page_count);
    assert_eq!(counters.text_vec.ready as usize, page_count);
    assert_all_tasks_terminal(&rig.store, &job);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_twice_is_idempotent() {
    let rig = build_rig(
        Arc::new(MockPdfConverter::timing_out()),
        Arc::new(MockThumbRenderer),
        Arc::new(CountingEmbedClient::new(8)),
        Arc::new(CountingImageClient::new(8)),
    );
    write_pptx(rig.root.path(), "deck.pptx", &["a", "b", "c"]);
    let mut options = JobOptions::default();
    options.pdf.timeout_sec = 10;

    let job = rig
        .manager
        .create_job(rig.root.path(), options)
        .expect("job");
    // Let the job reach its long-running pdf phase.
    for _ in 0..200 {
        let status = rig.store.job_row(&job).expect("job").expect("row").status;
        if status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    rig.manager.cancel_job(&job).expect("first cancel");
    let after_first: Vec<(i64, String)> = rig
        .store
        .tasks_for_job(&job)
        .expect("tasks")
        .into_iter()
        .map(|t| (t.task_id, t.status))
        .collect();

    rig.manager.cancel_job(&job).expect("second cancel succeeds too");
    let after_second: Vec<(i64, String)> = rig
        .store
        .tasks_for_job(&job)
        .expect("tasks")
        .into_iter()
        .map(|t| (t.task_id, t.status))
        .collect();

    assert_eq!(after_first, after_second, "second cancel changes nothing");
    let status = rig.store.job_row(&job).expect("job").expect("row").status;
    assert_eq!(status, JobStatus::Cancelled);
    assert_all_tasks_terminal(&rig.store, &job);
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_watchdog_expires_a_stalled_running_task() {
    let rig = default_rig();
    rig.store
        .insert_job("J_watch", rig.root.path().to_string_lossy().as_ref(), "{}")
        .expect("job row");
    let file_id = rig
        .store
        .upsert_file("/lib/stale.pptx", 10, 1)
        .expect("file");
    let pages = rig
        .store
        .ensure_pages_rows(file_id, 1, "16:9", 10, 1)
        .expect("pages");
    let task_id = rig
        .store
        .queue_artifact("J_watch", pages[0], ArtifactKind::Text, &serde_json::json!({}))
        .expect("queue");
    assert!(rig
        .store
        .task_start(task_id, Some((pages[0], ArtifactKind::Text)))
        .expect("start"));

    let mut events = rig.bus.subscribe("J_watch");
    let expired = rig
        .manager
        .watchdog_tick_at(now_epoch() + 999)
        .expect("tick");
    assert_eq!(expired, vec![task_id]);

    let task = rig
        .store
        .tasks_for_job("J_watch")
        .expect("tasks")
        .into_iter()
        .find(|t| t.task_id == task_id)
        .expect("task row");
    assert_eq!(task.status, "error");
    assert_eq!(task.error_code.as_deref(), Some("WATCHDOG_TIMEOUT"));

    let event = events.try_recv().expect("task_error event was published");
    assert_eq!(event.kind, "task_error");
    assert_eq!(event.payload["error_code"], "WATCHDOG_TIMEOUT");

    // A second tick finds nothing left to expire.
    let again = rig
        .manager
        .watchdog_tick_at(now_epoch() + 999)
        .expect("tick");
    assert!(again.is_empty(), "expiry is one-shot per task");
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_failure_aborts_text_vec_but_spares_other_pipelines() {
    let rig = build_rig(
        Arc::new(MockPdfConverter::succeeding()),
        Arc::new(MockThumbRenderer),
        Arc::new(AuthFailingEmbedClient),
        Arc::new(CountingImageClient::new(8)),
    );
    let pptx = write_pptx(rig.root.path(), "deck.pptx", &["one", "two", "three"]);
    let mut options = JobOptions {
        enable_thumb: false,
        enable_img_vec: false,
        ..JobOptions::default()
    };
    options.embed.batch_size = 1;
    options.embed.max_retries = 2;

    let job = rig
        .manager
        .create_job(rig.root.path(), options)
        .expect("job");
    assert_eq!(wait_for_terminal(&rig.store, &job).await, JobStatus::Completed);

    for page_id in page_ids(&rig.store, &pptx) {
        let text = rig
            .store
            .artifact_row(page_id, ArtifactKind::Text)
            .expect("artifact")
            .expect("row");
        assert_eq!(text.status, ArtifactStatus::Ready, "text pipeline survives");
        let vec_artifact = rig
            .store
            .artifact_row(page_id, ArtifactKind::TextVec)
            .expect("artifact")
            .expect("row");
        assert_eq!(vec_artifact.status, ArtifactStatus::Error);
        assert_eq!(vec_artifact.error_code.as_deref(), Some("OPENAI_AUTH"));
    }
    let errors = rig.store.errors_summary(&job).expect("summary");
    let auth_errors = errors
        .iter()
        .find(|(code, _)| code == "OPENAI_AUTH")
        .map(|(_, count)| *count)
        .unwrap_or(0);
    assert_eq!(auth_errors, 3, "every text_vec task records the auth error");
    assert_all_tasks_terminal(&rig.store, &job);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_pages_store_zero_vectors_without_remote_calls() {
    let text_embed = Arc::new(CountingEmbedClient::new(8));
    let rig = build_rig(
        Arc::new(MockPdfConverter::succeeding()),
        Arc::new(MockThumbRenderer),
        text_embed.clone(),
        Arc::new(CountingImageClient::new(8)),
    );
    // One slide with no text runs at all.
    let pptx = write_pptx_raw(rig.root.path(), "blank.pptx", &[slide_xml(&[])]);
    let options = JobOptions {
        enable_thumb: false,
        enable_img_vec: false,
        enable_bm25: false,
        ..JobOptions::default()
    };

    let job = rig
        .manager
        .create_job(rig.root.path(), options)
        .expect("job");
    assert_eq!(wait_for_terminal(&rig.store, &job).await, JobStatus::Completed);

    assert_eq!(text_embed.call_count(), 0, "empty text never goes remote");
    let pages = page_ids(&rig.store, &pptx);
    let model = JobOptions::default().embed.model_text;
    let (dim, blob) = rig
        .store
        .text_embedding_blob(pages[0], &model)
        .expect("blob query")
        .expect("vector stored");
    assert_eq!(blob.len() as i64, dim * 4, "blob is dim * 4 bytes");
    assert!(blob.iter().all(|b| *b == 0), "canonical zero vector");
}

#[tokio::test(flavor = "multi_thread")]
async fn thumbnails_match_thumb_size_and_feed_img_vec() {
    let image_embed = Arc::new(CountingImageClient::new(6));
    let rig = build_rig(
        Arc::new(MockPdfConverter::succeeding()),
        Arc::new(MockThumbRenderer),
        Arc::new(CountingEmbedClient::new(8)),
        image_embed.clone(),
    );
    let pptx = write_pptx(rig.root.path(), "visual.pptx", &["a", "b"]);
    let options = JobOptions {
        enable_text: false,
        enable_bm25: false,
        enable_text_vec: false,
        ..JobOptions::default()
    };

    let job = rig
        .manager
        .create_job(rig.root.path(), options)
        .expect("job");
    assert_eq!(wait_for_terminal(&rig.store, &job).await, JobStatus::Completed);

    let pages = page_ids(&rig.store, &pptx);
    let model = JobOptions::default().embed.model_image;
    for page_id in &pages {
        let thumb_path = rig
            .store
            .thumbnail_path(*page_id)
            .expect("query")
            .expect("thumbnail recorded");
        let img = image::open(&thumb_path).expect("thumbnail opens");
        // 16:9 fixture: 320x180, within the +-1px contract.
        assert!((img.width() as i64 - 320).abs() <= 1, "width {}", img.width());
        assert!((img.height() as i64 - 180).abs() <= 1, "height {}", img.height());

        let (dim, blob) = rig
            .store
            .image_embedding(*page_id, &model)
            .expect("query")
            .expect("image vector stored");
        assert_eq!(dim, 6);
        assert_eq!(blob.len(), 24);
    }
    assert_eq!(image_embed.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_all_tasks_terminal(&rig.store, &job);
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_jobs_leave_a_jsonl_event_log() {
    let rig = default_rig();
    write_pptx(rig.root.path(), "deck.pptx", &["hello"]);
    let job = rig
        .manager
        .create_job(rig.root.path(), text_only_options())
        .expect("job");
    assert_eq!(wait_for_terminal(&rig.store, &job).await, JobStatus::Completed);

    let log_path = rig
        .root
        .path()
        .join(".slidemanager")
        .join("logs")
        .join("jobs")
        .join(format!("{job}.log.jsonl"));
    let contents = std::fs::read_to_string(&log_path).expect("job log exists");
    let lines: Vec<&str> = contents.lines().collect();
    assert!(!lines.is_empty());
    for line in &lines {
        let parsed: serde_json::Value = serde_json::from_str(line).expect("jsonl line");
        assert_eq!(parsed["job_id"], job.as_str());
    }
    assert!(
        rig.store.event_count(&job).expect("count") >= lines.len() as i64,
        "every logged line has a persisted event row"
    );
}
