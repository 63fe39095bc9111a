//! End-to-end engine scenarios against a loopback HTTP fixture.
//!
//! The fixture serves playlists and segments from memory, can inject
//! failures per segment, and counts every request, so resume behavior is
//! observable without touching the network. The muxer search list is empty
//! in these tests, so merges take the byte-concat path and stay
//! deterministic on machines without ffmpeg.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::broadcast;

use hlsget_engine::store::DownloadStore;
use hlsget_engine::{
    DownloadEngine, DownloadJob, DownloadStatus, EngineConfig, EngineEvent, MemoryStore,
    NewDownload,
};

/// Fail the first `times` requests for a path with `status`.
struct FailurePlan {
    status: StatusCode,
    times: u32,
}

#[derive(Default)]
struct Fixture {
    playlists: HashMap<String, String>,
    segments: HashMap<String, Vec<u8>>,
    plans: HashMap<String, FailurePlan>,
    counts: Mutex<HashMap<String, u32>>,
    /// Artificial per-segment latency, for pause/cancel scenarios.
    segment_delay: Option<Duration>,
}

impl Fixture {
    fn request_count(&self, name: &str) -> u32 {
        *self.counts.lock().unwrap().get(name).unwrap_or(&0)
    }
}

async fn serve_path(State(fixture): State<Arc<Fixture>>, Path(path): Path<String>) -> Response {
    if let Some(body) = fixture.playlists.get(&path) {
        return body.clone().into_response();
    }

    let count = {
        let mut counts = fixture.counts.lock().unwrap();
        let entry = counts.entry(path.clone()).or_insert(0);
        *entry += 1;
        *entry
    };
    if let Some(plan) = fixture.plans.get(&path)
        && count <= plan.times
    {
        return plan.status.into_response();
    }
    if let Some(delay) = fixture.segment_delay {
        tokio::time::sleep(delay).await;
    }
    match fixture.segments.get(&path) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Bind an ephemeral port and serve the fixture; returns the base URL.
async fn start_fixture(fixture: Arc<Fixture>) -> String {
    let app = Router::new()
        .route("/{*path}", get(serve_path))
        .with_state(fixture);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn segment_body(index: usize) -> Vec<u8> {
    vec![index as u8; 1024]
}

/// VOD media playlist with `count` segments named `seg<i>.ts`.
fn media_playlist(count: usize) -> String {
    let mut out = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-PLAYLIST-TYPE:VOD\n",
    );
    for index in 0..count {
        out.push_str(&format!("#EXTINF:4.0,\nseg{index}.ts\n"));
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

fn vod_fixture(count: usize) -> Fixture {
    let mut fixture = Fixture::default();
    fixture
        .playlists
        .insert("index.m3u8".to_string(), media_playlist(count));
    for index in 0..count {
        fixture
            .segments
            .insert(format!("seg{index}.ts"), segment_body(index));
    }
    fixture
}

async fn engine_with_store(auto_start: bool) -> (DownloadEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let mut settings = store.settings().await.unwrap();
    settings.auto_start = auto_start;
    settings.default_threads = 4;
    store.save_settings(&settings).await.unwrap();
    let engine = DownloadEngine::new(
        Arc::clone(&store) as Arc<dyn DownloadStore>,
        EngineConfig::for_tests(),
    )
    .unwrap();
    (engine, store)
}

fn request(base: &str, output_dir: &std::path::Path, filename: &str) -> NewDownload {
    let mut request = NewDownload::new(format!("{base}/index.m3u8"), filename);
    request.output_dir = Some(output_dir.to_string_lossy().to_string());
    request
}

fn is_status(event: &EngineEvent, wanted: DownloadStatus) -> bool {
    matches!(event, EngineEvent::DownloadStatus { status, .. } if *status == wanted)
}

/// Drain the bus until a `download_status` event with `wanted` arrives.
async fn drain_until_status(
    rx: &mut broadcast::Receiver<EngineEvent>,
    wanted: DownloadStatus,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    let outcome = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let stop = is_status(&event, wanted);
                    events.push(event);
                    if stop {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for status {wanted}");
    events
}

fn progress_counts(events: &[EngineEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::DownloadProgress {
                downloaded_segments,
                ..
            } => Some(*downloaded_segments),
            _ => None,
        })
        .collect()
}

async fn job_of(engine: &DownloadEngine, id: &str) -> DownloadJob {
    engine.job(id).await.unwrap().expect("job record")
}

#[tokio::test]
async fn happy_path_ten_segments() {
    let fixture = Arc::new(vod_fixture(10));
    let base = start_fixture(Arc::clone(&fixture)).await;
    let dir = tempfile::tempdir().unwrap();

    let (engine, _store) = engine_with_store(true).await;
    let mut rx = engine.subscribe();
    let job = engine.create(request(&base, dir.path(), "show")).await.unwrap();

    let events = drain_until_status(&mut rx, DownloadStatus::Completed).await;

    // Progress counted every segment exactly once and never went backwards.
    let counts = progress_counts(&events);
    assert_eq!(counts.len(), 10);
    assert!(counts.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*counts.last().unwrap(), 10);

    let job = job_of(&engine, &job.id).await;
    assert_eq!(job.status, DownloadStatus::Completed);
    assert_eq!(job.downloaded_segments, 10);
    assert_eq!(job.progress, 100.0);
    assert_eq!(job.downloaded_bytes, 10 * 1024);

    // Fallback concat: output is the segments in index order, byte for byte.
    let output = std::path::PathBuf::from(job.output_file.as_deref().unwrap());
    let merged = std::fs::read(&output).unwrap();
    let expected: Vec<u8> = (0..10).flat_map(segment_body).collect();
    assert_eq!(merged, expected);

    // Segment temp files are gone after a successful merge.
    for index in 0..10 {
        assert!(!dir.path().join(format!("show_segment_{index}.ts")).exists());
    }

    // The completed event notes the muxer fallback.
    let completed = events
        .iter()
        .find(|event| is_status(event, DownloadStatus::Completed))
        .unwrap();
    let EngineEvent::DownloadStatus { message, output_file, .. } = completed else {
        unreachable!()
    };
    assert!(message.as_deref().is_some_and(|m| m.contains("concat")));
    assert_eq!(output_file.as_deref(), Some(output.to_str().unwrap()));
}

#[tokio::test]
async fn transient_flake_is_retried_and_counted_once() {
    let mut fixture = vod_fixture(10);
    fixture.plans.insert(
        "seg3.ts".to_string(),
        FailurePlan {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            times: 2,
        },
    );
    let fixture = Arc::new(fixture);
    let base = start_fixture(Arc::clone(&fixture)).await;
    let dir = tempfile::tempdir().unwrap();

    let (engine, _store) = engine_with_store(true).await;
    let mut rx = engine.subscribe();
    let job = engine.create(request(&base, dir.path(), "flaky")).await.unwrap();
    drain_until_status(&mut rx, DownloadStatus::Completed).await;

    assert_eq!(fixture.request_count("seg3.ts"), 3);
    let job = job_of(&engine, &job.id).await;
    assert_eq!(job.downloaded_segments, 10);
    assert_eq!(job.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn permanent_loss_of_one_segment_still_completes() {
    let mut fixture = vod_fixture(100);
    fixture.plans.insert(
        "seg42.ts".to_string(),
        FailurePlan {
            status: StatusCode::NOT_FOUND,
            times: u32::MAX,
        },
    );
    let fixture = Arc::new(fixture);
    let base = start_fixture(Arc::clone(&fixture)).await;
    let dir = tempfile::tempdir().unwrap();

    let (engine, _store) = engine_with_store(true).await;
    let mut rx = engine.subscribe();
    let job = engine.create(request(&base, dir.path(), "gappy")).await.unwrap();
    drain_until_status(&mut rx, DownloadStatus::Completed).await;

    // Exactly three attempts for the lost segment.
    assert_eq!(fixture.request_count("seg42.ts"), 3);

    let job = job_of(&engine, &job.id).await;
    assert_eq!(job.status, DownloadStatus::Completed);
    assert_eq!(job.downloaded_segments, 99);
    assert_eq!(job.progress, 99.0);

    // Output carries the 99 surviving segments in index order.
    let merged = std::fs::read(job.output_file.as_deref().unwrap()).unwrap();
    let expected: Vec<u8> = (0..100)
        .filter(|&index| index != 42)
        .flat_map(segment_body)
        .collect();
    assert_eq!(merged, expected);
}

#[tokio::test]
async fn too_many_failures_end_in_error_and_retry_merge_salvages() {
    let mut fixture = vod_fixture(10);
    for index in 0..5 {
        fixture.plans.insert(
            format!("seg{index}.ts"),
            FailurePlan {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                times: u32::MAX,
            },
        );
    }
    let fixture = Arc::new(fixture);
    let base = start_fixture(Arc::clone(&fixture)).await;
    let dir = tempfile::tempdir().unwrap();

    let (engine, _store) = engine_with_store(true).await;
    let mut rx = engine.subscribe();
    let job = engine.create(request(&base, dir.path(), "broken")).await.unwrap();
    drain_until_status(&mut rx, DownloadStatus::Error).await;

    let record = job_of(&engine, &job.id).await;
    assert_eq!(record.status, DownloadStatus::Error);
    assert!(record.error_message.as_deref().unwrap().contains("5 of 10"));

    // The five good segments are still on disk; retry-merge rebuilds the
    // list by probing deterministic paths and produces a partial file.
    engine.retry_merge(&job.id).await.unwrap();
    let events = drain_until_status(&mut rx, DownloadStatus::Completed).await;
    assert!(events.iter().any(|e| is_status(e, DownloadStatus::Merging)));

    let record = job_of(&engine, &job.id).await;
    assert_eq!(record.status, DownloadStatus::Completed);
    let merged = std::fs::read(record.output_file.as_deref().unwrap()).unwrap();
    let expected: Vec<u8> = (5..10).flat_map(segment_body).collect();
    assert_eq!(merged, expected);
}

#[tokio::test]
async fn pause_then_start_completes_like_a_single_run() {
    let mut fixture = vod_fixture(20);
    fixture.segment_delay = Some(Duration::from_millis(50));
    let fixture = Arc::new(fixture);
    let base = start_fixture(Arc::clone(&fixture)).await;
    let dir = tempfile::tempdir().unwrap();

    let (engine, _store) = engine_with_store(false).await;
    let mut rx = engine.subscribe();
    let job = engine.create(request(&base, dir.path(), "paused")).await.unwrap();
    assert_eq!(job.status, DownloadStatus::Queued);

    engine.start(&job.id).await.unwrap();
    // Starting twice while downloading is idempotent.
    engine.start(&job.id).await.unwrap();

    // Let a few segments land, then pause.
    let mut seen_progress = 0;
    while seen_progress < 3 {
        if let Ok(event) = rx.recv().await
            && matches!(event, EngineEvent::DownloadProgress { .. })
        {
            seen_progress += 1;
        }
    }
    engine.pause(&job.id).await.unwrap();
    drain_until_status(&mut rx, DownloadStatus::Paused).await;

    // Give in-flight fetches time to drain, then check the reconcile
    // invariant: the persisted counter matches the files on disk.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let record = job_of(&engine, &job.id).await;
    assert_eq!(record.status, DownloadStatus::Paused);
    let on_disk = (0..20)
        .filter(|index| {
            let path = dir.path().join(format!("paused_segment_{index}.ts"));
            path.metadata().map(|m| m.len() > 0).unwrap_or(false)
        })
        .count() as u32;
    assert_eq!(on_disk, record.downloaded_segments);
    assert!(on_disk < 20, "pause landed after everything finished");

    // Resume: only the missing segments are fetched, and the result is
    // identical to an uninterrupted run.
    engine.start(&job.id).await.unwrap();
    drain_until_status(&mut rx, DownloadStatus::Completed).await;

    let record = job_of(&engine, &job.id).await;
    assert_eq!(record.downloaded_segments, 20);
    let merged = std::fs::read(record.output_file.as_deref().unwrap()).unwrap();
    let expected: Vec<u8> = (0..20).flat_map(segment_body).collect();
    assert_eq!(merged, expected);
}

#[tokio::test]
async fn restart_resumes_from_disk_without_refetching() {
    let fixture = Arc::new(vod_fixture(20));
    let base = start_fixture(Arc::clone(&fixture)).await;
    let dir = tempfile::tempdir().unwrap();

    // Seven segments survived an earlier process; same stem, same directory.
    for index in 0..7 {
        std::fs::write(
            dir.path().join(format!("resumed_segment_{index}.ts")),
            segment_body(index),
        )
        .unwrap();
    }
    // An empty file does not count as present and must be refetched.
    std::fs::write(dir.path().join("resumed_segment_7.ts"), b"").unwrap();

    let (engine, _store) = engine_with_store(false).await;
    let mut rx = engine.subscribe();
    let job = engine
        .create(request(&base, dir.path(), "resumed"))
        .await
        .unwrap();
    engine.start(&job.id).await.unwrap();
    drain_until_status(&mut rx, DownloadStatus::Completed).await;

    for index in 0..7 {
        assert_eq!(
            fixture.request_count(&format!("seg{index}.ts")),
            0,
            "segment {index} was already on disk"
        );
    }
    for index in 7..20 {
        assert_eq!(fixture.request_count(&format!("seg{index}.ts")), 1);
    }

    let record = job_of(&engine, &job.id).await;
    assert_eq!(record.downloaded_segments, 20);
    let merged = std::fs::read(record.output_file.as_deref().unwrap()).unwrap();
    let expected: Vec<u8> = (0..20).flat_map(segment_body).collect();
    assert_eq!(merged, expected);
}

#[tokio::test]
async fn cancel_keeps_segment_files() {
    let mut fixture = vod_fixture(20);
    fixture.segment_delay = Some(Duration::from_millis(50));
    let fixture = Arc::new(fixture);
    let base = start_fixture(Arc::clone(&fixture)).await;
    let dir = tempfile::tempdir().unwrap();

    let (engine, _store) = engine_with_store(true).await;
    let mut rx = engine.subscribe();
    let job = engine.create(request(&base, dir.path(), "gone")).await.unwrap();

    let mut seen_progress = 0;
    while seen_progress < 2 {
        if let Ok(event) = rx.recv().await
            && matches!(event, EngineEvent::DownloadProgress { .. })
        {
            seen_progress += 1;
        }
    }
    engine.cancel(&job.id).await.unwrap();
    drain_until_status(&mut rx, DownloadStatus::Cancelled).await;
    // Cancelling again is a no-op.
    engine.cancel(&job.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let record = job_of(&engine, &job.id).await;
    assert_eq!(record.status, DownloadStatus::Cancelled);
    assert!(record.output_file.is_none());

    let on_disk = (0..20)
        .filter(|index| dir.path().join(format!("gone_segment_{index}.ts")).exists())
        .count();
    assert!(on_disk >= 2, "cancel must not delete segment files");
}

#[tokio::test]
async fn master_playlist_descends_by_bandwidth() {
    let mut fixture = Fixture::default();
    fixture.playlists.insert(
        "index.m3u8".to_string(),
        "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=854x480\n\
sd/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1920x1080\n\
hd/index.m3u8\n"
            .to_string(),
    );
    fixture.playlists.insert(
        "hd/index.m3u8".to_string(),
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:4.0,\nhd0.ts\n#EXTINF:4.0,\nhd1.ts\n#EXT-X-ENDLIST\n".to_string(),
    );
    fixture.playlists.insert(
        "sd/index.m3u8".to_string(),
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:4.0,\nsd0.ts\n#EXT-X-ENDLIST\n".to_string(),
    );
    fixture.segments.insert("hd/hd0.ts".to_string(), b"HD-0".to_vec());
    fixture.segments.insert("hd/hd1.ts".to_string(), b"HD-1".to_vec());
    fixture.segments.insert("sd/sd0.ts".to_string(), b"SD-0".to_vec());
    let fixture = Arc::new(fixture);
    let base = start_fixture(Arc::clone(&fixture)).await;
    let dir = tempfile::tempdir().unwrap();

    let (engine, _store) = engine_with_store(true).await;
    let mut rx = engine.subscribe();
    let job = engine.create(request(&base, dir.path(), "best")).await.unwrap();
    assert_eq!(
        job.playlist_url,
        format!("{base}/index.m3u8"),
        "record keeps the URL the user handed in"
    );
    drain_until_status(&mut rx, DownloadStatus::Completed).await;

    let record = job_of(&engine, &job.id).await;
    assert_eq!(record.total_segments, 2);
    let merged = std::fs::read(record.output_file.as_deref().unwrap()).unwrap();
    assert_eq!(merged, b"HD-0HD-1");
    assert_eq!(fixture.request_count("sd/sd0.ts"), 0);
}

#[tokio::test]
async fn live_playlists_are_refused() {
    let mut fixture = Fixture::default();
    fixture.playlists.insert(
        "index.m3u8".to_string(),
        // A target duration and no VOD marker: still rolling.
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n".to_string(),
    );
    let base = start_fixture(Arc::new(fixture)).await;
    let dir = tempfile::tempdir().unwrap();

    let (engine, _store) = engine_with_store(true).await;
    let err = engine
        .create(request(&base, dir.path(), "live"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("live"));
}

#[tokio::test]
async fn retry_merge_requires_a_settled_job() {
    let mut fixture = vod_fixture(20);
    fixture.segment_delay = Some(Duration::from_millis(50));
    let fixture = Arc::new(fixture);
    let base = start_fixture(fixture).await;
    let dir = tempfile::tempdir().unwrap();

    let (engine, _store) = engine_with_store(true).await;
    let mut rx = engine.subscribe();
    let job = engine.create(request(&base, dir.path(), "busy")).await.unwrap();

    // Still downloading: retry_merge must refuse.
    let err = engine.retry_merge(&job.id).await.unwrap_err();
    assert!(err.to_string().contains("retry_merge"));

    engine.cancel(&job.id).await.unwrap();
    drain_until_status(&mut rx, DownloadStatus::Cancelled).await;
}

#[tokio::test]
async fn start_errors_for_unknown_jobs() {
    let (engine, _store) = engine_with_store(false).await;
    let err = engine.start("no-such-job").await.unwrap_err();
    assert!(matches!(
        err,
        hlsget_engine::DownloadError::NotFound { .. }
    ));
}
