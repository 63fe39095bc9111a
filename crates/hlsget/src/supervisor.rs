//! Per-job supervisor: owns one download's run state, drives its fetches,
//! reconciles with disk, and reports progress.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{DownloadError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::fetcher::SegmentFetcher;
use crate::model::{
    DownloadJob, DownloadStatus, JobUpdate, completion_threshold_met, round2, segment_path,
};
use crate::muxer::MuxerDriver;
use crate::store::DownloadStore;

/// Ephemeral, non-persisted state for one run.
struct RunState {
    started_at: Instant,
    total_segments: u32,
    downloaded_segments: u32,
    downloaded_bytes: u64,
    /// Completions in this run only; drives the ETA average.
    completed_this_run: u32,
    /// Indices that exhausted all retry attempts this run.
    failed: HashSet<usize>,
    /// On-disk segment files, in completion order. The muxer re-sorts.
    segment_files: Vec<PathBuf>,
}

impl RunState {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_segments: 0,
            downloaded_segments: 0,
            downloaded_bytes: 0,
            completed_this_run: 0,
            failed: HashSet::new(),
            segment_files: Vec::new(),
        }
    }
}

pub struct JobSupervisor {
    job_id: String,
    store: Arc<dyn DownloadStore>,
    events: EventBus,
    fetcher: Arc<SegmentFetcher>,
    muxer: Arc<MuxerDriver>,
    /// Liveness flag: cleared by pause and cancel. Workers consult it at
    /// admission and inside the transport calls.
    token: CancellationToken,
    /// Held across the persist so readers of the record observe counters
    /// moving monotonically.
    state: Mutex<RunState>,
}

impl JobSupervisor {
    pub(crate) fn new(
        job_id: impl Into<String>,
        store: Arc<dyn DownloadStore>,
        events: EventBus,
        fetcher: Arc<SegmentFetcher>,
        muxer: Arc<MuxerDriver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_id: job_id.into(),
            store,
            events,
            fetcher,
            muxer,
            token: CancellationToken::new(),
            state: Mutex::new(RunState::new()),
        })
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drive the job to a settled state. Spawned by the engine.
    pub(crate) async fn run(&self) {
        match self.run_inner().await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                debug!(id = %self.job_id, "run stopped by pause or cancel");
            }
            Err(e) => {
                error!(id = %self.job_id, error = %e, "download failed");
                let message = e.to_string();
                let update = JobUpdate::new()
                    .with_status(DownloadStatus::Error)
                    .with_error_message(message.clone());
                if let Err(store_err) = self.store.update(&self.job_id, update).await {
                    error!(id = %self.job_id, error = %store_err, "could not persist failure");
                }
                self.events.emit(EngineEvent::DownloadStatus {
                    id: self.job_id.clone(),
                    status: DownloadStatus::Error,
                    error_message: Some(message),
                    output_file: None,
                    message: None,
                });
            }
        }
    }

    async fn run_inner(&self) -> Result<()> {
        let job = self
            .store
            .get(&self.job_id)
            .await?
            .ok_or_else(|| DownloadError::NotFound {
                id: self.job_id.clone(),
            })?;
        if job.segments.is_empty() {
            return Err(DownloadError::NoSegments);
        }

        let output_dir = PathBuf::from(&job.output_dir);
        tokio::fs::create_dir_all(&output_dir).await?;

        self.store
            .update(
                &self.job_id,
                JobUpdate::new()
                    .with_status(DownloadStatus::Downloading)
                    .clearing_error_message(),
            )
            .await?;

        // Reconcile with disk: a nonzero file at the deterministic path is a
        // finished segment; anything else is refetched (empty files get
        // overwritten by the rename).
        let total = job.segments.len() as u32;
        let mut missing: Vec<(usize, String)> = Vec::new();
        {
            let mut state = self.state.lock().await;
            *state = RunState::new();
            state.total_segments = total;
            state.downloaded_bytes = job.downloaded_bytes;
            for (index, url) in job.segments.iter().enumerate() {
                let path = segment_path(&output_dir, &job.filename, index);
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.len() > 0 => state.segment_files.push(path),
                    _ => missing.push((index, url.clone())),
                }
            }
            state.downloaded_segments = total - missing.len() as u32;

            let progress = round2(f64::from(state.downloaded_segments) / f64::from(total) * 100.0);
            self.store
                .update(
                    &self.job_id,
                    JobUpdate::new()
                        .with_downloaded_segments(state.downloaded_segments)
                        .with_progress(progress),
                )
                .await?;
        }

        self.events.emit(EngineEvent::status(
            self.job_id.clone(),
            DownloadStatus::Downloading,
        ));
        info!(
            id = %self.job_id,
            total,
            missing = missing.len(),
            "download starting"
        );

        if !missing.is_empty() {
            self.fetch_missing(&job, &output_dir, missing).await;
        }

        if self.token.is_cancelled() {
            // Pause or cancel already persisted the status; nothing to settle.
            return Ok(());
        }

        self.finish(&job, &output_dir).await
    }

    /// Fan the missing segments out over at most `threads` concurrent
    /// fetches. The semaphore is fair, so work is admitted in submission
    /// (index) order even though completion order is unconstrained. Results
    /// are accounted here as fetches settle, which keeps the persisted
    /// counters strictly monotone.
    async fn fetch_missing(
        &self,
        job: &DownloadJob,
        output_dir: &std::path::Path,
        missing: Vec<(usize, String)>,
    ) {
        let semaphore = Semaphore::new(job.threads.max(1) as usize);
        let mut in_flight = FuturesUnordered::new();

        for (index, url) in missing {
            let semaphore = &semaphore;
            let fetcher = &self.fetcher;
            let token = &self.token;
            let stem = job.filename.as_str();
            in_flight.push(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (index, Err(DownloadError::Cancelled));
                };
                // Admission checkpoint: unscheduled work aborts here without
                // counting as a fetch failure.
                if token.is_cancelled() {
                    return (index, Err(DownloadError::Cancelled));
                }
                let fetched = fetcher
                    .fetch_segment(&url, index, output_dir, stem, token)
                    .await;
                (index, fetched)
            });
        }

        while let Some((index, fetched)) = in_flight.next().await {
            match fetched {
                Ok((path, bytes)) => self.record_success(index, path, bytes).await,
                Err(e) if e.is_cancelled() => trace!(index, "fetch aborted"),
                Err(e) => self.record_failure(index, &e).await,
            }
        }
    }

    async fn record_success(&self, index: usize, path: PathBuf, bytes: u64) {
        let mut state = self.state.lock().await;
        state.segment_files.push(path);
        state.downloaded_segments += 1;
        state.downloaded_bytes += bytes;
        state.completed_this_run += 1;

        let total = state.total_segments;
        let downloaded = state.downloaded_segments;
        let elapsed = state.started_at.elapsed().as_secs_f64();
        let progress = round2(f64::from(downloaded) / f64::from(total) * 100.0);
        let speed = if elapsed > 0.0 {
            state.downloaded_bytes as f64 / elapsed
        } else {
            0.0
        };
        let settled = downloaded + state.failed.len() as u32;
        let remaining = total.saturating_sub(settled);
        let eta = if remaining > 0 {
            let avg_segment_secs = elapsed / f64::from(state.completed_this_run);
            (f64::from(remaining) * avg_segment_secs).round() as u64
        } else {
            0
        };
        let file_size = state.downloaded_bytes / u64::from(downloaded) * u64::from(total);

        let update = JobUpdate::new()
            .with_downloaded_segments(downloaded)
            .with_downloaded_bytes(state.downloaded_bytes)
            .with_file_size(file_size)
            .with_progress(progress)
            .with_speed(speed)
            .with_eta(eta);
        // Persisted under the state lock so progress can never regress.
        match self.store.update(&self.job_id, update).await {
            Ok(persisted) => {
                // A fetch that landed after a cancel finds the record
                // terminal and untouched; keep the file, skip the event.
                if persisted.status.is_terminal() {
                    return;
                }
                trace!(index, downloaded, progress, "segment complete");
                self.events.emit(EngineEvent::DownloadProgress {
                    id: self.job_id.clone(),
                    progress: persisted.progress,
                    downloaded_segments: persisted.downloaded_segments,
                    speed: persisted.speed,
                    eta: persisted.eta,
                    downloaded_bytes: persisted.downloaded_bytes,
                });
            }
            Err(e) => warn!(id = %self.job_id, index, error = %e, "could not persist progress"),
        }
    }

    async fn record_failure(&self, index: usize, error: &DownloadError) {
        let mut state = self.state.lock().await;
        state.failed.insert(index);
        warn!(
            id = %self.job_id,
            index,
            failed = state.failed.len(),
            error = %error,
            "segment exhausted its retries"
        );
    }

    /// Completion check: decide completed vs error once every missing-segment
    /// task has settled (or nothing was missing to begin with).
    async fn finish(&self, job: &DownloadJob, output_dir: &std::path::Path) -> Result<()> {
        let (downloaded, failed, total, files) = {
            let mut state = self.state.lock().await;
            (
                state.downloaded_segments,
                state.failed.len() as u32,
                state.total_segments,
                std::mem::take(&mut state.segment_files),
            )
        };

        if !completion_threshold_met(downloaded, failed, total) {
            let message = format!("{failed} of {total} segments failed to download");
            self.store
                .update(
                    &self.job_id,
                    JobUpdate::new()
                        .with_status(DownloadStatus::Error)
                        .with_error_message(message.clone()),
                )
                .await?;
            self.events.emit(EngineEvent::DownloadStatus {
                id: self.job_id.clone(),
                status: DownloadStatus::Error,
                error_message: Some(message),
                output_file: None,
                message: None,
            });
            return Ok(());
        }

        let ratio = f64::from(downloaded) / f64::from(total);
        let progress = (ratio * 100.0).round().min(100.0);
        self.store
            .update(
                &self.job_id,
                JobUpdate::new()
                    .with_status(DownloadStatus::Merging)
                    .with_progress(progress),
            )
            .await?;
        self.events.emit(EngineEvent::status(
            self.job_id.clone(),
            DownloadStatus::Merging,
        ));
        if failed > 0 {
            info!(id = %self.job_id, downloaded, failed, "completing despite failed segments");
        }

        self.merge_and_finalize(job, output_dir, files).await
    }

    /// Run the muxer and settle the record. Per the post-merge contract the
    /// job ends `completed` even when the merge fails; the failure is carried
    /// in `error_message` and the segment files stay on disk for a retry.
    async fn merge_and_finalize(
        &self,
        job: &DownloadJob,
        output_dir: &std::path::Path,
        files: Vec<PathBuf>,
    ) -> Result<()> {
        let merged = self
            .muxer
            .merge(
                output_dir,
                &job.filename,
                files,
                job.duration,
                &self.job_id,
                &self.events,
            )
            .await;

        match merged {
            Ok(outcome) => {
                let output_file = outcome.output_file.display().to_string();
                let mut update = JobUpdate::new()
                    .with_status(DownloadStatus::Completed)
                    .with_output_file(output_file.clone());
                if let Some(duration) = outcome.duration {
                    update = update.with_duration(duration);
                }
                self.store.update(&self.job_id, update).await?;

                let message = outcome
                    .used_fallback
                    .then(|| "segments joined by byte concatenation; muxer unavailable".to_string());
                info!(id = %self.job_id, output = %output_file, fallback = outcome.used_fallback, "download completed");
                self.events.emit(EngineEvent::DownloadStatus {
                    id: self.job_id.clone(),
                    status: DownloadStatus::Completed,
                    error_message: None,
                    output_file: Some(output_file),
                    message,
                });
            }
            Err(e) => {
                let message = e.to_string();
                warn!(id = %self.job_id, error = %message, "merge failed; segments retained");
                self.store
                    .update(
                        &self.job_id,
                        JobUpdate::new()
                            .with_status(DownloadStatus::Completed)
                            .with_error_message(message.clone()),
                    )
                    .await?;
                self.events.emit(EngineEvent::DownloadStatus {
                    id: self.job_id.clone(),
                    status: DownloadStatus::Completed,
                    error_message: Some(message),
                    output_file: None,
                    message: Some("download finished but the merge failed; segment files were kept".to_string()),
                });
            }
        }

        let mut state = self.state.lock().await;
        state.failed.clear();
        state.segment_files.clear();
        Ok(())
    }

    /// Cooperative pause: clears the liveness flag and lets in-flight fetches
    /// drain or abort at the next checkpoint. Already-written segments stay.
    pub(crate) async fn pause(&self) -> Result<()> {
        let Some(job) = self.store.get(&self.job_id).await? else {
            return Ok(());
        };
        if job.status != DownloadStatus::Downloading {
            return Ok(());
        }
        self.token.cancel();
        self.store
            .update(
                &self.job_id,
                JobUpdate::new().with_status(DownloadStatus::Paused),
            )
            .await?;
        info!(id = %self.job_id, "download paused");
        self.events.emit(EngineEvent::status(
            self.job_id.clone(),
            DownloadStatus::Paused,
        ));
        Ok(())
    }

    /// Cancel: stop work and mark the record. Segment files are left on disk,
    /// so a later job with the same stem and directory resumes from them.
    pub(crate) async fn cancel(&self) -> Result<()> {
        self.token.cancel();
        {
            let mut state = self.state.lock().await;
            state.failed.clear();
            state.segment_files.clear();
        }
        let Some(job) = self.store.get(&self.job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        self.store
            .update(
                &self.job_id,
                JobUpdate::new().with_status(DownloadStatus::Cancelled),
            )
            .await?;
        info!(id = %self.job_id, "download cancelled");
        self.events.emit(EngineEvent::status(
            self.job_id.clone(),
            DownloadStatus::Cancelled,
        ));
        Ok(())
    }

    /// Re-run the merge for a settled job. Permitted from `completed` (merge
    /// failed earlier) and `error`. The file list is rebuilt by probing the
    /// deterministic paths, which is the normal case after a restart.
    pub(crate) async fn retry_merge(&self) -> Result<()> {
        let job = self
            .store
            .get(&self.job_id)
            .await?
            .ok_or_else(|| DownloadError::NotFound {
                id: self.job_id.clone(),
            })?;
        if !matches!(
            job.status,
            DownloadStatus::Completed | DownloadStatus::Error
        ) {
            return Err(DownloadError::InvalidState {
                operation: "retry_merge",
                status: job.status.to_string(),
            });
        }

        let output_dir = PathBuf::from(&job.output_dir);
        let mut files = { self.state.lock().await.segment_files.clone() };
        if files.is_empty() {
            for index in 0..job.total_segments as usize {
                let path = segment_path(&output_dir, &job.filename, index);
                if let Ok(meta) = tokio::fs::metadata(&path).await
                    && meta.len() > 0
                {
                    files.push(path);
                }
            }
        }
        if files.is_empty() {
            warn!(id = %self.job_id, "retry-merge found no segment files on disk");
            self.events.emit(EngineEvent::DownloadStatus {
                id: self.job_id.clone(),
                status: job.status,
                error_message: None,
                output_file: None,
                message: Some("no segment files found on disk; nothing to merge".to_string()),
            });
            return Ok(());
        }

        self.store
            .update(
                &self.job_id,
                JobUpdate::new().with_status(DownloadStatus::Merging),
            )
            .await?;
        self.events.emit(EngineEvent::status(
            self.job_id.clone(),
            DownloadStatus::Merging,
        ));
        self.merge_and_finalize(&job, &output_dir, files).await
    }
}
