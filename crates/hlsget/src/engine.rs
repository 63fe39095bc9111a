//! The engine: process-wide registry of live jobs and the command surface
//! consumed by outer layers (API, CLI).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::fetcher::{SegmentFetcher, build_client};
use crate::model::{DownloadJob, DownloadStatus, JobUpdate, sanitize_filename};
use crate::muxer::MuxerDriver;
use crate::playlist::{PlaylistResolver, ResolvedPlaylist, VariantPolicy, select_variant};
use crate::store::DownloadStore;
use crate::supervisor::JobSupervisor;

/// Request to register a new download.
#[derive(Debug, Clone)]
pub struct NewDownload {
    /// Page the stream was found on. Doubles as the playlist URL when no
    /// separate one is given.
    pub source_url: String,
    pub playlist_url: Option<String>,
    /// Output stem; sanitized before use.
    pub filename: String,
    /// Falls back to the settings record when absent.
    pub output_dir: Option<String>,
    pub threads: Option<u32>,
    /// How to descend when the URL turns out to be a master playlist.
    pub variant_policy: VariantPolicy,
}

impl NewDownload {
    pub fn new(source_url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            playlist_url: None,
            filename: filename.into(),
            output_dir: None,
            threads: None,
            variant_policy: VariantPolicy::default(),
        }
    }
}

/// Owns everything process-wide: the job registry, the event bus, the shared
/// HTTP client, and the located muxer. Construct once; initialization
/// failures (a client that will not build) surface here, not on first use.
pub struct DownloadEngine {
    store: Arc<dyn DownloadStore>,
    events: EventBus,
    fetcher: Arc<SegmentFetcher>,
    resolver: PlaylistResolver,
    muxer: Arc<MuxerDriver>,
    active: Arc<DashMap<String, Arc<JobSupervisor>>>,
}

impl DownloadEngine {
    pub fn new(store: Arc<dyn DownloadStore>, config: EngineConfig) -> Result<Self> {
        let config = Arc::new(config);
        let client = build_client(&config)?;
        let fetcher = Arc::new(SegmentFetcher::new(client.clone(), Arc::clone(&config)));
        let resolver = PlaylistResolver::new(client, Arc::clone(&config));
        let muxer = Arc::new(MuxerDriver::locate(Arc::clone(&config)));
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            store,
            events,
            fetcher,
            resolver,
            muxer,
            active: Arc::new(DashMap::new()),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn DownloadStore> {
        &self.store
    }

    pub fn muxer_available(&self) -> bool {
        self.muxer.is_available()
    }

    /// Resolve a playlist and register a queued job for it.
    ///
    /// A master playlist is descended via the request's variant policy. Live
    /// playlists are refused: this engine downloads finished streams.
    pub async fn create(&self, request: NewDownload) -> Result<DownloadJob> {
        let settings = self.store.settings().await?;
        let playlist_url = request
            .playlist_url
            .clone()
            .unwrap_or_else(|| request.source_url.clone());

        let media = match self.resolver.resolve(&playlist_url).await? {
            ResolvedPlaylist::Media(info) => info,
            ResolvedPlaylist::Master { variants } => {
                let variant = select_variant(&variants, request.variant_policy)?;
                debug!(
                    bandwidth = variant.bandwidth,
                    url = %variant.url,
                    "descending into selected variant"
                );
                match self.resolver.resolve(&variant.url).await? {
                    ResolvedPlaylist::Media(info) => info,
                    ResolvedPlaylist::Master { .. } => {
                        return Err(DownloadError::playlist(
                            "master playlist points at another master playlist",
                        ));
                    }
                }
            }
        };

        if media.live {
            return Err(DownloadError::playlist(
                "live playlists are not supported; wait for the stream to finish",
            ));
        }
        if media.segments.is_empty() {
            return Err(DownloadError::NoSegments);
        }

        let mut job = DownloadJob::new(
            Uuid::new_v4().to_string(),
            request.source_url,
            playlist_url,
            sanitize_filename(&request.filename),
            request
                .output_dir
                .unwrap_or_else(|| settings.default_output_path.clone()),
            media.segments,
            request.threads.unwrap_or(settings.default_threads),
        );
        if media.duration > 0.0 {
            job.duration = Some(media.duration);
        }
        self.store.insert(&job).await?;
        info!(
            id = %job.id,
            segments = job.total_segments,
            threads = job.threads,
            "download registered"
        );
        self.events
            .emit(EngineEvent::status(job.id.clone(), DownloadStatus::Queued));

        if settings.auto_start {
            self.start(&job.id).await?;
        }
        let id = job.id;
        self.store
            .get(&id)
            .await?
            .ok_or(DownloadError::NotFound { id })
    }

    /// Begin or resume a job. Starting a job that is already downloading is
    /// idempotent; a paused or errored job gets a fresh supervisor.
    pub async fn start(&self, id: &str) -> Result<()> {
        if let Some(existing) = self.active.get(id)
            && !existing.is_stopped()
        {
            debug!(id, "start ignored, job already downloading");
            return Ok(());
        }

        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| DownloadError::NotFound { id: id.to_string() })?;
        if job.segments.is_empty() {
            return Err(DownloadError::NoSegments);
        }
        match job.status {
            DownloadStatus::Queued
            | DownloadStatus::Paused
            | DownloadStatus::Error
            | DownloadStatus::Downloading => {}
            DownloadStatus::Merging | DownloadStatus::Completed | DownloadStatus::Cancelled => {
                return Err(DownloadError::InvalidState {
                    operation: "start",
                    status: job.status.to_string(),
                });
            }
        }

        let supervisor = JobSupervisor::new(
            id,
            Arc::clone(&self.store),
            self.events.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.muxer),
        );
        self.active.insert(id.to_string(), Arc::clone(&supervisor));

        let active = Arc::clone(&self.active);
        let registry_key = id.to_string();
        let runner = Arc::clone(&supervisor);
        tokio::spawn(async move {
            runner.run().await;
            // Only drop the registry entry if it is still ours; a pause/start
            // cycle may already have installed a replacement.
            active.remove_if(&registry_key, |_, current| Arc::ptr_eq(current, &runner));
        });
        Ok(())
    }

    /// Cooperative pause. Not an error when the job is not downloading.
    pub async fn pause(&self, id: &str) -> Result<()> {
        // Clone out of the registry before awaiting so no shard lock is held
        // across the store round-trip.
        let supervisor = self.active.get(id).map(|entry| Arc::clone(entry.value()));
        match supervisor {
            Some(supervisor) => supervisor.pause().await,
            None => {
                debug!(id, "pause ignored, job not active");
                Ok(())
            }
        }
    }

    /// Idempotent cancel. Leaves segment files on disk.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        if let Some((_, supervisor)) = self.active.remove(id) {
            return supervisor.cancel().await;
        }
        // Not active: settle the record directly (queued / paused / error).
        let Some(job) = self.store.get(id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        self.store
            .update(id, JobUpdate::new().with_status(DownloadStatus::Cancelled))
            .await?;
        self.events
            .emit(EngineEvent::status(id.to_string(), DownloadStatus::Cancelled));
        Ok(())
    }

    /// Re-run the merge of a settled job.
    pub async fn retry_merge(&self, id: &str) -> Result<()> {
        let supervisor = match self.active.get(id) {
            Some(entry) => Arc::clone(entry.value()),
            None => JobSupervisor::new(
                id,
                Arc::clone(&self.store),
                self.events.clone(),
                Arc::clone(&self.fetcher),
                Arc::clone(&self.muxer),
            ),
        };
        supervisor.retry_merge().await
    }

    /// Remove the record. Active work is cancelled; files are not deleted.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if let Some((_, supervisor)) = self.active.remove(id) {
            if let Err(e) = supervisor.cancel().await {
                warn!(id, error = %e, "cancelling before delete failed");
            }
        }
        self.store.delete(id).await
    }

    pub async fn job(&self, id: &str) -> Result<Option<DownloadJob>> {
        self.store.get(id).await
    }

    pub async fn jobs(&self) -> Result<Vec<DownloadJob>> {
        self.store.list().await
    }
}
