//! Typed progress and status messages, fanned out over a broadcast bus.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::DownloadStatus;

/// Message published by the engine, tagged by job id.
///
/// Consumers (an API layer, a CLI) subscribe via [`EventBus::subscribe`].
/// Emission never blocks: a subscriber that falls behind loses the oldest
/// messages rather than stalling a fetch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    DownloadStatus {
        id: String,
        status: DownloadStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    DownloadProgress {
        id: String,
        progress: f64,
        downloaded_segments: u32,
        speed: f64,
        eta: u64,
        downloaded_bytes: u64,
    },
    MergeProgress {
        id: String,
        progress: f64,
    },
}

impl EngineEvent {
    pub fn status(id: impl Into<String>, status: DownloadStatus) -> Self {
        Self::DownloadStatus {
            id: id.into(),
            status,
            error_message: None,
            output_file: None,
            message: None,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::DownloadStatus { id, .. }
            | Self::DownloadProgress { id, .. }
            | Self::MergeProgress { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget emit. Send errors mean nobody is listening, which is
    /// a valid steady state for a headless engine.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
