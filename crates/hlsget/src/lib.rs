//! Download engine for segmented HTTP video streams.
//!
//! The engine resolves a playlist into an ordered list of segment URLs,
//! fetches the segments in parallel with bounded concurrency and bounded
//! retry, persists progress so interrupted jobs resume from exactly the
//! segments still missing, and drives a muxer (with a binary-concat
//! fallback) to produce one playable container file.
//!
//! Outer surfaces (an HTTP API, a CLI) talk to [`DownloadEngine`] and
//! subscribe to its event bus; persistence is pluggable through
//! [`store::DownloadStore`].

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod playlist;
pub mod store;

mod fetcher;
mod muxer;
mod retry;
mod supervisor;

pub use config::EngineConfig;
pub use engine::{DownloadEngine, NewDownload};
pub use error::{DownloadError, Result};
pub use events::{EngineEvent, EventBus};
pub use model::{DownloadJob, DownloadStatus, JobUpdate, Settings};
pub use muxer::{MergeOutcome, MuxerDriver};
pub use playlist::{
    MediaPlaylistInfo, PlaylistResolver, ResolvedPlaylist, Variant, VariantPolicy,
};
pub use store::{DownloadStore, MemoryStore, SqliteStore};
