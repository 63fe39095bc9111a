//! Persistent metadata behind a narrow interface.
//!
//! The engine only ever talks to [`DownloadStore`]; whether records live in
//! memory or in SQLite is the caller's choice at construction time.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{DownloadJob, JobUpdate, Settings};

/// One job record per download plus a singleton settings record.
///
/// `update` is a read-modify-write that is atomic per call: concurrent
/// updates to the same record serialize, and `updated_at` is refreshed on
/// every successful application.
#[async_trait]
pub trait DownloadStore: Send + Sync {
    async fn insert(&self, job: &DownloadJob) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<DownloadJob>>;

    async fn list(&self) -> Result<Vec<DownloadJob>>;

    /// Apply a partial update, returning the record as persisted.
    async fn update(&self, id: &str, update: JobUpdate) -> Result<DownloadJob>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn settings(&self) -> Result<Settings>;

    async fn save_settings(&self, settings: &Settings) -> Result<()>;
}
