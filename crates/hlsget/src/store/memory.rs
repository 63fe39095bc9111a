//! In-memory store for tests, the CLI, and embedding without persistence.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::DownloadStore;
use crate::error::{DownloadError, Result};
use crate::model::{DownloadJob, JobUpdate, Settings};

#[derive(Default)]
pub struct MemoryStore {
    jobs: DashMap<String, DownloadJob>,
    settings: RwLock<Settings>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DownloadStore for MemoryStore {
    async fn insert(&self, job: &DownloadJob) -> Result<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DownloadJob>> {
        Ok(self.jobs.get(id).map(|entry| entry.value().clone()))
    }

    async fn list(&self) -> Result<Vec<DownloadJob>> {
        let mut jobs: Vec<DownloadJob> = self
            .jobs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<DownloadJob> {
        // The shard lock held by `get_mut` makes the read-modify-write atomic.
        let mut entry = self.jobs.get_mut(id).ok_or_else(|| DownloadError::NotFound {
            id: id.to_string(),
        })?;
        update.apply_to(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.jobs.remove(id);
        Ok(())
    }

    async fn settings(&self) -> Result<Settings> {
        Ok(self.settings.read().clone())
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        *self.settings.write() = settings.clone();
        Ok(())
    }
}
