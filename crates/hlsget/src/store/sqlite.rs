//! SQLite-backed store.
//!
//! Records are kept in a single `downloads` table; the segment list is a
//! JSON column, timestamps are RFC 3339 text. The settings singleton is one
//! JSON row. Schema setup happens at connect time.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::DownloadStore;
use crate::error::{DownloadError, Result};
use crate::model::{DownloadJob, DownloadStatus, JobUpdate, Settings};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS downloads (
    id                  TEXT PRIMARY KEY,
    source_url          TEXT NOT NULL,
    playlist_url        TEXT NOT NULL,
    filename            TEXT NOT NULL,
    status              TEXT NOT NULL,
    threads             INTEGER NOT NULL,
    output_dir          TEXT NOT NULL,
    segments            TEXT NOT NULL,
    total_segments      INTEGER NOT NULL,
    downloaded_segments INTEGER NOT NULL,
    file_size           INTEGER NOT NULL,
    downloaded_bytes    INTEGER NOT NULL,
    progress            REAL NOT NULL,
    speed               REAL NOT NULL,
    eta                 INTEGER NOT NULL,
    output_file         TEXT,
    duration            REAL,
    error_message       TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS settings (
    id   INTEGER PRIMARY KEY CHECK (id = 1),
    data TEXT NOT NULL
);
";

/// Row model; conversion to the domain type validates status and timestamps.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    source_url: String,
    playlist_url: String,
    filename: String,
    status: String,
    threads: i64,
    output_dir: String,
    segments: String,
    total_segments: i64,
    downloaded_segments: i64,
    file_size: i64,
    downloaded_bytes: i64,
    progress: f64,
    speed: f64,
    eta: i64,
    output_file: Option<String>,
    duration: Option<f64>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DownloadError::storage(format!("bad timestamp `{text}`: {e}")))
}

impl JobRow {
    fn into_job(self) -> Result<DownloadJob> {
        let status = DownloadStatus::from_str(&self.status)
            .map_err(|_| DownloadError::storage(format!("unknown status `{}`", self.status)))?;
        let segments: Vec<String> = serde_json::from_str(&self.segments)
            .map_err(|e| DownloadError::storage(format!("bad segment list: {e}")))?;
        Ok(DownloadJob {
            id: self.id,
            source_url: self.source_url,
            playlist_url: self.playlist_url,
            filename: self.filename,
            status,
            threads: self.threads.max(1) as u32,
            output_dir: self.output_dir,
            segments,
            total_segments: self.total_segments as u32,
            downloaded_segments: self.downloaded_segments as u32,
            file_size: self.file_size as u64,
            downloaded_bytes: self.downloaded_bytes as u64,
            progress: self.progress,
            speed: self.speed,
            eta: self.eta as u64,
            output_file: self.output_file,
            duration: self.duration,
            error_message: self.error_message,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect (creating the file if needed) and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn write_job(
        &self,
        job: &DownloadJob,
        executor: &mut sqlx::SqliteConnection,
    ) -> Result<()> {
        let segments = serde_json::to_string(&job.segments)
            .map_err(|e| DownloadError::storage(format!("encoding segment list: {e}")))?;
        sqlx::query(
            "INSERT INTO downloads (
                id, source_url, playlist_url, filename, status, threads, output_dir,
                segments, total_segments, downloaded_segments, file_size,
                downloaded_bytes, progress, speed, eta, output_file, duration,
                error_message, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                threads = excluded.threads,
                output_dir = excluded.output_dir,
                segments = excluded.segments,
                total_segments = excluded.total_segments,
                downloaded_segments = excluded.downloaded_segments,
                file_size = excluded.file_size,
                downloaded_bytes = excluded.downloaded_bytes,
                progress = excluded.progress,
                speed = excluded.speed,
                eta = excluded.eta,
                output_file = excluded.output_file,
                duration = excluded.duration,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at",
        )
        .bind(&job.id)
        .bind(&job.source_url)
        .bind(&job.playlist_url)
        .bind(&job.filename)
        .bind(job.status.to_string())
        .bind(job.threads as i64)
        .bind(&job.output_dir)
        .bind(segments)
        .bind(job.total_segments as i64)
        .bind(job.downloaded_segments as i64)
        .bind(job.file_size as i64)
        .bind(job.downloaded_bytes as i64)
        .bind(job.progress)
        .bind(job.speed)
        .bind(job.eta as i64)
        .bind(&job.output_file)
        .bind(job.duration)
        .bind(&job.error_message)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DownloadStore for SqliteStore {
    async fn insert(&self, job: &DownloadJob) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.write_job(job, &mut conn).await
    }

    async fn get(&self, id: &str) -> Result<Option<DownloadJob>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list(&self) -> Result<Vec<DownloadJob>> {
        let rows: Vec<JobRow> = sqlx::query_as("SELECT * FROM downloads ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<DownloadJob> {
        // Read-modify-write inside one transaction so concurrent updates to
        // the same record serialize at the database.
        let mut tx = self.pool.begin().await?;
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut job = row
            .ok_or_else(|| DownloadError::NotFound { id: id.to_string() })?
            .into_job()?;
        update.apply_to(&mut job);
        self.write_job(&job, &mut tx).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn settings(&self) -> Result<Settings> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((data,)) => serde_json::from_str(&data)
                .map_err(|e| DownloadError::storage(format!("bad settings record: {e}"))),
            None => Ok(Settings::default()),
        }
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        let data = serde_json::to_string(settings)
            .map_err(|e| DownloadError::storage(format!("encoding settings: {e}")))?;
        sqlx::query(
            "INSERT INTO settings (id, data) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
        )
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
