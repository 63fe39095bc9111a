//! Job records, settings, and the naming scheme shared across the engine.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one download job.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Merging,
    Completed,
    Error,
    Cancelled,
}

impl DownloadStatus {
    /// Terminal statuses suppress further mutation of progress fields.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// One download of one media playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    /// Page the playlist was discovered on; may equal `playlist_url`.
    pub source_url: String,
    pub playlist_url: String,
    /// User-chosen stem; the final file is `<stem>.<ext>`.
    pub filename: String,
    pub status: DownloadStatus,
    /// Max concurrent segment fetches for this job (>= 1).
    pub threads: u32,
    pub output_dir: String,
    /// Ordered absolute segment URLs. Immutable once set.
    pub segments: Vec<String>,
    pub total_segments: u32,
    pub downloaded_segments: u32,
    /// Estimated total size, refreshed from the running per-segment average.
    pub file_size: u64,
    pub downloaded_bytes: u64,
    /// Percentage in [0, 100], two decimal places.
    pub progress: f64,
    /// Bytes per second over the current run.
    pub speed: f64,
    /// Remaining seconds at the current per-segment pace.
    pub eta: u64,
    pub output_file: Option<String>,
    /// Declared media duration in seconds, when the playlist carried one.
    pub duration: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadJob {
    pub fn new(
        id: impl Into<String>,
        source_url: impl Into<String>,
        playlist_url: impl Into<String>,
        filename: impl Into<String>,
        output_dir: impl Into<String>,
        segments: Vec<String>,
        threads: u32,
    ) -> Self {
        let now = Utc::now();
        let total_segments = segments.len() as u32;
        Self {
            id: id.into(),
            source_url: source_url.into(),
            playlist_url: playlist_url.into(),
            filename: filename.into(),
            status: DownloadStatus::Queued,
            threads: threads.max(1),
            output_dir: output_dir.into(),
            segments,
            total_segments,
            downloaded_segments: 0,
            file_size: 0,
            downloaded_bytes: 0,
            progress: 0.0,
            speed: 0.0,
            eta: 0,
            output_file: None,
            duration: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Singleton engine settings record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub max_concurrent_downloads: u32,
    pub default_threads: u32,
    pub default_output_path: String,
    pub auto_start: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            default_threads: 4,
            default_output_path: "./downloads".to_string(),
            auto_start: true,
        }
    }
}

/// Partial update applied to a job record.
///
/// `DownloadStore::update` treats one `JobUpdate` as a single atomic
/// read-modify-write; `updated_at` is refreshed on every application.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<DownloadStatus>,
    pub downloaded_segments: Option<u32>,
    pub downloaded_bytes: Option<u64>,
    pub file_size: Option<u64>,
    pub progress: Option<f64>,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
    pub output_file: Option<String>,
    pub duration: Option<f64>,
    /// `Some(None)` clears a stale error message.
    pub error_message: Option<Option<String>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: DownloadStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_downloaded_segments(mut self, count: u32) -> Self {
        self.downloaded_segments = Some(count);
        self
    }

    pub fn with_downloaded_bytes(mut self, bytes: u64) -> Self {
        self.downloaded_bytes = Some(bytes);
        self
    }

    pub fn with_file_size(mut self, bytes: u64) -> Self {
        self.file_size = Some(bytes);
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_eta(mut self, eta: u64) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_output_file(mut self, path: impl Into<String>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn clearing_error_message(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    /// Apply this update to a job in place.
    ///
    /// A terminal job accepts no further progress mutation; only an update
    /// that itself moves the status (resume, retry-merge) gets through.
    pub fn apply_to(&self, job: &mut DownloadJob) {
        if job.status.is_terminal() && self.status.is_none() {
            return;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(count) = self.downloaded_segments {
            job.downloaded_segments = count;
        }
        if let Some(bytes) = self.downloaded_bytes {
            job.downloaded_bytes = bytes;
        }
        if let Some(bytes) = self.file_size {
            job.file_size = bytes;
        }
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(speed) = self.speed {
            job.speed = speed;
        }
        if let Some(eta) = self.eta {
            job.eta = eta;
        }
        if let Some(ref path) = self.output_file {
            job.output_file = Some(path.clone());
        }
        if let Some(duration) = self.duration {
            job.duration = Some(duration);
        }
        if let Some(ref message) = self.error_message {
            job.error_message = message.clone();
        }
        job.updated_at = Utc::now();
    }
}

/// Deterministic on-disk location of one segment. This naming is the sole
/// cross-restart resume channel besides the job record itself.
pub fn segment_path(output_dir: &Path, stem: &str, index: usize) -> PathBuf {
    output_dir.join(format!("{stem}_segment_{index}.ts"))
}

/// Recover the segment index embedded in a path produced by [`segment_path`].
/// Paths that do not match fall to index 0.
pub fn segment_index_of(path: &Path) -> usize {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.rsplit_once("_segment_"))
        .and_then(|(_, index)| index.parse().ok())
        .unwrap_or(0)
}

/// Final container path, coalescing a duplicate trailing extension.
pub fn final_output_path(output_dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let suffix = format!(".{}", extension.to_ascii_lowercase());
    if stem.to_ascii_lowercase().ends_with(&suffix) {
        output_dir.join(stem)
    } else {
        output_dir.join(format!("{stem}.{extension}"))
    }
}

const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const RESERVED_FILENAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Make a user-supplied stem safe across platforms: control and reserved
/// characters collapse to a single `_`, leading/trailing dots and spaces are
/// trimmed, Windows device names get a `_` prefix.
pub fn sanitize_filename(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_replaced = false;
    for ch in input.chars() {
        if ch.is_control() || INVALID_FILENAME_CHARS.contains(&ch) {
            if !last_replaced {
                out.push('_');
                last_replaced = true;
            }
        } else {
            out.push(ch);
            last_replaced = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "download".to_string();
    }

    let upper = trimmed.to_uppercase();
    let reserved = RESERVED_FILENAMES
        .iter()
        .any(|name| upper == *name || upper.starts_with(&format!("{name}.")));
    if reserved {
        format!("_{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Round a percentage to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The completion-threshold rule: a job with missing segments still counts as
/// complete when enough of it arrived.
///
/// Holds when all segments are present, when at least 98% are present, or
/// when everything else failed and the failures stayed within
/// `max(2, ceil(2% of total))`.
pub fn completion_threshold_met(downloaded: u32, failed: u32, total: u32) -> bool {
    if total == 0 {
        return false;
    }
    if downloaded >= total {
        return true;
    }
    let ratio = f64::from(downloaded) / f64::from(total);
    if ratio >= 0.98 && downloaded > 0 {
        return true;
    }
    let allowed_failures = 2u32.max((f64::from(total) * 0.02).ceil() as u32);
    downloaded + failed >= total && failed <= allowed_failures
}
