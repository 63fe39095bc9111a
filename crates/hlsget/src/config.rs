// Engine-wide configuration with defaults matching common CDN behavior.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// User agent sent with playlist and segment requests.
    pub user_agent: String,
    /// Deadline for fetching a playlist document.
    pub playlist_fetch_timeout: Duration,
    /// Per-attempt deadline for one segment GET.
    pub segment_fetch_timeout: Duration,
    /// Total attempts per segment (initial try included).
    pub segment_attempts: u32,
    /// Backoff between attempts grows linearly: `base * attempt`, capped.
    pub segment_retry_base_delay: Duration,
    pub segment_retry_max_delay: Duration,
    /// Redirect cap for segment and playlist requests.
    pub max_redirects: usize,
    /// Container extension for the merged output file.
    pub output_extension: String,
    /// Candidate muxer locations, probed in order at engine construction.
    /// The bare command name is tried last via the executable search path.
    pub ffmpeg_search_paths: Vec<PathBuf>,
    /// Capacity of the broadcast event bus. Lagging subscribers drop events.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            playlist_fetch_timeout: Duration::from_secs(15),
            segment_fetch_timeout: Duration::from_secs(15),
            segment_attempts: 3,
            segment_retry_base_delay: Duration::from_secs(1),
            segment_retry_max_delay: Duration::from_secs(5),
            max_redirects: 5,
            output_extension: "mp4".to_string(),
            ffmpeg_search_paths: vec![
                PathBuf::from("/usr/bin/ffmpeg"),
                PathBuf::from("/usr/local/bin/ffmpeg"),
                PathBuf::from("/opt/homebrew/bin/ffmpeg"),
                PathBuf::from("ffmpeg"),
            ],
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Configuration suited to tests: millisecond backoff, no muxer probing.
    #[doc(hidden)]
    pub fn for_tests() -> Self {
        Self {
            segment_retry_base_delay: Duration::from_millis(10),
            segment_retry_max_delay: Duration::from_millis(50),
            ffmpeg_search_paths: Vec::new(),
            ..Self::default()
        }
    }
}
