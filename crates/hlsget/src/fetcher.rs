// Segment fetcher: one HTTP GET per attempt, bytes landed on disk at the
// deterministic per-index path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::{ACCEPT, CONNECTION, HeaderMap, HeaderValue, REFERER};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::model::segment_path;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// Build the shared HTTP client the engine uses for playlists and segments.
///
/// gzip/deflate are enabled at the feature level so reqwest advertises them
/// and decompresses transparently; setting the header by hand would disable
/// that.
pub(crate) fn build_client(config: &EngineConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    let client = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
        .default_headers(headers)
        .build()?;
    Ok(client)
}

/// `scheme://host[:port]` of a URL, used as the segment referer.
pub(crate) fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

pub struct SegmentFetcher {
    client: reqwest::Client,
    config: Arc<EngineConfig>,
    policy: RetryPolicy,
}

impl SegmentFetcher {
    pub fn new(client: reqwest::Client, config: Arc<EngineConfig>) -> Self {
        let policy = RetryPolicy {
            max_attempts: config.segment_attempts,
            base_delay: config.segment_retry_base_delay,
            max_delay: config.segment_retry_max_delay,
        };
        Self {
            client,
            config,
            policy,
        }
    }

    /// Download one segment to `<output_dir>/<stem>_segment_<index>.ts`.
    ///
    /// Retries per the engine policy; an attempt fails on transport error,
    /// non-2xx status, or an empty body. The body is written to a `.part`
    /// file and renamed, so a crashed write never masquerades as a present
    /// segment on resume. Returns the final path and byte count.
    pub async fn fetch_segment(
        &self,
        segment_url: &str,
        index: usize,
        output_dir: &Path,
        stem: &str,
        token: &CancellationToken,
    ) -> Result<(PathBuf, u64)> {
        let url = Url::parse(segment_url)
            .map_err(|e| DownloadError::invalid_url(segment_url, e.to_string()))?;
        let referer = origin_of(&url);

        let bytes = retry_with_backoff(&self.policy, token, |attempt| {
            let url = url.clone();
            let referer = referer.clone();
            async move {
                trace!(index, attempt, url = %url, "fetching segment");
                let request = self
                    .client
                    .get(url.clone())
                    .header(REFERER, referer)
                    .timeout(self.config.segment_fetch_timeout);

                let response = tokio::select! {
                    _ = token.cancelled() => return RetryAction::Fail(DownloadError::Cancelled),
                    response = request.send() => response,
                };
                let response = match response {
                    Ok(response) => response,
                    Err(e) => return RetryAction::Retry(DownloadError::from(e)),
                };

                if !response.status().is_success() {
                    return RetryAction::Retry(DownloadError::http_status(
                        response.status(),
                        url.as_str(),
                        "segment fetch",
                    ));
                }

                let body = tokio::select! {
                    _ = token.cancelled() => return RetryAction::Fail(DownloadError::Cancelled),
                    body = response.bytes() => body,
                };
                match body {
                    Ok(bytes) if bytes.is_empty() => RetryAction::Retry(
                        DownloadError::segment_fetch(format!("empty body for {url}")),
                    ),
                    Ok(bytes) => RetryAction::Success(bytes),
                    Err(e) => RetryAction::Retry(DownloadError::from(e)),
                }
            }
        })
        .await?;

        let path = segment_path(output_dir, stem, index);
        let part = path.with_extension("ts.part");
        tokio::fs::write(&part, &bytes).await?;
        tokio::fs::rename(&part, &path).await?;
        debug!(index, size = bytes.len(), path = %path.display(), "segment written");
        Ok((path, bytes.len() as u64))
    }
}
