// Playlist resolver: fetch a playlist document, classify it as master or
// media, and surface segment URLs ready for the fetcher.

use std::sync::Arc;

use m3u8_rs::{MediaPlaylistType, Playlist};
use reqwest::header::REFERER;
use tracing::debug;
use url::Url;

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};

/// One renditions entry of a master playlist.
#[derive(Debug, Clone)]
pub struct Variant {
    /// Absolute media-playlist URL.
    pub url: String,
    pub bandwidth: u64,
    /// `RESOLUTION=WxH` when declared.
    pub resolution: Option<(u64, u64)>,
}

/// A media playlist reduced to what the engine needs.
#[derive(Debug, Clone)]
pub struct MediaPlaylistInfo {
    /// Ordered absolute segment URLs.
    pub segments: Vec<String>,
    /// Aggregate `#EXTINF` duration in seconds.
    pub duration: f64,
    /// Whether the playlist is still rolling. The resolver returns live
    /// playlists; refusing them is the caller's decision.
    pub live: bool,
}

#[derive(Debug, Clone)]
pub enum ResolvedPlaylist {
    /// Variant list. Selection among variants is the caller's responsibility.
    Master { variants: Vec<Variant> },
    Media(MediaPlaylistInfo),
}

/// How to descend from a master playlist to one of its variants.
#[derive(Debug, Clone, Copy, Default)]
pub enum VariantPolicy {
    #[default]
    HighestBandwidth,
    LowestBandwidth,
    ClosestToBandwidth(u64),
}

/// Pick a variant under the given policy.
pub fn select_variant<'a>(variants: &'a [Variant], policy: VariantPolicy) -> Result<&'a Variant> {
    let selected = match policy {
        VariantPolicy::HighestBandwidth => variants.iter().max_by_key(|v| v.bandwidth),
        VariantPolicy::LowestBandwidth => variants.iter().min_by_key(|v| v.bandwidth),
        VariantPolicy::ClosestToBandwidth(target) => variants
            .iter()
            .min_by_key(|v| v.bandwidth.abs_diff(target)),
    };
    selected.ok_or_else(|| DownloadError::playlist("master playlist has no variants"))
}

pub struct PlaylistResolver {
    client: reqwest::Client,
    config: Arc<EngineConfig>,
}

impl PlaylistResolver {
    pub fn new(client: reqwest::Client, config: Arc<EngineConfig>) -> Self {
        Self { client, config }
    }

    /// Fetch and classify the playlist at `url`.
    ///
    /// Transport failures, non-2xx responses, and empty bodies all fail with
    /// a playlist error.
    pub async fn resolve(&self, url: &str) -> Result<ResolvedPlaylist> {
        let playlist_url =
            Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e.to_string()))?;

        let response = self
            .client
            .get(playlist_url.clone())
            // A playlist is its own referer; some origins require one.
            .header(REFERER, playlist_url.as_str())
            .timeout(self.config.playlist_fetch_timeout)
            .send()
            .await
            .map_err(|e| DownloadError::playlist(format!("fetching {playlist_url}: {e}")))?;

        if !response.status().is_success() {
            return Err(DownloadError::playlist(format!(
                "fetching {playlist_url}: HTTP {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DownloadError::playlist(format!("reading {playlist_url}: {e}")))?;
        if body.is_empty() {
            return Err(DownloadError::playlist(format!(
                "empty playlist body from {playlist_url}"
            )));
        }

        classify(&body, &playlist_url)
    }
}

/// Parse a playlist document and resolve every URI against `base`.
pub(crate) fn classify(content: &[u8], base: &Url) -> Result<ResolvedPlaylist> {
    match m3u8_rs::parse_playlist_res(content) {
        Ok(Playlist::MasterPlaylist(master)) => {
            let variants = master
                .variants
                .iter()
                .map(|variant| {
                    let url = resolve_uri(base, &variant.uri)?;
                    Ok(Variant {
                        url,
                        bandwidth: variant.bandwidth,
                        resolution: variant.resolution.as_ref().map(|r| (r.width, r.height)),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            debug!(count = variants.len(), "classified master playlist");
            Ok(ResolvedPlaylist::Master { variants })
        }
        Ok(Playlist::MediaPlaylist(playlist)) => {
            let segments = playlist
                .segments
                .iter()
                .map(|segment| resolve_uri(base, &segment.uri))
                .collect::<Result<Vec<_>>>()?;
            let duration = playlist
                .segments
                .iter()
                .map(|segment| f64::from(segment.duration))
                .sum();

            // Live unless the playlist explicitly declares VOD: any other
            // declared type counts as live, and so does a target duration
            // with no VOD marker.
            let live = match playlist.playlist_type.as_ref() {
                Some(MediaPlaylistType::Vod) => false,
                Some(_) => true,
                None => playlist.target_duration as f64 > 0.0,
            };

            debug!(
                segments = segments.len(),
                duration, live, "classified media playlist"
            );
            Ok(ResolvedPlaylist::Media(MediaPlaylistInfo {
                segments,
                duration,
                live,
            }))
        }
        Err(e) => Err(DownloadError::playlist(format!(
            "unparseable playlist from {base}: {e}"
        ))),
    }
}

fn resolve_uri(base: &Url, uri: &str) -> Result<String> {
    base.join(uri)
        .map(|url| url.to_string())
        .map_err(|e| DownloadError::playlist(format!("resolving `{uri}` against {base}: {e}")))
}
