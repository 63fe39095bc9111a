//! Muxer driver: assemble downloaded segments into the final container.
//!
//! The preferred path feeds an ffmpeg concat manifest and stream-copies into
//! the target container. When no ffmpeg binary can be located the driver
//! degrades to raw byte concatenation, which keeps transport-stream segments
//! playable and always leaves the user with a file.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::model::{final_output_path, segment_index_of};

/// What a merge produced.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub output_file: PathBuf,
    /// Media duration probed from the finished file, when ffmpeg was used.
    pub duration: Option<f64>,
    /// True when the byte-concat fallback produced the file.
    pub used_fallback: bool,
}

pub struct MuxerDriver {
    config: Arc<EngineConfig>,
    /// Located once at engine construction and remembered for the process.
    binary: Option<PathBuf>,
}

impl MuxerDriver {
    /// Probe the configured search list in order; the first candidate that
    /// answers `-version` wins. An empty result is not an error; it selects
    /// the fallback path for every merge.
    pub fn locate(config: Arc<EngineConfig>) -> Self {
        let binary = config
            .ffmpeg_search_paths
            .iter()
            .find(|candidate| probe_binary(candidate))
            .cloned();
        match &binary {
            Some(path) => info!(path = %path.display(), "muxer binary located"),
            None => info!("no muxer binary found; merges will use byte concatenation"),
        }
        Self { config, binary }
    }

    pub fn is_available(&self) -> bool {
        self.binary.is_some()
    }

    /// Merge `segment_files` into `<output_dir>/<stem>.<ext>`.
    ///
    /// Inputs are reordered by their embedded segment index regardless of the
    /// order fetches completed in. On success the segment files are deleted;
    /// on a muxer run failure they are retained and the error is surfaced.
    pub async fn merge(
        &self,
        output_dir: &Path,
        stem: &str,
        segment_files: Vec<PathBuf>,
        declared_duration: Option<f64>,
        job_id: &str,
        events: &EventBus,
    ) -> Result<MergeOutcome> {
        if segment_files.is_empty() {
            return Err(DownloadError::merge("no segments to merge"));
        }
        let ordered = order_segments(segment_files);
        let output_file = final_output_path(output_dir, stem, &self.config.output_extension);

        match &self.binary {
            Some(binary) => {
                let duration = self
                    .run_ffmpeg(
                        binary,
                        output_dir,
                        stem,
                        &ordered,
                        &output_file,
                        declared_duration,
                        job_id,
                        events,
                    )
                    .await?;
                delete_segments(&ordered).await;
                Ok(MergeOutcome {
                    output_file,
                    duration,
                    used_fallback: false,
                })
            }
            None => {
                self.concat_fallback(&ordered, &output_file, job_id, events)
                    .await?;
                delete_segments(&ordered).await;
                Ok(MergeOutcome {
                    output_file,
                    duration: None,
                    used_fallback: true,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_ffmpeg(
        &self,
        binary: &Path,
        output_dir: &Path,
        stem: &str,
        ordered: &[PathBuf],
        output_file: &Path,
        declared_duration: Option<f64>,
        job_id: &str,
        events: &EventBus,
    ) -> Result<Option<f64>> {
        let manifest_path = output_dir.join(format!("{stem}_concat.txt"));
        tokio::fs::write(&manifest_path, manifest_content(ordered)?).await?;

        debug!(
            manifest = %manifest_path.display(),
            output = %output_file.display(),
            "starting ffmpeg concat"
        );
        let spawned = Command::new(binary)
            .args(["-y", "-hide_banner", "-f", "concat", "-safe", "0", "-i"])
            .arg(&manifest_path)
            .args(["-c", "copy", "-avoid_negative_ts", "make_zero", "-fflags", "+genpts"])
            .arg(output_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                remove_quietly(&manifest_path).await;
                return Err(DownloadError::merge(format!("spawning ffmpeg: {e}")));
            }
        };

        let mut last_line = String::new();
        if let Some(stderr) = child.stderr.take() {
            let mut records = RecordReader::new(stderr);
            let mut last_percent = -1i64;
            while let Ok(Some(line)) = records.next_record().await {
                if let (Some(position), Some(total)) = (parse_time_field(&line), declared_duration)
                    && total > 0.0
                {
                    let percent = ((position / total) * 100.0).clamp(0.0, 100.0);
                    if percent.floor() as i64 > last_percent {
                        last_percent = percent.floor() as i64;
                        events.emit(EngineEvent::MergeProgress {
                            id: job_id.to_string(),
                            progress: percent.floor(),
                        });
                    }
                } else {
                    last_line = line;
                }
            }
        }

        let status = child.wait().await;
        // The manifest is scratch; it goes away regardless of the outcome.
        remove_quietly(&manifest_path).await;

        let status = status.map_err(|e| DownloadError::merge(format!("waiting for ffmpeg: {e}")))?;
        if !status.success() {
            let mut reason = format!("ffmpeg exited with {status}");
            if !last_line.is_empty() {
                reason.push_str(": ");
                reason.push_str(&last_line);
            }
            return Err(DownloadError::merge(reason));
        }

        events.emit(EngineEvent::MergeProgress {
            id: job_id.to_string(),
            progress: 100.0,
        });

        let duration = probe_duration(binary, output_file).await.or(declared_duration);
        Ok(duration)
    }

    async fn concat_fallback(
        &self,
        ordered: &[PathBuf],
        output_file: &Path,
        job_id: &str,
        events: &EventBus,
    ) -> Result<()> {
        events.emit(EngineEvent::MergeProgress {
            id: job_id.to_string(),
            progress: 0.0,
        });

        let mut output = tokio::fs::File::create(output_file).await?;
        for segment in ordered {
            let mut input = tokio::fs::File::open(segment).await?;
            tokio::io::copy(&mut input, &mut output).await?;
        }
        output.flush().await?;

        events.emit(EngineEvent::MergeProgress {
            id: job_id.to_string(),
            progress: 100.0,
        });
        info!(output = %output_file.display(), "segments concatenated without muxer");
        Ok(())
    }
}

/// Sort segment paths by the index embedded in `…_segment_<n>.ts`.
/// Non-matching names fall to index 0; the sort is stable, so ties keep
/// their input order.
pub fn order_segments(mut files: Vec<PathBuf>) -> Vec<PathBuf> {
    files.sort_by_key(|path| segment_index_of(path));
    files
}

/// One `file '<absolute path>'` line per segment.
fn manifest_content(ordered: &[PathBuf]) -> Result<String> {
    let mut out = String::new();
    for path in ordered {
        let absolute = std::path::absolute(path)?;
        out.push_str(&format!("file '{}'\n", absolute.display()));
    }
    Ok(out)
}

fn probe_binary(candidate: &Path) -> bool {
    std::process::Command::new(candidate)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Ask ffmpeg about the finished file and parse the `Duration:` banner line.
/// `ffmpeg -i` without an output exits nonzero by design; only the banner
/// matters here.
async fn probe_duration(binary: &Path, output_file: &Path) -> Option<f64> {
    let result = Command::new(binary)
        .arg("-hide_banner")
        .arg("-i")
        .arg(output_file)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .ok()?;
    let stderr = String::from_utf8_lossy(&result.stderr);
    stderr.lines().find_map(parse_duration_field)
}

async fn delete_segments(files: &[PathBuf]) {
    for file in files {
        if let Err(e) = tokio::fs::remove_file(file).await {
            // Leftover temp files are an annoyance, not a failure.
            warn!(path = %file.display(), error = %e, "could not delete segment file");
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "could not delete concat manifest");
    }
}

/// Parse `HH:MM:SS.ms` into seconds.
fn parse_time(text: &str) -> Option<f64> {
    let mut parts = text.splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Extract `time=HH:MM:SS.ms` from an ffmpeg progress record.
fn parse_time_field(line: &str) -> Option<f64> {
    let start = line.find("time=")?;
    let rest = &line[start + 5..];
    let end = rest.find(' ').unwrap_or(rest.len());
    parse_time(&rest[..end])
}

/// Extract `Duration: HH:MM:SS.ms` from an ffmpeg banner line.
fn parse_duration_field(line: &str) -> Option<f64> {
    let start = line.find("Duration:")?;
    let rest = line[start + 9..].trim_start();
    let end = rest.find(',').unwrap_or(rest.len());
    parse_time(rest[..end].trim())
}

/// Yields stderr records split on `\n` *or* `\r`.
///
/// ffmpeg rewrites its progress line with carriage returns when piped, so a
/// plain line reader would sit on updates until the process exits.
struct RecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    async fn next_record(&mut self) -> io::Result<Option<String>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(split) = self
                .pending
                .iter()
                .position(|&b| b == b'\n' || b == b'\r')
            {
                let rest = self.pending.split_off(split);
                let record_bytes = std::mem::replace(&mut self.pending, rest);
                let skip = self
                    .pending
                    .iter()
                    .take_while(|&&b| b == b'\n' || b == b'\r')
                    .count();
                self.pending.drain(..skip);

                let record = String::from_utf8_lossy(&record_bytes).trim().to_string();
                if !record.is_empty() {
                    return Ok(Some(record));
                }
                continue;
            }

            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                let record = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                return Ok(if record.is_empty() { None } else { Some(record) });
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::segment_path;

    #[test]
    fn ordering_is_by_embedded_index_not_completion_order() {
        let dir = Path::new("/tmp/x");
        let files = vec![
            segment_path(dir, "show", 10),
            segment_path(dir, "show", 2),
            segment_path(dir, "show", 0),
            segment_path(dir, "show", 1),
        ];
        let ordered = order_segments(files);
        let indices: Vec<usize> = ordered.iter().map(|p| segment_index_of(p)).collect();
        assert_eq!(indices, vec![0, 1, 2, 10]);
    }

    #[test]
    fn unparseable_names_sort_first_in_input_order() {
        let files = vec![
            PathBuf::from("/tmp/show_segment_3.ts"),
            PathBuf::from("/tmp/stray_b.ts"),
            PathBuf::from("/tmp/stray_a.ts"),
        ];
        let ordered = order_segments(files);
        assert_eq!(ordered[0], PathBuf::from("/tmp/stray_b.ts"));
        assert_eq!(ordered[1], PathBuf::from("/tmp/stray_a.ts"));
        assert_eq!(ordered[2], PathBuf::from("/tmp/show_segment_3.ts"));
    }

    #[test]
    fn manifest_quotes_absolute_paths() {
        let files = vec![
            PathBuf::from("/tmp/out/show_segment_0.ts"),
            PathBuf::from("/tmp/out/show_segment_1.ts"),
        ];
        let manifest = manifest_content(&files).unwrap();
        assert_eq!(
            manifest,
            "file '/tmp/out/show_segment_0.ts'\nfile '/tmp/out/show_segment_1.ts'\n"
        );
    }

    #[test]
    fn time_parsing() {
        assert_eq!(parse_time("00:00:10.50"), Some(10.5));
        assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_time("nope"), None);

        let line = "frame=  100 fps=25 size=1024kB time=00:00:04.00 bitrate=2097.2kbits/s";
        assert_eq!(parse_time_field(line), Some(4.0));
        assert_eq!(parse_time_field("no time here"), None);

        let banner = "  Duration: 00:01:02.34, start: 0.000000, bitrate: 2100 kb/s";
        assert_eq!(parse_duration_field(banner), Some(62.34));
    }

    #[tokio::test]
    async fn record_reader_splits_on_cr_and_lf() {
        let (mut tx, rx) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let _ = tx.write_all(b"one\rtwo\nthree\r\nfour").await;
        });
        let mut records = RecordReader::new(rx);
        let mut seen = Vec::new();
        while let Some(record) = records.next_record().await.unwrap() {
            seen.push(record);
        }
        assert_eq!(seen, vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn fallback_concat_is_byte_exact_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let stem = "clip";
        // Written in shuffled order; the merge must reorder by index.
        let payloads: [(usize, &[u8]); 3] = [(2, b"ccc"), (0, b"aaaa"), (1, b"bb")];
        let mut files = Vec::new();
        for (index, bytes) in payloads {
            let path = segment_path(dir.path(), stem, index);
            tokio::fs::write(&path, bytes).await.unwrap();
            files.push(path);
        }

        let config = Arc::new(EngineConfig::for_tests());
        let driver = MuxerDriver::locate(config);
        assert!(!driver.is_available());

        let events = EventBus::new(16);
        let outcome = driver
            .merge(dir.path(), stem, files.clone(), None, "job", &events)
            .await
            .unwrap();

        assert!(outcome.used_fallback);
        assert_eq!(outcome.output_file, dir.path().join("clip.mp4"));
        let merged = tokio::fs::read(&outcome.output_file).await.unwrap();
        assert_eq!(merged, b"aaaabbccc");
        for file in files {
            assert!(!file.exists(), "segment should be deleted after merge");
        }
    }

    #[tokio::test]
    async fn merge_with_no_segments_is_an_error() {
        let config = Arc::new(EngineConfig::for_tests());
        let driver = MuxerDriver::locate(config);
        let events = EventBus::new(4);
        let err = driver
            .merge(Path::new("/tmp"), "x", Vec::new(), None, "job", &events)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Merge { .. }));
    }
}
