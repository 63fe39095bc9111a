//! hlsget: download one segmented stream into a single file.
//!
//! A thin front-end over the engine crate: in-memory store, one job, events
//! rendered as log lines. Ctrl-C cancels the job cooperatively; segment
//! files already on disk survive for a later resume.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hlsget_engine::{
    DownloadEngine, DownloadError, DownloadStatus, EngineConfig, EngineEvent, MemoryStore,
    NewDownload, VariantPolicy,
};

#[derive(Debug, Parser)]
#[command(name = "hlsget", version, about = "Download a segmented HTTP stream into a single file")]
struct Args {
    /// Playlist URL (master or media).
    url: String,

    /// Output filename stem; the container extension is appended.
    #[arg(short = 'n', long, default_value = "download")]
    filename: String,

    /// Directory for segment temp files and the final output.
    #[arg(short, long, default_value = ".")]
    output_dir: String,

    /// Concurrent segment fetches.
    #[arg(short, long, default_value_t = 4)]
    threads: u32,

    /// Pick the lowest-bandwidth variant of a master playlist instead of
    /// the highest.
    #[arg(long)]
    lowest: bool,

    /// Target container extension for the merged file.
    #[arg(long, default_value = "mp4")]
    extension: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(DownloadStatus::Completed) => ExitCode::SUCCESS,
        Ok(status) => {
            warn!(%status, "download did not complete");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "download failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<DownloadStatus, DownloadError> {
    let config = EngineConfig {
        output_extension: args.extension.clone(),
        ..EngineConfig::default()
    };
    let engine = DownloadEngine::new(Arc::new(MemoryStore::new()), config)?;
    if !engine.muxer_available() {
        warn!("no ffmpeg found; the output will be a raw concatenation of segments");
    }
    let mut events = engine.subscribe();

    let mut request = NewDownload::new(args.url, args.filename);
    request.output_dir = Some(args.output_dir);
    request.threads = Some(args.threads.max(1));
    if args.lowest {
        request.variant_policy = VariantPolicy::LowestBandwidth;
    }

    let job = engine.create(request).await?;
    info!(
        id = %job.id,
        segments = job.total_segments,
        threads = job.threads,
        "download started"
    );

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted; cancelling (segment files are kept for resume)");
                engine.cancel(&job.id).await?;
                return Ok(DownloadStatus::Cancelled);
            }
        };
        match event {
            Ok(EngineEvent::DownloadProgress {
                progress,
                downloaded_segments,
                speed,
                eta,
                ..
            }) => {
                info!(
                    "{progress:.2}% ({downloaded_segments}/{} segments) {} eta {eta}s",
                    job.total_segments,
                    format_speed(speed),
                );
            }
            Ok(EngineEvent::MergeProgress { progress, .. }) => {
                info!("merging: {progress:.0}%");
            }
            Ok(EngineEvent::DownloadStatus {
                status,
                error_message,
                output_file,
                message,
                ..
            }) => {
                if let Some(message) = message {
                    info!("{message}");
                }
                if let Some(error_message) = error_message {
                    warn!("{error_message}");
                }
                if let Some(output_file) = output_file {
                    info!(output = %output_file, "wrote output file");
                }
                if status.is_terminal() {
                    return Ok(status);
                }
            }
            Err(_) => {
                // Bus closed or we lagged far behind; fall back to polling
                // the record for a terminal state.
                if let Some(job) = engine.job(&job.id).await?
                    && job.status.is_terminal()
                {
                    return Ok(job.status);
                }
                events = engine.subscribe();
            }
        }
    }
}

fn format_speed(bytes_per_sec: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    if bytes_per_sec >= MIB {
        format!("{:.2} MiB/s", bytes_per_sec / MIB)
    } else if bytes_per_sec >= KIB {
        format!("{:.1} KiB/s", bytes_per_sec / KIB)
    } else {
        format!("{bytes_per_sec:.0} B/s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_formatting_picks_a_sensible_unit() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(4.5 * 1024.0), "4.5 KiB/s");
        assert_eq!(format_speed(3.25 * 1024.0 * 1024.0), "3.25 MiB/s");
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::parse_from(["hlsget", "https://example.com/index.m3u8"]);
        assert_eq!(args.threads, 4);
        assert_eq!(args.filename, "download");
        assert_eq!(args.extension, "mp4");
        assert!(!args.lowest);
    }
}
