#![forbid(unsafe_code)]

//! Concurrent batch front-end for yt-dlp.
//!
//! Reads a URL list (arguments or a file), fans the downloads out to a
//! bounded pool of yt-dlp worker processes, and aggregates progress and
//! results. Format negotiation, retries, muxing, and metadata embedding
//! stay yt-dlp's and ffmpeg's job.

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use ytbatch::config;
use ytbatch::progress::ProgressDisplay;
use ytbatch::runner::{self, BatchOptions};
use ytbatch::urls;
use ytbatch::ytdlp::{self, Ytdlp};

#[derive(Parser, Debug)]
#[command(author, version, about = "Download videos concurrently through yt-dlp.")]
#[command(group(
    ArgGroup::new("input")
        .args(["urls", "file"])
        .required(true)
        .multiple(false)
))]
struct Cli {
    /// Video URLs to download.
    #[arg(short, long, num_args = 1.., value_name = "URL")]
    urls: Vec<String>,

    /// File with one URL per line (# starts a comment).
    #[arg(short, long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Maximum video height, e.g. 1080 or 720.
    #[arg(short, long, value_name = "HEIGHT")]
    quality: Option<u32>,

    /// Output directory for downloaded videos.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Number of parallel downloads (default: logical CPU count).
    #[arg(short, long, value_name = "N")]
    parallel: Option<usize>,

    /// Netscape cookie file handed to yt-dlp.
    #[arg(short, long, value_name = "PATH")]
    cookies: Option<PathBuf>,

    /// Suppress yt-dlp's own console output.
    #[arg(long)]
    quiet_ydl: bool,

    /// Enable debug logging for this tool.
    #[arg(long)]
    verbose: bool,

    /// Env file with defaults (YTDLP_BIN, OUTPUT_DIR, COOKIES_FILE, QUALITY,
    /// PARALLEL). Flags always win.
    #[arg(long, value_name = "PATH", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let env_cfg = config::read_env_config(&cli.config)?.unwrap_or_default();

    let quality = cli
        .quality
        .or(env_cfg.quality)
        .context("No quality given; pass -q/--quality or set QUALITY in the env file")?;
    let parallel = resolve_parallelism(cli.parallel.or(env_cfg.parallel));
    let cookies = resolve_cookies(cli.cookies.clone().or(env_cfg.cookies_file));

    let output_dir = cli
        .output
        .clone()
        .or(env_cfg.output_dir)
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_OUTPUT_DIR));
    let output_dir = std::path::absolute(&output_dir)
        .with_context(|| format!("Resolving output directory {}", output_dir.display()))?;

    let ytdlp = Ytdlp::new(
        env_cfg
            .ytdlp_bin
            .unwrap_or_else(|| PathBuf::from(config::DEFAULT_YTDLP_BIN)),
    );
    let version = ytdlp.ensure_available()?;
    tracing::info!("Using {} (version {})", ytdlp.bin().display(), version);
    if !ytdlp::program_available(config::DEFAULT_FFMPEG_BIN) {
        tracing::warn!("ffmpeg not found; merging and metadata embedding will be limited");
    }

    let raw_urls = if let Some(file) = &cli.file {
        let loaded = urls::load_url_file(file)?;
        tracing::info!("Loaded {} URL(s) from {}", loaded.len(), file.display());
        loaded
    } else {
        cli.urls.clone()
    };
    let url_list = urls::sanitize(raw_urls);
    if url_list.is_empty() {
        bail!("No valid URLs to download");
    }

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Creating output directory {}", output_dir.display()))?;

    println!(
        "Downloading {} video(s) at up to {}p with {} parallel worker(s)",
        url_list.len(),
        quality,
        parallel
    );
    println!("Output directory: {}", output_dir.display());
    if let Some(cookies) = &cookies {
        println!("Cookie file: {}", cookies.display());
    }
    println!();

    // First Ctrl-C cancels the batch; workers are killed and the summary is
    // still printed.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("Interrupt received; stopping workers...");
            signal_cancel.cancel();
        }
    });

    let display = Arc::new(ProgressDisplay::new(url_list.len() as u64));
    let options = BatchOptions {
        quality,
        output_dir: output_dir.clone(),
        cookies,
        quiet_ydl: cli.quiet_ydl,
        parallel,
    };

    let summary = runner::run_batch(
        Arc::new(ytdlp),
        url_list,
        options,
        display.clone(),
        cancel,
    )
    .await;

    display.finish();
    summary.print(&output_dir);

    if !summary.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "ytbatch=debug" } else { "ytbatch=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Invalid or missing counts fall back to one worker per logical CPU.
fn resolve_parallelism(requested: Option<usize>) -> usize {
    let default = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4);
    match requested {
        Some(0) => {
            tracing::warn!("Invalid worker count 0; using default: {}", default);
            default
        }
        Some(count) => count,
        None => default,
    }
}

/// A missing cookie file is a warning, not an error: the batch still runs,
/// yt-dlp just goes without cookies.
fn resolve_cookies(candidate: Option<PathBuf>) -> Option<PathBuf> {
    match candidate {
        Some(path) if path.exists() => Some(path),
        Some(path) => {
            tracing::warn!(
                "Cookie file not found, continuing without it: {}",
                path.display()
            );
            None
        }
        None => None,
    }
}
