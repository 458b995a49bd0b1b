//! Builds and supervises yt-dlp worker processes.
//!
//! All of the hard downloading work (stream selection, HTTP retries,
//! throttling, muxing through ffmpeg) stays inside yt-dlp. This module only
//! assembles the invocation, streams its output for progress parsing, and
//! turns its stderr into readable failure reasons.

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

pub const FALLBACK_USER_AGENT: &str = "Mozilla/5.0";

/// Rotated per worker so a batch does not present a single fingerprint for
/// every connection.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FALLBACK_USER_AGENT)
}

/// Receives parsed progress and pass-through output lines from a worker.
pub trait ProgressSink: Send + Sync {
    fn percent(&self, pct: f64);
    fn line(&self, line: &str);
}

/// Everything one worker invocation needs, resolved up front.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub quality: u32,
    pub output_dir: PathBuf,
    pub cookies: Option<PathBuf>,
    /// Suppress yt-dlp's non-progress console output.
    pub quiet: bool,
}

/// Only grab the small subset of fields we need from the probe JSON.
#[derive(Debug, Default, Deserialize)]
pub struct VideoProbe {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
}

impl VideoProbe {
    /// The probe is best-effort; callers fall back to the URL as a label.
    pub fn display_title(&self, fallback: &str) -> String {
        match &self.title {
            Some(title) if !title.trim().is_empty() => title.clone(),
            _ => fallback.to_owned(),
        }
    }
}

/// Handle to a resolved yt-dlp binary.
#[derive(Debug, Clone)]
pub struct Ytdlp {
    bin: PathBuf,
}

impl Ytdlp {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    /// Runs `--version` to fail loudly at startup when yt-dlp is missing.
    /// Returns the reported version string.
    pub fn ensure_available(&self) -> Result<String> {
        let output = std::process::Command::new(&self.bin).arg("--version").output();
        match output {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
            }
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.bin.display()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.bin.display(),
                err
            ),
        }
    }

    /// Fetches title metadata without downloading anything, so the progress
    /// display can show something better than a raw URL.
    pub async fn probe(
        &self,
        url: &str,
        cookies: Option<&Path>,
        user_agent: &str,
    ) -> Result<VideoProbe> {
        let mut cmd = Command::new(&self.bin);
        cmd.args([
            "--dump-single-json",
            "--skip-download",
            "--no-playlist",
            "--no-warnings",
            "--user-agent",
            user_agent,
        ]);
        if let Some(cookies) = cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| anyhow!("Metadata probe timed out for {}", url))?
            .with_context(|| format!("Running {}", self.bin.display()))?;

        if !output.status.success() {
            return Err(translate_ytdlp_error(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }

        serde_json::from_slice(&output.stdout).context("Parsing yt-dlp metadata JSON")
    }

    /// Runs one download to completion, streaming parsed progress into
    /// `sink`. Returns the final on-disk path when yt-dlp reported one.
    ///
    /// Cancellation kills the child; the caller decides how to classify the
    /// resulting error.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        let user_agent = random_user_agent();
        let args = build_download_args(request, user_agent);
        tracing::debug!("Starting worker for {} with UA '{}'", request.url, user_agent);

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Spawning {}", self.bin.display()))?;

        let stdout = child.stdout.take().context("yt-dlp stdout unavailable")?;
        let stderr = child.stderr.take().context("yt-dlp stderr unavailable")?;

        // The destination shows up mid-stream; remember the last one seen so
        // merged downloads report the muxed file, not the video-only part.
        let destination: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
        let destination_writer = destination.clone();
        let stdout_sink = sink.clone();
        let quiet = request.quiet;

        let stdout_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(pct) = parse_progress_line(&line) {
                    stdout_sink.percent(pct);
                    continue;
                }
                if let Some(dest) = parse_destination_line(&line) {
                    *destination_writer.lock() = Some(PathBuf::from(dest));
                }
                if !quiet {
                    stdout_sink.line(&line);
                }
            }
        });

        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "ytbatch::worker", "{}", line);
                buf.push_str(&line);
                buf.push('\n');
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status.context("Waiting for yt-dlp")?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = stdout_reader.await;
                let _ = stderr_reader.await;
                bail!("Download interrupted");
            }
        };

        let _ = stdout_reader.await;
        let stderr_output = stderr_reader.await.unwrap_or_default();

        if status.success() {
            sink.percent(100.0);
            Ok(destination.lock().take())
        } else {
            Err(translate_ytdlp_error(&stderr_output))
        }
    }
}

/// Runs `<name> --version` to detect optional helpers such as ffmpeg.
pub fn program_available(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Best-quality selector capped at the requested height, preferring mp4/m4a
/// streams so the merged output stays an mp4.
pub fn format_selector(quality: u32) -> String {
    format!(
        "bestvideo[height<={q}][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<={q}]+bestaudio/best[height<={q}]",
        q = quality
    )
}

/// Absolute `%(title)s [%(id)s].%(ext)s` template under the output directory.
pub fn output_template(output_dir: &Path) -> String {
    let absolute =
        std::path::absolute(output_dir).unwrap_or_else(|_| output_dir.to_path_buf());
    absolute
        .join("%(title)s [%(id)s].%(ext)s")
        .to_string_lossy()
        .into_owned()
}

/// Assembles the argument list for one worker. Kept separate from the spawn
/// so the exact invocation can be unit tested.
pub fn build_download_args(request: &DownloadRequest, user_agent: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--format".into(),
        format_selector(request.quality),
        "--merge-output-format".into(),
        "mp4".into(),
        "--output".into(),
        output_template(&request.output_dir),
        "--embed-metadata".into(),
        "--embed-thumbnail".into(),
        "--user-agent".into(),
        user_agent.into(),
        "--no-playlist".into(),
        "--no-warnings".into(),
        "--newline".into(),
        "--progress-template".into(),
        "download:%(progress._percent_str)s".into(),
    ];

    if let Some(cookies) = &request.cookies {
        args.push("--cookies".into());
        args.push(cookies.to_string_lossy().into_owned());
    }

    args.push(request.url.clone());
    args
}

/// yt-dlp emits `download:  42.3%` lines under our `--progress-template`.
fn parse_progress_line(line: &str) -> Option<f64> {
    let rest = line.trim().strip_prefix("download:")?;
    let pct = rest.trim().strip_suffix('%')?.trim();
    pct.parse::<f64>().ok().map(|p| p.clamp(0.0, 100.0))
}

/// The final path shows up either on the download destination line or, for
/// merged A/V, on the ffmpeg merger line.
fn parse_destination_line(line: &str) -> Option<String> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("[download] Destination:") {
        let path = rest.trim();
        if !path.is_empty() {
            return Some(path.to_owned());
        }
    }
    if let Some(rest) = line.strip_prefix("[Merger] Merging formats into \"") {
        let path = rest.trim_end_matches('"');
        if !path.is_empty() {
            return Some(path.to_owned());
        }
    }
    None
}

/// Collapses yt-dlp's stderr into a single readable failure reason.
pub fn translate_ytdlp_error(stderr: &str) -> anyhow::Error {
    let lower = stderr.to_lowercase();

    if lower.contains("http error 429") {
        return anyhow!("Rate limited (HTTP 429); try again later or lower --parallel");
    }
    if lower.contains("http error 403") || lower.contains("forbidden") {
        return anyhow!("Access denied (HTTP 403); the video may be private or region-locked");
    }
    if lower.contains("sign in") || lower.contains("login required") {
        return anyhow!("Login required; pass a --cookies file");
    }
    if lower.contains("private video") {
        return anyhow!("Video is private");
    }
    if lower.contains("video unavailable") {
        return anyhow!("Video unavailable or removed");
    }
    if lower.contains("unsupported url") {
        return anyhow!("URL is not supported by yt-dlp");
    }
    if lower.contains("ffmpeg")
        && (lower.contains("not found") || lower.contains("no such file"))
    {
        return anyhow!("ffmpeg not found; install it to merge and tag downloads");
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return anyhow!("Connection timed out");
    }

    let last_error_line = stderr.lines().rev().map(str::trim).find(|line| {
        let lower = line.to_lowercase();
        lower.starts_with("error:") || lower.starts_with("error ")
    });

    match last_error_line {
        Some(line) => {
            let msg = line
                .strip_prefix("ERROR:")
                .or_else(|| line.strip_prefix("error:"))
                .unwrap_or(line)
                .trim();
            anyhow!("yt-dlp: {}", msg)
        }
        None => {
            let trimmed = stderr.trim();
            if trimmed.is_empty() {
                anyhow!("yt-dlp exited with an error and no diagnostics")
            } else {
                anyhow!("yt-dlp: {}", trimmed.lines().last().unwrap_or(trimmed))
            }
        }
    }
}
