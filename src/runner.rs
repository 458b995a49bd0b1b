//! Bounded fan-out of download workers and end-of-batch accounting.
//!
//! One task per URL, at most `parallel` in flight. Each in-flight task owns
//! exactly one yt-dlp child process, so the semaphore bound is also the
//! worker-process bound.

use crate::progress::ProgressDisplay;
use crate::ytdlp::{self, DownloadRequest, ProgressSink, Ytdlp};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Settings shared by every task in the batch.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub quality: u32,
    pub output_dir: PathBuf,
    pub cookies: Option<PathBuf>,
    pub quiet_ydl: bool,
    pub parallel: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed(String),
    /// The batch was cancelled before this task could finish.
    Interrupted,
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub url: String,
    pub title: String,
    pub status: TaskStatus,
    pub elapsed: Duration,
}

impl TaskOutcome {
    fn interrupted(url: String, started: Instant) -> Self {
        Self {
            title: url.clone(),
            url,
            status: TaskStatus::Interrupted,
            elapsed: started.elapsed(),
        }
    }
}

#[derive(Debug)]
pub struct BatchSummary {
    /// Outcomes in input order.
    pub outcomes: Vec<TaskOutcome>,
    pub interrupted: bool,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.count(|status| matches!(status, TaskStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|status| matches!(status, TaskStatus::Failed(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|status| matches!(status, TaskStatus::Interrupted))
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded() == self.outcomes.len()
    }

    fn count(&self, pred: impl Fn(&TaskStatus) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| pred(&outcome.status))
            .count()
    }

    /// End-of-batch report, printed even after an interrupt.
    pub fn print(&self, output_dir: &Path) {
        println!();
        println!("--- Download summary ---");
        println!("Output directory: {}", output_dir.display());
        println!("Succeeded: {} video(s)", self.succeeded());
        println!("Failed: {} video(s)", self.failed());
        if self.cancelled() > 0 {
            println!("Interrupted: {} video(s)", self.cancelled());
        }

        let failures: Vec<&TaskOutcome> = self
            .outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, TaskStatus::Failed(_)))
            .collect();
        if !failures.is_empty() {
            println!("Failed URLs:");
            for outcome in failures {
                if let TaskStatus::Failed(reason) = &outcome.status {
                    println!("  - {} ({})", outcome.url, reason);
                }
            }
        }
        println!("------------------------");
    }
}

/// Dispatches every URL through the worker pool and waits for the batch to
/// drain. Returns outcomes in input order.
pub async fn run_batch(
    ytdlp: Arc<Ytdlp>,
    urls: Vec<String>,
    options: BatchOptions,
    display: Arc<ProgressDisplay>,
    cancel: CancellationToken,
) -> BatchSummary {
    let semaphore = Arc::new(Semaphore::new(options.parallel.max(1)));
    let mut join_set = JoinSet::new();

    for (index, url) in urls.into_iter().enumerate() {
        let ytdlp = ytdlp.clone();
        let options = options.clone();
        let display = display.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
            (
                index,
                run_one(ytdlp, url, options, display, cancel, semaphore).await,
            )
        });
    }

    let mut indexed = Vec::with_capacity(join_set.len());
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(entry) => indexed.push(entry),
            Err(err) => tracing::error!("Worker task failed to complete: {}", err),
        }
    }
    indexed.sort_by_key(|(index, _)| *index);

    BatchSummary {
        outcomes: indexed.into_iter().map(|(_, outcome)| outcome).collect(),
        interrupted: cancel.is_cancelled(),
    }
}

async fn run_one(
    ytdlp: Arc<Ytdlp>,
    url: String,
    options: BatchOptions,
    display: Arc<ProgressDisplay>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
) -> TaskOutcome {
    let started = Instant::now();

    let _permit = tokio::select! {
        _ = cancel.cancelled() => return TaskOutcome::interrupted(url, started),
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return TaskOutcome::interrupted(url, started),
        },
    };

    // Cheap metadata probe first so the bar can show a real title. Probe
    // failures are not fatal; the URL itself becomes the label.
    let title = tokio::select! {
        _ = cancel.cancelled() => return TaskOutcome::interrupted(url, started),
        probe = ytdlp.probe(&url, options.cookies.as_deref(), ytdlp::random_user_agent()) => {
            match probe {
                Ok(info) => info.display_title(&url),
                Err(err) => {
                    tracing::debug!("Metadata probe failed for {}: {}", url, err);
                    url.clone()
                }
            }
        }
    };

    tracing::info!("Downloading '{}' ({})", title, url);
    let handle = display.start_task(&title);

    let request = DownloadRequest {
        url: url.clone(),
        quality: options.quality,
        output_dir: options.output_dir.clone(),
        cookies: options.cookies.clone(),
        quiet: options.quiet_ydl,
    };

    let sink: Arc<dyn ProgressSink> = handle.clone();
    let result = ytdlp.download(&request, sink, &cancel).await;

    handle.finish();
    display.task_done();

    let status = match result {
        Ok(path) => {
            match path {
                Some(path) => tracing::info!(
                    "Finished '{}' in {:.1}s -> {}",
                    title,
                    started.elapsed().as_secs_f64(),
                    path.display()
                ),
                None => tracing::info!(
                    "Finished '{}' in {:.1}s",
                    title,
                    started.elapsed().as_secs_f64()
                ),
            }
            TaskStatus::Succeeded
        }
        Err(_) if cancel.is_cancelled() => TaskStatus::Interrupted,
        Err(err) => {
            tracing::warn!("Download failed for {}: {:#}", url, err);
            TaskStatus::Failed(format!("{err:#}"))
        }
    };

    TaskOutcome {
        url,
        title,
        status,
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    /// Stub worker: probes always succeed, downloads fail for URLs that
    /// mention `fail` and stall for URLs that mention `slow`.
    const STUB: &str = r#"#!/bin/sh
case "$*" in
  *--dump-single-json*) printf '{"id":"x","title":"Stub"}\n'; exit 0;;
esac
case "$*" in
  *fail*) echo "ERROR: Video unavailable" >&2; exit 1;;
  *slow*) sleep 30; exit 0;;
esac
printf 'download: 100.0%%\n'
exit 0
"#;

    fn install_stub(dir: &Path) -> PathBuf {
        let path = dir.join("yt-dlp");
        fs::write(&path, STUB).unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    fn options(output_dir: &Path, parallel: usize) -> BatchOptions {
        BatchOptions {
            quality: 720,
            output_dir: output_dir.to_path_buf(),
            cookies: None,
            quiet_ydl: true,
            parallel,
        }
    }

    fn outcome(url: &str, status: TaskStatus) -> TaskOutcome {
        TaskOutcome {
            url: url.into(),
            title: url.into(),
            status,
            elapsed: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn run_batch_collects_mixed_outcomes_in_input_order() {
        let dir = tempdir().unwrap();
        let ytdlp = Arc::new(Ytdlp::new(install_stub(dir.path())));
        let urls = vec![
            "https://example.com/ok-one".to_owned(),
            "https://example.com/fail-two".to_owned(),
            "https://example.com/ok-three".to_owned(),
        ];
        let display = Arc::new(ProgressDisplay::hidden(urls.len() as u64));

        let summary = run_batch(
            ytdlp,
            urls.clone(),
            options(dir.path(), 2),
            display,
            CancellationToken::new(),
        )
        .await;

        assert!(!summary.interrupted);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.failed(), 1);
        assert!(!summary.all_succeeded());

        let ordered: Vec<&str> = summary.outcomes.iter().map(|o| o.url.as_str()).collect();
        assert_eq!(ordered, urls.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(matches!(summary.outcomes[1].status, TaskStatus::Failed(ref reason)
            if reason.contains("unavailable")));
    }

    #[tokio::test]
    async fn run_batch_cancellation_interrupts_remaining_tasks() {
        let dir = tempdir().unwrap();
        let ytdlp = Arc::new(Ytdlp::new(install_stub(dir.path())));
        let urls: Vec<String> = (0..4)
            .map(|n| format!("https://example.com/slow-{n}"))
            .collect();
        let display = Arc::new(ProgressDisplay::hidden(urls.len() as u64));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let summary = run_batch(ytdlp, urls, options(dir.path(), 2), display, cancel).await;

        assert!(summary.interrupted);
        assert_eq!(summary.cancelled(), 4);
        assert_eq!(summary.succeeded(), 0);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn run_batch_probe_failure_still_downloads() {
        // Probe and download share one stub; make only the probe fail by
        // matching on --dump-single-json.
        let dir = tempdir().unwrap();
        let stub_path = dir.path().join("yt-dlp");
        fs::write(
            &stub_path,
            "#!/bin/sh\ncase \"$*\" in\n  *--dump-single-json*) echo 'ERROR: no metadata' >&2; exit 1;;\nesac\nprintf 'download: 100.0%%\\n'\nexit 0\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&stub_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&stub_path, perms).unwrap();
        }

        let ytdlp = Arc::new(Ytdlp::new(stub_path));
        let urls = vec!["https://example.com/mystery".to_owned()];
        let display = Arc::new(ProgressDisplay::hidden(1));

        let summary = run_batch(
            ytdlp,
            urls,
            options(dir.path(), 1),
            display,
            CancellationToken::new(),
        )
        .await;

        assert!(summary.all_succeeded());
        // Without metadata the URL doubles as the display title.
        assert_eq!(summary.outcomes[0].title, summary.outcomes[0].url);
    }

    #[test]
    fn summary_counts_by_status() {
        let summary = BatchSummary {
            outcomes: vec![
                outcome("a", TaskStatus::Succeeded),
                outcome("b", TaskStatus::Failed("reason".into())),
                outcome("c", TaskStatus::Interrupted),
            ],
            interrupted: true,
        };
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.cancelled(), 1);
        assert!(!summary.all_succeeded());
    }

    #[test]
    fn summary_all_succeeded_on_empty_failures() {
        let summary = BatchSummary {
            outcomes: vec![
                outcome("a", TaskStatus::Succeeded),
                outcome("b", TaskStatus::Succeeded),
            ],
            interrupted: false,
        };
        assert!(summary.all_succeeded());
    }
}
