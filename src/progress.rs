//! Batch progress rendering on top of indicatif.
//!
//! One overall bar counts finished tasks; each in-flight worker gets its own
//! percent bar fed from parsed yt-dlp output. Bars draw to stderr so piped
//! stdout stays clean for the summary.

use crate::ytdlp::ProgressSink;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Arc;

const TITLE_WIDTH: usize = 40;

pub struct ProgressDisplay {
    multi: MultiProgress,
    overall: ProgressBar,
}

impl ProgressDisplay {
    pub fn new(total: u64) -> Self {
        Self::with_target(total, ProgressDrawTarget::stderr())
    }

    /// Same API, no drawing. Used by tests and callers that only want the
    /// end-of-batch summary.
    pub fn hidden(total: u64) -> Self {
        Self::with_target(total, ProgressDrawTarget::hidden())
    }

    fn with_target(total: u64, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let overall = multi.add(ProgressBar::new(total));
        overall.set_style(
            ProgressStyle::with_template(
                "{bar:30.cyan/blue} {pos}/{len} videos ({elapsed})",
            )
            .expect("valid overall template"),
        );
        Self { multi, overall }
    }

    /// Adds a live bar for one worker, placed above the overall bar.
    pub fn start_task(&self, title: &str) -> Arc<TaskHandle> {
        let bar = self
            .multi
            .insert_before(&self.overall, ProgressBar::new(100));
        bar.set_style(
            ProgressStyle::with_template("{prefix:.bold} [{bar:25}] {pos:>3}%")
                .expect("valid task template"),
        );
        bar.set_prefix(short_title(title));
        Arc::new(TaskHandle {
            multi: self.multi.clone(),
            bar,
        })
    }

    /// Records one finished task on the overall bar, whatever its outcome.
    pub fn task_done(&self) {
        self.overall.inc(1);
    }

    /// Prints a line above the live bars without corrupting them.
    pub fn println(&self, msg: &str) {
        let _ = self.multi.println(msg);
    }

    pub fn finish(&self) {
        self.overall.finish_and_clear();
    }
}

/// Per-worker handle; doubles as the worker's [`ProgressSink`].
pub struct TaskHandle {
    multi: MultiProgress,
    bar: ProgressBar,
}

impl TaskHandle {
    /// Removes the bar once the worker is done. Failures are reported via
    /// the summary, not the bars, so every outcome clears the same way.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
        self.multi.remove(&self.bar);
    }
}

impl ProgressSink for TaskHandle {
    fn percent(&self, pct: f64) {
        self.bar.set_position(pct.clamp(0.0, 100.0).round() as u64);
    }

    fn line(&self, line: &str) {
        let _ = self.multi.println(line);
    }
}

/// Keeps worker labels to one screen line even for essay-length titles.
fn short_title(title: &str) -> String {
    let mut chars = title.chars();
    let prefix: String = chars.by_ref().take(TITLE_WIDTH).collect();
    if chars.next().is_some() {
        format!("{}...", prefix)
    } else {
        prefix
    }
}
