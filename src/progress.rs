//! Per-stage progress bars over source row counts.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::{Arc, OnceLock};

/// Optional global MultiProgress so stage bars stack instead of overwriting.
static GLOBAL_MP: OnceLock<Arc<MultiProgress>> = OnceLock::new();

/// Install once; later calls are ignored.
pub fn set_global_multiprogress(mp: Arc<MultiProgress>) {
    let _ = GLOBAL_MP.set(mp);
}

fn new_bar(total: u64) -> ProgressBar {
    match GLOBAL_MP.get() {
        Some(mp) => mp.add(ProgressBar::new(total)),
        None => ProgressBar::new(total),
    }
}

/// Rows processed out of `total`, labeled with the stage name.
pub fn make_count_progress(total: u64, label: &str) -> ProgressBar {
    let pb = new_bar(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {msg:<11} {pos}/{len} [{bar:.cyan/blue}] {percent:>3}%  \
         rows/s: {per_sec}  elapsed: {elapsed_precise}  eta: {eta_precise}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    if !label.is_empty() {
        pb.set_message(label.to_string());
    }
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Bar for one stage, or a no-op when progress is disabled.
pub struct StageProgress {
    pb: Option<ProgressBar>,
}

impl StageProgress {
    pub fn new(enabled: bool, total: u64, label: &str) -> Self {
        Self { pb: enabled.then(|| make_count_progress(total, label)) }
    }

    #[inline]
    pub fn inc(&self, rows: u64) {
        if let Some(pb) = &self.pb {
            pb.inc(rows);
        }
    }

    pub fn finish(&self, msg: impl Into<String>) {
        if let Some(pb) = &self.pb {
            pb.finish_with_message(msg.into());
        }
    }
}
