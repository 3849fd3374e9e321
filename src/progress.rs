use std::collections::HashMap;
use std::fmt;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;

/// Where the backend is in its manifest → cache → import pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NeedManifest,
    HaveManifest,
    CacheHit,
    NeedImport,
    Ready,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::NeedManifest => "need-manifest",
            Phase::HaveManifest => "have-manifest",
            Phase::CacheHit => "cache-hit",
            Phase::NeedImport => "need-import",
            Phase::Ready => "ready",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Phase { dataset: String, phase: Phase },
    FileStarted { url: String, total: Option<u64> },
    FileAdvanced { url: String, bytes: u64 },
    FileFinished { url: String },
    BatchStarted { total: usize },
    BatchAdvanced,
    Notice(String),
    Warning(String),
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}

/// One bar per in-flight file plus an aggregate bar for batches.
pub struct TerminalProgress {
    multi: MultiProgress,
    files: Mutex<HashMap<String, ProgressBar>>,
    batch: Mutex<Option<ProgressBar>>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            files: Mutex::new(HashMap::new()),
            batch: Mutex::new(None),
        }
    }

    fn file_bar(&self, url: &str, total: Option<u64>) -> ProgressBar {
        let bar = match total {
            Some(total) => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{msg:30!} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("━━─"),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner} {msg:30!} {bytes}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar
            }
        };
        bar.set_message(crate::manifest::url_basename(url).to_string());
        self.multi.add(bar)
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TerminalProgress {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Phase { dataset, phase } => {
                tracing::debug!(dataset = %dataset, phase = %phase, "backend phase");
            }
            ProgressEvent::FileStarted { url, total } => {
                let bar = self.file_bar(&url, total);
                self.files.lock().insert(url, bar);
            }
            ProgressEvent::FileAdvanced { url, bytes } => {
                if let Some(bar) = self.files.lock().get(&url) {
                    bar.inc(bytes);
                }
            }
            ProgressEvent::FileFinished { url } => {
                if let Some(bar) = self.files.lock().remove(&url) {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
            }
            ProgressEvent::BatchStarted { total } => {
                let bar = self.multi.add(ProgressBar::new(total as u64));
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("Downloading [{bar:40.green/white}] {pos}/{len} files")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("##-"),
                );
                if let Some(previous) = self.batch.lock().replace(bar) {
                    previous.finish_and_clear();
                }
            }
            ProgressEvent::BatchAdvanced => {
                let mut batch = self.batch.lock();
                if let Some(bar) = batch.as_ref() {
                    bar.inc(1);
                    if bar.length().is_some_and(|len| bar.position() >= len) {
                        bar.finish_and_clear();
                        *batch = None;
                    }
                }
            }
            ProgressEvent::Notice(text) => {
                self.multi.suspend(|| eprintln!("{text}"));
            }
            ProgressEvent::Warning(text) => {
                self.multi.suspend(|| eprintln!("warning: {text}"));
            }
        }
    }
}
