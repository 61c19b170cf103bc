//! Run-wide progress counters and the optional JSON stats file.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Monotonic counters updated by every stage. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct Progress {
    pages_discovered: AtomicUsize,
    pages_total: AtomicUsize,
    pages_fetched: AtomicUsize,
    pages_rewritten: AtomicUsize,
    pages_failed: AtomicUsize,
    assets_total: AtomicUsize,
    assets_resolved: AtomicUsize,
}

/// Point-in-time copy of [Progress].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub pages_discovered: usize,
    pub pages_total: usize,
    pub pages_fetched: usize,
    pub pages_rewritten: usize,
    pub pages_failed: usize,
    pub assets_total: usize,
    pub assets_resolved: usize,
}

impl ProgressSnapshot {
    /// Work items finished so far: pages processed (either way) and assets resolved.
    pub fn done(&self) -> usize {
        self.pages_rewritten + self.pages_failed + self.assets_resolved
    }

    /// Work items known so far.
    pub fn total(&self) -> usize {
        self.pages_total + self.assets_total
    }
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the number of pages discovered so far. Never decreases.
    pub fn discovered(&self, count: usize) {
        self.pages_discovered.fetch_max(count, Ordering::Relaxed);
    }

    pub fn set_pages_total(&self, count: usize) {
        self.pages_total.fetch_max(count, Ordering::Relaxed);
    }

    pub fn page_fetched(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_rewritten(&self) {
        self.pages_rewritten.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_failed(&self) {
        self.pages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_assets_total(&self, count: usize) {
        self.assets_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn asset_resolved(&self) {
        self.assets_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            pages_discovered: self.pages_discovered.load(Ordering::Relaxed),
            pages_total: self.pages_total.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            pages_rewritten: self.pages_rewritten.load(Ordering::Relaxed),
            pages_failed: self.pages_failed.load(Ordering::Relaxed),
            assets_total: self.assets_total.load(Ordering::Relaxed),
            assets_resolved: self.assets_resolved.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsPayload {
    done: usize,
    total: usize,
}

/// JSON file (`{"done": n, "total": m}`) rewritten after each stage.
#[derive(Debug, Clone)]
pub struct StatsFile {
    path: PathBuf,
}

impl StatsFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current counts. Failures are logged; stats never fail a run.
    pub fn write(&self, snapshot: &ProgressSnapshot) {
        let payload = StatsPayload {
            done: snapshot.done(),
            total: snapshot.total(),
        };
        let result = serde_json::to_vec(&payload)
            .map_err(std::io::Error::from)
            .and_then(|data| {
                if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(&self.path, data)
            });
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "cannot write stats file");
        }
    }
}
