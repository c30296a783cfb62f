use glob::glob;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Expand a list of paths and glob patterns into concrete file paths.
/// Non-glob paths pass through even when the file does not exist yet; the
/// tailer keeps polling until it appears.
pub fn expand_paths(patterns: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for pattern in patterns {
        if !is_glob(pattern) {
            files.push(PathBuf::from(pattern));
            continue;
        }
        match glob(pattern) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if entry.is_file() {
                        files.push(entry);
                    }
                }
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid glob pattern");
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

/// Re-expands wildcard patterns on an interval and reports paths not seen
/// before, so the worker can instantiate a tailer for every rotated-in
/// successor.
pub struct PathWatcher {
    patterns: Vec<String>,
    known: HashSet<PathBuf>,
    interval: Duration,
    last_scan: Instant,
}

impl PathWatcher {
    pub fn new(patterns: Vec<String>, interval: Duration, known: Vec<PathBuf>) -> Self {
        Self {
            patterns,
            known: known.into_iter().collect(),
            interval,
            last_scan: Instant::now(),
        }
    }

    /// True when any pattern actually needs rescanning.
    pub fn is_active(&self) -> bool {
        self.patterns.iter().any(|p| is_glob(p))
    }

    /// Newly discovered paths, at most once per interval.
    pub fn poll(&mut self) -> Vec<PathBuf> {
        if !self.is_active() || self.last_scan.elapsed() < self.interval {
            return Vec::new();
        }
        self.last_scan = Instant::now();

        let mut discovered = Vec::new();
        for path in expand_paths(&self.patterns) {
            if self.known.insert(path.clone()) {
                info!(path = %path.display(), "Discovered new file");
                discovered.push(path);
            }
        }
        discovered
    }

    /// Forget a destroyed input's path so a recreated file is rediscovered.
    pub fn forget(&mut self, path: &PathBuf) {
        self.known.remove(path);
    }
}
