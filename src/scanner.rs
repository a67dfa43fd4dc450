//! Directory discovery.
//!
//! Walks every configured root recursively and returns files whose basename
//! matches the translated `FilePattern`, ordered by modification time
//! ascending so the oldest backlog is tailed first. Walk errors are logged
//! and skipped; discovery never fails the service.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

pub fn discover_files(roots: &[PathBuf], pattern: &Regex) -> Vec<PathBuf> {
    let mut found: Vec<(PathBuf, SystemTime)> = Vec::new();
    for root in roots {
        if !root.exists() {
            debug!(path = %root.display(), "log root does not exist yet; skipping");
            continue;
        }
        walk(root, pattern, &mut found);
    }

    found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    found.into_iter().map(|(path, _)| path).collect()
}

fn walk(dir: &Path, pattern: &Regex, found: &mut Vec<(PathBuf, SystemTime)>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, path = %dir.display(), "failed to read directory; skipping");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, path = %dir.display(), "failed to read directory entry");
                continue;
            }
        };
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to stat entry; skipping");
                continue;
            }
        };

        if metadata.is_dir() {
            walk(&path, pattern, found);
        } else if metadata.is_file() && matches_basename(&path, pattern) {
            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((path, mtime));
        }
    }
}

pub fn matches_basename(path: &Path, pattern: &Regex) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| pattern.is_match(name))
        .unwrap_or(false)
}
