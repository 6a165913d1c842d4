//! Maintenance of a results directory: listing, garbage detection and
//! copying a set of runs together with everything they depend on.
//!
//! Entries are named relative to the results directory. A symlink in it
//! (usually the latest-run link of an experiment) is an entry of its own.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::discovery::{RunEntry, RunStatus};
use crate::fsutil::{copy_dir_filtered, ensure_dir, replace_symlink};
use crate::metadata::{format_duration, metadata_path, runtime, KEY_DATE_START};

#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub symlink: bool,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Listing {
    pub entries: Vec<CatalogEntry>,
    pub total_runtime_seconds: u64,
}

impl Listing {
    /// Aligned `name status detail` lines followed by the total runtime.
    pub fn render(&self) -> String {
        let width = self.entries.iter().map(|e| e.name.len()).max().unwrap_or(0);
        let mut out = String::new();
        for entry in &self.entries {
            let line = match entry.status {
                RunStatus::Complete => format!(
                    "{:<width$} ok {}",
                    entry.name,
                    format_duration(Duration::from_secs(entry.runtime_seconds.unwrap_or(0))),
                    width = width
                ),
                RunStatus::Incomplete => format!(
                    "{:<width$} incomplete (begin: {})",
                    entry.name,
                    entry.started.as_deref().unwrap_or("?"),
                    width = width
                ),
                RunStatus::Broken => format!("{:<width$} broken", entry.name, width = width),
            };
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out.push_str(&format!(
            "Total Runtime: {}",
            format_duration(Duration::from_secs(self.total_runtime_seconds))
        ));
        out
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

fn dir_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| anyhow!("read {}: {}", dir.display(), e))? {
        names.push(entry?.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

/// Status of the named entries of `dir`. Entries without metadata are
/// ignored; a directory also reachable through a listed symlink is only
/// shown as the symlink.
pub fn describe(dir: &Path, names: &[String]) -> Result<Listing> {
    let links: BTreeSet<PathBuf> = names
        .iter()
        .map(|n| dir.join(n))
        .filter(|p| is_symlink(p))
        .filter_map(|p| p.canonicalize().ok())
        .collect();

    let mut sorted: Vec<(bool, &String)> = names
        .iter()
        .map(|n| (is_symlink(&dir.join(n)), n))
        .collect();
    sorted.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let mut listing = Listing::default();
    for (symlink, name) in sorted {
        let path = dir.join(name);
        if !metadata_path(&path).is_file() {
            continue;
        }
        if !symlink {
            if let Ok(real) = path.canonicalize() {
                if links.contains(&real) {
                    continue;
                }
            }
        }
        let run = RunEntry::load(&path)?;
        let metadata = run.metadata.as_ref();
        let runtime_seconds = metadata.and_then(runtime).map(|d| d.as_secs());
        if run.status == RunStatus::Complete {
            listing.total_runtime_seconds += runtime_seconds.unwrap_or(0);
        }
        listing.entries.push(CatalogEntry {
            name: name.clone(),
            symlink,
            status: run.status,
            runtime_seconds: runtime_seconds.filter(|_| run.status == RunStatus::Complete),
            started: metadata
                .and_then(|m| m.get(KEY_DATE_START))
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }
    Ok(listing)
}

/// Every entry of `dir`.
pub fn ls(dir: &Path) -> Result<Listing> {
    describe(dir, &dir_names(dir)?)
}

/// Entries reachable from `roots`: symlinks are followed to their target
/// and, with `from_metadata`, every string metadata value naming another
/// entry is followed as well.
pub fn transitive_hull(dir: &Path, roots: &[String], from_metadata: bool) -> Result<BTreeSet<String>> {
    let base = dir.canonicalize()?;
    let mut good = BTreeSet::new();
    let mut pending: Vec<String> = roots.to_vec();
    while let Some(item) = pending.pop() {
        let path = dir.join(&item);
        if !metadata_path(&path).is_file() || !good.insert(item.clone()) {
            continue;
        }
        if is_symlink(&path) {
            if let Ok(real) = path.canonicalize() {
                pending.push(match real.strip_prefix(&base) {
                    Ok(rel) => rel.display().to_string(),
                    Err(_) => real.display().to_string(),
                });
            }
        }
        if !from_metadata {
            continue;
        }
        if let Some(metadata) = RunEntry::load(&path)?.metadata {
            for value in metadata.values() {
                if let Value::String(name) = value {
                    pending.push(name.clone());
                }
            }
        }
    }
    debug!(reachable = good.len(), "transitive hull");
    Ok(good)
}

/// Entries not reachable from `roots` (default: the symlinks of `dir`).
/// Nothing is deleted.
pub fn gc(dir: &Path, roots: &[String]) -> Result<Listing> {
    let names = dir_names(dir)?;
    let roots: Vec<String> = if roots.is_empty() {
        names
            .iter()
            .filter(|n| is_symlink(&dir.join(n)))
            .cloned()
            .collect()
    } else {
        roots.to_vec()
    };
    let good = transitive_hull(dir, &roots, true)?;
    let garbage: Vec<String> = names.into_iter().filter(|n| !good.contains(n)).collect();
    describe(dir, &garbage)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyOutcome {
    Copied,
    Linked,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CopyAction {
    pub name: String,
    pub outcome: CopyOutcome,
}

/// Copies `roots` and the runs their symlinks point to into `dst`.
/// Symlinks are recreated, existing run directories in `dst` are kept.
pub fn cp(dir: &Path, roots: &[String], dst: &Path) -> Result<Vec<CopyAction>> {
    if metadata_path(dst).is_file() {
        return Err(anyhow!(
            "target {} is itself a run directory; missing destination?",
            dst.display()
        ));
    }
    ensure_dir(dst)?;
    let mut actions = Vec::new();
    for name in transitive_hull(dir, roots, false)? {
        if Path::new(&name).is_absolute() {
            warn!(entry = %name, "not copying a run outside of the results directory");
            actions.push(CopyAction {
                name,
                outcome: CopyOutcome::Skipped,
            });
            continue;
        }
        let src = dir.join(&name);
        let target = dst.join(&name);
        let outcome = if is_symlink(&src) {
            let link = fs::read_link(&src)?;
            if !replace_symlink(&link, &target)? {
                return Err(anyhow!("{} exists and is not a symlink", target.display()));
            }
            CopyOutcome::Linked
        } else if target.exists() {
            warn!(entry = %name, "already exists in the destination");
            CopyOutcome::Skipped
        } else {
            copy_dir_filtered(&src, &target, &|_: &Path| true)?;
            CopyOutcome::Copied
        };
        actions.push(CopyAction { name, outcome });
    }
    Ok(actions)
}
