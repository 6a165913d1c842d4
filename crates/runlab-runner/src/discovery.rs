//! Read-only queries over a tree of run directories.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::HarnessError;
use crate::experiment::{Coordinator, Experiment};
use crate::identity::is_run_of;
use crate::metadata::{is_complete, metadata_path, read_metadata, render_value, Metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Incomplete,
    Broken,
}

/// One directory holding a metadata file.
#[derive(Debug, Clone, Serialize)]
pub struct RunEntry {
    /// Canonical location; symlinked duplicates collapse onto it.
    pub path: PathBuf,
    pub identifier: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl RunEntry {
    pub fn load(path: &Path) -> Result<Self> {
        let path = path.canonicalize()?;
        let identifier = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("run directory without a name: {}", path.display()))?
            .to_string();
        let (status, metadata) = match read_metadata(&path) {
            Ok(metadata) if is_complete(&metadata) => (RunStatus::Complete, Some(metadata)),
            Ok(metadata) => (RunStatus::Incomplete, Some(metadata)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "unreadable metadata");
                (RunStatus::Broken, None)
            }
        };
        Ok(Self {
            path,
            identifier,
            status,
            metadata,
        })
    }
}

/// Every run below `root`, following symlinks. With a title only runs of
/// exactly that title are reported.
pub fn scan_runs(root: &Path, title: Option<&str>) -> Result<Vec<RunEntry>> {
    let mut seen = BTreeSet::new();
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_dir() || !metadata_path(entry.path()).is_file() {
            continue;
        }
        let run = RunEntry::load(entry.path())?;
        if let Some(title) = title {
            if !is_run_of(&run.identifier, title) {
                continue;
            }
        }
        if seen.insert(run.path.clone()) {
            entries.push(run);
        }
    }
    Ok(entries)
}

/// How discovered runs are filtered.
pub enum Selector<E: Experiment> {
    Any,
    /// Every listed key must be present with an equal value.
    Metadata(Metadata),
    Predicate(Box<dyn Fn(&Coordinator<E>) -> bool>),
}

impl<E: Experiment> Selector<E> {
    pub fn predicate(f: impl Fn(&Coordinator<E>) -> bool + 'static) -> Self {
        Selector::Predicate(Box::new(f))
    }

    fn matches(&self, coordinator: &Coordinator<E>) -> bool {
        match self {
            Selector::Any => true,
            Selector::Metadata(wanted) => metadata_matches(coordinator.metadata(), wanted),
            Selector::Predicate(f) => f(coordinator),
        }
    }
}

pub fn metadata_matches(metadata: &Metadata, wanted: &Metadata) -> bool {
    wanted
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

/// Like [`metadata_matches`], comparing against the textual form of each
/// value, as given on a command line.
pub fn metadata_matches_text(metadata: &Metadata, wanted: &[(String, String)]) -> bool {
    wanted.iter().all(|(key, text)| {
        metadata
            .get(key)
            .map(|value| render_value(value) == *text)
            .unwrap_or(false)
    })
}

/// Reattaches every complete run of `make()`'s experiment below `root`
/// that the selector accepts. Runs that fail to reattach are skipped.
pub fn search_runs<E: Experiment>(
    root: &Path,
    make: impl Fn() -> E,
    selector: &Selector<E>,
) -> Result<Vec<Coordinator<E>>> {
    let title = make().title();
    let mut found = Vec::new();
    for entry in scan_runs(root, Some(&title))? {
        if entry.status != RunStatus::Complete {
            debug!(path = %entry.path.display(), status = ?entry.status, "skipping run");
            continue;
        }
        let path = entry.path.display().to_string();
        let coordinator = match Coordinator::reattach(make(), root, &path) {
            Ok(coordinator) => coordinator,
            Err(e) => {
                warn!(path = %path, error = %format!("{:#}", e), "skipping run that cannot be reattached");
                continue;
            }
        };
        if selector.matches(&coordinator) {
            found.push(coordinator);
        }
    }
    Ok(found)
}

/// Like [`search_runs`], but exactly one run must match.
pub fn search_run<E: Experiment>(
    root: &Path,
    make: impl Fn() -> E,
    selector: &Selector<E>,
) -> Result<Coordinator<E>> {
    let title = make().title();
    let mut found = search_runs(root, make, selector)?;
    if found.len() != 1 {
        let matches = found
            .iter()
            .filter_map(|c| c.path().ok().map(Path::to_path_buf))
            .collect();
        return Err(HarnessError::NotUnique { title, matches }.into());
    }
    found
        .pop()
        .ok_or_else(|| anyhow!("search result vanished"))
}

/// Fails when two runs share a value for `field`.
pub fn assert_metadata_unique<E: Experiment>(field: &str, runs: &[Coordinator<E>]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for run in runs {
        let value = field_value(run, field)?;
        if !seen.insert(render_value(value)) {
            return Err(anyhow!(
                "metadata field '{}' is not unique: {} appears twice",
                field,
                render_value(value)
            ));
        }
    }
    Ok(())
}

/// Fails unless every run has the same value for `field`.
pub fn assert_metadata_common<E: Experiment>(field: &str, runs: &[Coordinator<E>]) -> Result<()> {
    let Some(first) = runs.first() else {
        return Ok(());
    };
    let expected = field_value(first, field)?;
    for run in &runs[1..] {
        let value = field_value(run, field)?;
        if value != expected {
            return Err(anyhow!(
                "metadata field '{}' differs: {} vs {}",
                field,
                render_value(expected),
                render_value(value)
            ));
        }
    }
    Ok(())
}

fn field_value<'a, E: Experiment>(run: &'a Coordinator<E>, field: &str) -> Result<&'a Value> {
    run.metadata().get(field).ok_or_else(|| {
        anyhow!(
            "run {} has no metadata field '{}'",
            run.identifier().unwrap_or("?"),
            field
        )
    })
}

/// Walks up from `path` to the nearest ancestor (or `path` itself) named
/// `name`.
pub fn go_up_till(path: &Path, name: &str) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| p.file_name().map(|n| n == name).unwrap_or(false))
        .map(Path::to_path_buf)
}

/// Renders every run of `title` directly below `root` with its metadata.
/// Symlinks count as the run they point to.
/// Runs referenced from metadata values are nested below the run using them.
pub fn render_run_tree(root: &Path, title: &str) -> Result<String> {
    let mut runs = BTreeMap::new();
    if root.is_dir() {
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if !metadata_path(&path).is_file() {
                continue;
            }
            let real = path.canonicalize()?;
            let name = real
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if is_run_of(&name, title) {
                runs.insert(name, real);
            }
        }
    }
    let mut out = String::new();
    for run_dir in runs.values() {
        let mut visiting = BTreeSet::new();
        render_node(root, run_dir, 0, &mut visiting, &mut out)?;
    }
    Ok(out.trim_end().to_string())
}

fn render_node(
    root: &Path,
    run_dir: &Path,
    indent: usize,
    visiting: &mut BTreeSet<PathBuf>,
    out: &mut String,
) -> Result<()> {
    let entry = RunEntry::load(run_dir)?;
    if !visiting.insert(entry.path.clone()) {
        return Ok(());
    }
    let mut lines = vec![entry.identifier.clone()];
    let metadata = entry.metadata.clone().unwrap_or_default();
    if entry.metadata.is_none() {
        lines.push("(unreadable metadata)".to_string());
    }
    for (key, value) in &metadata {
        lines.push(format!("{}: {}", key, render_value(value)));
    }
    out.push('+');
    out.push_str(&"-".repeat(indent));
    out.push_str(&lines.join(&format!("\n|{}", " ".repeat(indent + 1))));
    out.push('\n');

    let referenced = metadata.values().flat_map(|value| match value {
        Value::String(name) => vec![name.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    });
    let mut nested = BTreeSet::new();
    for name in referenced {
        let candidate = root.join(name);
        if !metadata_path(&candidate).is_file() {
            continue;
        }
        match candidate.canonicalize() {
            Ok(real) if real != entry.path && nested.insert(real.clone()) => {
                render_node(root, &candidate, indent + 3, visiting, out)?;
            }
            _ => {}
        }
    }
    visiting.remove(&entry.path);
    Ok(())
}
