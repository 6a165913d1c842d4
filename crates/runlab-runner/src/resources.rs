use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

use crate::fsutil::{absolutize, ensure_dir};

/// Shared handles owned by one coordinator for the length of a run.
/// Database connections are keyed by their resolved path, so two
/// parameters naming the same file share one connection.
#[derive(Default)]
pub struct ResourcePool {
    sqlite: BTreeMap<PathBuf, Rc<Connection>>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sqlite(&mut self, path: &Path) -> Result<Rc<Connection>> {
        let key = resolve_key(path)?;
        if let Some(conn) = self.sqlite.get(&key) {
            return Ok(Rc::clone(conn));
        }
        if let Some(parent) = key.parent() {
            ensure_dir(parent)?;
        }
        debug!(path = %key.display(), "opening sqlite connection");
        let conn = Connection::open(&key)
            .map_err(|e| anyhow!("failed to open sqlite database {}: {}", key.display(), e))?;
        let conn = Rc::new(conn);
        self.sqlite.insert(key, Rc::clone(&conn));
        Ok(conn)
    }

    /// Drops the pooled connection once no parameter holds it anymore.
    /// Returns whether it was dropped.
    pub fn release_sqlite(&mut self, path: &Path) -> Result<bool> {
        let key = resolve_key(path)?;
        let unused = self
            .sqlite
            .get(&key)
            .map(|conn| Rc::strong_count(conn) == 1)
            .unwrap_or(false);
        if unused {
            debug!(path = %key.display(), "closing sqlite connection");
            self.sqlite.remove(&key);
        }
        Ok(unused)
    }

    pub fn open_connections(&self) -> usize {
        self.sqlite.len()
    }
}

fn resolve_key(path: &Path) -> Result<PathBuf> {
    let path = absolutize(path)?;
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(path.clone()),
        },
        _ => Ok(path),
    }
}
