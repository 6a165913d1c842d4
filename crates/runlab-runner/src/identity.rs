//! Deterministic run identifiers derived from input metadata.

use md5::{Digest, Md5};

use crate::metadata::{render_value, Metadata};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub title: String,
    pub digest: String,
    /// `<title>-<digest>`, also the run directory name.
    pub identifier: String,
}

/// Hashes `version <v>` followed by `key value` for every entry in byte
/// order of the keys. `BTreeMap` iteration gives that order regardless of
/// how the mapping was assembled.
pub fn compute_identity(title: &str, version: u32, metadata: &Metadata) -> Identity {
    let mut hasher = Md5::new();
    hasher.update(format!("version {}", version).as_bytes());
    for (key, value) in metadata {
        hasher.update(key.as_bytes());
        hasher.update(b" ");
        hasher.update(render_value(value).as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    Identity {
        title: title.to_string(),
        identifier: format!("{}-{}", title, digest),
        digest,
    }
}

/// Splits `<title>-<digest>` back apart. Titles may themselves contain `-`.
pub fn split_identifier(identifier: &str) -> Option<(&str, &str)> {
    let (title, digest) = identifier.rsplit_once('-')?;
    if title.is_empty() || digest.len() != 32 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((title, digest))
}

/// Whether the directory `name` holds a run of `title`: everything before
/// the last `-` must equal the title, so `Exp` does not claim `Exp-Foo-<digest>`.
pub fn is_run_of(name: &str, title: &str) -> bool {
    match split_identifier(name) {
        Some((run_title, _)) => run_title == title,
        None => name
            .rsplit_once('-')
            .map(|(run_title, tag)| run_title == title && !tag.is_empty())
            .unwrap_or(false),
    }
}
