//! The flat key/value record persisted next to every run.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HarnessError;
use crate::fsutil::atomic_write_json_pretty;

pub type Metadata = BTreeMap<String, Value>;

pub const METADATA_FILE: &str = "metadata";
pub const KEY_NAME: &str = "experiment-name";
pub const KEY_VERSION: &str = "experiment-version";
pub const KEY_HASH: &str = "experiment-hash";
pub const KEY_DATE_START: &str = "date-start";
pub const KEY_DATE_END: &str = "date-end";

pub fn metadata_path(run_dir: &Path) -> PathBuf {
    run_dir.join(METADATA_FILE)
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn write_metadata(run_dir: &Path, metadata: &Metadata) -> Result<()> {
    let value = serde_json::to_value(metadata)?;
    atomic_write_json_pretty(&metadata_path(run_dir), &value)
}

pub fn read_metadata(run_dir: &Path) -> Result<Metadata> {
    let path = metadata_path(run_dir);
    let bytes = fs::read(&path).map_err(|e| anyhow!("read {}: {}", path.display(), e))?;
    let metadata: Metadata = serde_json::from_slice(&bytes)
        .map_err(|e| anyhow!("parse {}: {}", path.display(), e))?;
    Ok(metadata)
}

/// A run is complete once its end timestamp has been recorded.
pub fn is_complete(metadata: &Metadata) -> bool {
    metadata.contains_key(KEY_DATE_END)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Wall-clock runtime of a completed run, truncated to whole seconds.
pub fn runtime(metadata: &Metadata) -> Option<Duration> {
    let start = metadata.get(KEY_DATE_START)?.as_str().and_then(parse_timestamp)?;
    let end = metadata.get(KEY_DATE_END)?.as_str().and_then(parse_timestamp)?;
    let secs = (end - start).num_seconds().max(0) as u64;
    Some(Duration::from_secs(secs))
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Adds every entry of `contribution` to `into`, refusing to overwrite.
pub fn merge_contribution(into: &mut Metadata, contribution: Metadata, owner: &str) -> Result<()> {
    for (key, value) in contribution {
        if into.contains_key(&key) {
            return Err(HarnessError::DuplicateMetadataKey {
                key,
                owner: owner.to_string(),
            }
            .into());
        }
        into.insert(key, value);
    }
    Ok(())
}

/// Text used for a value inside the identity digest. Strings are taken
/// verbatim, everything else uses its compact JSON form.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_round_trips_through_the_run_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut metadata = Metadata::new();
        metadata.insert("key".to_string(), json!("ABC"));
        metadata.insert(KEY_VERSION.to_string(), json!(3));
        metadata.insert("list".to_string(), json!(["a", "b"]));
        write_metadata(dir.path(), &metadata).expect("write");
        assert_eq!(read_metadata(dir.path()).expect("read"), metadata);
    }

    #[test]
    fn merge_rejects_duplicate_keys() {
        let mut into = Metadata::new();
        into.insert("a".to_string(), json!(1));
        let mut extra = Metadata::new();
        extra.insert("a".to_string(), json!(2));
        let err = merge_contribution(&mut into, extra, "other").expect_err("duplicate");
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::DuplicateMetadataKey { .. })
        ));
        assert_eq!(into["a"], json!(1));
    }

    #[test]
    fn runtime_requires_both_timestamps() {
        let mut metadata = Metadata::new();
        metadata.insert(KEY_DATE_START.to_string(), json!("2024-01-01T10:00:00.000000Z"));
        assert!(!is_complete(&metadata));
        assert_eq!(runtime(&metadata), None);
        metadata.insert(KEY_DATE_END.to_string(), json!("2024-01-01T11:02:03.500000Z"));
        assert!(is_complete(&metadata));
        let elapsed = runtime(&metadata).expect("runtime");
        assert_eq!(format_duration(elapsed), "1:02:03");
    }

    #[test]
    fn render_value_keeps_strings_verbatim() {
        assert_eq!(render_value(&json!("ABC")), "ABC");
        assert_eq!(render_value(&json!(12)), "12");
        assert_eq!(render_value(&json!(true)), "true");
        assert_eq!(render_value(&json!(["a", 1])), "[\"a\",1]");
        assert_eq!(render_value(&Value::Null), "null");
    }
}
