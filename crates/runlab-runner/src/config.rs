use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::flags::ParsedFlags;

pub const OVERRIDES_SCHEMA: &str = "overrides_v1";

/// Run-level settings taken from the global flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub base_dir: PathBuf,
    pub list: bool,
    pub symlink: bool,
    pub verbosity: u8,
    pub suspend_on_error: bool,
    pub overrides: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            list: false,
            symlink: false,
            verbosity: 0,
            suspend_on_error: false,
            overrides: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OverridesFile {
    schema_version: String,
    #[serde(default)]
    values: BTreeMap<String, serde_yaml::Value>,
}

/// Loads a parameter overrides file. YAML is a superset of JSON, so both
/// formats go through `serde_yaml`.
pub fn load_overrides(path: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read overrides {}: {}", path.display(), e))?;
    let parsed: OverridesFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow!("failed to parse overrides {}: {}", path.display(), e))?;
    if parsed.schema_version != OVERRIDES_SCHEMA {
        return Err(anyhow!(
            "unsupported overrides schema_version '{}' (expected {})",
            parsed.schema_version,
            OVERRIDES_SCHEMA
        ));
    }
    let mut out = BTreeMap::new();
    for (flag, value) in parsed.values {
        let values = match value {
            serde_yaml::Value::Sequence(items) => items
                .iter()
                .map(|item| yaml_scalar(&flag, item))
                .collect::<Result<Vec<_>>>()?,
            other => vec![yaml_scalar(&flag, &other)?],
        };
        out.insert(flag, values);
    }
    Ok(out)
}

fn yaml_scalar(flag: &str, value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        _ => Err(anyhow!(
            "override for '{}' must be a scalar or a list of scalars",
            flag
        )),
    }
}

/// Applies the overrides file named by `--overrides` and then the keyword
/// overrides, in that order.
pub fn apply_overrides(parsed: &mut ParsedFlags, keywords: &[(&str, &str)]) -> Result<()> {
    if let Some(path) = parsed.config.overrides.clone() {
        for (flag, values) in load_overrides(&path)? {
            parsed.set(&flag, values)?;
        }
    }
    for (flag, value) in keywords {
        parsed.set(flag, vec![value.to_string()])?;
    }
    Ok(())
}
