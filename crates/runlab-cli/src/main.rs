use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

use runlab_runner::catalog::{self, CopyOutcome, Listing};
use runlab_runner::discovery::metadata_matches_text;
use runlab_runner::{init_logging, render_run_tree, scan_runs, HarnessError, RunEntry, RunStatus};

#[derive(Parser)]
#[command(name = "runlab", version, about = "Maintain experiment result directories")]
struct Cli {
    /// Increase verbosity (specify multiple times for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all experiment results in a directory
    Ls {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Results that are not referenced by a symlink or from metadata
    Gc {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        roots: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Copy results and everything their symlinks point to
    Cp {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Entries to copy, followed by the destination directory
        #[arg(required = true, num_args = 2..)]
        paths: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Find complete runs of an experiment by metadata
    Search {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        title: String,
        /// `key=value` condition on the run metadata (repeatable)
        #[arg(long = "where")]
        conditions: Vec<String>,
        #[arg(long)]
        unique: bool,
        #[arg(long)]
        json: bool,
    },
    /// Runs of an experiment with the runs they reference
    Tree {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let (code, details) = error_details(&err);
                emit_json(&json_error(code, format!("{:#}", err), details));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Ls { dir, json } => {
            let listing = catalog::ls(&dir)?;
            if json {
                return Ok(Some(listing_json("ls", &dir, &listing)?));
            }
            println!("{}", listing.render());
        }
        Commands::Gc { dir, roots, json } => {
            let listing = catalog::gc(&dir, &roots)?;
            if json {
                return Ok(Some(listing_json("gc", &dir, &listing)?));
            }
            println!("{}", listing.render());
        }
        Commands::Cp { dir, paths, json } => {
            let (dst, roots) = paths
                .split_last()
                .ok_or_else(|| anyhow!("cp needs at least one entry and a destination"))?;
            let dst = PathBuf::from(dst);
            let actions = catalog::cp(&dir, roots, &dst)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "cp",
                    "dst": dst.display().to_string(),
                    "actions": serde_json::to_value(&actions)?,
                })));
            }
            for action in &actions {
                match action.outcome {
                    CopyOutcome::Skipped => println!("WARN: {} skipped", action.name),
                    _ => println!("{} -> {}/", action.name, dst.display()),
                }
            }
        }
        Commands::Search {
            dir,
            title,
            conditions,
            unique,
            json,
        } => {
            let wanted = parse_conditions(&conditions)?;
            let matches = search_entries(&dir, &title, &wanted)?;
            if unique && matches.len() != 1 {
                return Err(HarnessError::NotUnique {
                    title,
                    matches: matches.into_iter().map(|m| m.path).collect(),
                }
                .into());
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "search",
                    "title": title,
                    "matches": serde_json::to_value(&matches)?,
                })));
            }
            for entry in &matches {
                println!("{}", entry.path.display());
            }
        }
        Commands::Tree { dir, title, json } => {
            let tree = render_run_tree(&dir, &title)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "tree",
                    "title": title,
                    "tree": tree,
                })));
            }
            if !tree.is_empty() {
                println!("{}", tree);
            }
        }
    }
    Ok(None)
}

fn parse_conditions(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| anyhow!("invalid --where '{}': expected key=value", item))
        })
        .collect()
}

fn search_entries(dir: &Path, title: &str, wanted: &[(String, String)]) -> Result<Vec<RunEntry>> {
    let mut matches = Vec::new();
    for entry in scan_runs(dir, Some(title))? {
        if entry.status != RunStatus::Complete {
            debug!(path = %entry.path.display(), "skipping unfinished run");
            continue;
        }
        let selected = entry
            .metadata
            .as_ref()
            .map(|m| metadata_matches_text(m, wanted))
            .unwrap_or(false);
        if selected {
            matches.push(entry);
        }
    }
    Ok(matches)
}

fn listing_json(command: &str, dir: &Path, listing: &Listing) -> Result<Value> {
    Ok(json!({
        "ok": true,
        "command": command,
        "dir": dir.display().to_string(),
        "entries": serde_json::to_value(&listing.entries)?,
        "total_runtime_seconds": listing.total_runtime_seconds,
    }))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_details(err: &anyhow::Error) -> (&'static str, Value) {
    match err.downcast_ref::<HarnessError>() {
        Some(HarnessError::NotUnique { title, matches }) => (
            "discovery_error",
            json!({
                "title": title,
                "matches": matches.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            }),
        ),
        Some(other) => (other.code(), json!({})),
        None => ("command_failed", json!({})),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Ls { json, .. }
        | Commands::Gc { json, .. }
        | Commands::Cp { json, .. }
        | Commands::Search { json, .. }
        | Commands::Tree { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_split_on_the_first_equals_sign() {
        let parsed = parse_conditions(&["key=a=b".to_string(), " n =3".to_string()]).expect("parse");
        assert_eq!(
            parsed,
            vec![
                ("key".to_string(), "a=b".to_string()),
                ("n".to_string(), "3".to_string())
            ]
        );
        assert!(parse_conditions(&["novalue".to_string()]).is_err());
        assert!(parse_conditions(&["=x".to_string()]).is_err());
    }

    #[test]
    fn not_unique_errors_list_their_matches() {
        let err: anyhow::Error = HarnessError::NotUnique {
            title: "Exp".to_string(),
            matches: vec![PathBuf::from("/r/Exp-1"), PathBuf::from("/r/Exp-2")],
        }
        .into();
        let (code, details) = error_details(&err);
        assert_eq!(code, "discovery_error");
        assert_eq!(details["matches"], json!(["/r/Exp-1", "/r/Exp-2"]));
        let payload = json_error(code, err.to_string(), details);
        assert_eq!(payload["ok"], json!(false));
    }

    #[test]
    fn cli_parses_cp_destination_last() {
        let cli = Cli::try_parse_from(["runlab", "cp", "A", "B", "/dst"]).expect("parse");
        match cli.command {
            Commands::Cp { paths, .. } => assert_eq!(paths, vec!["A", "B", "/dst"]),
            _ => panic!("wrong command"),
        }
    }
}
