//! Blocking `sh -c` wrapper used by run logic and by parameters that need
//! external tools.

use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

use crate::fsutil::atomic_write_bytes;

#[derive(Debug, Error)]
#[error("command {command} failed to execute (exit code: {code})\n\nSTDOUT:\n{stdout}")]
pub struct CommandFailed {
    pub command: String,
    pub code: i32,
    pub stdout: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub lines: Vec<String>,
    pub code: i32,
}

impl ShellOutput {
    pub fn stdout(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Clone)]
struct Tracker {
    dir: PathBuf,
    count: usize,
    enabled: bool,
}

/// Runs commands through `sh -c` with `LC_ALL=C`. Stderr is merged into
/// stdout unless tracking is on, in which case every command leaves
/// `shell_<n>_stdout`, `shell_<n>_stderr` and `shell_<n>_time` behind.
#[derive(Debug, Clone, Default)]
pub struct Shell {
    tracker: Option<Tracker>,
}

impl Shell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked(dir: &Path) -> Self {
        let mut shell = Self::new();
        shell.track(dir);
        shell
    }

    pub fn track(&mut self, dir: &Path) {
        self.tracker = Some(Tracker {
            dir: dir.to_path_buf(),
            count: 0,
            enabled: true,
        });
    }

    pub fn enable_tracking(&mut self) {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.enabled = true;
        }
    }

    pub fn disable_tracking(&mut self) {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.enabled = false;
        }
    }

    /// Number of commands recorded by the tracker so far.
    pub fn tracked_commands(&self) -> usize {
        self.tracker.as_ref().map(|t| t.count).unwrap_or(0)
    }

    /// Fails with [`CommandFailed`] on a non-zero exit code.
    pub fn run(&mut self, command: &str) -> Result<ShellOutput> {
        self.execute(command, false)
    }

    pub fn run_failok(&mut self, command: &str) -> Result<ShellOutput> {
        self.execute(command, true)
    }

    fn execute(&mut self, command: &str, failok: bool) -> Result<ShellOutput> {
        debug!(command, "executing");
        let track_base = match self.tracker.as_mut() {
            Some(tracker) if tracker.enabled => {
                let base = tracker.dir.join(format!("shell_{}", tracker.count));
                tracker.count += 1;
                Some(base)
            }
            _ => None,
        };

        let mut cmd = Command::new("sh");
        cmd.env("LC_ALL", "C").stdin(Stdio::null()).stdout(Stdio::piped());
        match &track_base {
            Some(base) => {
                let stderr = fs::File::create(suffixed(base, "_stderr"))?;
                cmd.arg("-c").arg(command).stderr(Stdio::from(stderr));
            }
            None => {
                cmd.arg("-c")
                    .arg(format!("exec 2>&1\n{}", command))
                    .stderr(Stdio::null());
            }
        }

        let started = Instant::now();
        let output = cmd
            .output()
            .map_err(|e| anyhow!("failed to spawn sh for '{}': {}", command, e))?;
        let elapsed = started.elapsed();
        let code = output.status.code().unwrap_or(-1);

        let raw = String::from_utf8_lossy(&output.stdout);
        let stdout = raw.strip_suffix('\n').unwrap_or(raw.as_ref()).to_string();
        for line in stdout.lines() {
            debug!("stdout|{}", line);
        }

        if let Some(base) = &track_base {
            atomic_write_bytes(&suffixed(base, "_stdout"), format!("{}\n", stdout).as_bytes())?;
            let timing = format!(
                "command: {}\nelapsed_seconds: {:.6}\nexit_code: {}\n",
                command,
                elapsed.as_secs_f64(),
                code
            );
            atomic_write_bytes(&suffixed(base, "_time"), timing.as_bytes())?;
        }

        if !failok && code != 0 {
            return Err(CommandFailed {
                command: command.to_string(),
                code,
                stdout,
            }
            .into());
        }
        Ok(ShellOutput {
            lines: stdout.lines().map(|l| l.to_string()).collect(),
            code,
        })
    }
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Splits a command line into words, honouring single quotes, double
/// quotes and backslash escapes the way `sh` does for plain words.
pub fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(anyhow!("unterminated single quote in: {}", line)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch) => current.push(ch),
                            None => return Err(anyhow!("dangling escape in: {}", line)),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(anyhow!("unterminated double quote in: {}", line)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err(anyhow!("dangling escape in: {}", line)),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
