use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;

use super::csv_file::{CsvFile, Row};
use super::{LifecycleAware, OutputParameter, Parameterized, PathBacked, Phase, PhaseContext, Role};
use crate::shell::{Shell, ShellOutput};

pub const EVENT_STARTED: &str = "process started";
pub const EVENT_FINISHED: &str = "process finished";
pub const EVENT_DURATION: &str = "process duration";

fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Timestamped `time,event,key,value` records.
#[derive(Debug, Clone)]
pub struct EventLog {
    csv: CsvFile,
}

impl EventLog {
    pub fn new(filename: &str) -> Self {
        Self {
            csv: CsvFile::new(filename),
        }
    }

    /// Records one event and returns its UNIX time.
    pub fn event(&mut self, event: &str, key: &str, value: &str) -> Result<f64> {
        let t = unix_now();
        self.csv
            .append([format!("{:.6}", t), event.to_string(), key.to_string(), value.to_string()])?;
        Ok(t)
    }

    /// Runs `command` and records its start, end and duration.
    pub fn shell(&mut self, shell: &mut Shell, command: &str) -> Result<ShellOutput> {
        let start = self.event(EVENT_STARTED, command, "")?;
        let output = shell.run(command)?;
        let stop = self.event(EVENT_FINISHED, command, "")?;
        self.event(EVENT_DURATION, command, &format!("{:.6}", stop - start))?;
        Ok(output)
    }

    pub fn rows(&self) -> Result<Vec<Row>> {
        self.csv.rows()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.csv.flush()
    }
}

impl PathBacked for EventLog {
    fn path(&self) -> Result<PathBuf> {
        self.csv.path()
    }
}

impl Parameterized for EventLog {
    fn name(&self) -> &str {
        self.csv.name()
    }

    fn set_name(&mut self, name: &str) {
        self.csv.set_name(name);
    }
}

impl LifecycleAware for EventLog {
    fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, role: Role, phase: Phase) -> Result<()> {
        self.csv.on_phase(ctx, role, phase)
    }
}

impl OutputParameter for EventLog {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::resources::ResourcePool;
    use std::fs;

    #[test]
    fn shell_commands_are_bracketed_by_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let metadata = Metadata::new();
        let mut pool = ResourcePool::new();
        let mut ctx = PhaseContext {
            run_dir: dir.path(),
            anchor_dir: dir.path(),
            scratch_dir: None,
            identifier: "Test-0",
            metadata: &metadata,
            resources: &mut pool,
        };
        let mut log = EventLog::new("events");
        log.set_name("events");
        log.on_phase(&mut ctx, Role::Output, Phase::Before).expect("before");

        let mut shell = Shell::new();
        log.event("marker", "k", "v").expect("event");
        log.shell(&mut shell, "true").expect("shell");
        log.on_phase(&mut ctx, Role::Output, Phase::After).expect("after");

        let rows = log.rows().expect("rows");
        let events: Vec<&str> = rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(events, vec!["marker", EVENT_STARTED, EVENT_FINISHED, EVENT_DURATION]);
        assert_eq!(rows[1][2], "true");
        let duration: f64 = rows[3][3].parse().expect("duration");
        assert!(duration >= 0.0);
        assert!(fs::read_to_string(dir.path().join("events"))
            .expect("read")
            .starts_with(&rows[0][0]));
    }
}
