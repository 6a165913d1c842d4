use anyhow::{anyhow, Result};
use md5::{Digest, Md5};
use runlab_runner::metadata::{read_metadata, KEY_DATE_END, KEY_DATE_START, KEY_HASH, KEY_NAME, KEY_VERSION};
use runlab_runner::{
    scan_runs, Coordinator, EventLog, Experiment, File, HarnessError, Inputs, Integer, Outputs,
    MachineMonitor, RunContext, RunState, RunStatus, Str,
};
use std::time::Duration;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn base_args(root: &Path) -> Vec<String> {
    vec!["--base-dir".to_string(), root.display().to_string()]
}

struct SimpleExperiment;

impl Experiment for SimpleExperiment {
    fn inputs(&self) -> Inputs {
        Inputs::new().with("key", Str::new("ABC"))
    }

    fn outputs(&self) -> Outputs {
        Outputs::new().with("out", File::new("out"))
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        let key = ctx.input::<Str>("key")?.get()?.clone();
        ctx.output_mut::<File>("out")?.write(format!("Hallo {}", key));
        Ok(())
    }
}

#[test]
fn identifier_is_title_and_digest_of_version_and_inputs() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut coordinator = Coordinator::new(SimpleExperiment);
    let result = coordinator
        .execute_with(base_args(root.path()), &[])
        .expect("execute")
        .expect("result");

    let digest = md5_hex("version 1key ABC");
    assert_eq!(result.identifier, format!("SimpleExperiment-{}", digest));
    assert_eq!(result.run_dir, root.path().join(&result.identifier));
    assert_eq!(coordinator.state(), RunState::Completed);

    let metadata = read_metadata(&result.run_dir).expect("metadata");
    assert_eq!(metadata["key"], json!("ABC"));
    assert_eq!(metadata[KEY_NAME], json!("SimpleExperiment"));
    assert_eq!(metadata[KEY_VERSION], json!(1));
    assert_eq!(metadata[KEY_HASH], json!(digest));
    assert!(metadata.contains_key(KEY_DATE_START));
    assert!(metadata.contains_key(KEY_DATE_END));
    assert_eq!(
        fs::read_to_string(result.run_dir.join("out")).expect("out"),
        "Hallo ABC"
    );
}

#[test]
fn different_inputs_give_different_run_directories() {
    let root = tempfile::tempdir().expect("tempdir");
    let first = Coordinator::new(SimpleExperiment)
        .execute_with(base_args(root.path()), &[])
        .expect("first")
        .expect("result");
    let mut args = base_args(root.path());
    args.extend(["--key".to_string(), "XYZ".to_string()]);
    let second = Coordinator::new(SimpleExperiment)
        .execute_with(args, &[])
        .expect("second")
        .expect("result");

    assert_ne!(first.identifier, second.identifier);
    assert!(first.run_dir.is_dir());
    assert!(second.run_dir.is_dir());
    assert_eq!(
        second.identifier,
        format!("SimpleExperiment-{}", md5_hex("version 1key XYZ"))
    );
}

#[test]
fn rerunning_purges_the_previous_contents() {
    let root = tempfile::tempdir().expect("tempdir");
    let first = Coordinator::new(SimpleExperiment)
        .execute_with(base_args(root.path()), &[])
        .expect("first")
        .expect("result");
    fs::write(first.run_dir.join("stale"), "left over").expect("stale");

    let second = Coordinator::new(SimpleExperiment)
        .execute_with(base_args(root.path()), &[])
        .expect("second")
        .expect("result");
    assert_eq!(first.identifier, second.identifier);
    assert!(!second.run_dir.join("stale").exists());
    assert!(second.run_dir.join("out").is_file());
}

#[test]
fn keyword_overrides_win_over_the_overrides_file() {
    let root = tempfile::tempdir().expect("tempdir");
    let overrides = root.path().join("overrides.yaml");
    fs::write(&overrides, "schema_version: overrides_v1\nvalues:\n  key: FROMFILE\n").expect("write");

    let mut args = base_args(root.path());
    args.extend(["--overrides".to_string(), overrides.display().to_string()]);
    let from_file = Coordinator::new(SimpleExperiment)
        .execute_with(args.clone(), &[])
        .expect("file")
        .expect("result");
    assert!(from_file.identifier.ends_with(&md5_hex("version 1key FROMFILE")));

    let keyword = Coordinator::new(SimpleExperiment)
        .execute_with(args, &[("key", "KW")])
        .expect("keyword")
        .expect("result");
    assert!(keyword.identifier.ends_with(&md5_hex("version 1key KW")));
}

/// Writes its output, then fails; remembers the scratch directory it saw.
#[derive(Default)]
struct FailingExperiment {
    scratch: Option<PathBuf>,
}

impl Experiment for FailingExperiment {
    fn inputs(&self) -> Inputs {
        Inputs::new().with("attempt", Integer::new(1))
    }

    fn outputs(&self) -> Outputs {
        Outputs::new()
            .with("out", File::new("out"))
            .with("events", EventLog::new("events"))
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        assert!(ctx.scratch_dir().is_dir());
        self.scratch = Some(ctx.scratch_dir().to_path_buf());
        fs::write(ctx.scratch_dir().join("partial"), "x")?;
        ctx.output_mut::<File>("out")?.write("never flushed");
        ctx.output_mut::<EventLog>("events")?.event("step", "k", "v")?;
        Err(anyhow!("boom"))
    }
}

#[test]
fn failed_runs_propagate_the_error_and_clean_up_scratch() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut coordinator = Coordinator::new(FailingExperiment::default());
    let err = coordinator
        .execute_with(base_args(root.path()), &[])
        .expect_err("run fails");

    assert_eq!(err.to_string(), "boom");
    assert!(err.downcast_ref::<HarnessError>().is_none());
    assert_eq!(coordinator.state(), RunState::Failed);

    let scratch = coordinator.experiment().scratch.clone().expect("scratch seen");
    assert!(!scratch.exists());

    let run_dir = coordinator.path().expect("run dir").to_path_buf();
    assert_eq!(fs::read_to_string(run_dir.join("out")).expect("out"), "");
    assert_eq!(fs::read_to_string(run_dir.join("events")).expect("events"), "");

    let runs = scan_runs(root.path(), Some("FailingExperiment")).expect("scan");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Incomplete);
}

struct MonitoredFailure;

impl Experiment for MonitoredFailure {
    fn inputs(&self) -> Inputs {
        Inputs::new()
    }

    fn outputs(&self) -> Outputs {
        Outputs::new().with(
            "load",
            MachineMonitor::new("load").tick_interval(Duration::from_millis(10)),
        )
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        assert!(ctx.output::<MachineMonitor>("load")?.is_sampling());
        std::thread::sleep(Duration::from_millis(30));
        Err(anyhow!("boom"))
    }
}

#[test]
fn failed_runs_stop_background_samplers() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut coordinator = Coordinator::new(MonitoredFailure);
    let err = coordinator
        .execute_with(base_args(root.path()), &[])
        .expect_err("run fails");
    assert_eq!(err.to_string(), "boom");

    let monitor = coordinator.output::<MachineMonitor>("load").expect("monitor");
    assert!(!monitor.is_sampling());
    let run_dir = coordinator.path().expect("run dir").to_path_buf();
    assert_eq!(fs::read_to_string(run_dir.join("load")).expect("load"), "");
}

/// Its title extends `Simple` by a dash.
struct Dashed;

impl Experiment for Dashed {
    fn title(&self) -> String {
        "Simple-Experiment".to_string()
    }

    fn inputs(&self) -> Inputs {
        Inputs::new()
    }

    fn outputs(&self) -> Outputs {
        Outputs::new()
    }

    fn run(&mut self, _ctx: &mut RunContext<'_>) -> Result<()> {
        Ok(())
    }
}

struct Short;

impl Experiment for Short {
    fn title(&self) -> String {
        "Simple".to_string()
    }

    fn inputs(&self) -> Inputs {
        Inputs::new()
    }

    fn outputs(&self) -> Outputs {
        Outputs::new()
    }

    fn run(&mut self, _ctx: &mut RunContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[test]
fn runs_of_a_longer_dashed_title_belong_to_that_title_only() {
    let root = tempfile::tempdir().expect("tempdir");
    let dashed = Coordinator::new(Dashed)
        .execute_with(base_args(root.path()), &[])
        .expect("dashed")
        .expect("result");

    let err = Coordinator::reattach(Short, root.path(), &dashed.identifier)
        .err()
        .expect("foreign title");
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::Reattach { .. })
    ));
    assert!(Coordinator::reattach(Dashed, root.path(), &dashed.identifier).is_ok());
    assert!(scan_runs(root.path(), Some("Simple")).expect("scan").is_empty());
    assert_eq!(scan_runs(root.path(), Some("Simple-Experiment")).expect("scan").len(), 1);
}

#[derive(Default)]
struct ScratchUser {
    scratch: Option<PathBuf>,
}

impl Experiment for ScratchUser {
    fn title(&self) -> String {
        "Scratch".to_string()
    }

    fn version(&self) -> u32 {
        3
    }

    fn inputs(&self) -> Inputs {
        Inputs::new()
    }

    fn outputs(&self) -> Outputs {
        Outputs::new()
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        self.scratch = Some(ctx.scratch_dir().to_path_buf());
        ctx.track_shell();
        let output = ctx.shell().run("echo hello; echo world")?;
        assert_eq!(output.lines, vec!["hello".to_string(), "world".to_string()]);
        Ok(())
    }
}

#[test]
fn successful_runs_remove_scratch_and_record_shell_commands() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut coordinator = Coordinator::new(ScratchUser::default());
    let result = coordinator
        .execute_with(base_args(root.path()), &[])
        .expect("execute")
        .expect("result");

    assert_eq!(result.identifier, format!("Scratch-{}", md5_hex("version 3")));
    let scratch = coordinator.experiment().scratch.clone().expect("scratch seen");
    assert!(!scratch.exists());
    assert_eq!(
        fs::read_to_string(result.run_dir.join("shell_0_stdout")).expect("stdout"),
        "hello\nworld\n"
    );
    assert!(result.run_dir.join("shell_0_time").is_file());
}

#[cfg(unix)]
#[test]
fn symlink_points_at_the_latest_run() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut args = base_args(root.path());
    args.push("--symlink".to_string());
    let first = Coordinator::new(SimpleExperiment)
        .execute_with(args.clone(), &[])
        .expect("first")
        .expect("result");
    let link = root.path().join("SimpleExperiment");
    assert_eq!(fs::read_link(&link).expect("link"), PathBuf::from(&first.identifier));

    let second = Coordinator::new(SimpleExperiment)
        .execute_with(args, &[("key", "other")])
        .expect("second")
        .expect("result");
    assert_eq!(fs::read_link(&link).expect("link"), PathBuf::from(&second.identifier));
}

#[test]
fn reattaching_reads_what_the_run_produced() {
    let root = tempfile::tempdir().expect("tempdir");
    let result = Coordinator::new(SimpleExperiment)
        .execute_with(base_args(root.path()), &[("key", "XYZ")])
        .expect("execute")
        .expect("result");

    let attached = Coordinator::reattach(SimpleExperiment, root.path(), &result.identifier)
        .expect("reattach");
    assert_eq!(attached.state(), RunState::Reattached);
    assert_eq!(attached.identifier(), Some(result.identifier.as_str()));
    assert_eq!(attached.input::<Str>("key").expect("key").as_str(), Some("XYZ"));
    assert_eq!(
        attached.output::<File>("out").expect("out").value().expect("value"),
        "Hallo XYZ"
    );
    assert_eq!(
        attached.get::<File>("out").expect("out").value().expect("value"),
        "Hallo XYZ"
    );

    let by_path = Coordinator::reattach(
        SimpleExperiment,
        Path::new("/nonexistent"),
        &result.run_dir.display().to_string(),
    )
    .expect("absolute path");
    assert_eq!(by_path.identifier(), attached.identifier());
}

#[test]
fn reattach_rejects_missing_foreign_and_incomplete_runs() {
    let root = tempfile::tempdir().expect("tempdir");
    let err = Coordinator::reattach(SimpleExperiment, root.path(), "SimpleExperiment-0")
        .err()
        .expect("missing");
    assert_eq!(err.downcast_ref::<HarnessError>().map(|e| e.code()), Some("reattach_error"));

    let other = Coordinator::new(ScratchUser::default())
        .execute_with(base_args(root.path()), &[])
        .expect("other")
        .expect("result");
    assert!(Coordinator::reattach(SimpleExperiment, root.path(), &other.identifier).is_err());

    let mut failing = Coordinator::new(FailingExperiment::default());
    assert!(failing.execute_with(base_args(root.path()), &[]).is_err());
    let failed_id = failing.identifier().expect("identifier").to_string();
    let err = Coordinator::reattach(FailingExperiment::default(), root.path(), &failed_id)
        .err()
        .expect("incomplete");
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::Reattach { .. })
    ));
}

struct SharedName {
    source: PathBuf,
}

impl Experiment for SharedName {
    fn inputs(&self) -> Inputs {
        Inputs::new().with("data", File::new(&self.source.display().to_string()))
    }

    fn outputs(&self) -> Outputs {
        Outputs::new()
            .with("data", File::new("data"))
            .with("count", File::new("count"))
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        let (inputs, outputs) = ctx.parts();
        let content = inputs.get::<File>("data")?.value()?.to_string();
        outputs.get_mut::<File>("data")?.write(content.to_uppercase());
        outputs
            .get_mut::<File>("count")?
            .write(content.len().to_string());
        Ok(())
    }
}

#[test]
fn accessors_report_ambiguous_missing_and_mistyped_names() {
    let root = tempfile::tempdir().expect("tempdir");
    let source = root.path().join("source.txt");
    fs::write(&source, "abc").expect("source");
    let mut coordinator = Coordinator::new(SharedName { source });
    let result = coordinator
        .execute_with(base_args(root.path()), &[])
        .expect("execute")
        .expect("result");
    assert_eq!(fs::read_to_string(result.run_dir.join("data")).expect("data"), "ABC");

    let code = |err: anyhow::Error| -> Option<String> {
        err.downcast_ref::<HarnessError>().map(|e| format!("{:?}", e))
    };
    let ambiguous = code(coordinator.get::<File>("data").err().expect("ambiguous"));
    assert!(ambiguous.expect("typed").starts_with("Ambiguous"));
    let missing = code(coordinator.get::<File>("nope").err().expect("missing"));
    assert!(missing.expect("typed").starts_with("NotFound"));
    let mismatch = code(coordinator.output::<Str>("count").err().expect("mismatch"));
    assert!(mismatch.expect("typed").starts_with("TypeMismatch"));
    assert!(coordinator.input::<File>("data").is_ok());
}
