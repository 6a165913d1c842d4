//! The run coordinator: binds inputs, derives the run identity, prepares
//! the run directory, drives the lifecycle hooks around the user's run
//! logic and persists the metadata.

use anyhow::Result;
use serde_json::Value;
use std::any::{type_name, Any};
use std::env;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::{apply_overrides, RunConfig};
use crate::discovery::render_run_tree;
use crate::error::HarnessError;
use crate::flags::FlagSet;
use crate::fsutil::{absolutize, ensure_dir, purge_dir_contents, replace_symlink};
use crate::identity::{compute_identity, is_run_of};
use crate::logging::init_logging;
use crate::metadata::{
    is_complete, merge_contribution, read_metadata, timestamp_now, write_metadata, Metadata,
    KEY_DATE_END, KEY_DATE_START, KEY_HASH, KEY_NAME, KEY_VERSION,
};
use crate::param::{Phase, PhaseContext, ResolveContext, Role};
use crate::resources::ResourcePool;
use crate::shell::Shell;
use crate::slots::{lookup, Inputs, Outputs};

/// A user-defined experiment: what it consumes, what it produces and the
/// logic turning one into the other.
pub trait Experiment: 'static {
    /// Prefix of every run directory. Defaults to the type name.
    fn title(&self) -> String {
        default_title(type_name::<Self>())
    }

    /// Part of the identity; bump it when the run logic changes.
    fn version(&self) -> u32 {
        1
    }

    fn inputs(&self) -> Inputs;

    fn outputs(&self) -> Outputs;

    /// Restricts the metadata that goes into the identity hash. The
    /// persisted metadata always holds every input entry.
    fn filter_metadata(&self, metadata: Metadata) -> Metadata {
        metadata
    }

    /// Waits for the operator before the scratch directory of a failed run
    /// is removed.
    fn suspend_on_error(&self) -> bool {
        false
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()>;
}

fn default_title(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Uninitialized,
    Bound,
    Running,
    Completed,
    Failed,
    Reattached,
}

/// Outcome of a successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub identifier: String,
    pub run_dir: PathBuf,
}

/// What the run logic gets to work with.
pub struct RunContext<'a> {
    inputs: &'a mut Inputs,
    outputs: &'a mut Outputs,
    shell: Shell,
    run_dir: &'a Path,
    scratch_dir: &'a Path,
    identifier: &'a str,
    metadata: &'a Metadata,
    resources: &'a mut ResourcePool,
}

impl<'a> RunContext<'a> {
    pub fn input<T: Any>(&self, name: &str) -> Result<&T> {
        self.inputs.get(name)
    }

    pub fn input_mut<T: Any>(&mut self, name: &str) -> Result<&mut T> {
        self.inputs.get_mut(name)
    }

    pub fn output<T: Any>(&self, name: &str) -> Result<&T> {
        self.outputs.get(name)
    }

    pub fn output_mut<T: Any>(&mut self, name: &str) -> Result<&mut T> {
        self.outputs.get_mut(name)
    }

    /// Looks in inputs and outputs alike.
    pub fn get<T: Any>(&self, name: &str) -> Result<&T> {
        lookup(&*self.inputs, &*self.outputs, name)
    }

    /// Read access to the inputs next to write access to the outputs.
    pub fn parts(&mut self) -> (&Inputs, &mut Outputs) {
        (&*self.inputs, &mut *self.outputs)
    }

    pub fn path(&self) -> &Path {
        self.run_dir
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch_dir
    }

    pub fn identifier(&self) -> &str {
        self.identifier
    }

    pub fn metadata(&self) -> &Metadata {
        self.metadata
    }

    pub fn shell(&mut self) -> &mut Shell {
        &mut self.shell
    }

    /// Records every following shell command in the run directory.
    pub fn track_shell(&mut self) {
        self.shell.track(self.run_dir);
    }

    pub fn resources(&mut self) -> &mut ResourcePool {
        &mut *self.resources
    }
}

/// Owns one experiment, its parameter tree and the state of one run.
pub struct Coordinator<E: Experiment> {
    experiment: E,
    title: String,
    version: u32,
    inputs: Inputs,
    outputs: Outputs,
    state: RunState,
    identifier: Option<String>,
    run_dir: Option<PathBuf>,
    metadata: Metadata,
    resources: ResourcePool,
    config: RunConfig,
}

impl<E: Experiment> Coordinator<E> {
    pub fn new(experiment: E) -> Self {
        let title = experiment.title();
        let version = experiment.version();
        let inputs = experiment.inputs();
        let outputs = experiment.outputs();
        Self {
            experiment,
            title,
            version,
            inputs,
            outputs,
            state: RunState::Uninitialized,
            identifier: None,
            run_dir: None,
            metadata: Metadata::new(),
            resources: ResourcePool::new(),
            config: RunConfig::default(),
        }
    }

    /// Attaches to a finished run instead of executing. `identifier` is a
    /// directory name below `root`, or a path (symlinks are followed).
    pub fn reattach(experiment: E, root: &Path, identifier: &str) -> Result<Self> {
        let mut coordinator = Self::new(experiment);
        coordinator.attach(root, identifier)?;
        Ok(coordinator)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn path(&self) -> Result<&Path> {
        self.run_dir.as_deref().ok_or_else(|| {
            HarnessError::InvalidState(format!("{} has no run directory yet", self.title)).into()
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn experiment(&self) -> &E {
        &self.experiment
    }

    pub fn experiment_mut(&mut self) -> &mut E {
        &mut self.experiment
    }

    pub fn into_experiment(self) -> E {
        self.experiment
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    pub fn input<T: Any>(&self, name: &str) -> Result<&T> {
        self.inputs.get(name)
    }

    pub fn output<T: Any>(&self, name: &str) -> Result<&T> {
        self.outputs.get(name)
    }

    pub fn output_mut<T: Any>(&mut self, name: &str) -> Result<&mut T> {
        self.outputs.get_mut(name)
    }

    pub fn get<T: Any>(&self, name: &str) -> Result<&T> {
        lookup(&self.inputs, &self.outputs, name)
    }

    pub fn resources(&mut self) -> &mut ResourcePool {
        &mut self.resources
    }

    /// Global flags plus one flag per static input.
    pub fn flag_set(&self) -> Result<FlagSet> {
        let mut flags = FlagSet::with_globals(&self.title);
        self.inputs.register(&mut flags)?;
        Ok(flags)
    }

    pub fn help(&self) -> Result<String> {
        Ok(self.flag_set()?.render_help())
    }

    /// Executes with every input at its default.
    pub fn execute(&mut self) -> Result<Option<RunResult>> {
        self.execute_with(Vec::<String>::new(), &[])
    }

    /// Executes with the process arguments. Usage errors (including
    /// `--help`) print and exit like any clap program.
    pub fn execute_from_env(&mut self) -> Result<Option<RunResult>> {
        let result = self.execute_with(env::args().skip(1), &[]);
        if let Err(e) = &result {
            if let Some(usage) = e.downcast_ref::<clap::Error>() {
                usage.exit();
            }
        }
        result
    }

    /// Parses `args`, applies the overrides file and then `overrides`, and
    /// runs. Returns `None` in list mode, where nothing is executed.
    pub fn execute_with<I, S>(&mut self, args: I, overrides: &[(&str, &str)]) -> Result<Option<RunResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.state != RunState::Uninitialized {
            return Err(HarnessError::InvalidState(format!(
                "{} cannot be executed in state {:?}",
                self.title, self.state
            ))
            .into());
        }
        let result = self.execute_inner(args, overrides);
        if result.is_err() {
            self.state = RunState::Failed;
        }
        result
    }

    fn execute_inner<I, S>(&mut self, args: I, overrides: &[(&str, &str)]) -> Result<Option<RunResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.check_unique()?;
        self.outputs.check_unique()?;
        let flags = self.flag_set()?;
        let mut parsed = flags.parse(args)?;
        apply_overrides(&mut parsed, overrides)?;
        init_logging(parsed.config.verbosity);
        self.config = parsed.config.clone();

        let root_dir = absolutize(&self.config.base_dir)?;
        if self.config.list {
            println!("{}", render_run_tree(&root_dir, &self.title)?);
            return Ok(None);
        }

        let startup_dir = env::current_dir()?;
        let rctx = ResolveContext {
            root_dir: &root_dir,
            startup_dir: &startup_dir,
            verbosity: self.config.verbosity,
        };
        self.inputs.bind_static(&parsed)?;
        self.inputs.resolve_static(&rctx)?;
        self.inputs.resolve_deferred(&parsed, &rctx, &self.config)?;

        let collected = self.inputs.collect_metadata()?;
        let identity = compute_identity(
            &self.title,
            self.version,
            &self.experiment.filter_metadata(collected.clone()),
        );
        let mut metadata = collected;
        merge_contribution(
            &mut metadata,
            Metadata::from([
                (KEY_NAME.to_string(), Value::String(self.title.clone())),
                (KEY_VERSION.to_string(), Value::from(self.version)),
                (KEY_HASH.to_string(), Value::String(identity.digest.clone())),
                (KEY_DATE_START.to_string(), Value::String(timestamp_now())),
            ]),
            &self.title,
        )?;

        let run_dir = root_dir.join(&identity.identifier);
        if run_dir.exists() {
            info!(run_dir = %run_dir.display(), "purging previous run");
            purge_dir_contents(&run_dir)?;
        } else {
            info!(run_dir = %run_dir.display(), "creating run directory");
            ensure_dir(&run_dir)?;
        }
        write_metadata(&run_dir, &metadata)?;
        self.metadata = metadata;
        self.identifier = Some(identity.identifier.clone());
        self.run_dir = Some(run_dir.clone());
        self.state = RunState::Bound;

        self.drive(&run_dir, &startup_dir, &identity.identifier)?;

        self.metadata
            .insert(KEY_DATE_END.to_string(), Value::String(timestamp_now()));
        write_metadata(&run_dir, &self.metadata)?;
        self.state = RunState::Completed;
        info!(identifier = %identity.identifier, "run completed");

        if self.config.symlink {
            let link = root_dir.join(&self.title);
            if !replace_symlink(Path::new(&identity.identifier), &link)? {
                warn!(link = %link.display(), "not replacing a non-symlink with the latest-run link");
            }
        }
        Ok(Some(RunResult {
            identifier: identity.identifier,
            run_dir,
        }))
    }

    /// Scratch directory, before hooks, run logic, after hooks. A failure
    /// anywhere skips the remaining hooks and aborts every parameter; the
    /// scratch directory is gone either way and the failure is returned as
    /// it was raised.
    fn drive(&mut self, run_dir: &Path, startup_dir: &Path, identifier: &str) -> Result<()> {
        let suspend = self.config.suspend_on_error || self.experiment.suspend_on_error();
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", self.title))
            .tempdir()?;
        debug!(scratch = %scratch.path().display(), "scratch directory");

        let Coordinator {
            experiment,
            inputs,
            outputs,
            metadata,
            resources,
            state,
            ..
        } = self;
        let metadata = &*metadata;

        let outcome = (|| -> Result<()> {
            let mut ctx = PhaseContext {
                run_dir,
                anchor_dir: startup_dir,
                scratch_dir: Some(scratch.path()),
                identifier,
                metadata,
                resources: &mut *resources,
            };
            inputs.on_phase(&mut ctx, Phase::Before)?;
            ctx.anchor_dir = run_dir;
            outputs.on_phase(&mut ctx, Role::Output, Phase::Before)?;
            *state = RunState::Running;
            debug!(identifier, "running");

            let mut run_ctx = RunContext {
                inputs: &mut *inputs,
                outputs: &mut *outputs,
                shell: Shell::new(),
                run_dir,
                scratch_dir: scratch.path(),
                identifier,
                metadata,
                resources: &mut *resources,
            };
            experiment.run(&mut run_ctx)?;

            let mut ctx = PhaseContext {
                run_dir,
                anchor_dir: run_dir,
                scratch_dir: Some(scratch.path()),
                identifier,
                metadata,
                resources: &mut *resources,
            };
            outputs.on_phase(&mut ctx, Role::Output, Phase::After)?;
            ctx.anchor_dir = startup_dir;
            inputs.on_phase(&mut ctx, Phase::After)
        })();

        match outcome {
            Ok(()) => {
                scratch.close()?;
                Ok(())
            }
            Err(err) => {
                *state = RunState::Failed;
                error!(identifier, error = %format!("{:#}", err), "run failed");
                outputs.abort();
                inputs.abort();
                if suspend {
                    wait_for_operator(scratch.path());
                }
                let scratch_path = scratch.path().to_path_buf();
                if let Err(close) = scratch.close() {
                    warn!(scratch = %scratch_path.display(), error = %close, "failed to remove scratch directory");
                }
                Err(err)
            }
        }
    }

    fn attach(&mut self, root: &Path, identifier: &str) -> Result<()> {
        if self.state != RunState::Uninitialized {
            return Err(HarnessError::InvalidState(format!(
                "{} cannot be reattached in state {:?}",
                self.title, self.state
            ))
            .into());
        }
        self.inputs.check_unique()?;
        self.outputs.check_unique()?;

        let candidate = if Path::new(identifier).is_absolute() {
            PathBuf::from(identifier)
        } else {
            root.join(identifier)
        };
        let run_dir = candidate.canonicalize().map_err(|e| {
            HarnessError::reattach(identifier, format!("{}: {}", candidate.display(), e))
        })?;
        if !run_dir.is_dir() {
            return Err(HarnessError::reattach(identifier, "not a directory").into());
        }
        let dir_name = run_dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| HarnessError::reattach(identifier, "run directory has no name"))?;
        if !is_run_of(&dir_name, &self.title) {
            return Err(HarnessError::reattach(
                identifier,
                format!("{} is not a run of {}", dir_name, self.title),
            )
            .into());
        }
        let metadata = read_metadata(&run_dir)
            .map_err(|e| HarnessError::reattach(identifier, format!("{:#}", e)))?;
        if !is_complete(&metadata) {
            return Err(HarnessError::reattach(identifier, "run did not complete").into());
        }

        let parent = run_dir.parent().unwrap_or(root).to_path_buf();
        let startup_dir = env::current_dir()?;
        let rctx = ResolveContext {
            root_dir: &parent,
            startup_dir: &startup_dir,
            verbosity: 0,
        };
        self.inputs.restore(&metadata)?;
        self.inputs.resolve_static(&rctx)?;

        let mut ctx = PhaseContext {
            run_dir: &run_dir,
            anchor_dir: &run_dir,
            scratch_dir: None,
            identifier: &dir_name,
            metadata: &metadata,
            resources: &mut self.resources,
        };
        self.outputs.on_phase(&mut ctx, Role::Input, Phase::Before)?;

        debug!(identifier = %dir_name, "reattached");
        self.metadata = metadata;
        self.identifier = Some(dir_name);
        self.run_dir = Some(run_dir);
        self.state = RunState::Reattached;
        Ok(())
    }
}

fn wait_for_operator(scratch: &Path) {
    eprintln!("run failed, scratch directory kept at {}", scratch.display());
    eprintln!("press enter to clean up");
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
}
