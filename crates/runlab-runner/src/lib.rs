pub mod catalog;
pub mod config;
pub mod discovery;
pub mod error;
pub mod experiment;
pub mod flags;
pub mod fsutil;
pub mod identity;
pub mod logging;
pub mod metadata;
pub mod param;
pub mod resources;
pub mod shell;
pub mod slots;

pub use config::RunConfig;
pub use discovery::{
    assert_metadata_common, assert_metadata_unique, go_up_till, render_run_tree, scan_runs,
    search_run, search_runs, RunEntry, RunStatus, Selector,
};
pub use error::HarnessError;
pub use experiment::{Coordinator, Experiment, RunContext, RunResult, RunState};
pub use identity::{compute_identity, Identity};
pub use logging::init_logging;
pub use metadata::Metadata;
pub use param::{
    Bool, Conflict, CsvFile, Database, Directory, EventLog, Executable, File, Integer, List,
    MachineMonitor, Str, Table, TableDict, Upstream,
};
pub use resources::ResourcePool;
pub use shell::{CommandFailed, Shell, ShellOutput};
pub use slots::{DeferredContext, Input, Inputs, Outputs};
