//! Parameter capabilities and the concrete parameter catalogue.
//!
//! A parameter type implements the capabilities it needs:
//!
//! - [`Parameterized`]: name, command-line registration, binding and the
//!   pre-hash resolution pass.
//! - [`HasMetadata`]: the entries it contributes to the run identity, and
//!   how to restore itself from persisted metadata.
//! - [`LifecycleAware`]: reactions to `before`/`after` for either role.
//! - [`PathBacked`]: a concrete filesystem location.
//!
//! [`InputParameter`] and [`OutputParameter`] are marker traits a type opts
//! into explicitly; a declaration only accepts types that did.

use anyhow::Result;
use std::any::Any;
use std::path::{Path, PathBuf};

use crate::flags::{FlagSet, ParsedFlags};
use crate::metadata::Metadata;
use crate::resources::ResourcePool;

pub mod csv_file;
pub mod database;
pub mod directory;
pub mod events;
pub mod file;
pub mod list;
pub mod monitor;
pub mod scalar;
pub mod table;
pub mod upstream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
}

/// Per-slot progress through a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Unbound,
    Bound,
    Active,
    Finalized,
}

/// Environment handed to lifecycle hooks.
pub struct PhaseContext<'a> {
    /// Directory of the run that owns the parameter.
    pub run_dir: &'a Path,
    /// Relative paths of the parameter resolve against this directory.
    pub anchor_dir: &'a Path,
    pub scratch_dir: Option<&'a Path>,
    pub identifier: &'a str,
    pub metadata: &'a Metadata,
    pub resources: &'a mut ResourcePool,
}

impl<'a> PhaseContext<'a> {
    /// Context for parameters owned by another (reattached) run.
    pub fn nested<'b>(
        &'b mut self,
        run_dir: &'b Path,
        identifier: &'b str,
        metadata: &'b Metadata,
    ) -> PhaseContext<'b> {
        PhaseContext {
            run_dir,
            anchor_dir: run_dir,
            scratch_dir: self.scratch_dir,
            identifier,
            metadata,
            resources: &mut *self.resources,
        }
    }

    pub fn anchored(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.anchor_dir.join(path)
        }
    }
}

/// Environment for the resolution pass that runs after binding and
/// before metadata collection.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub root_dir: &'a Path,
    pub startup_dir: &'a Path,
    pub verbosity: u8,
}

pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub trait Parameterized {
    fn name(&self) -> &str;

    /// Called by the owning container. Containers propagate
    /// `<parent>-<child>` names to their children.
    fn set_name(&mut self, name: &str);

    fn register(&self, _flags: &mut FlagSet) -> Result<()> {
        Ok(())
    }

    fn bind(&mut self, _flags: &ParsedFlags) -> Result<()> {
        Ok(())
    }

    fn resolve(&mut self, _ctx: &ResolveContext<'_>) -> Result<()> {
        Ok(())
    }
}

pub trait HasMetadata {
    fn contribute_metadata(&self) -> Result<Metadata>;

    /// Re-initialises the bound value from a persisted run.
    fn restore(&mut self, _metadata: &Metadata) -> Result<()> {
        Ok(())
    }
}

pub trait LifecycleAware {
    fn on_phase(&mut self, _ctx: &mut PhaseContext<'_>, _role: Role, _phase: Phase) -> Result<()> {
        Ok(())
    }

    /// The run failed and no `after` hook will follow. Background work
    /// stops here; nothing is flushed.
    fn abort(&mut self) {}
}

pub trait PathBacked {
    fn path(&self) -> Result<PathBuf>;
}

pub trait InputParameter: Parameterized + HasMetadata + LifecycleAware + AsAny {}

pub trait OutputParameter: Parameterized + LifecycleAware + AsAny {}

impl dyn InputParameter {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

impl dyn OutputParameter {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

pub fn child_name(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}-{}", parent, child)
    }
}

pub use csv_file::CsvFile;
pub use database::{Conflict, Database};
pub use directory::Directory;
pub use events::EventLog;
pub use file::{Executable, File};
pub use list::List;
pub use monitor::MachineMonitor;
pub use scalar::{Bool, Integer, Scalar, ScalarValue, Str};
pub use table::{Table, TableDict};
pub use upstream::Upstream;
