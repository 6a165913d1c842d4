use anyhow::Result;
use serde_json::Value;
use std::any::Any;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{
    HasMetadata, InputParameter, LifecycleAware, Parameterized, PathBacked, ResolveContext,
};
use crate::error::HarnessError;
use crate::experiment::{Coordinator, Experiment};
use crate::flags::{FlagSet, ParsedFlags};
use crate::metadata::Metadata;

/// Another experiment used as an input.
///
/// Given an identifier (in code or as `--<name> <identifier>`), the
/// upstream run is reattached. A bare upstream executes its experiment with
/// default inputs into the same base directory first and then attaches to
/// the fresh run. Either way the upstream contributes the canonical run
/// directory name, so the downstream identity follows the upstream one.
pub struct Upstream<E: Experiment> {
    name: String,
    template: Option<E>,
    requested: Option<String>,
    attached: Option<Coordinator<E>>,
}

impl<E: Experiment> Upstream<E> {
    pub fn new(experiment: E) -> Self {
        Self {
            name: String::new(),
            template: Some(experiment),
            requested: None,
            attached: None,
        }
    }

    pub fn with_identifier(experiment: E, identifier: &str) -> Self {
        Self {
            requested: Some(identifier.to_string()),
            ..Self::new(experiment)
        }
    }

    /// Wraps an already reattached run, as returned by discovery.
    pub fn from_run(coordinator: Coordinator<E>) -> Self {
        Self {
            name: String::new(),
            template: None,
            requested: coordinator.identifier().map(str::to_string),
            attached: Some(coordinator),
        }
    }

    pub fn coordinator(&self) -> Result<&Coordinator<E>> {
        self.attached.as_ref().ok_or_else(|| {
            HarnessError::InvalidState(format!("upstream '{}' is not attached", self.name)).into()
        })
    }

    pub fn identifier(&self) -> Option<&str> {
        self.attached
            .as_ref()
            .and_then(|c| c.identifier())
            .or(self.requested.as_deref())
    }

    pub fn metadata(&self) -> Result<&Metadata> {
        Ok(self.coordinator()?.metadata())
    }

    pub fn output<T: Any>(&self, name: &str) -> Result<&T> {
        self.coordinator()?.output(name)
    }

    pub fn input<T: Any>(&self, name: &str) -> Result<&T> {
        self.coordinator()?.input(name)
    }

    fn take_template(&mut self) -> Result<E> {
        self.template
            .take()
            .or_else(|| self.attached.take().map(Coordinator::into_experiment))
            .ok_or_else(|| {
                HarnessError::InvalidState(format!("upstream '{}' has no experiment", self.name)).into()
            })
    }

    fn execute_fresh(&mut self, ctx: &ResolveContext<'_>) -> Result<String> {
        let template = self.take_template()?;
        let mut args = vec!["--base-dir".to_string(), ctx.root_dir.display().to_string()];
        if ctx.verbosity > 0 {
            args.push(format!("-{}", "v".repeat(ctx.verbosity as usize)));
        }
        let mut upstream = Coordinator::new(template);
        info!(upstream = %self.name, title = upstream.title(), "executing upstream experiment");
        let result = upstream.execute_with(args, &[])?.ok_or_else(|| {
            HarnessError::InvalidState(format!("upstream '{}' produced no run", self.name))
        })?;
        self.template = Some(upstream.into_experiment());
        Ok(result.identifier)
    }

    /// Run identifiers may be given as paths; those are taken relative to
    /// the startup directory, plain names relative to the base directory.
    fn locate(identifier: &str, ctx: &ResolveContext<'_>) -> String {
        let path = Path::new(identifier);
        if !path.is_absolute() && path.components().count() > 1 {
            ctx.startup_dir.join(path).display().to_string()
        } else {
            identifier.to_string()
        }
    }
}

impl<E: Experiment> PathBacked for Upstream<E> {
    fn path(&self) -> Result<PathBuf> {
        Ok(self.coordinator()?.path()?.to_path_buf())
    }
}

impl<E: Experiment> Parameterized for Upstream<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn register(&self, flags: &mut FlagSet) -> Result<()> {
        flags.add(&self.name, self.requested.as_deref())
    }

    fn bind(&mut self, flags: &ParsedFlags) -> Result<()> {
        if let Some(value) = flags.value(&self.name) {
            self.requested = Some(value.to_string());
        }
        Ok(())
    }

    fn resolve(&mut self, ctx: &ResolveContext<'_>) -> Result<()> {
        let identifier = match self.requested.clone() {
            Some(id) => {
                let current = self.attached.as_ref().and_then(|c| c.identifier());
                if current == Some(id.as_str()) {
                    return Ok(());
                }
                id
            }
            None => self.execute_fresh(ctx)?,
        };
        let target = Self::locate(&identifier, ctx);
        let template = self.take_template()?;
        let coordinator = Coordinator::reattach(template, ctx.root_dir, &target)?;
        self.requested = coordinator.identifier().map(str::to_string);
        self.attached = Some(coordinator);
        Ok(())
    }
}

impl<E: Experiment> HasMetadata for Upstream<E> {
    fn contribute_metadata(&self) -> Result<Metadata> {
        let identifier = self
            .attached
            .as_ref()
            .and_then(|c| c.identifier())
            .ok_or_else(|| {
                HarnessError::InvalidState(format!("upstream '{}' is not resolved", self.name))
            })?;
        Ok(Metadata::from([(
            self.name.clone(),
            Value::String(identifier.to_string()),
        )]))
    }

    fn restore(&mut self, metadata: &Metadata) -> Result<()> {
        match metadata.get(&self.name) {
            Some(Value::String(identifier)) => {
                self.requested = Some(identifier.clone());
                Ok(())
            }
            _ => Err(HarnessError::invalid_value(&self.name, "no upstream run recorded").into()),
        }
    }
}

impl<E: Experiment> LifecycleAware for Upstream<E> {}

impl<E: Experiment> InputParameter for Upstream<E> {}
