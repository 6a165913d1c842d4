//! Named input and output containers owned by a run coordinator.

use anyhow::Result;
use std::any::{type_name, Any};
use std::path::Path;

use crate::config::RunConfig;
use crate::error::HarnessError;
use crate::flags::{FlagSet, ParsedFlags};
use crate::metadata::{merge_contribution, Metadata};
use crate::param::{
    InputParameter, OutputParameter, Phase, PhaseContext, PhaseState, ResolveContext, Role,
};

pub type DeferredFn = Box<dyn FnOnce(&DeferredContext<'_>) -> Result<Box<dyn InputParameter>>>;

/// An input declaration: either a parameter, or a function producing one
/// once the static inputs are bound.
pub enum Input {
    Static(Box<dyn InputParameter>),
    Deferred(DeferredFn),
}

/// What a deferred input sees while it is being constructed.
pub struct DeferredContext<'a> {
    inputs: &'a Inputs,
    root_dir: &'a Path,
    config: &'a RunConfig,
}

impl<'a> DeferredContext<'a> {
    pub fn input<T: Any>(&self, name: &str) -> Result<&'a T> {
        self.inputs.get::<T>(name)
    }

    /// Directory holding the run directories, i.e. the `--base-dir`.
    pub fn root_dir(&self) -> &'a Path {
        self.root_dir
    }

    pub fn config(&self) -> &'a RunConfig {
        self.config
    }
}

struct InputSlot {
    name: String,
    param: Option<Box<dyn InputParameter>>,
    deferred: Option<DeferredFn>,
    state: PhaseState,
}

impl InputSlot {
    fn param(&self) -> Result<&(dyn InputParameter + 'static)> {
        self.param.as_deref().ok_or_else(|| unresolved(&self.name))
    }
}

fn unresolved(name: &str) -> anyhow::Error {
    HarnessError::UnresolvedDeferred {
        name: name.to_string(),
        reason: "deferred input has not been resolved yet".to_string(),
    }
    .into()
}

/// Declared inputs, in declaration order.
#[derive(Default)]
pub struct Inputs {
    slots: Vec<InputSlot>,
    duplicates: Vec<String>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<P: InputParameter>(self, name: &str, param: P) -> Self {
        self.declare(name, Input::Static(Box::new(param)))
    }

    /// Declares an input computed after all static inputs are bound and
    /// resolved. Deferred inputs have no command-line flags.
    pub fn deferred<P, F>(self, name: &str, build: F) -> Self
    where
        P: InputParameter,
        F: FnOnce(&DeferredContext<'_>) -> Result<P> + 'static,
    {
        let build: DeferredFn = Box::new(move |ctx: &DeferredContext<'_>| {
            let param = build(ctx)?;
            Ok(Box::new(param) as Box<dyn InputParameter>)
        });
        self.declare(name, Input::Deferred(build))
    }

    pub fn declare(mut self, name: &str, input: Input) -> Self {
        if self.slots.iter().any(|slot| slot.name == name) {
            self.duplicates.push(name.to_string());
            return self;
        }
        let (param, deferred) = match input {
            Input::Static(mut param) => {
                param.set_name(name);
                (Some(param), None)
            }
            Input::Deferred(build) => (None, Some(build)),
        };
        self.slots.push(InputSlot {
            name: name.to_string(),
            param,
            deferred,
            state: PhaseState::Unbound,
        });
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.slots.iter().map(|slot| slot.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.iter().any(|slot| slot.name == name)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, name: &str) -> Option<PhaseState> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.state)
    }

    pub fn get<T: Any>(&self, name: &str) -> Result<&T> {
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.name == name)
            .ok_or_else(|| HarnessError::NotFound(name.to_string()))?;
        slot.param()?
            .downcast_ref::<T>()
            .ok_or_else(|| type_mismatch::<T>(name))
    }

    pub fn get_mut<T: Any>(&mut self, name: &str) -> Result<&mut T> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.name == name)
            .ok_or_else(|| HarnessError::NotFound(name.to_string()))?;
        let param = slot.param.as_deref_mut().ok_or_else(|| unresolved(name))?;
        param.downcast_mut::<T>().ok_or_else(|| type_mismatch::<T>(name))
    }

    pub(crate) fn check_unique(&self) -> Result<()> {
        match self.duplicates.first() {
            Some(name) => Err(HarnessError::DuplicateName(name.clone()).into()),
            None => Ok(()),
        }
    }

    pub(crate) fn register(&self, flags: &mut FlagSet) -> Result<()> {
        for param in self.slots.iter().filter_map(|slot| slot.param.as_deref()) {
            param.register(flags)?;
        }
        Ok(())
    }

    pub(crate) fn bind_static(&mut self, parsed: &ParsedFlags) -> Result<()> {
        for slot in &mut self.slots {
            if let Some(param) = slot.param.as_deref_mut() {
                param.bind(parsed)?;
                slot.state = PhaseState::Bound;
            }
        }
        Ok(())
    }

    pub(crate) fn resolve_static(&mut self, ctx: &ResolveContext<'_>) -> Result<()> {
        for param in self.slots.iter_mut().filter_map(|slot| slot.param.as_deref_mut()) {
            param.resolve(ctx)?;
        }
        Ok(())
    }

    /// Builds every deferred input in declaration order. A deferred input
    /// may read the static inputs and any deferred input declared before it.
    pub(crate) fn resolve_deferred(
        &mut self,
        parsed: &ParsedFlags,
        ctx: &ResolveContext<'_>,
        config: &RunConfig,
    ) -> Result<()> {
        for index in 0..self.slots.len() {
            let Some(build) = self.slots[index].deferred.take() else {
                continue;
            };
            let name = self.slots[index].name.clone();
            let built = {
                let deferred_ctx = DeferredContext {
                    inputs: &*self,
                    root_dir: ctx.root_dir,
                    config,
                };
                build(&deferred_ctx)
            };
            let mut param = built.map_err(|e| HarnessError::UnresolvedDeferred {
                name: name.clone(),
                reason: format!("{:#}", e),
            })?;
            param.set_name(&name);
            param.bind(parsed)?;
            param.resolve(ctx)?;
            let slot = &mut self.slots[index];
            slot.param = Some(param);
            slot.state = PhaseState::Bound;
        }
        Ok(())
    }

    /// Union of every input's contribution. Any unresolved input or
    /// duplicate key fails the whole collection.
    pub(crate) fn collect_metadata(&self) -> Result<Metadata> {
        let mut metadata = Metadata::new();
        for slot in &self.slots {
            let contribution = slot.param()?.contribute_metadata()?;
            merge_contribution(&mut metadata, contribution, &slot.name)?;
        }
        Ok(metadata)
    }

    pub(crate) fn restore(&mut self, metadata: &Metadata) -> Result<()> {
        for slot in &mut self.slots {
            if let Some(param) = slot.param.as_deref_mut() {
                param.restore(metadata)?;
                slot.state = PhaseState::Bound;
            }
        }
        Ok(())
    }

    pub(crate) fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, phase: Phase) -> Result<()> {
        for slot in &mut self.slots {
            let param = slot.param.as_deref_mut().ok_or_else(|| unresolved(&slot.name))?;
            param.on_phase(ctx, Role::Input, phase)?;
            slot.state = advance(phase);
        }
        Ok(())
    }

    pub(crate) fn abort(&mut self) {
        for slot in &mut self.slots {
            if let Some(param) = slot.param.as_deref_mut() {
                param.abort();
            }
        }
    }
}

struct OutputSlot {
    name: String,
    param: Box<dyn OutputParameter>,
    state: PhaseState,
}

/// Declared outputs, in declaration order.
#[derive(Default)]
pub struct Outputs {
    slots: Vec<OutputSlot>,
    duplicates: Vec<String>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<P: OutputParameter>(mut self, name: &str, mut param: P) -> Self {
        if self.slots.iter().any(|slot| slot.name == name) {
            self.duplicates.push(name.to_string());
            return self;
        }
        param.set_name(name);
        self.slots.push(OutputSlot {
            name: name.to_string(),
            param: Box::new(param),
            state: PhaseState::Unbound,
        });
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.slots.iter().map(|slot| slot.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.iter().any(|slot| slot.name == name)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, name: &str) -> Option<PhaseState> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.state)
    }

    pub fn get<T: Any>(&self, name: &str) -> Result<&T> {
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.name == name)
            .ok_or_else(|| HarnessError::NotFound(name.to_string()))?;
        slot.param
            .downcast_ref::<T>()
            .ok_or_else(|| type_mismatch::<T>(name))
    }

    pub fn get_mut<T: Any>(&mut self, name: &str) -> Result<&mut T> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.name == name)
            .ok_or_else(|| HarnessError::NotFound(name.to_string()))?;
        slot.param
            .downcast_mut::<T>()
            .ok_or_else(|| type_mismatch::<T>(name))
    }

    pub(crate) fn check_unique(&self) -> Result<()> {
        match self.duplicates.first() {
            Some(name) => Err(HarnessError::DuplicateName(name.clone()).into()),
            None => Ok(()),
        }
    }

    /// Runs one phase for every output. Outputs of a reattached run are
    /// prepared in the input role: they are read, never produced.
    pub(crate) fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, role: Role, phase: Phase) -> Result<()> {
        for slot in &mut self.slots {
            slot.param.on_phase(ctx, role, phase)?;
            slot.state = advance(phase);
        }
        Ok(())
    }

    pub(crate) fn abort(&mut self) {
        for slot in &mut self.slots {
            slot.param.abort();
        }
    }
}

fn advance(phase: Phase) -> PhaseState {
    match phase {
        Phase::Before => PhaseState::Active,
        Phase::After => PhaseState::Finalized,
    }
}

fn type_mismatch<T>(name: &str) -> anyhow::Error {
    HarnessError::TypeMismatch {
        name: name.to_string(),
        expected: type_name::<T>(),
    }
    .into()
}

/// Looks `name` up in both containers. A name declared as input and as
/// output at the same time must be accessed through the specific
/// container.
pub(crate) fn lookup<'a, T: Any>(inputs: &'a Inputs, outputs: &'a Outputs, name: &str) -> Result<&'a T> {
    match (inputs.contains(name), outputs.contains(name)) {
        (true, true) => Err(HarnessError::Ambiguous(name.to_string()).into()),
        (true, false) => inputs.get(name),
        (false, true) => outputs.get(name),
        (false, false) => Err(HarnessError::NotFound(name.to_string()).into()),
    }
}
