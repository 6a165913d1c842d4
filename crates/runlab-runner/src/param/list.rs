use anyhow::Result;
use serde_json::Value;
use std::ops::Deref;

use super::{
    child_name, HasMetadata, InputParameter, LifecycleAware, Parameterized, Phase, PhaseContext,
    ResolveContext, Role,
};
use crate::error::HarnessError;
use crate::flags::{FlagSet, ParsedFlags};
use crate::metadata::{merge_contribution, Metadata};
use crate::shell::split_words;

/// A variable-length list of input parameters of one type.
///
/// Every `--<name> VALUE` on the command line creates one element named
/// `<name>-<index>`. Elements taking several flags are given in colon form:
/// `--<name> ":url /path/a :branch main"` expands to
/// `--<name>-<index>-url /path/a --<name>-<index>-branch main`, and a bare
/// `": value"` addresses the element's own flag.
///
/// Any value on the command line replaces the defaults completely.
pub struct List<T: InputParameter> {
    name: String,
    factory: Option<Box<dyn Fn() -> T>>,
    items: Vec<T>,
}

impl<T: InputParameter> List<T> {
    pub fn new(factory: impl Fn() -> T + 'static) -> Self {
        Self {
            name: String::new(),
            factory: Some(Box::new(factory)),
            items: Vec::new(),
        }
    }

    pub fn with_defaults(factory: impl Fn() -> T + 'static, defaults: Vec<T>) -> Self {
        let mut list = Self::new(factory);
        list.items = defaults;
        list
    }

    /// A list built in code, typically inside a deferred input. It cannot be
    /// filled from the command line.
    pub fn from_items(items: Vec<T>) -> Self {
        Self {
            name: String::new(),
            factory: None,
            items,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [T] {
        &mut self.items
    }

    pub fn push(&mut self, mut item: T) {
        item.set_name(&child_name(&self.name, &self.items.len().to_string()));
        self.items.push(item);
    }

    fn rename_children(&mut self) {
        for (index, item) in self.items.iter_mut().enumerate() {
            item.set_name(&child_name(&self.name, &index.to_string()));
        }
    }

    fn make_child(&self) -> Result<T> {
        let factory = self.factory.as_ref().ok_or_else(|| {
            HarnessError::invalid_value(&self.name, "list elements cannot be created from arguments")
        })?;
        Ok(factory())
    }

    fn parse_child(&self, index: usize, raw: &str) -> Result<T> {
        let mut child = self.make_child()?;
        let name = child_name(&self.name, &index.to_string());
        child.set_name(&name);
        let mut flags = FlagSet::new(&name);
        child.register(&mut flags)?;
        let args = if raw.trim_start().starts_with(':') {
            let expanded = raw
                .replace(": ", &format!("--{} ", name))
                .replace(':', &format!("--{}-", name));
            split_words(&expanded)?
        } else {
            vec![format!("--{}", name), raw.to_string()]
        };
        let parsed = flags
            .parse(args)
            .map_err(|e| HarnessError::invalid_value(&name, e.to_string()))?;
        child.bind(&parsed)?;
        Ok(child)
    }
}

impl<T: InputParameter> Deref for List<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T: InputParameter> Parameterized for List<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
        self.rename_children();
    }

    fn register(&self, flags: &mut FlagSet) -> Result<()> {
        flags.add_repeated(&self.name)
    }

    fn bind(&mut self, flags: &ParsedFlags) -> Result<()> {
        let given = flags.values(&self.name);
        if given.is_empty() {
            return Ok(());
        }
        let mut items = Vec::with_capacity(given.len());
        for (index, raw) in given.iter().enumerate() {
            items.push(self.parse_child(index, raw)?);
        }
        self.items = items;
        Ok(())
    }

    fn resolve(&mut self, ctx: &ResolveContext<'_>) -> Result<()> {
        for item in &mut self.items {
            item.resolve(ctx)?;
        }
        Ok(())
    }
}

impl<T: InputParameter> HasMetadata for List<T> {
    fn contribute_metadata(&self) -> Result<Metadata> {
        let mut metadata = Metadata::new();
        let mut summary = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let contribution = item.contribute_metadata()?;
            summary.push(contribution.get(item.name()).cloned().unwrap_or(Value::Null));
            merge_contribution(&mut metadata, contribution, item.name())?;
        }
        merge_contribution(
            &mut metadata,
            Metadata::from([(self.name.clone(), Value::Array(summary))]),
            &self.name,
        )?;
        Ok(metadata)
    }

    /// Rebuilds one element per persisted entry, then lets each element
    /// restore itself from its own keys.
    fn restore(&mut self, metadata: &Metadata) -> Result<()> {
        let count = match metadata.get(&self.name) {
            Some(Value::Array(entries)) => entries.len(),
            _ => return Ok(()),
        };
        if self.factory.is_some() {
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(self.make_child()?);
            }
            self.items = items;
            self.rename_children();
        } else if self.items.len() != count {
            return Err(HarnessError::invalid_value(
                &self.name,
                format!("persisted list has {} elements, found {}", count, self.items.len()),
            )
            .into());
        }
        for item in &mut self.items {
            item.restore(metadata)?;
        }
        Ok(())
    }
}

impl<T: InputParameter> LifecycleAware for List<T> {
    fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, role: Role, phase: Phase) -> Result<()> {
        for item in &mut self.items {
            item.on_phase(ctx, role, phase)?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        for item in &mut self.items {
            item.abort();
        }
    }
}

impl<T: InputParameter> InputParameter for List<T> {}
