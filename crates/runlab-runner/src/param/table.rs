use anyhow::{anyhow, Result};
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::debug;

use super::database::{Conflict, Database, Rows};
use super::{child_name, LifecycleAware, OutputParameter, Parameterized, PathBacked, Phase, PhaseContext, Role};
use crate::error::HarnessError;
use crate::metadata::render_value;

const EXPERIMENT_COLUMN: &str = "experiment";
const DEFAULT_DATABASE: &str = "sqlite3.db";

/// A table inside a [`Database`] that knows which run every row came
/// from. Rows carry an `experiment` column holding the run identifier, so
/// one database file can collect the rows of many runs.
///
/// The table is named `<title>__<name>`. Without an explicit database it
/// lives in `sqlite3.db` in the run directory.
#[derive(Debug)]
pub struct Table {
    name: String,
    fields: Vec<(String, String)>,
    keys: Vec<String>,
    conflict: Conflict,
    db: Database,
    table_name: Option<String>,
    identifier: Option<String>,
    writable: bool,
}

impl Table {
    /// `(column, sql type)` pairs, for example `("score", "integer")`.
    pub fn new(fields: &[(&str, &str)]) -> Self {
        Self {
            name: String::new(),
            fields: fields
                .iter()
                .map(|(field, ty)| (field.to_string(), ty.to_string()))
                .collect(),
            keys: Vec::new(),
            conflict: Conflict::Fail,
            db: Database::new(DEFAULT_DATABASE),
            table_name: None,
            identifier: None,
            writable: false,
        }
    }

    /// Columns of type `text`.
    pub fn text(fields: &[&str]) -> Self {
        let typed: Vec<(&str, &str)> = fields.iter().map(|field| (*field, "text")).collect();
        Self::new(&typed)
    }

    /// Unique key over these columns. Add `experiment` to keep equal keys
    /// of different runs apart.
    pub fn keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn on_conflict(mut self, conflict: Conflict) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn database(mut self, db: Database) -> Self {
        self.db = db;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn table_name(&self) -> Result<&str> {
        self.table_name
            .as_deref()
            .ok_or_else(|| HarnessError::InvalidState(format!("table '{}' is not attached to a run", self.name)).into())
    }

    fn identifier(&self) -> Result<&str> {
        self.identifier
            .as_deref()
            .ok_or_else(|| HarnessError::InvalidState(format!("table '{}' is not attached to a run", self.name)).into())
    }

    /// Adds one row for the running experiment. Every declared column must
    /// be given, and nothing else.
    pub fn insert<I, K>(&self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        if !self.writable {
            return Err(HarnessError::InvalidState(format!("table '{}' is read-only", self.name)).into());
        }
        let mut row: BTreeMap<String, Value> = row.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let given: BTreeSet<&str> = row.keys().map(String::as_str).collect();
        let declared: BTreeSet<&str> = self.fields.iter().map(|(f, _)| f.as_str()).collect();
        if given != declared {
            return Err(anyhow!(
                "row for table '{}' has columns {:?}, expected {:?}",
                self.name,
                given,
                declared
            ));
        }
        row.insert(EXPERIMENT_COLUMN.to_string(), Value::String(self.identifier()?.to_string()));

        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {}({}) VALUES ({})",
            self.table_name()?,
            columns.join(", "),
            placeholders.join(", ")
        );
        self.db.execute(&sql, params_from_iter(row.values().map(sql_value)))?;
        Ok(())
    }

    /// Removes every row of the running experiment.
    pub fn clear(&self) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE {} = ?1", self.table_name()?, EXPERIMENT_COLUMN);
        self.db.execute(&sql, [self.identifier()?])?;
        Ok(())
    }

    /// Columns and rows of this run, without the `experiment` column.
    pub fn value(&self) -> Result<Rows> {
        let filter = format!("WHERE {} = ?1", EXPERIMENT_COLUMN);
        let (mut columns, rows) = self.db.values(self.table_name()?, &filter, [self.identifier()?])?;
        let Some(index) = columns.iter().position(|c| c == EXPERIMENT_COLUMN) else {
            return Ok((columns, rows));
        };
        columns.remove(index);
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.remove(index);
                row
            })
            .collect();
        Ok((columns, rows))
    }

    fn attach(&mut self, ctx: &PhaseContext<'_>) {
        let title = ctx
            .identifier
            .rsplit_once('-')
            .map(|(title, _)| title)
            .unwrap_or(ctx.identifier);
        let suffix = self.name.rsplit('-').next().unwrap_or(&self.name);
        self.table_name = Some(format!("{}__{}", title, suffix));
        self.identifier = Some(ctx.identifier.to_string());
    }

    fn create(&self) -> Result<()> {
        let mut fields = vec![(EXPERIMENT_COLUMN, "text")];
        fields.extend(self.fields.iter().map(|(f, t)| (f.as_str(), t.as_str())));
        let keys: Vec<&str> = self.keys.iter().map(String::as_str).collect();
        self.db
            .create_table_on_conflict(self.table_name()?, &fields, &keys, Some(self.conflict))
    }
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

impl PathBacked for Table {
    fn path(&self) -> Result<PathBuf> {
        self.db.path()
    }
}

impl Parameterized for Table {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
        self.db.set_name(&child_name(name, "database"));
    }
}

impl LifecycleAware for Table {
    fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, role: Role, phase: Phase) -> Result<()> {
        match (role, phase) {
            (Role::Output, Phase::Before) => {
                self.db.on_phase(ctx, role, phase)?;
                self.attach(ctx);
                self.create()?;
                self.clear()?;
                self.writable = true;
                debug!(table = %self.table_name()?, "table ready");
                Ok(())
            }
            (_, Phase::Before) => {
                self.db.on_phase(ctx, role, phase)?;
                self.attach(ctx);
                Ok(())
            }
            (_, Phase::After) => {
                self.writable = false;
                self.db.on_phase(ctx, role, phase)
            }
        }
    }
}

impl OutputParameter for Table {}

/// A string map stored in a [`Table`] with `key` and `value` columns.
/// Writes stay in memory until the run finishes successfully; reading a
/// finished run loads the stored pairs.
#[derive(Debug)]
pub struct TableDict {
    table: Table,
    entries: BTreeMap<String, String>,
}

impl TableDict {
    pub fn new() -> Self {
        Self {
            table: Table::text(&["key", "value"])
                .keys(&["key"])
                .on_conflict(Conflict::Replace),
            entries: BTreeMap::new(),
        }
    }

    pub fn database(mut self, db: Database) -> Self {
        self.table = self.table.database(db);
        self
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replaces the stored rows of this run with the current entries.
    pub fn flush(&self) -> Result<()> {
        self.table.clear()?;
        for (key, value) in &self.entries {
            self.table.insert([
                ("key", Value::String(key.clone())),
                ("value", Value::String(value.clone())),
            ])?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let (columns, rows) = self.table.value()?;
        let key = column(&columns, "key")?;
        let value = column(&columns, "value")?;
        self.entries = rows
            .iter()
            .map(|row| (render_value(&row[key]), render_value(&row[value])))
            .collect();
        Ok(())
    }
}

impl Default for TableDict {
    fn default() -> Self {
        Self::new()
    }
}

fn column(columns: &[String], name: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| anyhow!("table has no '{}' column", name))
}

impl PathBacked for TableDict {
    fn path(&self) -> Result<PathBuf> {
        self.table.path()
    }
}

impl Parameterized for TableDict {
    fn name(&self) -> &str {
        self.table.name()
    }

    fn set_name(&mut self, name: &str) {
        self.table.set_name(name);
    }
}

impl LifecycleAware for TableDict {
    fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, role: Role, phase: Phase) -> Result<()> {
        match (role, phase) {
            (Role::Output, Phase::Before) => {
                self.entries.clear();
                self.table.on_phase(ctx, role, phase)
            }
            (Role::Output, Phase::After) => {
                self.flush()?;
                self.table.on_phase(ctx, role, phase)
            }
            (Role::Input, Phase::Before) => {
                self.table.on_phase(ctx, role, phase)?;
                self.load()
            }
            (Role::Input, Phase::After) => self.table.on_phase(ctx, role, phase),
        }
    }
}

impl OutputParameter for TableDict {}
