use anyhow::{anyhow, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Params};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

use super::file::FsObject;
use super::{
    HasMetadata, InputParameter, LifecycleAware, OutputParameter, Parameterized, PathBacked,
    Phase, PhaseContext, Role,
};
use crate::error::HarnessError;
use crate::flags::{FlagSet, ParsedFlags};
use crate::metadata::Metadata;
use crate::resources::ResourcePool;

pub const METADATA_TABLE: &str = "metadata";

/// Column names and rows of a query result.
pub type Rows = (Vec<String>, Vec<Vec<Value>>);

/// SQLite `ON CONFLICT` resolution for a table's unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    Rollback,
    Abort,
    Fail,
    Ignore,
    Replace,
}

impl Conflict {
    fn sql(self) -> &'static str {
        match self {
            Conflict::Rollback => "ROLLBACK",
            Conflict::Abort => "ABORT",
            Conflict::Fail => "FAIL",
            Conflict::Ignore => "IGNORE",
            Conflict::Replace => "REPLACE",
        }
    }
}

/// An SQLite database file. The connection is borrowed from the
/// coordinator's [`ResourcePool`] for the duration of the run, so
/// parameters naming the same file share it.
///
/// As an output, the database records the run in its `metadata` table:
/// one row per experiment identifier holding the run metadata as JSON.
/// Once the last output parameter on the file lets go of it, the file is
/// made read-only.
#[derive(Debug)]
pub struct Database {
    fs: FsObject,
    connection: Option<Rc<Connection>>,
}

impl Database {
    pub fn new(filename: &str) -> Self {
        Self {
            fs: FsObject::new(filename),
            connection: None,
        }
    }

    /// Connects outside of a run, e.g. to inspect the database of a
    /// reattached experiment.
    pub fn open(&mut self, pool: &mut ResourcePool) -> Result<()> {
        let path = self.fs.path()?;
        self.connection = Some(pool.sqlite(&path)?);
        Ok(())
    }

    pub fn handle(&self) -> Result<&Connection> {
        self.connection
            .as_deref()
            .ok_or_else(|| HarnessError::InvalidState(format!("database '{}' is not connected", self.fs.name())).into())
    }

    /// Executes one statement. `?` placeholders take `params`.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        debug!(sql, "sqlite");
        Ok(self.handle()?.execute(sql, params)?)
    }

    /// `CREATE TABLE IF NOT EXISTS` with `(name, type)` columns and an
    /// optional unique key.
    pub fn create_table(&self, name: &str, fields: &[(&str, &str)], unique: &[&str]) -> Result<()> {
        self.create_table_on_conflict(name, fields, unique, None)
    }

    /// Like [`create_table`](Self::create_table), resolving unique key
    /// conflicts with `conflict` instead of SQLite's default.
    pub fn create_table_on_conflict(
        &self,
        name: &str,
        fields: &[(&str, &str)],
        unique: &[&str],
        conflict: Option<Conflict>,
    ) -> Result<()> {
        for key in unique {
            if !fields.iter().any(|(field, _)| field == key) {
                return Err(anyhow!("unique key '{}' is not a column of {}", key, name));
            }
        }
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}",
            name,
            fields
                .iter()
                .map(|(field, ty)| format!("{} {}", field, ty))
                .collect::<Vec<_>>()
                .join(", ")
        );
        if !unique.is_empty() {
            sql.push_str(&format!(", UNIQUE({})", unique.join(", ")));
            if let Some(conflict) = conflict {
                sql.push_str(" ON CONFLICT ");
                sql.push_str(conflict.sql());
            }
        }
        sql.push(')');
        self.execute(&sql, [])?;
        Ok(())
    }

    /// Rows of `table` restricted by a trailing SQL `filter` such as
    /// `where experiment = ?`.
    pub fn values<P: Params>(&self, table: &str, filter: &str, params: P) -> Result<Rows> {
        let conn = self.handle()?;
        let sql = format!("SELECT * FROM {} {}", table, filter);
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(json_value(row.get_ref(index)?));
            }
            out.push(values);
        }
        Ok((columns, out))
    }

    fn record_run(&self, identifier: &str, metadata: &Metadata) -> Result<()> {
        self.create_table(
            METADATA_TABLE,
            &[("experiment", "text"), ("metadata", "text")],
            &["experiment"],
        )?;
        let encoded = serde_json::to_string(metadata)?;
        self.execute(
            "INSERT OR REPLACE INTO metadata(experiment, metadata) VALUES (?1, ?2)",
            [identifier, encoded.as_str()],
        )?;
        Ok(())
    }

    /// Returns whether this was the last holder of the pooled connection.
    fn disconnect(&mut self, pool: &mut ResourcePool) -> Result<bool> {
        if self.connection.take().is_some() {
            let path = self.fs.path()?;
            return pool.release_sqlite(&path);
        }
        Ok(false)
    }
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

#[cfg(unix)]
fn make_read_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() & 0o444);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_read_only(path: &Path) -> Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

impl PathBacked for Database {
    fn path(&self) -> Result<PathBuf> {
        self.fs.path()
    }
}

impl Parameterized for Database {
    fn name(&self) -> &str {
        self.fs.name()
    }

    fn set_name(&mut self, name: &str) {
        self.fs.set_name(name);
    }

    fn register(&self, flags: &mut FlagSet) -> Result<()> {
        self.fs.register(flags)
    }

    fn bind(&mut self, flags: &ParsedFlags) -> Result<()> {
        self.fs.bind(flags);
        Ok(())
    }
}

impl HasMetadata for Database {
    fn contribute_metadata(&self) -> Result<Metadata> {
        Ok(self.fs.contribute())
    }

    fn restore(&mut self, metadata: &Metadata) -> Result<()> {
        self.fs.restore(metadata);
        Ok(())
    }
}

impl LifecycleAware for Database {
    fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, role: Role, phase: Phase) -> Result<()> {
        match phase {
            Phase::Before => {
                self.fs.anchor(ctx);
                let path = self.fs.path()?;
                if role == Role::Input && !path.exists() {
                    return Err(anyhow!("database not found: {}", path.display()));
                }
                self.connection = Some(ctx.resources.sqlite(&path)?);
                if role == Role::Output {
                    self.record_run(ctx.identifier, ctx.metadata)?;
                }
                Ok(())
            }
            Phase::After => {
                let released = self.disconnect(ctx.resources)?;
                if released && role == Role::Output {
                    make_read_only(&self.fs.path()?)?;
                }
                Ok(())
            }
        }
    }
}

impl InputParameter for Database {}

impl OutputParameter for Database {}
