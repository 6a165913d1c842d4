use anyhow::{anyhow, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use super::file::FsObject;
use super::{
    HasMetadata, InputParameter, LifecycleAware, OutputParameter, Parameterized, PathBacked,
    Phase, PhaseContext, Role,
};
use crate::flags::{FlagSet, ParsedFlags};
use crate::fsutil::{atomic_write_bytes, ensure_dir};
use crate::metadata::Metadata;

pub type Row = Vec<String>;

/// A file whose content is a list of CSV records. Rows are buffered and
/// written on flush or when the run finishes.
#[derive(Debug, Clone)]
pub struct CsvFile {
    fs: FsObject,
    delimiter: u8,
    pending: Option<Vec<Row>>,
}

impl CsvFile {
    pub fn new(filename: &str) -> Self {
        Self {
            fs: FsObject::new(filename),
            delimiter: b',',
            pending: None,
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn filename(&self) -> &str {
        self.fs.object_name()
    }

    fn read_rows(&self) -> Result<Vec<Row>> {
        let path = self.fs.path()?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow!("read {}: {}", path.display(), e)),
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(raw.as_slice());
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| anyhow!("parse {}: {}", path.display(), e))?;
            rows.push(record.iter().map(|field| field.to_string()).collect());
        }
        Ok(rows)
    }

    /// Buffered rows, or the rows currently on disk.
    pub fn rows(&self) -> Result<Vec<Row>> {
        match &self.pending {
            Some(rows) => Ok(rows.clone()),
            None => self.read_rows(),
        }
    }

    pub fn set_rows(&mut self, rows: Vec<Row>) {
        self.pending = Some(rows);
    }

    pub fn append<I, S>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        if self.pending.is_none() {
            self.pending = Some(self.read_rows()?);
        }
        if let Some(rows) = self.pending.as_mut() {
            rows.push(row.into_iter().map(|field| field.to_string()).collect());
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        let Some(rows) = self.pending.take() else {
            return Ok(());
        };
        let path = self.fs.path()?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_writer(Vec::new());
        for row in &rows {
            writer.write_record(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| anyhow!("encode {}: {}", path.display(), e))?;
        atomic_write_bytes(&path, &bytes)
    }

    pub(crate) fn prepare_output(&mut self, ctx: &PhaseContext<'_>) -> Result<()> {
        self.fs.anchor(ctx);
        let path = self.fs.path()?;
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(&path, b"")?;
        self.pending = None;
        Ok(())
    }
}

impl PathBacked for CsvFile {
    fn path(&self) -> Result<PathBuf> {
        self.fs.path()
    }
}

impl Parameterized for CsvFile {
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

impl HasMetadata for CsvFile {
    fn contribute_metadata(&self) -> Result<Metadata> {
        Ok(self.fs.contribute())
    }

    fn restore(&mut self, metadata: &Metadata) -> Result<()> {
        self.fs.restore(metadata);
        Ok(())
    }
}

impl LifecycleAware for CsvFile {
    fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, role: Role, phase: Phase) -> Result<()> {
        match (role, phase) {
            (Role::Output, Phase::Before) => self.prepare_output(ctx),
            (Role::Input, Phase::Before) => {
                self.fs.anchor(ctx);
                Ok(())
            }
            (Role::Output, Phase::After) => self.flush(),
            (Role::Input, Phase::After) => Ok(()),
        }
    }
}

impl InputParameter for CsvFile {}

impl OutputParameter for CsvFile {}
