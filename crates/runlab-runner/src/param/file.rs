use anyhow::{anyhow, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cell::OnceCell;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{
    HasMetadata, InputParameter, LifecycleAware, OutputParameter, Parameterized, PathBacked,
    Phase, PhaseContext, Role,
};
use crate::error::HarnessError;
use crate::flags::{FlagSet, ParsedFlags};
use crate::fsutil::{absolutize, ensure_dir};
use crate::metadata::Metadata;
use crate::shell::{shell_quote, Shell, ShellOutput};

/// Name and location shared by every filesystem-backed parameter. The
/// object name comes from the declaration or the command line; relative
/// names resolve against the anchor handed out by the lifecycle.
#[derive(Debug, Clone)]
pub(crate) struct FsObject {
    name: String,
    object_name: String,
    anchor: Option<PathBuf>,
    pinned: bool,
}

impl FsObject {
    pub(crate) fn new(default_name: &str) -> Self {
        Self {
            name: String::new(),
            object_name: default_name.to_string(),
            anchor: None,
            pinned: false,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub(crate) fn object_name(&self) -> &str {
        if self.object_name.is_empty() {
            &self.name
        } else {
            &self.object_name
        }
    }

    pub(crate) fn register(&self, flags: &mut FlagSet) -> Result<()> {
        let default = (!self.object_name.is_empty()).then_some(self.object_name.as_str());
        flags.add(&self.name, default)
    }

    pub(crate) fn bind(&mut self, flags: &ParsedFlags) {
        if let Some(value) = flags.value(&self.name) {
            self.object_name = value.to_string();
        }
    }

    pub(crate) fn contribute(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(self.name.clone(), Value::String(self.object_name().to_string()));
        metadata
    }

    pub(crate) fn restore(&mut self, metadata: &Metadata) {
        if let Some(Value::String(object_name)) = metadata.get(&self.name) {
            self.object_name = object_name.clone();
        }
    }

    pub(crate) fn anchor(&mut self, ctx: &PhaseContext<'_>) {
        if !self.pinned {
            self.anchor = Some(ctx.anchor_dir.to_path_buf());
        }
    }

    /// Fixes the location independent of any later lifecycle anchoring.
    pub(crate) fn pin(&mut self, dir: &Path, object_name: &str) {
        self.anchor = Some(dir.to_path_buf());
        self.object_name = object_name.to_string();
        self.pinned = true;
    }

    pub(crate) fn path(&self) -> Result<PathBuf> {
        let object_name = self.object_name();
        if object_name.is_empty() {
            return Err(HarnessError::MissingValue(self.name.clone()).into());
        }
        let path = Path::new(object_name);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        match &self.anchor {
            Some(anchor) => Ok(anchor.join(path)),
            None => absolutize(path),
        }
    }
}

/// The content of a single file. Writes are buffered and reach the disk
/// on [`File::flush`] or when the owning run finishes.
#[derive(Debug, Clone)]
pub struct File {
    fs: FsObject,
    pending: Option<String>,
    cache: OnceCell<String>,
}

impl File {
    pub fn new(filename: &str) -> Self {
        Self {
            fs: FsObject::new(filename),
            pending: None,
            cache: OnceCell::new(),
        }
    }

    pub(crate) fn at(dir: &Path, filename: &str) -> Self {
        let mut file = Self::new(filename);
        file.fs.set_name(filename);
        file.fs.pin(dir, filename);
        file
    }

    pub fn filename(&self) -> &str {
        self.fs.object_name()
    }

    /// Buffered content, or the file on disk read once and memoized. A
    /// missing file reads as empty.
    pub fn value(&self) -> Result<&str> {
        if let Some(pending) = &self.pending {
            return Ok(pending.as_str());
        }
        if let Some(cached) = self.cache.get() {
            return Ok(cached.as_str());
        }
        let path = self.fs.path()?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(anyhow!("read {}: {}", path.display(), e)),
        };
        Ok(self.cache.get_or_init(|| content).as_str())
    }

    pub fn write(&mut self, content: impl Into<String>) {
        self.pending = Some(content.into());
        self.cache = OnceCell::new();
    }

    pub fn append(&mut self, content: &str) -> Result<()> {
        let mut current = self.value()?.to_string();
        current.push_str(content);
        self.write(current);
        Ok(())
    }

    /// Writes buffered content to disk. Nothing happens when nothing was
    /// written since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        let Some(content) = self.pending.take() else {
            return Ok(());
        };
        let path = self.fs.path()?;
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(&path, content.as_bytes()).map_err(|e| anyhow!("write {}: {}", path.display(), e))?;
        self.cache = OnceCell::from(content);
        Ok(())
    }

    /// Replaces the value with the content of `source` and flushes.
    pub fn copy_contents(&mut self, source: &Path) -> Result<()> {
        let content = fs::read_to_string(source)
            .map_err(|e| anyhow!("read {}: {}", source.display(), e))?;
        self.write(content);
        self.flush()
    }

    #[cfg(unix)]
    pub fn make_executable(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let path = self.fs.path()?;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(&path, perms)?;
        Ok(())
    }
}

impl PathBacked for File {
    fn path(&self) -> Result<PathBuf> {
        self.fs.path()
    }
}

impl Parameterized for File {
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

impl HasMetadata for File {
    fn contribute_metadata(&self) -> Result<Metadata> {
        Ok(self.fs.contribute())
    }

    fn restore(&mut self, metadata: &Metadata) -> Result<()> {
        self.fs.restore(metadata);
        Ok(())
    }
}

impl LifecycleAware for File {
    fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, role: Role, phase: Phase) -> Result<()> {
        match (role, phase) {
            (_, Phase::Before) => {
                self.fs.anchor(ctx);
                self.cache = OnceCell::new();
                if role == Role::Output {
                    let path = self.fs.path()?;
                    if let Some(parent) = path.parent() {
                        ensure_dir(parent)?;
                    }
                    fs::write(&path, b"")?;
                }
                Ok(())
            }
            (Role::Output, Phase::After) => self.flush(),
            (Role::Input, Phase::After) => Ok(()),
        }
    }
}

impl InputParameter for File {}

impl OutputParameter for File {}

/// A read-only reference to a program. Its checksum, not its name, takes
/// part in the run identity.
#[derive(Debug, Clone)]
pub struct Executable {
    fs: FsObject,
}

impl Executable {
    pub fn new(filename: &str) -> Self {
        Self {
            fs: FsObject::new(filename),
        }
    }

    pub fn checksum(&self) -> Result<String> {
        let path = self.fs.path()?;
        let bytes = fs::read(&path).map_err(|e| anyhow!("read {}: {}", path.display(), e))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Runs the executable with `args` appended verbatim to the command line.
    pub fn execute(&self, shell: &mut Shell, args: &str) -> Result<ShellOutput> {
        let program = self.fs.path()?;
        let command = format!("{} {}", shell_quote(&program.to_string_lossy()), args);
        shell.run(command.trim_end())
    }
}

impl PathBacked for Executable {
    fn path(&self) -> Result<PathBuf> {
        self.fs.path()
    }
}

impl Parameterized for Executable {
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

impl HasMetadata for Executable {
    fn contribute_metadata(&self) -> Result<Metadata> {
        let mut metadata = Metadata::new();
        metadata.insert(format!("{}-sha256", self.fs.name()), Value::String(self.checksum()?));
        Ok(metadata)
    }
}

impl LifecycleAware for Executable {
    fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, _role: Role, phase: Phase) -> Result<()> {
        if phase == Phase::Before {
            self.fs.anchor(ctx);
        }
        Ok(())
    }
}

impl InputParameter for Executable {}
