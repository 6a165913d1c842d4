use anyhow::{anyhow, Result};
use globset::{Glob, GlobMatcher};
use std::fs;
use std::path::{Path, PathBuf};

use super::file::{File, FsObject};
use super::{
    HasMetadata, InputParameter, LifecycleAware, OutputParameter, Parameterized, PathBacked,
    Phase, PhaseContext, Role,
};
use crate::error::HarnessError;
use crate::flags::{FlagSet, ParsedFlags};
use crate::fsutil::{copy_dir_filtered, ensure_dir};
use crate::metadata::Metadata;

/// A directory whose visible entries are restricted by a glob filter.
/// Files created through [`Directory::new_file`] must match the filter and
/// are flushed with the directory.
///
/// ```ignore
/// Outputs::new().with("logs", Directory::filtered(".", "*.log"))
/// ```
#[derive(Debug, Clone)]
pub struct Directory {
    fs: FsObject,
    filter: String,
    new_files: Vec<File>,
}

impl Directory {
    pub fn new(dirname: &str) -> Self {
        Self::filtered(dirname, "*")
    }

    pub fn filtered(dirname: &str, filter: &str) -> Self {
        Self {
            fs: FsObject::new(dirname),
            filter: filter.to_string(),
            new_files: Vec::new(),
        }
    }

    fn at(dir: &Path, dirname: &str, filter: &str) -> Self {
        let mut directory = Self::filtered(dirname, filter);
        directory.fs.set_name(dirname);
        directory.fs.pin(dir, dirname);
        directory
    }

    pub fn dirname(&self) -> &str {
        self.fs.object_name()
    }

    fn matcher(&self) -> Result<GlobMatcher> {
        let glob = Glob::new(&self.filter)
            .map_err(|e| HarnessError::invalid_value(self.fs.name(), format!("bad filter: {}", e)))?;
        Ok(glob.compile_matcher())
    }

    fn check_filter(&self, name: &str) -> Result<()> {
        if self.matcher()?.is_match(name) {
            Ok(())
        } else {
            Err(HarnessError::invalid_value(
                self.fs.name(),
                format!("filename {} does not match filter {}", name, self.filter),
            )
            .into())
        }
    }

    fn ensure_exists(&self) -> Result<PathBuf> {
        let path = self.fs.path()?;
        ensure_dir(&path)?;
        Ok(path)
    }

    /// Names of the entries matching the filter, sorted.
    pub fn value(&self) -> Result<Vec<String>> {
        let path = self.fs.path()?;
        let matcher = self.matcher()?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&path).map_err(|e| anyhow!("list {}: {}", path.display(), e))? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if matcher.is_match(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Absolute paths of the entries matching the filter.
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        let path = self.fs.path()?;
        Ok(self.value()?.into_iter().map(|name| path.join(name)).collect())
    }

    pub fn new_file(&mut self, name: &str) -> Result<&mut File> {
        self.check_filter(name)?;
        let dir = self.ensure_exists()?;
        let mut file = File::at(&dir, name);
        file.write("");
        self.new_files.push(file);
        let index = self.new_files.len() - 1;
        Ok(&mut self.new_files[index])
    }

    /// Creates `name` inside this directory. The directory must not exist yet.
    pub fn new_directory(&mut self, name: &str) -> Result<Directory> {
        self.check_filter(name)?;
        let dir = self.ensure_exists()?;
        let child = Directory::at(&dir, name, "*");
        let path = child.fs.path()?;
        fs::create_dir(&path).map_err(|e| anyhow!("create {}: {}", path.display(), e))?;
        Ok(child)
    }

    /// Copies the content of `source` into this directory. `include` sees
    /// every absolute source path and decides whether it is mirrored.
    pub fn mirror_directory(&mut self, source: &Path, include: &dyn Fn(&Path) -> bool) -> Result<()> {
        if !source.is_dir() {
            return Err(anyhow!("{} is not a directory", source.display()));
        }
        let dir = self.ensure_exists()?;
        copy_dir_filtered(source, &dir, include)
    }

    fn flush_new_files(&mut self) -> Result<()> {
        for file in &mut self.new_files {
            file.flush()?;
        }
        Ok(())
    }
}

impl PathBacked for Directory {
    fn path(&self) -> Result<PathBuf> {
        self.fs.path()
    }
}

impl Parameterized for Directory {
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

impl HasMetadata for Directory {
    fn contribute_metadata(&self) -> Result<Metadata> {
        Ok(self.fs.contribute())
    }

    fn restore(&mut self, metadata: &Metadata) -> Result<()> {
        self.fs.restore(metadata);
        Ok(())
    }
}

impl LifecycleAware for Directory {
    fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, role: Role, phase: Phase) -> Result<()> {
        match (role, phase) {
            (Role::Output, Phase::Before) => {
                self.fs.anchor(ctx);
                self.ensure_exists()?;
                Ok(())
            }
            (Role::Input, Phase::Before) => {
                self.fs.anchor(ctx);
                Ok(())
            }
            (Role::Output, Phase::After) => self.flush_new_files(),
            (Role::Input, Phase::After) => Ok(()),
        }
    }
}

impl InputParameter for Directory {}

impl OutputParameter for Directory {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourcePool;

    fn run_phase(dir: &mut Directory, anchor: &Path, role: Role, phase: Phase) -> Result<()> {
        let metadata = Metadata::new();
        let mut pool = ResourcePool::new();
        let mut ctx = PhaseContext {
            run_dir: anchor,
            anchor_dir: anchor,
            scratch_dir: None,
            identifier: "Test-0",
            metadata: &metadata,
            resources: &mut pool,
        };
        dir.on_phase(&mut ctx, role, phase)
    }

    #[test]
    fn new_files_respect_the_filter_and_flush_after_the_run() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut logs = Directory::filtered("logs", "*.log");
        logs.set_name("logs");
        run_phase(&mut logs, root.path(), Role::Output, Phase::Before).expect("before");
        assert!(root.path().join("logs").is_dir());

        logs.new_file("a.log").expect("a").write("alpha");
        assert!(logs.new_file("b.txt").is_err());
        assert!(!root.path().join("logs").join("a.log").exists());
        run_phase(&mut logs, root.path(), Role::Output, Phase::After).expect("after");
        assert_eq!(
            fs::read_to_string(root.path().join("logs").join("a.log")).expect("read"),
            "alpha"
        );
        fs::write(root.path().join("logs").join("ignored.txt"), "x").expect("write");
        assert_eq!(logs.value().expect("value"), vec!["a.log".to_string()]);
    }

    #[test]
    fn mirror_copies_included_paths_only() {
        let root = tempfile::tempdir().expect("tempdir");
        let source = root.path().join("source");
        ensure_dir(&source.join("sub")).expect("sub");
        fs::write(source.join("keep.txt"), "k").expect("write");
        fs::write(source.join("sub").join("drop.tmp"), "d").expect("write");

        let mut mirror = Directory::new("mirror");
        mirror.set_name("mirror");
        run_phase(&mut mirror, root.path(), Role::Output, Phase::Before).expect("before");
        mirror
            .mirror_directory(&source, &|p: &Path| {
                p.extension().map(|ext| ext != "tmp").unwrap_or(true)
            })
            .expect("mirror");
        assert!(root.path().join("mirror").join("keep.txt").is_file());
        assert!(root.path().join("mirror").join("sub").is_dir());
        assert!(!root.path().join("mirror").join("sub").join("drop.tmp").exists());
    }

    #[test]
    fn new_directory_refuses_existing_entries() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut out = Directory::new("out");
        out.set_name("out");
        run_phase(&mut out, root.path(), Role::Output, Phase::Before).expect("before");
        let child = out.new_directory("nested").expect("nested");
        assert_eq!(child.path().expect("path"), root.path().join("out").join("nested"));
        assert!(out.new_directory("nested").is_err());
    }
}
