//! Per-run values shared by every component.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use crate::generation::GenerationName;

/// User and group that own the certificate store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOwner {
    pub uid: Uid,
    pub gid: Gid,
}

/// Path of an entry relative to a generation root: empty for the root
/// itself, otherwise starting with `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryPath(String);

impl EntryPath {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn join(&self, name: &OsStr) -> Self {
        Self(format!("{}/{}", self.0, name.to_string_lossy()))
    }

}

impl fmt::Display for EntryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable description of one rotation, created once the old generation
/// is resolved and the new one allocated.
#[derive(Debug, Clone)]
pub struct RunContext {
    conf_dir: PathBuf,
    hostname: String,
    owner: StoreOwner,
    old: String,
    new: GenerationName,
}

impl RunContext {
    pub fn new(
        conf_dir: impl Into<PathBuf>,
        hostname: impl Into<String>,
        owner: StoreOwner,
        old: impl Into<String>,
        new: GenerationName,
    ) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            hostname: hostname.into(),
            owner,
            old: old.into(),
            new,
        }
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn owner(&self) -> StoreOwner {
        self.owner
    }

    pub fn old_name(&self) -> &str {
        &self.old
    }

    pub fn new_name(&self) -> &GenerationName {
        &self.new
    }

    /// Display path of `path` inside the old generation.
    pub fn old_path(&self, path: &EntryPath) -> String {
        format!("{}/{}{}", self.conf_dir.display(), self.old, path)
    }

    /// Display path of `path` inside the new generation.
    pub fn new_path(&self, path: &EntryPath) -> String {
        format!("{}/{}{}", self.conf_dir.display(), self.new, path)
    }

    /// Display path of an entry directly under the configuration root.
    pub fn conf_path(&self, name: &str) -> String {
        format!("{}/{}", self.conf_dir.display(), name)
    }
}
