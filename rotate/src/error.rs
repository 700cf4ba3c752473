//! Error type shared by every rotation component.
//!
//! Every failure is fatal to a run. Components return [`Error`] and the
//! binary reports it.

use std::io;

use nix::errno::Errno;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure class, used for reporting and by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or misconfigured alias, wrong file types, unreadable or
    /// unwritable filesystem objects.
    Environment,
    /// A source file or link changed while it was being copied.
    Race,
    /// Allocation, descriptor or library initialization failures.
    Resource,
    /// The certificate store rejected an operation.
    Store,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to {op}: {path}: {source}")]
    Sys {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Not a symbolic link: {0}")]
    NotSymlink(String),

    #[error("Symbolic link target too long: {0}")]
    LinkTargetTooLong(String),

    #[error("Symbolic link target invalid: {path} -> {target}")]
    LinkTargetInvalid { path: String, target: String },

    #[error("Not a regular file: {0}")]
    NotRegularFile(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("File size invalid: {0}")]
    InvalidFileSize(String),

    #[error("This program is not supported in the year {0}")]
    UnsupportedYear(i32),

    #[error("Generation still referenced by alias: {0}")]
    GenerationStillLive(String),

    #[error("File changed during copy: {0}")]
    FileChanged(String),

    #[error("Symbolic link target changed: {0}")]
    LinkTargetChanged(String),

    #[error("Effective {which} not really changed (still {actual})")]
    IdentityNotChanged { which: &'static str, actual: u32 },

    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },
}

impl Error {
    pub(crate) fn sys(op: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        Self::Sys {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn store(context: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sys { source, .. } => match source.raw_os_error().map(Errno::from_raw) {
                Some(Errno::ENOMEM | Errno::EMFILE | Errno::ENFILE | Errno::ENOSPC | Errno::EDQUOT) => {
                    ErrorKind::Resource
                }
                _ => ErrorKind::Environment,
            },
            Self::FileChanged(_) | Self::LinkTargetChanged(_) => ErrorKind::Race,
            Self::IdentityNotChanged { .. } => ErrorKind::Resource,
            Self::Store { .. } => ErrorKind::Store,
            Self::NotSymlink(_)
            | Self::LinkTargetTooLong(_)
            | Self::LinkTargetInvalid { .. }
            | Self::NotRegularFile(_)
            | Self::UnsupportedFileType(_)
            | Self::InvalidFileSize(_)
            | Self::UnsupportedYear(_)
            | Self::GenerationStillLive(_) => ErrorKind::Environment,
        }
    }
}
