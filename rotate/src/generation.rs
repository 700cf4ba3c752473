//! Generation directory naming and allocation.

use std::ffi::OsStr;
use std::fmt;
use std::os::fd::AsFd;
use std::path::Path;

use chrono::{DateTime, Datelike, Utc};
use nix::sys::stat::Mode;
use nix::unistd::Gid;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sys::{self, Dir};

pub const GENERATION_PREFIX: &str = "alias-";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
pub const TIMESTAMP_LEN: usize = 14;
/// Length of `alias-YYYYMMDDHHMMSS`; also the longest alias target accepted.
pub const GENERATION_NAME_LEN: usize = GENERATION_PREFIX.len() + TIMESTAMP_LEN;

const GENERATION_MODE: Mode = Mode::from_bits_truncate(0o750);

/// Name of a generation created by this tool. Names sort in creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationName(String);

impl GenerationName {
    pub fn for_time(now: DateTime<Utc>) -> Result<Self> {
        let year = now.year();
        if !(1000..=9999).contains(&year) {
            return Err(Error::UnsupportedYear(year));
        }
        let name = format!("{GENERATION_PREFIX}{}", now.format(TIMESTAMP_FORMAT));
        debug_assert_eq!(name.len(), GENERATION_NAME_LEN);
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_os_str(&self) -> &OsStr {
        OsStr::new(&self.0)
    }
}

impl fmt::Display for GenerationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A freshly created, still empty generation.
#[derive(Debug)]
pub struct NewGeneration {
    pub name: GenerationName,
    pub dir: Dir,
}

/// Create the generation for `now` under `conf` and hand its group to the
/// store owner. The directory must not exist yet.
pub fn allocate(conf: &Dir, conf_path: &Path, now: DateTime<Utc>, group: Gid) -> Result<NewGeneration> {
    let name = GenerationName::for_time(now)?;
    let gen_path = format!("{}/{}", conf_path.display(), name);

    sys::mkdir_at(conf, name.as_os_str(), GENERATION_MODE)
        .map_err(|e| Error::sys("create directory", &gen_path, e))?;

    let dir = conf
        .open_at(name.as_os_str())
        .map_err(|e| Error::sys("open directory", &gen_path, e))?;

    sys::fchown(dir.as_fd(), None, Some(group.as_raw()))
        .map_err(|e| Error::sys("change owner of directory", &gen_path, e))?;

    debug!("Created new NSS database directory: {gen_path}");
    Ok(NewGeneration { name, dir })
}
