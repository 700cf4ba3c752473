//! The `alias` link that names the live generation.

use std::ffi::OsStr;
use std::os::fd::AsFd;
use std::path::Path;

use tracing::{debug, info};

use crate::context::RunContext;
use crate::copy;
use crate::error::{Error, Result};
use crate::generation::GENERATION_NAME_LEN;
use crate::sys::{self, Dir, FileKind, Stat};

pub const ALIAS_NAME: &str = "alias";
pub const ALIAS_TEMP_NAME: &str = "alias.new";

/// The generation the alias pointed at when the run started.
#[derive(Debug)]
pub struct ResolvedAlias {
    pub generation: String,
    pub dir: Dir,
    /// Stat of the alias link itself; its owner is carried over on swap.
    pub link: Stat,
}

fn validate_target(target: &[u8], path: &str) -> Result<String> {
    let invalid = || Error::LinkTargetInvalid {
        path: path.to_owned(),
        target: String::from_utf8_lossy(target).into_owned(),
    };
    if target.is_empty() || target == b"." || target == b".." {
        return Err(invalid());
    }
    if !target
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_')
    {
        return Err(invalid());
    }
    String::from_utf8(target.to_vec()).map_err(|_| invalid())
}

/// Read and validate the alias under `conf`, then open the generation it
/// names.
pub fn resolve(conf: &Dir, conf_path: &Path) -> Result<ResolvedAlias> {
    let path = format!("{}/{}", conf_path.display(), ALIAS_NAME);

    let fd = sys::open_link(conf, OsStr::new(ALIAS_NAME))
        .map_err(|e| Error::sys("open symbolic link", &path, e))?;
    let link = sys::fstat(fd.as_fd()).map_err(|e| Error::sys("read symbolic link info", &path, e))?;
    if link.kind() != FileKind::Symlink {
        return Err(Error::NotSymlink(path));
    }
    if link.size < 0 || link.size as u64 > GENERATION_NAME_LEN as u64 {
        return Err(Error::LinkTargetTooLong(path));
    }

    let target = sys::read_link_fd(fd.as_fd())
        .map_err(|e| Error::sys("read symbolic link target", &path, e))?;
    if target.len() > GENERATION_NAME_LEN {
        return Err(Error::LinkTargetTooLong(path));
    }
    if target.len() as i64 != link.size {
        return Err(Error::LinkTargetChanged(path));
    }
    let generation = validate_target(&target, &path)?;

    let gen_path = format!("{}/{}", conf_path.display(), generation);
    let dir = conf
        .open_at(OsStr::new(&generation))
        .map_err(|e| Error::sys("open directory", &gen_path, e))?;

    debug!("Current NSS database directory: {gen_path}");
    Ok(ResolvedAlias { generation, dir, link })
}

/// What the alias currently points at, without validating it.
pub fn current_target(conf: &Dir, conf_path: &Path) -> Result<Vec<u8>> {
    let path = format!("{}/{}", conf_path.display(), ALIAS_NAME);
    sys::read_link_at(conf, OsStr::new(ALIAS_NAME))
        .map_err(|e| Error::sys("read symbolic link target", path, e))
}

/// Point the alias at the new generation with a single rename, keeping the
/// owner and group of the original link.
pub fn swap(ctx: &RunContext, conf: &Dir, link: &Stat) -> Result<()> {
    let temp = OsStr::new(ALIAS_TEMP_NAME);
    let temp_path = ctx.conf_path(ALIAS_TEMP_NAME);
    let alias_path = ctx.conf_path(ALIAS_NAME);

    copy::create_verified_symlink(conf, ctx.new_name().as_str().as_bytes(), temp, &temp_path)?;
    sys::chown_at(conf, temp, Some(link.uid), Some(link.gid))
        .map_err(|e| Error::sys("change owner of symbolic link", &temp_path, e))?;
    sys::rename_at(conf, temp, OsStr::new(ALIAS_NAME))
        .map_err(|e| Error::sys("rename symbolic link", format!("{temp_path} -> {alias_path}"), e))?;

    info!("Switched {alias_path} to {}", ctx.new_name());
    Ok(())
}
