//! Removal of the superseded generation.

use std::ffi::OsStr;

use tracing::{debug, trace};

use crate::alias;
use crate::context::{EntryPath, RunContext};
use crate::error::{Error, Result};
use crate::sys::{self, Dir, DirStream, FileKind};

/// Delete the old generation through `old`, the handle held since the alias
/// was resolved, then its entry in `conf`. Refuses while the alias still
/// names it.
pub fn reap(ctx: &RunContext, conf: &Dir, old: Dir) -> Result<()> {
    let root = EntryPath::root();
    let old_path = ctx.old_path(&root);

    let target = alias::current_target(conf, ctx.conf_dir())?;
    if target == ctx.old_name().as_bytes() {
        return Err(Error::GenerationStillLive(old_path));
    }

    remove_contents(ctx, &old, &root)?;
    drop(old);

    sys::unlink_at(conf, OsStr::new(ctx.old_name()), true)
        .map_err(|e| Error::sys("remove directory", &old_path, e))?;
    debug!("Removed old NSS database directory: {old_path}");
    Ok(())
}

fn remove_contents(ctx: &RunContext, dir: &Dir, path: &EntryPath) -> Result<()> {
    let entries = DirStream::open(dir).map_err(|e| Error::sys("open directory", ctx.old_path(path), e))?;
    for entry in entries {
        let name = entry.map_err(|e| Error::sys("read directory", ctx.old_path(path), e))?;
        let child = path.join(&name);
        let child_path = ctx.old_path(&child);

        let st = sys::stat_at(dir, &name).map_err(|e| Error::sys("read file info", &child_path, e))?;
        let is_dir = st.kind() == FileKind::Directory;
        if is_dir {
            let sub = dir
                .open_at(&name)
                .map_err(|e| Error::sys("open directory", &child_path, e))?;
            remove_contents(ctx, &sub, &child)?;
        }
        sys::unlink_at(dir, &name, is_dir).map_err(|e| Error::sys("remove", &child_path, e))?;
        trace!("Removed {child_path}");
    }
    Ok(())
}
