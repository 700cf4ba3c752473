//! Copy of the three certificate store files into the new generation.

use std::ffi::OsStr;
use std::os::fd::AsFd;

use nix::sys::stat::Mode;
use tracing::trace;

use crate::context::{EntryPath, RunContext};
use crate::copy;
use crate::error::{Error, Result};
use crate::sys::{self, Dir, FileKind};

/// The legacy (dbm) NSS database layout.
pub const STORE_FILES: [&str; 3] = ["cert8.db", "key3.db", "secmod.db"];

const STORE_FILE_MODE: Mode = Mode::from_bits_truncate(0o660);

/// Copy each store file from `old` to `new`, readable and writable by the
/// store group. Source timestamps are kept; ownership is not.
pub fn replicate(ctx: &RunContext, old: &Dir, new: &Dir) -> Result<()> {
    for name in STORE_FILES {
        copy_store_file(ctx, old, new, name)?;
    }
    Ok(())
}

fn copy_store_file(ctx: &RunContext, old: &Dir, new: &Dir, name: &str) -> Result<()> {
    let entry = EntryPath::root().join(OsStr::new(name));
    let src_path = ctx.old_path(&entry);
    let dst_path = ctx.new_path(&entry);

    let src = sys::open_file_read(old, OsStr::new(name)).map_err(|e| Error::sys("open file", &src_path, e))?;
    let st = sys::fstat(src.as_fd()).map_err(|e| Error::sys("read file info", &src_path, e))?;
    if st.kind() != FileKind::Regular {
        return Err(Error::NotRegularFile(src_path));
    }

    let dst = sys::create_file_excl(new, OsStr::new(name), STORE_FILE_MODE)
        .map_err(|e| Error::sys("create file", &dst_path, e))?;

    copy::copy_contents(&src, &dst, &st, &src_path, &dst_path)?;

    sys::fchown(dst.as_fd(), None, Some(ctx.owner().gid.as_raw()))
        .map_err(|e| Error::sys("change owner of file", &dst_path, e))?;
    // the umask may have narrowed the create mode
    sys::fchmod(dst.as_fd(), STORE_FILE_MODE).map_err(|e| Error::sys("set permissions", &dst_path, e))?;
    sys::futimens(dst.as_fd(), st.atime, st.mtime).map_err(|e| Error::sys("set timestamp", &dst_path, e))?;

    trace!("Copied store file {src_path} to {dst_path}");
    Ok(())
}
