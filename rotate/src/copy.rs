//! File copy primitives shared by the store file and tree replicators.

use std::ffi::OsStr;
use std::fs::File;
use std::os::fd::AsFd;

use tracing::trace;

use crate::error::{Error, Result};
use crate::sys::{self, Dir, FileKind, Mapping, Stat};

/// Copy the contents of `src` into the freshly created `dst`, then check
/// that `src` was not modified while it was being read.
///
/// `before` is the stat of `src` taken before the copy started; its size
/// decides how much is copied and its mtime is what the race check
/// compares against.
pub fn copy_contents(src: &File, dst: &File, before: &Stat, src_path: &str, dst_path: &str) -> Result<()> {
    if before.size == 0 {
        // mapping zero bytes is undefined
        return Ok(());
    }
    if before.size < 0 || before.size as u64 > isize::MAX as u64 {
        return Err(Error::InvalidFileSize(src_path.to_owned()));
    }
    let len = before.size as usize;

    sys::allocate(dst.as_fd(), len as u64).map_err(|e| Error::sys("allocate file", dst_path, e))?;

    let smap = Mapping::read_only(src.as_fd(), len).map_err(|e| Error::sys("map file", src_path, e))?;
    let mut dmap = Mapping::writable(dst.as_fd(), len).map_err(|e| Error::sys("map file", dst_path, e))?;

    dmap.as_mut_slice().copy_from_slice(smap.as_slice());

    smap.unmap().map_err(|e| Error::sys("unmap file", src_path, e))?;
    dmap.unmap().map_err(|e| Error::sys("unmap file", dst_path, e))?;

    check_unchanged(src, before, src_path)?;
    trace!("Copied {len} bytes: {src_path} -> {dst_path}");
    Ok(())
}

/// Fail with a race error if `file`'s mtime differs from `before`.
pub fn check_unchanged(file: &File, before: &Stat, path: &str) -> Result<()> {
    let after = sys::fstat(file.as_fd()).map_err(|e| Error::sys("read file info", path, e))?;
    if after.mtime != before.mtime {
        return Err(Error::FileChanged(path.to_owned()));
    }
    Ok(())
}

/// What [`copy_metadata`] should carry over besides ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamps {
    Copy,
    Keep,
}

/// Copy ownership, permission bits and (optionally) timestamps from `src`
/// onto the open file or directory `dst`.
pub fn copy_metadata(dst: &impl AsFd, src: &Stat, times: Timestamps, dst_path: &str) -> Result<()> {
    sys::fchown(dst.as_fd(), Some(src.uid), Some(src.gid))
        .map_err(|e| Error::sys("set ownership", dst_path, e))?;
    sys::fchmod(dst.as_fd(), src.permissions()).map_err(|e| Error::sys("set permissions", dst_path, e))?;
    if times == Timestamps::Copy {
        sys::futimens(dst.as_fd(), src.atime, src.mtime)
            .map_err(|e| Error::sys("set timestamp", dst_path, e))?;
    }
    Ok(())
}

/// Copy ownership and timestamps from `src` onto the symbolic link `name`
/// in `dir`. Permission bits are meaningless for links and left alone.
pub fn copy_link_metadata(dir: &Dir, name: &OsStr, src: &Stat, dst_path: &str) -> Result<()> {
    sys::chown_at(dir, name, Some(src.uid), Some(src.gid))
        .map_err(|e| Error::sys("set ownership", dst_path, e))?;
    sys::utimens_at(dir, name, src.atime, src.mtime).map_err(|e| Error::sys("set timestamp", dst_path, e))?;
    Ok(())
}

/// Create the symbolic link `name -> target` in `dir` and read it back,
/// failing if what landed on disk is not exactly `target`.
pub fn create_verified_symlink(dir: &Dir, target: &[u8], name: &OsStr, path: &str) -> Result<Stat> {
    sys::symlink_at(target, dir, name).map_err(|e| Error::sys("create symbolic link", path, e))?;

    let st = sys::stat_at(dir, name).map_err(|e| Error::sys("read symbolic link info", path, e))?;
    if st.kind() != FileKind::Symlink {
        return Err(Error::NotSymlink(path.to_owned()));
    }
    if st.size <= 0 || st.size as u64 != target.len() as u64 {
        return Err(Error::LinkTargetChanged(path.to_owned()));
    }

    let written = sys::read_link_at(dir, name)
        .map_err(|e| Error::sys("read symbolic link target", path, e))?;
    if written != target {
        return Err(Error::LinkTargetChanged(path.to_owned()));
    }
    Ok(st)
}

/// Read the target of the source link `name`, whose stat is `st`.
pub fn read_link_target(dir: &Dir, name: &OsStr, st: &Stat, path: &str) -> Result<Vec<u8>> {
    if st.size <= 0 || st.size as u64 >= isize::MAX as u64 {
        return Err(Error::InvalidFileSize(path.to_owned()));
    }
    let len = st.size as usize;
    let target = sys::read_link_at(dir, name)
        .map_err(|e| Error::sys("read symbolic link target", path, e))?;
    if target.len() != len {
        return Err(Error::LinkTargetChanged(path.to_owned()));
    }
    Ok(target)
}
