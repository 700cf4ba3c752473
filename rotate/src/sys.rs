//! Descriptor-relative filesystem primitives.
//!
//! Thin wrappers over the `*at` family of system calls. Every handle is an
//! owned value (`OwnedFd`, [`DirStream`], [`Mapping`]) so it is released on
//! every exit path. Paths are never resolved from the filesystem root once a
//! directory handle exists.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::{self, AtFlags, OFlag};
use nix::libc;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::{self, FileStat, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{self, Gid, Uid, UnlinkatFlags};

/// Take ownership of a descriptor nix handed back as a raw integer.
fn owned(fd: RawFd) -> OwnedFd {
    // SAFETY: `fd` was just returned by a successful open and nothing else
    // holds it.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Seconds and nanoseconds, as stored in an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

impl From<Timestamp> for TimeSpec {
    fn from(t: Timestamp) -> Self {
        TimeSpec::new(t.sec as libc::time_t, t.nsec as _)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Symlink,
    Directory,
    Other,
}

/// The subset of `struct stat` the rotation cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
}

impl Stat {
    pub fn kind(&self) -> FileKind {
        let fmt = SFlag::from_bits_truncate(self.mode as libc::mode_t) & SFlag::S_IFMT;
        if fmt == SFlag::S_IFREG {
            FileKind::Regular
        } else if fmt == SFlag::S_IFLNK {
            FileKind::Symlink
        } else if fmt == SFlag::S_IFDIR {
            FileKind::Directory
        } else {
            FileKind::Other
        }
    }

    /// Permission bits including setuid, setgid and sticky.
    pub fn permissions(&self) -> Mode {
        Mode::from_bits_truncate(self.mode as libc::mode_t)
    }

    pub fn same_inode(&self, other: &Stat) -> bool {
        self.dev == other.dev && self.ino == other.ino
    }
}

impl From<FileStat> for Stat {
    fn from(st: FileStat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            size: st.st_size as i64,
            atime: Timestamp {
                sec: st.st_atime as i64,
                nsec: st.st_atime_nsec as i64,
            },
            mtime: Timestamp {
                sec: st.st_mtime as i64,
                nsec: st.st_mtime_nsec as i64,
            },
        }
    }
}

/// An open directory used as the anchor for relative operations.
#[derive(Debug)]
pub struct Dir {
    fd: OwnedFd,
}

impl Dir {
    /// Open a directory by absolute or relative path. Only used for the
    /// configuration root; everything below it is reached through handles.
    pub fn open(path: &Path) -> io::Result<Self> {
        let fd = fcntl::open(
            path,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Self { fd: owned(fd) })
    }

    /// Open the subdirectory `name` without following a symbolic link.
    pub fn open_at(&self, name: &OsStr) -> io::Result<Self> {
        let fd = openat(
            self.as_fd(),
            name,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW,
            Mode::empty(),
        )?;
        Ok(Self { fd })
    }

    pub fn stat(&self) -> io::Result<Stat> {
        fstat(self.as_fd())
    }
}

impl AsFd for Dir {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

pub fn openat(dir: BorrowedFd<'_>, name: &OsStr, flags: OFlag, mode: Mode) -> io::Result<OwnedFd> {
    let fd = fcntl::openat(Some(dir.as_raw_fd()), name, flags | OFlag::O_CLOEXEC, mode)?;
    Ok(owned(fd))
}

/// Open an existing regular file for reading, refusing symbolic links.
pub fn open_file_read(dir: &Dir, name: &OsStr) -> io::Result<File> {
    openat(
        dir.as_fd(),
        name,
        OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_NOCTTY,
        Mode::empty(),
    )
    .map(File::from)
}

/// Create `name` exclusively for reading and writing.
pub fn create_file_excl(dir: &Dir, name: &OsStr, mode: Mode) -> io::Result<File> {
    openat(
        dir.as_fd(),
        name,
        OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_NOFOLLOW,
        mode,
    )
    .map(File::from)
}

/// Open an existing file for writing without following a symbolic link.
pub fn open_file_write(dir: &Dir, name: &OsStr) -> io::Result<File> {
    openat(
        dir.as_fd(),
        name,
        OFlag::O_WRONLY | OFlag::O_NOFOLLOW | OFlag::O_NOCTTY,
        Mode::empty(),
    )
    .map(File::from)
}

/// Open `name` as an `O_PATH` handle that refers to a symbolic link itself.
pub fn open_link(dir: &Dir, name: &OsStr) -> io::Result<OwnedFd> {
    openat(dir.as_fd(), name, OFlag::O_PATH | OFlag::O_NOFOLLOW, Mode::empty())
}

pub fn fstat(fd: BorrowedFd<'_>) -> io::Result<Stat> {
    Ok(stat::fstat(fd.as_raw_fd())?.into())
}

/// `lstat` relative to `dir`.
pub fn stat_at(dir: &Dir, name: &OsStr) -> io::Result<Stat> {
    Ok(stat::fstatat(Some(dir.as_fd().as_raw_fd()), name, AtFlags::AT_SYMLINK_NOFOLLOW)?.into())
}

pub fn mkdir_at(dir: &Dir, name: &OsStr, mode: Mode) -> io::Result<()> {
    stat::mkdirat(Some(dir.as_fd().as_raw_fd()), name, mode)?;
    Ok(())
}

pub fn symlink_at(target: &[u8], dir: &Dir, name: &OsStr) -> io::Result<()> {
    unistd::symlinkat(OsStr::from_bytes(target), Some(dir.as_fd().as_raw_fd()), name)?;
    Ok(())
}

/// Read the complete target of the link `name`.
pub fn read_link_at(dir: &Dir, name: &OsStr) -> io::Result<Vec<u8>> {
    let target = fcntl::readlinkat(Some(dir.as_fd().as_raw_fd()), name)?;
    Ok(target.into_vec())
}

/// Read the target of the link an `O_PATH` descriptor refers to.
pub fn read_link_fd(link: BorrowedFd<'_>) -> io::Result<Vec<u8>> {
    // an empty path makes readlinkat act on the descriptor itself
    let target = fcntl::readlinkat(Some(link.as_raw_fd()), "")?;
    Ok(target.into_vec())
}

/// Rename within one directory. Atomic with respect to other readers.
pub fn rename_at(dir: &Dir, from: &OsStr, to: &OsStr) -> io::Result<()> {
    let fd = dir.as_fd().as_raw_fd();
    fcntl::renameat(Some(fd), from, Some(fd), to)?;
    Ok(())
}

pub fn unlink_at(dir: &Dir, name: &OsStr, is_dir: bool) -> io::Result<()> {
    let flag = if is_dir {
        UnlinkatFlags::RemoveDir
    } else {
        UnlinkatFlags::NoRemoveDir
    };
    unistd::unlinkat(Some(dir.as_fd().as_raw_fd()), name, flag)?;
    Ok(())
}

/// `None` leaves the id as it is.
pub fn fchown(fd: BorrowedFd<'_>, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    unistd::fchown(fd.as_raw_fd(), uid.map(Uid::from_raw), gid.map(Gid::from_raw))?;
    Ok(())
}

/// `lchown` relative to `dir`.
pub fn chown_at(dir: &Dir, name: &OsStr, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    unistd::fchownat(
        Some(dir.as_fd().as_raw_fd()),
        name,
        uid.map(Uid::from_raw),
        gid.map(Gid::from_raw),
        AtFlags::AT_SYMLINK_NOFOLLOW,
    )?;
    Ok(())
}

pub fn fchmod(fd: BorrowedFd<'_>, mode: Mode) -> io::Result<()> {
    stat::fchmod(fd.as_raw_fd(), mode)?;
    Ok(())
}

pub fn futimens(fd: BorrowedFd<'_>, atime: Timestamp, mtime: Timestamp) -> io::Result<()> {
    stat::futimens(fd.as_raw_fd(), &atime.into(), &mtime.into())?;
    Ok(())
}

/// Set the timestamps of `name` itself, not of what a symbolic link points at.
pub fn utimens_at(dir: &Dir, name: &OsStr, atime: Timestamp, mtime: Timestamp) -> io::Result<()> {
    stat::utimensat(
        Some(dir.as_fd().as_raw_fd()),
        name,
        &atime.into(),
        &mtime.into(),
        UtimensatFlags::NoFollowSymlink,
    )?;
    Ok(())
}

/// Reserve `len` bytes for `fd` so the mapped copy can never hit `SIGBUS`.
pub fn allocate(fd: BorrowedFd<'_>, len: u64) -> io::Result<()> {
    let len = libc::off_t::try_from(len).map_err(|_| io::Error::from(Errno::EFBIG))?;
    fcntl::posix_fallocate(fd.as_raw_fd(), 0, len)?;
    Ok(())
}

/// `O_PATH` handle on the current working directory, usable with [`fchdir`]
/// even without read permission on it.
pub fn open_cwd() -> io::Result<OwnedFd> {
    let fd = fcntl::open(
        ".",
        OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    Ok(owned(fd))
}

pub fn fchdir(dir: BorrowedFd<'_>) -> io::Result<()> {
    unistd::fchdir(dir.as_raw_fd())?;
    Ok(())
}

/// A memory mapping, unmapped on drop.
pub struct Mapping {
    ptr: NonNull<libc::c_void>,
    len: NonZeroUsize,
}

impl Mapping {
    fn new(fd: BorrowedFd<'_>, len: usize, prot: ProtFlags, flags: MapFlags) -> io::Result<Self> {
        let len = NonZeroUsize::new(len).ok_or_else(|| io::Error::from(Errno::EINVAL))?;
        // SAFETY: a fresh mapping chosen by the kernel aliases no Rust memory.
        let ptr = unsafe { mman::mmap(None, len, prot, flags, fd, 0) }?;
        Ok(Self { ptr, len })
    }

    pub fn read_only(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        Self::new(fd, len, ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE)
    }

    /// Shared writable mapping; `fd` must be open read-write.
    pub fn writable(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        Self::new(
            fd,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
        )
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is `len` readable bytes and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len.get()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; only writable mappings are ever written through.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len.get()) }
    }

    /// Unmap explicitly so that failures can be reported.
    pub fn unmap(self) -> io::Result<()> {
        let (ptr, len) = (self.ptr, self.len.get());
        std::mem::forget(self);
        // SAFETY: `self` is forgotten, so no slice into the mapping survives.
        unsafe { mman::munmap(ptr, len) }?;
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: no slice borrowed from `self` outlives it.
        let _ = unsafe { mman::munmap(self.ptr, self.len.get()) };
    }
}

/// A directory stream with its own open file description, so reading it
/// never disturbs the offset of the handle it was opened from.
pub struct DirStream {
    entries: nix::dir::OwningIter,
}

impl DirStream {
    pub fn open(dir: &Dir) -> io::Result<Self> {
        let stream = nix::dir::Dir::openat(
            Some(dir.as_fd().as_raw_fd()),
            ".",
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Self {
            entries: stream.into_iter(),
        })
    }
}

impl Iterator for DirStream {
    type Item = io::Result<OsString>;

    /// Yields every entry name except `.` and `..`.
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.entries.next()? {
                Ok(entry) => {
                    let name = entry.file_name().to_bytes();
                    if name == b"." || name == b".." {
                        continue;
                    }
                    return Some(Ok(OsStr::from_bytes(name).to_os_string()));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_stat_at_does_not_follow_links() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("file"), b"data").unwrap();
        symlink("file", tmp.path().join("link")).unwrap();

        let dir = Dir::open(tmp.path()).unwrap();
        assert_eq!(stat_at(&dir, OsStr::new("file")).unwrap().kind(), FileKind::Regular);
        let link = stat_at(&dir, OsStr::new("link")).unwrap();
        assert_eq!(link.kind(), FileKind::Symlink);
        assert_eq!(link.size, 4);
    }

    #[test]
    fn test_open_at_refuses_symlinked_directory() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("real")).unwrap();
        symlink("real", tmp.path().join("alias")).unwrap();

        let dir = Dir::open(tmp.path()).unwrap();
        assert!(dir.open_at(OsStr::new("real")).is_ok());
        assert!(dir.open_at(OsStr::new("alias")).is_err());
    }

    #[test]
    fn test_dir_stream_skips_dot_entries() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a"), b"").unwrap();
        std::fs::create_dir(tmp.path().join("b")).unwrap();

        let dir = Dir::open(tmp.path()).unwrap();
        let names: BTreeSet<OsString> = DirStream::open(&dir)
            .unwrap()
            .collect::<io::Result<_>>()
            .unwrap();
        let expected: BTreeSet<OsString> = ["a", "b"].iter().map(OsString::from).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_read_link_fd_reads_own_target() {
        let tmp = TempDir::new().unwrap();
        symlink("alias-20230101000000", tmp.path().join("alias")).unwrap();

        let dir = Dir::open(tmp.path()).unwrap();
        let link = open_link(&dir, OsStr::new("alias")).unwrap();
        assert_eq!(fstat(link.as_fd()).unwrap().kind(), FileKind::Symlink);
        assert_eq!(read_link_fd(link.as_fd()).unwrap(), b"alias-20230101000000");
    }

    #[test]
    fn test_read_link_at_returns_whole_target() {
        let tmp = TempDir::new().unwrap();
        let long = "x".repeat(300);
        symlink(&long, tmp.path().join("l")).unwrap();
        let dir = Dir::open(tmp.path()).unwrap();
        assert_eq!(read_link_at(&dir, OsStr::new("l")).unwrap(), long.as_bytes());
    }

    #[test]
    fn test_mapped_copy_and_metadata_setters() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("src"), b"hello mapping").unwrap();
        let dir = Dir::open(tmp.path()).unwrap();

        let src = open_file_read(&dir, OsStr::new("src")).unwrap();
        let dst = create_file_excl(&dir, OsStr::new("dst"), Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
        let len = fstat(src.as_fd()).unwrap().size as usize;
        allocate(dst.as_fd(), len as u64).unwrap();
        let smap = Mapping::read_only(src.as_fd(), len).unwrap();
        let mut dmap = Mapping::writable(dst.as_fd(), len).unwrap();
        dmap.as_mut_slice().copy_from_slice(smap.as_slice());
        dmap.unmap().unwrap();
        drop(smap);

        let stamp = Timestamp { sec: 1_500_000_000, nsec: 42 };
        fchmod(dst.as_fd(), Mode::from_bits_truncate(0o640)).unwrap();
        futimens(dst.as_fd(), stamp, stamp).unwrap();
        drop(dst);

        // stat before reading: a relatime mount bumps atime on the first read
        let st = stat_at(&dir, OsStr::new("dst")).unwrap();
        assert_eq!(st.mtime, stamp);
        assert_eq!(st.atime, stamp);
        assert_eq!(st.permissions().bits(), 0o640);
        assert_eq!(std::fs::read(tmp.path().join("dst")).unwrap(), b"hello mapping");
    }

    #[test]
    fn test_create_file_excl_rejects_existing() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), b"").unwrap();
        let dir = Dir::open(tmp.path()).unwrap();
        let err = create_file_excl(&dir, OsStr::new("f"), Mode::S_IRUSR).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::EEXIST as i32));
    }

    #[test]
    fn test_rename_and_unlink_at() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a"), b"").unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        let dir = Dir::open(tmp.path()).unwrap();

        rename_at(&dir, OsStr::new("a"), OsStr::new("b")).unwrap();
        assert!(tmp.path().join("b").exists());
        unlink_at(&dir, OsStr::new("b"), false).unwrap();
        unlink_at(&dir, OsStr::new("d"), true).unwrap();
        assert!(!tmp.path().join("b").exists());
        assert!(!tmp.path().join("d").exists());
    }
}
