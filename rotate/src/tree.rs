//! Recursive replica of a generation with ownership, modes and timestamps.

use std::ffi::OsStr;
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use tracing::{debug, trace};

use crate::context::{EntryPath, RunContext};
use crate::copy::{self, Timestamps};
use crate::error::{Error, Result};
use crate::sys::{self, Dir, DirStream, FileKind, Stat};

const NEW_FILE_MODE: Mode = Mode::S_IRUSR.union(Mode::S_IWUSR);
const NEW_DIR_MODE: Mode = Mode::S_IRWXU;

/// Copy everything under `old` into `new`. Files already present in `new`
/// keep their content and timestamps but take the source's ownership and
/// mode. The root gets the old root's ownership and mode last.
pub fn replicate(ctx: &RunContext, old: &Dir, new: &Dir) -> Result<()> {
    let root = EntryPath::root();
    copy_dir_contents(ctx, old, new, &root)?;

    let st = old
        .stat()
        .map_err(|e| Error::sys("read directory info", ctx.old_path(&root), e))?;
    copy::copy_metadata(new, &st, Timestamps::Keep, &ctx.new_path(&root))?;
    debug!("Copied {} to {}", ctx.old_path(&root), ctx.new_path(&root));
    Ok(())
}

fn copy_dir_contents(ctx: &RunContext, src: &Dir, dst: &Dir, path: &EntryPath) -> Result<()> {
    let entries = DirStream::open(src).map_err(|e| Error::sys("open directory", ctx.old_path(path), e))?;
    for entry in entries {
        let name = entry.map_err(|e| Error::sys("read directory", ctx.old_path(path), e))?;
        copy_entry(ctx, src, dst, &name, &path.join(&name))?;
    }
    Ok(())
}

fn copy_entry(ctx: &RunContext, src: &Dir, dst: &Dir, name: &OsStr, path: &EntryPath) -> Result<()> {
    let src_path = ctx.old_path(path);
    let st = sys::stat_at(src, name).map_err(|e| Error::sys("read file info", &src_path, e))?;
    match st.kind() {
        FileKind::Regular => copy_file(ctx, src, dst, name, path, &st),
        FileKind::Symlink => copy_symlink(ctx, src, dst, name, path, &st),
        FileKind::Directory => copy_dir(ctx, src, dst, name, path, &st),
        FileKind::Other => Err(Error::UnsupportedFileType(src_path)),
    }
}

fn copy_file(ctx: &RunContext, src: &Dir, dst: &Dir, name: &OsStr, path: &EntryPath, st: &Stat) -> Result<()> {
    let src_path = ctx.old_path(path);
    let dst_path = ctx.new_path(path);

    let file = sys::open_file_read(src, name).map_err(|e| Error::sys("open file", &src_path, e))?;
    let opened = sys::fstat(file.as_fd())
        .map_err(|e| Error::sys("read file info", &src_path, e))?;
    if !opened.same_inode(st) {
        return Err(Error::FileChanged(src_path));
    }

    match sys::create_file_excl(dst, name, NEW_FILE_MODE) {
        Ok(out) => {
            copy::copy_contents(&file, &out, st, &src_path, &dst_path)?;
            copy::copy_metadata(&out, st, Timestamps::Copy, &dst_path)?;
            trace!("Copied file {src_path}");
        }
        Err(e) if e.raw_os_error() == Some(Errno::EEXIST as i32) => {
            let out = sys::open_file_write(dst, name).map_err(|e| Error::sys("open file", &dst_path, e))?;
            copy::copy_metadata(&out, st, Timestamps::Keep, &dst_path)?;
            trace!("Updated metadata of existing file {dst_path}");
        }
        Err(e) => return Err(Error::sys("create file", dst_path, e)),
    }
    Ok(())
}

fn copy_symlink(ctx: &RunContext, src: &Dir, dst: &Dir, name: &OsStr, path: &EntryPath, st: &Stat) -> Result<()> {
    let src_path = ctx.old_path(path);
    let dst_path = ctx.new_path(path);

    let target = copy::read_link_target(src, name, st, &src_path)?;
    copy::create_verified_symlink(dst, &target, name, &dst_path)?;
    copy::copy_link_metadata(dst, name, st, &dst_path)?;
    trace!("Copied symbolic link {src_path}");
    Ok(())
}

fn copy_dir(ctx: &RunContext, src: &Dir, dst: &Dir, name: &OsStr, path: &EntryPath, st: &Stat) -> Result<()> {
    let src_path = ctx.old_path(path);
    let dst_path = ctx.new_path(path);

    let sub_src = src.open_at(name).map_err(|e| Error::sys("open directory", &src_path, e))?;
    let opened = sub_src
        .stat()
        .map_err(|e| Error::sys("read directory info", &src_path, e))?;
    if !opened.same_inode(st) {
        return Err(Error::FileChanged(src_path));
    }

    sys::mkdir_at(dst, name, NEW_DIR_MODE).map_err(|e| Error::sys("create directory", &dst_path, e))?;
    let sub_dst = dst.open_at(name).map_err(|e| Error::sys("open directory", &dst_path, e))?;

    copy_dir_contents(ctx, &sub_src, &sub_dst, path)?;

    // after the contents, so that their creation does not bump the times
    copy::copy_metadata(&sub_dst, st, Timestamps::Copy, &dst_path)?;
    trace!("Copied directory {src_path}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StoreOwner;
    use crate::generation::GenerationName;
    use chrono::{TimeZone, Utc};
    use std::fs::FileTimes;
    use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
    use std::os::unix::net::UnixListener;
    use std::path::Path;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    const OLD: &str = "alias-20230101000000";

    fn setup() -> (TempDir, RunContext, Dir, Dir) {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join(OLD)).unwrap();
        let name = GenerationName::for_time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()).unwrap();
        std::fs::create_dir(tmp.path().join(name.as_str())).unwrap();
        let ctx = RunContext::new(
            tmp.path(),
            "www.example.com",
            StoreOwner {
                uid: nix::unistd::geteuid(),
                gid: nix::unistd::getegid(),
            },
            OLD,
            name.clone(),
        );
        let conf = Dir::open(tmp.path()).unwrap();
        let old = conf.open_at(OsStr::new(OLD)).unwrap();
        let new = conf.open_at(name.as_os_str()).unwrap();
        (tmp, ctx, old, new)
    }

    fn set_mtime(path: &Path, secs: u64) {
        let t = UNIX_EPOCH + Duration::from_secs(secs);
        let f = std::fs::File::open(path).unwrap();
        f.set_times(FileTimes::new().set_modified(t).set_accessed(t)).unwrap();
    }

    #[test]
    fn test_replicates_files_links_and_directories() {
        let (tmp, ctx, old, new) = setup();
        let src = tmp.path().join(OLD);
        std::fs::create_dir_all(src.join("pkcs11/nested")).unwrap();
        std::fs::write(src.join("pkcs11/file"), b"module config").unwrap();
        std::fs::write(src.join("pkcs11/nested/empty"), b"").unwrap();
        std::fs::set_permissions(src.join("pkcs11/file"), std::fs::Permissions::from_mode(0o640)).unwrap();
        std::fs::set_permissions(src.join("pkcs11"), std::fs::Permissions::from_mode(0o751)).unwrap();
        symlink("pkcs11/file", src.join("link")).unwrap();
        set_mtime(&src.join("pkcs11/file"), 1_600_000_000);
        set_mtime(&src.join("pkcs11"), 1_500_000_000);

        replicate(&ctx, &old, &new).unwrap();

        let dst = tmp.path().join(ctx.new_name().as_str());
        assert_eq!(std::fs::read(dst.join("pkcs11/file")).unwrap(), b"module config");
        assert_eq!(std::fs::read(dst.join("pkcs11/nested/empty")).unwrap(), b"");
        assert_eq!(
            std::fs::read_link(dst.join("link")).unwrap(),
            Path::new("pkcs11/file")
        );

        let file = std::fs::metadata(dst.join("pkcs11/file")).unwrap();
        assert_eq!(file.permissions().mode() & 0o7777, 0o640);
        assert_eq!(file.mtime(), 1_600_000_000);
        let dir = std::fs::metadata(dst.join("pkcs11")).unwrap();
        assert_eq!(dir.permissions().mode() & 0o7777, 0o751);
        assert_eq!(dir.mtime(), 1_500_000_000);

        let link_src = std::fs::symlink_metadata(src.join("link")).unwrap();
        let link_dst = std::fs::symlink_metadata(dst.join("link")).unwrap();
        assert_eq!(link_dst.mtime(), link_src.mtime());
        assert_eq!(link_dst.uid(), link_src.uid());
    }

    #[test]
    fn test_root_takes_mode_but_not_times() {
        let (tmp, ctx, old, new) = setup();
        let src = tmp.path().join(OLD);
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o755)).unwrap();
        set_mtime(&src, 1_400_000_000);

        replicate(&ctx, &old, &new).unwrap();

        let root = std::fs::metadata(tmp.path().join(ctx.new_name().as_str())).unwrap();
        assert_eq!(root.permissions().mode() & 0o7777, 0o755);
        assert_ne!(root.mtime(), 1_400_000_000);
    }

    #[test]
    fn test_existing_file_keeps_content_and_times() {
        let (tmp, ctx, old, new) = setup();
        let src = tmp.path().join(OLD);
        let dst = tmp.path().join(ctx.new_name().as_str());
        std::fs::write(src.join("cert8.db"), b"old store").unwrap();
        std::fs::set_permissions(src.join("cert8.db"), std::fs::Permissions::from_mode(0o600)).unwrap();
        set_mtime(&src.join("cert8.db"), 1_300_000_000);
        std::fs::write(dst.join("cert8.db"), b"updated store").unwrap();
        set_mtime(&dst.join("cert8.db"), 1_700_000_000);

        replicate(&ctx, &old, &new).unwrap();

        assert_eq!(std::fs::read(dst.join("cert8.db")).unwrap(), b"updated store");
        let meta = std::fs::metadata(dst.join("cert8.db")).unwrap();
        assert_eq!(meta.mtime(), 1_700_000_000);
        assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
    }

    #[test]
    fn test_socket_is_unsupported() {
        let (tmp, ctx, old, new) = setup();
        let _listener = UnixListener::bind(tmp.path().join(OLD).join("sock")).unwrap();

        let err = replicate(&ctx, &old, &new).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFileType(ref p) if p.ends_with("/sock")));
    }

    #[test]
    fn test_existing_directory_in_destination_fails() {
        let (tmp, ctx, old, new) = setup();
        std::fs::create_dir(tmp.path().join(OLD).join("pkcs11")).unwrap();
        std::fs::create_dir(tmp.path().join(ctx.new_name().as_str()).join("pkcs11")).unwrap();
        let err = replicate(&ctx, &old, &new).unwrap_err();
        assert!(err.to_string().starts_with("Failed to create directory"));
    }

    #[test]
    fn test_modified_source_is_detected() {
        let (tmp, ctx, old, new) = setup();
        let src = tmp.path().join(OLD);
        std::fs::write(src.join("data"), b"content").unwrap();

        // stat taken before a concurrent writer touches the file
        let st = sys::stat_at(&old, OsStr::new("data")).unwrap();
        set_mtime(&src.join("data"), st.mtime.sec as u64 + 100);

        let path = EntryPath::root().join(OsStr::new("data"));
        let err = copy_file(&ctx, &old, &new, OsStr::new("data"), &path, &st).unwrap_err();
        assert!(matches!(err, Error::FileChanged(_)));
    }

    #[test]
    fn test_replaced_source_is_detected() {
        let (tmp, ctx, old, new) = setup();
        let src = tmp.path().join(OLD);
        std::fs::write(src.join("data"), b"content").unwrap();
        let st = sys::stat_at(&old, OsStr::new("data")).unwrap();
        std::fs::write(src.join("replacement"), b"replacement").unwrap();
        std::fs::rename(src.join("replacement"), src.join("data")).unwrap();

        let path = EntryPath::root().join(OsStr::new("data"));
        let err = copy_file(&ctx, &old, &new, OsStr::new("data"), &path, &st).unwrap_err();
        assert!(matches!(err, Error::FileChanged(_)));
    }

    #[test]
    fn test_uid_gid_preserved() {
        let (tmp, ctx, old, new) = setup();
        std::fs::write(tmp.path().join(OLD).join("f"), b"x").unwrap();
        replicate(&ctx, &old, &new).unwrap();
        let src = std::fs::metadata(tmp.path().join(OLD).join("f")).unwrap();
        let dst = std::fs::metadata(tmp.path().join(ctx.new_name().as_str()).join("f")).unwrap();
        assert_eq!((src.uid(), src.gid()), (dst.uid(), dst.gid()));
    }
}
