//! Replace the host's certificate in the new generation's store.

use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::context::{EntryPath, RunContext};
use crate::error::{Error, Result};
use crate::store::{format_expiry, CertStore, Certificate};
use crate::sys::{self, Dir};

/// Summary of one store update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub deleted: u32,
    pub not_after: DateTime<Utc>,
}

/// Changes into a directory and returns to the previous working directory
/// on drop.
struct WorkingDirGuard {
    previous: OwnedFd,
}

impl WorkingDirGuard {
    fn enter(dir: &Dir, path: &str) -> Result<Self> {
        let previous = sys::open_cwd().map_err(|e| Error::sys("open working directory", ".", e))?;
        sys::fchdir(dir.as_fd()).map_err(|e| Error::sys("change working directory", path, e))?;
        Ok(Self { previous })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(e) = sys::fchdir(self.previous.as_fd()) {
            warn!("Failed to restore working directory: {e}");
        }
    }
}

/// Load `<cert_dir>/<hostname>.crt`.
pub fn read_certificate(cert_dir: &Path, hostname: &str) -> Result<Certificate> {
    let path = cert_dir.join(format!("{hostname}.crt"));
    let cert_path = path.display().to_string();
    let data = std::fs::read(&path).map_err(|e| Error::sys("read file", &cert_path, e))?;
    if data.is_empty() {
        return Err(Error::InvalidFileSize(cert_path));
    }
    Certificate::from_pem_or_der(&data)
        .map_err(|e| Error::store(format!("Failed to decode certificate: {cert_path}"), e))
}

/// Open the store in `new`, drop every record named after the host and
/// import the host's certificate under its name.
///
/// Must run with the store owner's effective identity so that the files
/// the backend writes keep the right owner.
pub fn update<S: CertStore + ?Sized>(
    ctx: &RunContext,
    new: &Dir,
    cert_dir: &Path,
    store: &mut S,
) -> Result<UpdateOutcome> {
    let db_path = ctx.new_path(&EntryPath::root());
    let cert = read_certificate(cert_dir, ctx.hostname())?;

    let _cwd = WorkingDirGuard::enter(new, &db_path)?;

    store
        .open_read_write()
        .map_err(|e| Error::store(format!("Failed to open NSS database: {db_path}"), e))?;

    let replaced = replace(ctx, store, &cert, &db_path);
    let closed = store
        .close()
        .map_err(|e| Error::store(format!("Failed to close NSS database: {db_path}"), e));
    let deleted = replaced?;
    closed?;

    info!("Updated mod_nss certificate for {}", ctx.hostname());
    info!("New certificate valid until {}", format_expiry(cert.not_after()));
    Ok(UpdateOutcome {
        deleted,
        not_after: cert.not_after(),
    })
}

fn replace<S: CertStore + ?Sized>(ctx: &RunContext, store: &mut S, cert: &Certificate, db_path: &str) -> Result<u32> {
    let host = ctx.hostname();
    let records = store
        .list_records()
        .map_err(|e| Error::store(format!("Failed to list certificates: {db_path}"), e))?;

    let mut deleted = 0u32;
    for record in &records {
        match record.not_after {
            Some(t) => trace!("Certificate {} ({}) valid until {}", record.nickname, record.trust, format_expiry(t)),
            None => trace!("Certificate {} ({})", record.nickname, record.trust),
        }
        if record.nickname != host {
            continue;
        }
        store
            .delete_record(host)
            .map_err(|e| Error::store(format!("Failed to delete certificate {host}: {db_path}"), e))?;
        deleted += 1;
    }
    debug!("Deleted {deleted} existing certificate(s)");

    store
        .import_record(host, cert)
        .map_err(|e| Error::store(format!("Failed to import certificate {host}: {db_path}"), e))?;
    Ok(deleted)
}
