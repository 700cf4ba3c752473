//! One complete rotation: build the next generation, switch the alias to
//! it and remove the previous one.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::alias;
use crate::context::{RunContext, StoreOwner};
use crate::error::{Error, Result};
use crate::generation::{self, GenerationName};
use crate::identity::IdentityGuard;
use crate::reaper;
use crate::store::CertStore;
use crate::storefiles;
use crate::sys::Dir;
use crate::tree;
use crate::updater;

pub const DEFAULT_CONF_DIR: &str = "/etc/httpd";
pub const DEFAULT_CERT_DIR: &str = "/var/lib/acme";

/// Inputs of a rotation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub conf_dir: PathBuf,
    pub cert_dir: PathBuf,
    pub hostname: String,
    pub owner: StoreOwner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub old: String,
    pub new: GenerationName,
    pub deleted: u32,
    pub not_after: DateTime<Utc>,
}

/// Run every step in order. The first failure aborts the run and leaves
/// the filesystem as it is; the alias only ever names a complete
/// generation.
pub fn rotate<S: CertStore + ?Sized>(
    settings: &Settings,
    store: &mut S,
    now: DateTime<Utc>,
) -> Result<RotationReport> {
    let conf_path = settings.conf_dir.as_path();
    let conf = Dir::open(conf_path).map_err(|e| Error::sys("open directory", conf_path.display().to_string(), e))?;

    let current = alias::resolve(&conf, conf_path)?;
    let new = generation::allocate(&conf, conf_path, now, settings.owner.gid)?;
    let ctx = RunContext::new(
        conf_path,
        settings.hostname.as_str(),
        settings.owner,
        current.generation.as_str(),
        new.name.clone(),
    );

    storefiles::replicate(&ctx, &current.dir, &new.dir)?;
    debug!("Copied certificate database to {}", ctx.new_name());

    let guard = IdentityGuard::assume(settings.owner.into())?;
    let updated = updater::update(&ctx, &new.dir, &settings.cert_dir, store);
    let restored = guard.restore();
    let outcome = updated?;
    restored?;

    tree::replicate(&ctx, &current.dir, &new.dir)?;
    alias::swap(&ctx, &conf, &current.link)?;

    reaper::reap(&ctx, &conf, current.dir)?;

    Ok(RotationReport {
        old: ctx.old_name().to_string(),
        new: ctx.new_name().clone(),
        deleted: outcome.deleted,
        not_after: outcome.not_after,
    })
}
