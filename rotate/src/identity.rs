//! Temporary switch of the effective user and group.

use std::io;

use nix::unistd::{getegid, geteuid, setegid, seteuid, Gid, Uid};
use tracing::{trace, warn};

use crate::context::StoreOwner;
use crate::error::{Error, Result};

/// An effective uid/gid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
}

impl Identity {
    pub fn effective() -> Self {
        Self {
            uid: geteuid(),
            gid: getegid(),
        }
    }
}

impl From<StoreOwner> for Identity {
    fn from(owner: StoreOwner) -> Self {
        Self {
            uid: owner.uid,
            gid: owner.gid,
        }
    }
}

fn set_uid(uid: Uid) -> Result<()> {
    seteuid(uid).map_err(|e| Error::sys("set effective uid", uid.to_string(), io::Error::from_raw_os_error(e as i32)))?;
    let actual = geteuid();
    if actual != uid {
        return Err(Error::IdentityNotChanged {
            which: "uid",
            actual: actual.as_raw(),
        });
    }
    Ok(())
}

fn set_gid(gid: Gid) -> Result<()> {
    setegid(gid).map_err(|e| Error::sys("set effective gid", gid.to_string(), io::Error::from_raw_os_error(e as i32)))?;
    let actual = getegid();
    if actual != gid {
        return Err(Error::IdentityNotChanged {
            which: "gid",
            actual: actual.as_raw(),
        });
    }
    Ok(())
}

/// Switch the effective identity to `target`, verifying each half took
/// effect. Root changes its group while it still may; anyone else changes
/// the user first.
pub fn set_effective(target: Identity) -> Result<()> {
    let current = Identity::effective();
    if current.uid.is_root() {
        set_gid(target.gid)?;
        set_uid(target.uid)?;
    } else {
        set_uid(target.uid)?;
        set_gid(target.gid)?;
    }
    trace!(
        "Effective identity changed from {}:{} to {}:{}",
        current.uid, current.gid, target.uid, target.gid
    );
    Ok(())
}

/// Holds an assumed identity and returns to the previous one when
/// restored or dropped.
#[derive(Debug)]
pub struct IdentityGuard {
    previous: Option<Identity>,
}

impl IdentityGuard {
    pub fn assume(target: Identity) -> Result<Self> {
        let previous = Identity::effective();
        set_effective(target)?;
        Ok(Self {
            previous: Some(previous),
        })
    }

    /// Restore the previous identity, reporting failure.
    pub fn restore(mut self) -> Result<()> {
        match self.previous.take() {
            Some(previous) => set_effective(previous),
            None => Ok(()),
        }
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(e) = set_effective(previous) {
                warn!("Failed to restore effective identity: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_assume_own_identity_is_noop() {
        let me = Identity::effective();
        let guard = IdentityGuard::assume(me).unwrap();
        assert_eq!(Identity::effective(), me);
        guard.restore().unwrap();
        assert_eq!(Identity::effective(), me);
    }

    #[test]
    #[serial]
    fn test_unprivileged_switch_is_refused() {
        let me = Identity::effective();
        if me.uid.is_root() {
            return;
        }
        let other = Identity {
            uid: Uid::from_raw(me.uid.as_raw().wrapping_add(1)),
            gid: me.gid,
        };
        let err = IdentityGuard::assume(other).unwrap_err();
        assert!(err.to_string().starts_with("Failed to set effective uid"));
        assert_eq!(Identity::effective(), me);
    }
}
