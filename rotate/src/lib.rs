//! Transactional rotation of a mod_nss certificate database.
//!
//! The web server reads its NSS database through `<conf>/alias`, a symbolic
//! link to a generation directory named `alias-YYYYMMDDHHMMSS`. A rotation
//! builds the next generation next to the live one, replaces the host's
//! certificate in it, copies everything else across and then renames a new
//! link over `alias`. Readers see either the old or the new generation.

pub mod alias;
pub mod context;
pub mod copy;
pub mod error;
pub mod generation;
pub mod identity;
pub mod reaper;
pub mod rotation;
pub mod store;
pub mod storefiles;
pub mod sys;
pub mod tree;
pub mod updater;

pub use context::StoreOwner;
pub use error::{Error, ErrorKind, Result};
pub use rotation::{rotate, RotationReport, Settings};
