//! Certificate store capability used by the updater.
//!
//! The rotation core never talks to NSS directly. It opens a store in the
//! current working directory, lists its records, deletes and imports by
//! nickname, then closes it. [`CertutilStore`] is the production backend.

mod certutil;
#[cfg(test)]
pub(crate) mod memory;

use std::fmt;
use std::io;

use chrono::{DateTime, Utc};
use x509_parser::pem::Pem;
use x509_parser::parse_x509_certificate;

pub use certutil::{CertutilStore, DEFAULT_CERTUTIL};

/// Format used when logging certificate expiry.
pub const EXPIRY_FORMAT: &str = "%a %b %d %H:%M:%S %Y UTC";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Key slot requires authentication")]
    AuthenticationRequired,

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed ({status}): {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Certificate decoding failed: {0}")]
    Decode(String),

    #[error("Database is not open")]
    NotOpen,
}

/// One certificate held by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRecord {
    pub nickname: String,
    pub trust: String,
    pub not_after: Option<DateTime<Utc>>,
}

/// A decoded certificate ready for import.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    subject: String,
    not_after: DateTime<Utc>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("not_after", &self.not_after)
            .field("der_len", &self.der.len())
            .finish()
    }
}

impl Certificate {
    /// Decode a certificate given either as a PEM `CERTIFICATE` block or as
    /// raw DER. Text before the PEM armor, such as the bag attributes
    /// `openssl pkcs12` writes, is skipped.
    pub fn from_pem_or_der(data: &[u8]) -> Result<Self, StoreError> {
        if data.is_empty() {
            return Err(StoreError::Decode("empty input".into()));
        }
        if let Some(start) = pem_start(data) {
            for pem in Pem::iter_from_buffer(&data[start..]) {
                let pem = pem.map_err(|e| StoreError::Decode(format!("invalid PEM: {e}")))?;
                if pem.label == "CERTIFICATE" {
                    return Self::from_der(pem.contents);
                }
            }
            return Err(StoreError::Decode("no CERTIFICATE block found".into()));
        }
        Self::from_der(data.to_vec())
    }

    pub fn from_der(der: Vec<u8>) -> Result<Self, StoreError> {
        let (subject, not_after) = {
            let (_, cert) =
                parse_x509_certificate(&der).map_err(|e| StoreError::Decode(e.to_string()))?;
            let ts = cert.validity().not_after.timestamp();
            let not_after = DateTime::<Utc>::from_timestamp(ts, 0)
                .ok_or_else(|| StoreError::Decode(format!("expiry out of range: {ts}")))?;
            (cert.subject().to_string(), not_after)
        };
        Ok(Self {
            der,
            subject,
            not_after,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}

/// Offset of the first PEM armor line in `data`.
fn pem_start(data: &[u8]) -> Option<usize> {
    const ARMOR: &[u8] = b"-----BEGIN";
    data.windows(ARMOR.len()).position(|w| w == ARMOR)
}

pub fn format_expiry(t: DateTime<Utc>) -> String {
    t.format(EXPIRY_FORMAT).to_string()
}

/// The four operations the rotation needs from a certificate database,
/// plus closing it.
pub trait CertStore {
    /// Open the database in the current working directory for writing.
    /// Fails with [`StoreError::AuthenticationRequired`] when reading
    /// certificates would need a login.
    fn open_read_write(&mut self) -> Result<(), StoreError>;

    fn list_records(&mut self) -> Result<Vec<CertRecord>, StoreError>;

    /// Delete one record named `nickname`.
    fn delete_record(&mut self, nickname: &str) -> Result<(), StoreError>;

    /// Import `cert` under `nickname` with no trust flags.
    fn import_record(&mut self, nickname: &str, cert: &Certificate) -> Result<(), StoreError>;

    fn close(&mut self) -> Result<(), StoreError>;
}
