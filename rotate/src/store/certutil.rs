//! Certificate store backed by the NSS `certutil` tool.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::trace;
use x509_parser::pem::Pem;

use super::{CertRecord, CertStore, Certificate, StoreError};

pub const DEFAULT_CERTUTIL: &str = "certutil";

/// Legacy dbm database in the working directory.
const DATABASE: &str = "dbm:.";

/// Header line above the nickname/trust table printed by `certutil -L`.
const TRUST_HEADER: &str = "SSL,S/MIME,JAR/XPI";

/// Empty SSL, S/MIME and code signing trust.
const NO_TRUST: &str = ",,";

#[derive(Debug)]
pub struct CertutilStore {
    program: PathBuf,
    open: bool,
}

impl CertutilStore {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            open: false,
        }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Vec<u8>, StoreError> {
        trace!("Running {} {}", self.program_name(), args.join(" "));
        let spawn_err = |source| StoreError::Spawn {
            program: self.program_name(),
            source,
        };

        let mut child = Command::new(&self.program)
            .arg("-d")
            .arg(DATABASE)
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(data).map_err(spawn_err)?;
        }
        let output = child.wait_with_output().map_err(spawn_err)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if needs_authentication(&stderr) {
                return Err(StoreError::AuthenticationRequired);
            }
            return Err(StoreError::Command {
                program: self.program_name(),
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(output.stdout)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::NotOpen)
        }
    }

    /// Expiry of every certificate stored under `nickname`, in listing order.
    fn expiries(&self, nickname: &str) -> Result<Vec<chrono::DateTime<chrono::Utc>>, StoreError> {
        let out = self.run(&["-L", "-n", nickname, "-a"], None)?;
        let mut result = Vec::new();
        for pem in Pem::iter_from_buffer(&out) {
            let pem = pem.map_err(|e| StoreError::Decode(format!("invalid PEM from certutil: {e}")))?;
            if pem.label == "CERTIFICATE" {
                result.push(Certificate::from_der(pem.contents)?.not_after());
            }
        }
        Ok(result)
    }
}

fn needs_authentication(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("password") || lower.contains(" pin")
}

/// Parse the nickname/trust table of `certutil -L`. Nicknames may contain
/// spaces; the trust attributes are the last column.
pub(crate) fn parse_listing(out: &str) -> Vec<(String, String)> {
    let mut records = Vec::new();
    let mut in_table = false;
    for line in out.lines() {
        if !in_table {
            in_table = line.trim() == TRUST_HEADER;
            continue;
        }
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if let Some((nickname, trust)) = line.rsplit_once(char::is_whitespace) {
            let nickname = nickname.trim_end();
            if !nickname.is_empty() {
                records.push((nickname.to_string(), trust.to_string()));
            }
        }
    }
    records
}

impl CertStore for CertutilStore {
    fn open_read_write(&mut self) -> Result<(), StoreError> {
        // listing needs no login unless the key slot is unfriendly
        self.run(&["-L"], None)?;
        self.open = true;
        Ok(())
    }

    fn list_records(&mut self) -> Result<Vec<CertRecord>, StoreError> {
        self.ensure_open()?;
        let out = self.run(&["-L"], None)?;
        let listing = parse_listing(&String::from_utf8_lossy(&out));

        let mut expiries: HashMap<String, std::vec::IntoIter<_>> = HashMap::new();
        let mut records = Vec::with_capacity(listing.len());
        for (nickname, trust) in listing {
            if !expiries.contains_key(&nickname) {
                let list = self.expiries(&nickname)?;
                expiries.insert(nickname.clone(), list.into_iter());
            }
            let not_after = expiries.get_mut(&nickname).and_then(Iterator::next);
            records.push(CertRecord {
                nickname,
                trust,
                not_after,
            });
        }
        Ok(records)
    }

    fn delete_record(&mut self, nickname: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.run(&["-D", "-n", nickname], None)?;
        Ok(())
    }

    fn import_record(&mut self, nickname: &str, cert: &Certificate) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.run(&["-A", "-n", nickname, "-t", NO_TRUST], Some(cert.der()))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.open = false;
        Ok(())
    }
}
