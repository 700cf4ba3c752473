//! In-memory store for tests.

use std::path::PathBuf;

use super::{CertRecord, CertStore, Certificate, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub records: Vec<(CertRecord, Option<Vec<u8>>)>,
    pub opened_in: Option<PathBuf>,
    pub open: bool,
    pub closed: bool,
    pub require_login: bool,
    pub fail_import: bool,
    pub deletions: Vec<String>,
}

impl MemoryStore {
    pub fn with_nicknames(names: &[&str]) -> Self {
        let records = names
            .iter()
            .map(|n| {
                (
                    CertRecord {
                        nickname: n.to_string(),
                        trust: ",,".to_string(),
                        not_after: None,
                    },
                    None,
                )
            })
            .collect();
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn nicknames(&self) -> Vec<&str> {
        self.records.iter().map(|(r, _)| r.nickname.as_str()).collect()
    }
}

impl CertStore for MemoryStore {
    fn open_read_write(&mut self) -> Result<(), StoreError> {
        if self.require_login {
            return Err(StoreError::AuthenticationRequired);
        }
        self.opened_in = std::env::current_dir().ok();
        self.open = true;
        Ok(())
    }

    fn list_records(&mut self) -> Result<Vec<CertRecord>, StoreError> {
        if !self.open {
            return Err(StoreError::NotOpen);
        }
        Ok(self.records.iter().map(|(r, _)| r.clone()).collect())
    }

    fn delete_record(&mut self, nickname: &str) -> Result<(), StoreError> {
        if !self.open {
            return Err(StoreError::NotOpen);
        }
        let pos = self
            .records
            .iter()
            .position(|(r, _)| r.nickname == nickname)
            .ok_or_else(|| StoreError::Command {
                program: "memory".into(),
                status: "exit status: 255".into(),
                stderr: format!("could not find certificate named \"{nickname}\""),
            })?;
        self.records.remove(pos);
        self.deletions.push(nickname.to_string());
        Ok(())
    }

    fn import_record(&mut self, nickname: &str, cert: &Certificate) -> Result<(), StoreError> {
        if !self.open {
            return Err(StoreError::NotOpen);
        }
        if self.fail_import {
            return Err(StoreError::Command {
                program: "memory".into(),
                status: "exit status: 255".into(),
                stderr: "SEC_ERROR_ADDING_CERT".into(),
            });
        }
        self.records.push((
            CertRecord {
                nickname: nickname.to_string(),
                trust: ",,".to_string(),
                not_after: Some(cert.not_after()),
            },
            Some(cert.der().to_vec()),
        ));
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.open = false;
        self.closed = true;
        Ok(())
    }
}
