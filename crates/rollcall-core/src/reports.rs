//! Read-side views over the registry and ledger.

use crate::clock::Clock;
use crate::config::Config;
use crate::store::{AttendanceLedger, SampleStore, StoreError, StudentRegistry};
use crate::types::AttendanceRecord;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("no attendance file found")]
    NoLedger,
    #[error("export failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub id: String,
    pub name: String,
    pub present: bool,
}

/// Enrolled students with today's presence.
#[derive(Debug, Clone, Serialize)]
pub struct Roster {
    pub today: String,
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub students: Vec<RosterEntry>,
}

pub struct Reports {
    samples: Arc<SampleStore>,
    registry: Arc<StudentRegistry>,
    ledger: Arc<AttendanceLedger>,
    clock: Arc<dyn Clock>,
}

impl Reports {
    pub fn new(
        samples: Arc<SampleStore>,
        registry: Arc<StudentRegistry>,
        ledger: Arc<AttendanceLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            samples,
            registry,
            ledger,
            clock,
        }
    }

    /// Reports over the stores under `config.data_dir`.
    pub fn open(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Ok(Self::new(
            Arc::new(SampleStore::open(config.dataset_dir())?),
            Arc::new(StudentRegistry::new(config.students_file())),
            Arc::new(AttendanceLedger::new(config.attendance_file())),
            clock,
        ))
    }

    /// Registered students that still have a sample folder, flagged with
    /// whether they were recorded today.
    pub fn roster(&self) -> Result<Roster, StoreError> {
        let today = self.clock.today();
        let present_ids = self.ledger.present_on(&today)?;

        let students: Vec<RosterEntry> = self
            .registry
            .load()?
            .into_iter()
            .filter(|s| self.samples.has_folder(s))
            .map(|s| RosterEntry {
                present: present_ids.contains(&s.id),
                id: s.id,
                name: s.name,
            })
            .collect();

        let total = students.len();
        let present = students.iter().filter(|s| s.present).count();
        Ok(Roster {
            today,
            total,
            present,
            absent: total - present,
            students,
        })
    }

    /// Full attendance history in file order.
    pub fn history(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.ledger.load()
    }

    /// Copy the ledger file to `dest`, returning the bytes copied.
    pub fn export(&self, dest: &Path) -> Result<u64, ExportError> {
        if !self.ledger.exists() {
            return Err(ExportError::NoLedger);
        }
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = fs::copy(self.ledger.path(), dest)?;
        tracing::info!(dest = %dest.display(), bytes, "attendance exported");
        Ok(bytes)
    }
}
