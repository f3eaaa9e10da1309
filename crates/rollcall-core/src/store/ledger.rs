use super::{append_row, read_table, StoreError};
use crate::types::AttendanceRecord;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const LEDGER_HEADER: [&str; 4] = ["id", "name", "date", "time"];

/// Append-only attendance log, `id,name,date,time`.
///
/// The ledger accepts whatever it is given; the one-row-per-student-per-day
/// rule is enforced by the recognition engine before it appends.
pub struct AttendanceLedger {
    path: PathBuf,
}

impl AttendanceLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// All records in file order.
    pub fn load(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        read_table(&self.path)
    }

    pub fn append(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        append_row(&self.path, &LEDGER_HEADER, record)
    }

    /// Ids with at least one record on `date`.
    pub fn present_on(&self, date: &str) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.date == date)
            .map(|r| r.id)
            .collect())
    }
}
