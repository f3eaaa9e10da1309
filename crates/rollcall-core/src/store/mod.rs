//! Flat-file persistence: per-student sample folders and the two CSV tables.
//!
//! Rows are read into explicit record types. Header names are trimmed and
//! lower-cased and every field is trimmed once here, at the storage boundary.

mod ledger;
mod registry;
mod samples;

pub use ledger::{AttendanceLedger, LEDGER_HEADER};
pub use registry::{StudentRegistry, REGISTRY_HEADER};
pub use samples::SampleStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("image write failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Read every well-formed row of a CSV table. A missing file is an empty table.
///
/// Structurally empty rows are skipped; rows missing a required column are
/// skipped with a warning rather than failing the whole read.
pub(crate) fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    let headers: csv::StringRecord = reader
        .headers()?
        .iter()
        .map(|h| h.to_lowercase())
        .collect();
    reader.set_headers(headers.clone());

    let mut rows = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) if is_row_error(&e) => {
                tracing::warn!(
                    path = %path.display(),
                    row = line + 1,
                    error = %e,
                    "skipping undecodable row"
                );
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if record.iter().all(str::is_empty) {
            continue;
        }
        match record.deserialize::<T>(Some(&headers)) {
            Ok(row) => rows.push(row),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    row = line + 1,
                    error = %e,
                    "skipping malformed row"
                );
            }
        }
    }
    Ok(rows)
}

/// Errors confined to one record; anything else (I/O) fails the read.
fn is_row_error(e: &csv::Error) -> bool {
    matches!(e.kind(), csv::ErrorKind::Utf8 { .. } | csv::ErrorKind::UnequalLengths { .. })
}

/// Append one row, creating the file with `header` first if it is absent or
/// empty. A previous row left without a trailing newline is terminated
/// before the new one is written.
pub(crate) fn append_row<T: Serialize>(path: &Path, header: &[&str], row: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let len = file.metadata()?.len();

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if len == 0 {
        writer.write_record(header)?;
    }
    writer.serialize(row)?;
    let mut line = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;

    if len > 0 && !ends_with_newline(&mut file, len)? {
        line.insert(0, b'\n');
    }

    // Single write so a concurrent reader never sees half a header.
    file.write_all(&line)?;
    file.flush()?;
    Ok(())
}

fn ends_with_newline(file: &mut fs::File, len: u64) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
