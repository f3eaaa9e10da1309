use super::{append_row, read_table, StoreError};
use crate::types::Student;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const REGISTRY_HEADER: [&str; 2] = ["id", "name"];

/// Persisted student list, `id,name`, at most one row per id.
pub struct StudentRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StudentRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<Student>, StoreError> {
        read_table(&self.path)
    }

    /// Append `student` unless a row with the same id already exists.
    ///
    /// Returns whether a row was written.
    pub fn register(&self, student: &Student) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.load()?.iter().any(|s| s.id == student.id) {
            tracing::debug!(student = %student.id, "already registered");
            return Ok(false);
        }

        append_row(&self.path, &REGISTRY_HEADER, student)?;
        tracing::info!(student = %student.id, name = %student.name, "student registered");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_register_dedups_by_id() {
        let dir = tempdir().unwrap();
        let registry = StudentRegistry::new(dir.path().join("students.csv"));

        assert!(registry.register(&Student::new("101", "Alice")).unwrap());
        assert!(!registry.register(&Student::new("101", "Alice")).unwrap());
        assert!(!registry.register(&Student::new("101", "Alicia")).unwrap());
        assert!(registry.register(&Student::new("102", "Bob")).unwrap());

        assert_eq!(
            fs::read_to_string(registry.path()).unwrap(),
            "id,name\n101,Alice\n102,Bob\n"
        );
    }

    #[test]
    fn test_register_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("students.csv");
        StudentRegistry::new(&path).register(&Student::new("101", "Alice")).unwrap();

        let reopened = StudentRegistry::new(&path);
        assert!(!reopened.register(&Student::new("101", "Alice")).unwrap());
        assert_eq!(reopened.load().unwrap(), vec![Student::new("101", "Alice")]);
    }

    #[test]
    fn test_register_matches_trimmed_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("students.csv");
        fs::write(&path, "ID,NAME\n 101 ,Alice\n").unwrap();
        let registry = StudentRegistry::new(&path);
        assert!(!registry.register(&Student::new("101", "Alice")).unwrap());
    }
}
