use super::StoreError;
use crate::types::Student;
use image::{GrayImage, ImageFormat};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-student folders of normalized face crops, `{root}/{id}_{name}/{seq}.jpg`.
pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn student_dir(&self, student: &Student) -> PathBuf {
        self.root.join(student.folder_name())
    }

    pub fn has_folder(&self, student: &Student) -> bool {
        self.student_dir(student).is_dir()
    }

    /// Persist sample number `seq` for `student`.
    pub fn write_sample(&self, student: &Student, seq: u32, face: &GrayImage) -> Result<PathBuf, StoreError> {
        let dir = self.student_dir(student);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{seq}.jpg"));
        face.save_with_format(&path, ImageFormat::Jpeg)?;
        Ok(path)
    }

    /// Names of all student folders, sorted lexicographically.
    pub fn folders(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => tracing::warn!(folder = ?raw, "skipping non UTF-8 sample folder"),
            }
        }
        names.sort();
        Ok(names)
    }

    /// Files inside one student folder, sorted by name.
    pub fn folder_files(&self, folder: &str) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.root.join(folder))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}
