use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An enrolled student. Identity is `id`; `name` is carried for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
}

impl Student {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Sample folder name, `{id}_{name}`.
    pub fn folder_name(&self) -> String {
        format!("{}_{}", self.id, self.name)
    }

    /// Parse a sample folder name back into a student.
    ///
    /// The first underscore separates id from name, so names may contain
    /// underscores themselves. Returns `None` when there is no separator or
    /// either half is blank.
    pub fn from_folder_name(folder: &str) -> Option<Self> {
        let (id, name) = folder.split_once('_')?;
        let (id, name) = (id.trim(), name.trim());
        if id.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(id, name))
    }
}

/// Rectangular face region in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Intersect the region with a `width × height` frame.
    ///
    /// Returns `None` if nothing of the region lies inside the frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceRegion> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(FaceRegion::new(self.x, self.y, w, h))
    }
}

/// Classifier output: a label id and a distance score (lower = more similar).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: u32,
    pub distance: f64,
}

/// Dense zero-based label ids mapped to the students they were assigned to
/// during one training run. Not stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelMap(BTreeMap<u32, Student>);

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next dense label id to `student` and return it.
    pub fn push(&mut self, student: Student) -> u32 {
        let label = self.0.len() as u32;
        self.0.insert(label, student);
        label
    }

    pub fn get(&self, label: u32) -> Option<&Student> {
        self.0.get(&label)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Student)> {
        self.0.iter().map(|(label, student)| (*label, student))
    }
}

/// One attendance event, persisted as a ledger row `id,name,date,time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub name: String,
    pub date: String,
    pub time: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_name_roundtrip() {
        let student = Student::new("101", "Alice");
        assert_eq!(student.folder_name(), "101_Alice");
        assert_eq!(Student::from_folder_name("101_Alice"), Some(student));
    }

    #[test]
    fn test_folder_name_splits_on_first_underscore() {
        let student = Student::from_folder_name("7_Mary_Jane").unwrap();
        assert_eq!(student.id, "7");
        assert_eq!(student.name, "Mary_Jane");
    }

    #[test]
    fn test_folder_name_rejects_malformed() {
        assert!(Student::from_folder_name("nounderscore").is_none());
        assert!(Student::from_folder_name("_Alice").is_none());
        assert!(Student::from_folder_name("101_").is_none());
        assert!(Student::from_folder_name(" _ ").is_none());
    }

    #[test]
    fn test_folder_name_trims_halves() {
        let student = Student::from_folder_name(" 42 _ Bob ").unwrap();
        assert_eq!(student, Student::new("42", "Bob"));
    }

    #[test]
    fn test_region_clamp_inside() {
        let region = FaceRegion::new(10, 10, 50, 50);
        assert_eq!(region.clamp_to(100, 100), Some(region));
    }

    #[test]
    fn test_region_clamp_overhang() {
        let region = FaceRegion::new(80, 90, 50, 50);
        assert_eq!(region.clamp_to(100, 100), Some(FaceRegion::new(80, 90, 20, 10)));
    }

    #[test]
    fn test_region_clamp_outside() {
        assert!(FaceRegion::new(100, 0, 10, 10).clamp_to(100, 100).is_none());
        assert!(FaceRegion::new(0, 0, 0, 10).clamp_to(100, 100).is_none());
    }

    #[test]
    fn test_label_map_dense_ids() {
        let mut labels = LabelMap::new();
        assert_eq!(labels.push(Student::new("1", "A")), 0);
        assert_eq!(labels.push(Student::new("2", "B")), 1);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get(1).map(|s| s.id.as_str()), Some("2"));
        assert!(labels.get(2).is_none());
    }

    #[test]
    fn test_label_map_json_keys() {
        let mut labels = LabelMap::new();
        labels.push(Student::new("101", "Alice"));
        let json = serde_json::to_string(&labels).unwrap();
        assert_eq!(json, r#"{"0":{"id":"101","name":"Alice"}}"#);
        let back: LabelMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, labels);
    }
}
