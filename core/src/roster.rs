//! Student records and grade lookups consumed by formula evaluation.
//!
//! Grade storage lives outside this crate; evaluation only sees a roster
//! snapshot and a [`GradeSource`] answering per-student, per-entry lookups.

use std::collections::HashMap;

use serde::Deserialize;

use crate::config::{GradeEntry, Pset};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct StudentId(pub u64);

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Student {
    pub id: StudentId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    /// Repository-host username.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub anon_username: String,
    /// Whether names are hidden from the current viewer.
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub extension: bool,
    #[serde(default)]
    pub dropped: bool,
    #[serde(default)]
    pub year: String,
}

/// Read-only roster snapshot used for one computation pass.
#[derive(Clone, Debug, Default)]
pub struct Roster {
    students: Vec<Student>,
}

impl Roster {
    pub fn new(students: Vec<Student>) -> Self {
        Roster { students }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Roster::new(serde_json::from_str(json)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Student> {
        self.students.iter()
    }

    pub fn get(&self, id: StudentId) -> Option<&Student> {
        self.students.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }
}

/// Trait for providing stored grade values during evaluation.
pub trait GradeSource {
    fn grade(&self, student: &Student, pset: &Pset, entry: &GradeEntry) -> Option<f64>;
}

impl<F> GradeSource for F
where
    F: Fn(&Student, &Pset, &GradeEntry) -> Option<f64>,
{
    fn grade(&self, student: &Student, pset: &Pset, entry: &GradeEntry) -> Option<f64> {
        self(student, pset, entry)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GradeRecord {
    pub student: StudentId,
    pub pset: String,
    pub entry: String,
    pub value: f64,
}

/// In-memory grade store keyed by student, problem set key and entry key.
#[derive(Clone, Debug, Default)]
pub struct GradeTable {
    values: HashMap<(StudentId, String, String), f64>,
}

impl GradeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let records: Vec<GradeRecord> = serde_json::from_str(json)?;
        let mut table = GradeTable::new();
        for r in records {
            table.set(r.student, &r.pset, &r.entry, r.value);
        }
        Ok(table)
    }

    pub fn set(&mut self, student: StudentId, pset: &str, entry: &str, value: f64) {
        self.values
            .insert((student, pset.to_string(), entry.to_string()), value);
    }

    pub fn with(mut self, student: u64, pset: &str, entry: &str, value: f64) -> Self {
        self.set(StudentId(student), pset, entry, value);
        self
    }
}

impl GradeSource for GradeTable {
    fn grade(&self, student: &Student, pset: &Pset, entry: &GradeEntry) -> Option<f64> {
        self.values
            .get(&(student.id, pset.key.clone(), entry.key.clone()))
            .copied()
    }
}
