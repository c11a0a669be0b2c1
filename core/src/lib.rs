pub mod config;
pub mod error;
pub mod ffi;
pub mod formula;
pub mod roster;

uniffi::setup_scaffolding!();

pub use config::{Category, GradeEntry, Gradebook, GradebookConfig, LetterTable, NamedFormula, Pset};
pub use error::{CompileError, ConfigError, FormulaError};
pub use ffi::{FfiError, FormulaInfo, FormulaIssue, GradebookHandle, StudentResult};
pub use formula::{CheckReport, FormulaRef, FormulaRegistry, Value, ValueKind};
pub use roster::{GradeSource, GradeTable, Roster, Student, StudentId};
