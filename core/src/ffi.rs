//! Foreign-function surface for host applications.

use std::sync::Arc;

use chrono::DateTime;

use crate::config::Gradebook;
use crate::error::{CompileError, ConfigError};
use crate::formula::{evaluate_all, Compiler, EvalEnv, FormulaRegistry, Value};
use crate::roster::{GradeTable, Roster};

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum FfiError {
    #[error("{message}")]
    Config { message: String },

    #[error("{message}")]
    Compile { message: String },

    #[error("invalid input: {message}")]
    Input { message: String },
}

impl From<ConfigError> for FfiError {
    fn from(e: ConfigError) -> Self {
        FfiError::Config {
            message: e.to_string(),
        }
    }
}

impl From<Vec<CompileError>> for FfiError {
    fn from(errors: Vec<CompileError>) -> Self {
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        FfiError::Compile { message }
    }
}

impl From<serde_json::Error> for FfiError {
    fn from(e: serde_json::Error) -> Self {
        FfiError::Input {
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FormulaIssue {
    pub label: String,
    pub message: String,
    pub start: u32,
    pub end: u32,
}

/// A configured named formula and its compiled form.
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FormulaInfo {
    pub name: String,
    pub expression: String,
    pub description: Option<String>,
    /// Fully parenthesized form, `None` when the formula does not compile.
    pub canonical: Option<String>,
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct StudentResult {
    pub student_id: u64,
    /// Display text, `None` for a null result.
    pub text: Option<String>,
    /// Numeric encoding of the result, if it has one.
    pub number: Option<f64>,
}

/// A loaded gradebook together with its compiled formula cache.
#[derive(Debug, uniffi::Object)]
pub struct GradebookHandle {
    book: Gradebook,
    registry: FormulaRegistry,
}

#[uniffi::export]
impl GradebookHandle {
    #[uniffi::constructor]
    pub fn new(config_json: String) -> Result<Arc<Self>, FfiError> {
        Ok(Arc::new(GradebookHandle {
            book: Gradebook::from_json(&config_json)?,
            registry: FormulaRegistry::new(),
        }))
    }

    pub fn check_formulas(&self) -> Vec<FormulaIssue> {
        self.book
            .check_all(&self.registry)
            .errors
            .into_iter()
            .map(|e| FormulaIssue {
                message: e.message(),
                start: e.span.start as u32,
                end: e.span.end as u32,
                label: e.label,
            })
            .collect()
    }

    /// Fully parenthesized form of `source`, with letter grades named
    /// through the gradebook's table.
    pub fn canonical_formula(&self, source: String) -> Result<String, FfiError> {
        let formula = self.book.compile(&self.registry, &source)?;
        Ok(formula.source(self.book.letters()).to_string())
    }

    /// Every configured named formula, in configuration order.
    pub fn named_formulas(&self) -> Vec<FormulaInfo> {
        let compiler = Compiler::new(&self.book, &self.registry);
        self.book
            .formulas()
            .map(|formula| FormulaInfo {
                name: formula.name.clone(),
                expression: formula.expression.clone(),
                description: formula.description.clone(),
                canonical: compiler
                    .compile_named(formula)
                    .ok()
                    .map(|f| f.source(self.book.letters()).to_string()),
            })
            .collect()
    }

    /// Evaluate `source` for every student, at `now` (Unix seconds) when given.
    pub fn evaluate(
        &self,
        source: String,
        roster_json: String,
        grades_json: String,
        now: Option<i64>,
    ) -> Result<Vec<StudentResult>, FfiError> {
        let formula = self.book.compile(&self.registry, &source)?;
        let roster = Roster::from_json(&roster_json)?;
        let grades = GradeTable::from_json(&grades_json)?;
        let mut env = EvalEnv::new(&self.book, &roster, &grades);
        if let Some(now) = now {
            let now = DateTime::from_timestamp(now, 0).ok_or_else(|| FfiError::Input {
                message: format!("timestamp {now} out of range"),
            })?;
            env = env.at(now);
        }
        Ok(evaluate_all(&formula, &env)
            .into_iter()
            .map(|(id, value)| StudentResult {
                student_id: id.0,
                text: (!value.is_null()).then(|| value.render(self.book.letters())),
                number: numeric(value),
            })
            .collect())
    }

    /// Ids of the students matching search `query`.
    pub fn search(
        &self,
        query: String,
        pset: Option<String>,
        roster_json: String,
        grades_json: String,
    ) -> Result<Vec<u64>, FfiError> {
        let roster = Roster::from_json(&roster_json)?;
        let grades = GradeTable::from_json(&grades_json)?;
        Ok(self
            .book
            .search(&self.registry, &query, pset.as_deref(), &roster, &grades)
            .into_iter()
            .map(|id| id.0)
            .collect())
    }

    /// Drop every cached formula.
    pub fn reset_cache(&self) {
        self.registry.clear();
    }
}

fn numeric(value: Value) -> Option<f64> {
    match value {
        Value::Null => None,
        Value::Boolean(b) => Some(if b { 1.0 } else { 0.0 }),
        Value::Number(n) | Value::Letter(n) => Some(n),
        Value::Time(t) | Value::Duration(t) => Some(t as f64),
    }
}
