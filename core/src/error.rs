use std::fmt;
use std::ops::Range;

use thiserror::Error;

/// What went wrong while compiling a grade formula.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("empty expression")]
    EmptyExpression,

    #[error("Undefined problem set or category `{0}`")]
    UndefinedReference(String),

    #[error("invalid argument count for {function}: expected {expected}, got {got}")]
    InvalidArgCount {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("{0}")]
    RlookupArguments(String),

    #[error("invalid time `{0}`")]
    InvalidTime(String),

    #[error("References invalid formula `{0}`")]
    InvalidFormulaReference(String),

    #[error("circular reference to `{0}`")]
    CircularReference(String),

    #[error("parse error: formula too deeply nested")]
    TooDeeplyNested,
}

impl FormulaError {
    /// Whether the error depends on the chain of references that led to
    /// the failing formula rather than on the formula alone.
    pub fn depends_on_path(&self) -> bool {
        matches!(
            self,
            FormulaError::CircularReference(_) | FormulaError::TooDeeplyNested
        )
    }
}

/// A compile error anchored to a byte range of the formula source.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub error: FormulaError,
    pub span: Range<usize>,
    /// Names the formula being compiled, e.g. `final` or `pset1.combined`.
    pub label: String,
}

impl CompileError {
    pub fn new(error: FormulaError, span: Range<usize>, label: impl Into<String>) -> Self {
        Self {
            error,
            span,
            label: label.into(),
        }
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.error)
    }
}

impl std::error::Error for CompileError {}

/// Error loading or validating gradebook configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration format error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("problem set key format error: `{0}`")]
    PsetKey(String),

    #[error("problem set `{0}` reused")]
    DuplicatePset(String),

    #[error("grade entry key format error: `{pset}.{key}`")]
    EntryKey { pset: String, key: String },

    #[error("grade `{pset}.{key}` reused")]
    DuplicateEntry { pset: String, key: String },

    #[error("formula `{0}` reused")]
    DuplicateFormula(String),

    #[error("formula grade entry `{pset}.{key}` has no expression")]
    MissingExpression { pset: String, key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formula_error_display() {
        let err = FormulaError::ParseError("unexpected character `$`".to_string());
        assert_eq!(err.to_string(), "parse error: unexpected character `$`");

        let err = FormulaError::UndefinedReference("psetx".to_string());
        assert_eq!(err.to_string(), "Undefined problem set or category `psetx`");

        let err = FormulaError::InvalidArgCount {
            function: "rank".to_string(),
            expected: "1".to_string(),
            got: 2,
        };
        assert_eq!(
            err.to_string(),
            "invalid argument count for rank: expected 1, got 2"
        );

        let err = FormulaError::TooDeeplyNested;
        assert_eq!(err.to_string(), "parse error: formula too deeply nested");
        assert!(err.depends_on_path());
        assert!(!FormulaError::EmptyExpression.depends_on_path());
    }

    #[test]
    fn test_compile_error_display() {
        let err = CompileError::new(
            FormulaError::InvalidFormulaReference("midterm".to_string()),
            4..11,
            "final",
        );
        assert_eq!(
            err.to_string(),
            "final: References invalid formula `midterm`"
        );
        assert_eq!(err.span, 4..11);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::DuplicateEntry {
            pset: "pset1".to_string(),
            key: "tests".to_string(),
        };
        assert_eq!(err.to_string(), "grade `pset1.tests` reused");
    }
}
