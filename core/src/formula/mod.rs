//! Grade formula engine.
//!
//! Formulas are compiled against a [`Gradebook`] into shared, immutable
//! trees and evaluated per student against a roster and a grade source.
//!
//! # Supported Grammar
//!
//! - Arithmetic: `+ - * / % **`, unary `-`, `log`, `log10`, `ln`, `lg`, `exp`
//! - Comparison: `== != < <= > >=` (also `=`, `≠`, `≤`, `≥`)
//! - Boolean: `! && || ^^`, null-aware `??` and `+?`
//! - Ternary: `cond ? a : b`
//! - Functions: `min(...)`, `max(...)`, `rank(x)`, `rlookup(x, t1, t2, ...)`
//! - References: `tests`, `pset1.tests`, `pset1.total_norm`, `psets_raw`,
//!   `self.entry`, `global.name`, named formulas
//! - Literals: numbers, letter grades (`B+`, or `letter(88)` by encoding),
//!   `@2024-05-01T12:00`, `now`, `pi`, `null`, `true`, `false`, predicates
//!   `is:x`, `year:1-4`, `namematch:text`, `namematch:"two words"`
//!
//! Nesting is limited, and a formula nested too deeply fails to compile
//! instead of exhausting the stack.
//!
//! # Example
//!
//! ```
//! use gradebook_compute::config::Gradebook;
//! use gradebook_compute::formula::{FormulaRegistry, Value};
//! use gradebook_compute::roster::{GradeTable, Roster, Student, StudentId};
//!
//! let book = Gradebook::from_json(
//!     r#"{ "psets": [ { "key": "pset1",
//!            "grades": [ { "key": "tests", "max": 40 },
//!                        { "key": "style", "max": 10 } ] } ] }"#,
//! )
//! .unwrap();
//! let registry = FormulaRegistry::new();
//! let formula = book.compile(&registry, "pset1.tests + pset1.style").unwrap();
//!
//! let roster = Roster::new(vec![Student { id: StudentId(7), ..Student::default() }]);
//! let grades = GradeTable::new()
//!     .with(7, "pset1", "tests", 32.0)
//!     .with(7, "pset1", "style", 8.0);
//! let values = book.evaluate_roster(&formula, &roster, &grades);
//! assert_eq!(values, vec![(StudentId(7), Value::Number(40.0))]);
//! ```

pub mod aggregate;
pub mod ast;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod query;
pub mod registry;
pub mod search;
pub mod value;

pub use aggregate::{compute_all, StudentValues};
pub use ast::{BinaryOp, Expr, Formula, FormulaRef, Function, NullableOp, RelationOp, UnaryOp};
pub use evaluator::{evaluate, evaluate_submission, EvalEnv};
pub use parser::Compiler;
pub use query::{SearchQuery, SearchTerm};
pub use registry::FormulaRegistry;
pub use search::SearchCompiler;
pub use value::{Value, ValueKind};

use tracing::debug;

use crate::config::Gradebook;
use crate::error::CompileError;
use crate::roster::{GradeSource, Roster, StudentId};

/// Outcome of compiling every configured formula.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    /// Labels of the formulas that compiled.
    pub compiled: Vec<String>,
    pub errors: Vec<CompileError>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Value of `formula` for every student in `env`'s roster, in roster order.
///
/// A formula that is not cacheable depends on the whole roster, so it is
/// computed once through the environment's aggregate cache and read back.
pub fn evaluate_all(formula: &FormulaRef, env: &EvalEnv<'_>) -> Vec<(StudentId, Value)> {
    if formula.is_cacheable() {
        return env
            .roster()
            .iter()
            .map(|s| (s.id, evaluate(formula, env, s)))
            .collect();
    }
    let values = compute_all(formula, env);
    env.roster()
        .iter()
        .map(|s| (s.id, values.get(&s.id).copied().unwrap_or(Value::Null)))
        .collect()
}

impl Gradebook {
    /// Compile a standalone formula.
    pub fn compile(
        &self,
        registry: &FormulaRegistry,
        source: &str,
    ) -> Result<FormulaRef, Vec<CompileError>> {
        Compiler::new(self, registry).compile(source)
    }

    /// Compile every named formula and formula grade entry. A broken
    /// formula is reported without hiding problems in the others.
    pub fn check_all(&self, registry: &FormulaRegistry) -> CheckReport {
        let compiler = Compiler::new(self, registry);
        let mut report = CheckReport::default();
        let mut record = |label: String, result: Result<FormulaRef, Vec<CompileError>>| match result {
            Ok(_) => report.compiled.push(label),
            Err(errors) => report.errors.extend(errors),
        };
        for formula in self.formulas() {
            record(formula.name.clone(), compiler.compile_named(formula));
        }
        for pset in self.psets() {
            for entry in pset.grades().filter(|e| e.is_formula()) {
                record(
                    format!("{}.{}", pset.key, entry.key),
                    compiler.compile_entry(pset, entry),
                );
            }
        }
        debug!(
            compiled = report.compiled.len(),
            errors = report.errors.len(),
            "checked configured formulas"
        );
        report
    }

    /// Students matching search `query`, in roster order. Bare keywords
    /// resolve against `pset` first when it names a problem set.
    pub fn search(
        &self,
        registry: &FormulaRegistry,
        query: &str,
        pset: Option<&str>,
        roster: &Roster,
        grades: &dyn GradeSource,
    ) -> Vec<StudentId> {
        let mut compiler = SearchCompiler::new(self, registry);
        if let Some(pset) = pset.and_then(|p| self.pset_by_key_or_title(p)) {
            compiler = compiler.in_pset(pset);
        }
        let formula = compiler.compile_str(query);
        let env = EvalEnv::new(self, roster, grades);
        evaluate_all(&formula, &env)
            .into_iter()
            .filter(|(_, v)| v.is_truthy())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn evaluate_roster(
        &self,
        formula: &FormulaRef,
        roster: &Roster,
        grades: &dyn GradeSource,
    ) -> Vec<(StudentId, Value)> {
        evaluate_all(formula, &EvalEnv::new(self, roster, grades))
    }
}
