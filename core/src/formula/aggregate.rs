//! Whole-roster computation: ranks and problem set / category totals.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::Gradebook;
use crate::formula::ast::{Expr, FormulaRef, Function};
use crate::formula::evaluator::{evaluate, EvalEnv};
use crate::formula::value::Value;
use crate::roster::{GradeSource, Student, StudentId};

/// One formula's value for every student in a roster.
pub type StudentValues = HashMap<StudentId, Value>;

type Cell = Arc<OnceCell<Arc<StudentValues>>>;

/// Write-once aggregate results, keyed by node identity. Holding the node
/// keeps its address from being reused while the cache lives.
#[derive(Default)]
pub(crate) struct AggregateCache {
    cells: Mutex<HashMap<usize, (FormulaRef, Cell)>>,
}

impl AggregateCache {
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cells.lock().len()
    }

    fn cell(&self, formula: &FormulaRef) -> Cell {
        let mut cells = self.cells.lock();
        let (_, cell) = cells
            .entry(Arc::as_ptr(formula) as usize)
            .or_insert_with(|| (formula.clone(), Cell::default()));
        cell.clone()
    }
}

/// Values of `formula` for every student in the environment's roster,
/// computed once per node and environment.
pub fn compute_all(formula: &FormulaRef, env: &EvalEnv<'_>) -> Arc<StudentValues> {
    let cell = env.cache.cell(formula);
    cell.get_or_init(|| {
        let values = match formula.expr() {
            Expr::Function {
                func: Function::Rank,
                args,
            } => args.first().map(|arg| rank(arg, env)).unwrap_or_default(),
            _ => env
                .roster()
                .iter()
                .map(|s| (s.id, evaluate(formula, env, s)))
                .collect(),
        };
        debug!(
            key = formula.canonical_key(),
            students = env.roster().len(),
            "computed aggregate values"
        );
        Arc::new(values)
    })
    .clone()
}

/// Competition ranks of `inner`, highest value first. Dropped students and
/// students without a value hold no rank.
fn rank(inner: &FormulaRef, env: &EvalEnv<'_>) -> StudentValues {
    let values = compute_all(inner, env);
    let mut ranks = StudentValues::new();
    let mut ranked = Vec::new();
    for s in env.roster().iter() {
        match values.get(&s.id).and_then(Value::as_number) {
            Some(v) if !s.dropped => ranked.push((-v, s.id)),
            _ => {
                ranks.insert(s.id, Value::Null);
            }
        }
    }
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

    let (Some(first), Some(last)) = (ranked.first(), ranked.last()) else {
        return ranks;
    };
    let epsilon = f64::min(0.001, (last.0 - first.0) / 1000.0);
    let mut rank = 1;
    let mut previous: Option<f64> = None;
    for (i, (v, id)) in ranked.iter().enumerate() {
        let tied = previous.is_some_and(|p| *v == p || *v - p < epsilon);
        if !tied {
            rank = i + 1;
        }
        previous = Some(*v);
        ranks.insert(*id, Value::Number(rank as f64));
    }
    ranks
}

/// Sum of a student's problem set entries, or its percentage of the
/// achievable maximum when `normalized`.
pub fn pset_total(
    book: &Gradebook,
    grades: &dyn GradeSource,
    student: &Student,
    pset: &str,
    no_extra: bool,
    normalized: bool,
) -> Value {
    let Some(pset) = book.pset(pset) else {
        return Value::Null;
    };
    let total = pset
        .grades()
        .filter(|entry| entry.in_total(no_extra))
        .filter_map(|entry| grades.grade(student, pset, entry))
        .filter(|v| v.is_finite())
        .fold(None, |sum: Option<f64>, v| Some(sum.unwrap_or(0.0) + v));
    match (total, normalized) {
        (None, _) => Value::Null,
        (Some(total), false) => Value::number(total),
        (Some(total), true) => {
            let max = pset.max_total();
            if max > 0.0 {
                Value::number(100.0 * total / max)
            } else {
                Value::Null
            }
        }
    }
}

/// Total over a category's problem sets. Normalized totals weight each
/// problem set's percentage by its weight factor; without usable factors
/// the raw totals are summed.
pub fn category_total(
    book: &Gradebook,
    grades: &dyn GradeSource,
    student: &Student,
    category: &str,
    no_extra: bool,
    normalized: bool,
) -> Value {
    let Some(category) = book.category(category) else {
        return Value::Null;
    };
    let mut total: Option<f64> = None;
    for pset in category.psets() {
        let contribution = match category.weight_factor(pset).filter(|_| normalized) {
            Some(factor) if factor > 0.0 => {
                pset_total(book, grades, student, pset, no_extra, true)
                    .as_number()
                    .map(|v| v * factor)
            }
            Some(_) => None,
            None => pset_total(book, grades, student, pset, no_extra, false).as_number(),
        };
        if let Some(c) = contribution {
            *total.get_or_insert(0.0) += c;
        }
    }
    total.map_or(Value::Null, Value::number)
}
