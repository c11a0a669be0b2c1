//! Per-student evaluation of compiled formulas.
//!
//! Missing data never fails an evaluation: absent grades, division by zero
//! and out-of-domain math all produce [`Value::Null`].

use chrono::{DateTime, Utc};

use crate::config::Gradebook;
use crate::formula::aggregate::{self, AggregateCache};
use crate::formula::ast::{Expr, FormulaRef, Function, Predicate, Status, YearSpan};
use crate::formula::value::Value;
use crate::roster::{GradeSource, Roster, Student};

/// Everything a formula can observe during one computation pass.
///
/// Whole-roster results (such as `rank`) are memoized per node for the
/// lifetime of the environment, so build a fresh one whenever the roster or
/// grades change.
pub struct EvalEnv<'a> {
    book: &'a Gradebook,
    roster: &'a Roster,
    grades: &'a dyn GradeSource,
    now: i64,
    pub(crate) cache: AggregateCache,
}

impl<'a> EvalEnv<'a> {
    pub fn new(book: &'a Gradebook, roster: &'a Roster, grades: &'a dyn GradeSource) -> Self {
        EvalEnv {
            book,
            roster,
            grades,
            now: Utc::now().timestamp(),
            cache: AggregateCache::default(),
        }
    }

    /// Fix the value of `now`.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now.timestamp();
        self
    }

    pub fn book(&self) -> &'a Gradebook {
        self.book
    }

    pub fn roster(&self) -> &'a Roster {
        self.roster
    }

    pub fn grades(&self) -> &'a dyn GradeSource {
        self.grades
    }

    pub fn now(&self) -> i64 {
        self.now
    }
}

/// Evaluate `formula` for one student.
pub fn evaluate(formula: &FormulaRef, env: &EvalEnv<'_>, student: &Student) -> Value {
    Evaluation {
        env,
        student,
        grades: env.grades,
    }
    .eval(formula)
}

/// Evaluate `formula` for one student, reading grade entries from
/// `submission` instead of the environment's grade source.
pub fn evaluate_submission(
    formula: &FormulaRef,
    env: &EvalEnv<'_>,
    student: &Student,
    submission: &dyn GradeSource,
) -> Value {
    Evaluation {
        env,
        student,
        grades: submission,
    }
    .eval(formula)
}

struct Evaluation<'e, 'a> {
    env: &'e EvalEnv<'a>,
    student: &'e Student,
    grades: &'e dyn GradeSource,
}

impl Evaluation<'_, '_> {
    fn eval(&self, formula: &FormulaRef) -> Value {
        let book = self.env.book;
        match formula.expr() {
            Expr::Constant(v) => *v,
            Expr::GradeEntry { pset, entry, kind } => {
                let Some(pset) = book.pset(pset) else {
                    return Value::Null;
                };
                let Some(entry) = pset.grade(entry) else {
                    return Value::Null;
                };
                self.grades
                    .grade(self.student, pset, entry)
                    .map_or(Value::Null, |v| Value::from_raw(*kind, v))
            }
            Expr::PsetTotal {
                pset,
                no_extra,
                normalized,
            } => aggregate::pset_total(book, self.grades, self.student, pset, *no_extra, *normalized),
            Expr::CategoryTotal {
                category,
                no_extra,
                normalized,
            } => aggregate::category_total(
                book,
                self.grades,
                self.student,
                category,
                *no_extra,
                *normalized,
            ),
            Expr::Unary { op, expr } => op.apply(self.eval(expr)),
            Expr::Not(expr) => Value::Boolean(!self.eval(expr).is_truthy()),
            Expr::Binary { op, left, right } => op.apply(self.eval(left), self.eval(right)),
            Expr::Relation { op, left, right } => op.apply(self.eval(left), self.eval(right)),
            Expr::Nullable { op, left, right } => op.apply(self.eval(left), || self.eval(right)),
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.eval(condition).is_truthy() {
                    self.eval(then_expr)
                } else {
                    self.eval(else_expr)
                }
            }
            Expr::Function { func, args } => match func {
                Function::Min | Function::Max => Function::extreme(
                    *func == Function::Max,
                    args.iter().map(|arg| self.eval(arg)),
                ),
                Function::Rank => aggregate::compute_all(formula, self.env)
                    .get(&self.student.id)
                    .copied()
                    .unwrap_or(Value::Null),
                Function::Rlookup(thresholds) => {
                    let Some(v) = args.first().and_then(|arg| self.eval(arg).as_number()) else {
                        return Value::Null;
                    };
                    args.get(Function::rlookup_branch(thresholds, v))
                        .map_or(Value::Null, |arg| self.eval(arg))
                }
            },
            Expr::Predicate(predicate) => test_predicate(predicate, self.student),
            Expr::Now => Value::Time(self.env.now),
            Expr::Time(t) => Value::Time(*t),
            Expr::Error => Value::Null,
        }
    }
}

fn test_predicate(predicate: &Predicate, student: &Student) -> Value {
    match predicate {
        Predicate::Is(status) => match status {
            Status::Extension => Value::Boolean(student.extension),
            Status::College => Value::Boolean(!student.extension),
            Status::Dropped => Value::Boolean(student.dropped),
            Status::Unknown => Value::Null,
        },
        Predicate::Year(spans) => {
            let year = student.year.trim();
            let numeric: Option<u32> = year
                .bytes()
                .all(|b| b.is_ascii_digit())
                .then(|| year.parse().ok())
                .flatten();
            Value::Boolean(spans.iter().any(|span| match span {
                YearSpan::Range(lo, hi) => numeric.is_some_and(|y| *lo <= y && y <= *hi),
                YearSpan::Named(name) => year.eq_ignore_ascii_case(name),
            }))
        }
        Predicate::NameMatch(pattern) => {
            let pattern = pattern.to_lowercase();
            let matches = |field: &str| field.to_lowercase().contains(&pattern);
            Value::Boolean(if student.is_anonymous {
                matches(&student.anon_username)
            } else {
                matches(&student.first_name)
                    || matches(&student.last_name)
                    || matches(&student.email)
                    || student.username.as_deref().is_some_and(matches)
            })
        }
    }
}
