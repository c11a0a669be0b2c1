//! Formula expression tree.
//!
//! Nodes are immutable once built and shared through [`FormulaRef`]. Each
//! node records its inferred [`ValueKind`], whether a per-student result may
//! be cached, and its canonical serialization, which doubles as the
//! deduplication key in the formula registry.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::config::LetterTable;
use crate::formula::lexer;
use crate::formula::value::{self, format_number, Value, ValueKind};

pub type FormulaRef = Arc<Formula>;

/// Precedence of prefix `-`, `+` and `!`.
pub const UNARY_PRECEDENCE: u8 = 12;
/// Precedence of `?:`.
pub const TERNARY_PRECEDENCE: u8 = 0;

/// Prefix math operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Log10,
    Ln,
    Lg,
    Exp,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Log10 => "log10",
            UnaryOp::Ln => "ln",
            UnaryOp::Lg => "lg",
            UnaryOp::Exp => "exp",
        }
    }

    pub fn apply(&self, v: Value) -> Value {
        let Some(x) = v.as_number() else {
            return Value::Null;
        };
        let log = |f: fn(f64) -> f64| if x > 0.0 { Value::number(f(x)) } else { Value::Null };
        match self {
            UnaryOp::Neg => match v {
                Value::Duration(d) => Value::Duration(-d),
                _ => Value::number(-x),
            },
            UnaryOp::Log10 => log(f64::log10),
            UnaryOp::Ln => log(f64::ln),
            UnaryOp::Lg => log(f64::log2),
            UnaryOp::Exp => Value::number(x.exp()),
        }
    }
}

/// Arithmetic operators. Any null operand makes the result null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

impl BinaryOp {
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Pow => 13,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 11,
            BinaryOp::Add | BinaryOp::Sub => 10,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Pow => "**",
        }
    }

    pub fn apply(&self, a: Value, b: Value) -> Value {
        match self {
            BinaryOp::Add => value::add(a, b),
            BinaryOp::Sub => value::sub(a, b),
            BinaryOp::Mul => value::mul(a, b),
            BinaryOp::Div => value::div(a, b),
            BinaryOp::Rem => value::rem(a, b),
            BinaryOp::Pow => value::pow(a, b),
        }
    }
}

/// Comparison operators. Ordering comparisons with a null operand are null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelationOp {
    pub fn precedence(&self) -> u8 {
        match self {
            RelationOp::Eq | RelationOp::Ne => 7,
            _ => 8,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            RelationOp::Eq => "==",
            RelationOp::Ne => "!=",
            RelationOp::Lt => "<",
            RelationOp::Le => "<=",
            RelationOp::Gt => ">",
            RelationOp::Ge => ">=",
        }
    }

    pub fn apply(&self, a: Value, b: Value) -> Value {
        use std::cmp::Ordering::*;
        match self {
            RelationOp::Eq => Value::Boolean(value::loose_eq(a, b)),
            RelationOp::Ne => Value::Boolean(!value::loose_eq(a, b)),
            _ => match value::compare(a, b) {
                None => Value::Null,
                Some(ord) => Value::Boolean(match self {
                    RelationOp::Lt => ord == Less,
                    RelationOp::Le => ord != Greater,
                    RelationOp::Gt => ord == Greater,
                    _ => ord != Less,
                }),
            },
        }
    }
}

/// Operators with their own null handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NullableOp {
    /// `+?`: null only if both sides are null, otherwise null counts as zero.
    AddOrZero,
    /// `??`: left unless it is null.
    Coalesce,
    And,
    Or,
    Xor,
}

impl NullableOp {
    pub fn precedence(&self) -> u8 {
        match self {
            NullableOp::AddOrZero => 10,
            NullableOp::And => 3,
            NullableOp::Or | NullableOp::Xor => 2,
            NullableOp::Coalesce => 1,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            NullableOp::AddOrZero => "+?",
            NullableOp::Coalesce => "??",
            NullableOp::And => "&&",
            NullableOp::Or => "||",
            NullableOp::Xor => "^^",
        }
    }

    /// `right` is only called when the operator needs it.
    pub fn apply(&self, left: Value, right: impl FnOnce() -> Value) -> Value {
        match self {
            NullableOp::AddOrZero => {
                let right = right();
                if left.is_null() && right.is_null() {
                    Value::Null
                } else {
                    Value::number(left.as_number().unwrap_or(0.0) + right.as_number().unwrap_or(0.0))
                }
            }
            NullableOp::Coalesce => {
                if left.is_null() {
                    right()
                } else {
                    left
                }
            }
            NullableOp::And => {
                if left.is_truthy() {
                    right()
                } else {
                    left
                }
            }
            NullableOp::Or => {
                if left.is_truthy() {
                    left
                } else {
                    right()
                }
            }
            NullableOp::Xor => {
                let right = right();
                if left.is_null() && right.is_null() {
                    Value::Null
                } else {
                    Value::Boolean(left.is_truthy() != right.is_truthy())
                }
            }
        }
    }
}

/// Built-in variadic functions.
#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    Min,
    Max,
    /// Competition rank across the roster; 1 is the highest value.
    Rank,
    /// `rlookup(v, r0, t1, r1, t2, r2, ...)` with the thresholds `t1 <= t2 <= ...`.
    Rlookup(Vec<f64>),
}

impl Function {
    pub fn name(&self) -> &'static str {
        match self {
            Function::Min => "min",
            Function::Max => "max",
            Function::Rank => "rank",
            Function::Rlookup(_) => "rlookup",
        }
    }

    /// Smallest (or largest) non-null value, keeping its tag.
    pub fn extreme(is_max: bool, values: impl IntoIterator<Item = Value>) -> Value {
        let mut cur = Value::Null;
        for v in values {
            let better = match (cur.as_number(), v.as_number()) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(c), Some(x)) => {
                    if is_max {
                        c < x
                    } else {
                        c > x
                    }
                }
            };
            if better {
                cur = v;
            }
        }
        cur
    }

    /// Index of the `rlookup` argument selected for `v`.
    pub fn rlookup_branch(thresholds: &[f64], v: f64) -> usize {
        let i = thresholds.iter().take_while(|t| v >= **t).count();
        1 + 2 * i
    }
}

/// Enrollment status tested by `is:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Extension,
    College,
    Dropped,
    /// Unrecognized status; evaluates to null.
    Unknown,
}

impl Status {
    pub fn parse(text: &str) -> Status {
        match text {
            "x" | "X" => Status::Extension,
            "college" => Status::College,
            "dropped" => Status::Dropped,
            _ => Status::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Status::Extension => "x",
            Status::College => "college",
            Status::Dropped => "dropped",
            Status::Unknown => "false",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum YearSpan {
    Range(u32, u32),
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Is(Status),
    Year(Vec<YearSpan>),
    NameMatch(String),
}

impl Predicate {
    /// Parse a `year:` argument such as `1-4,G`. Malformed text yields an
    /// empty span list, which matches nobody.
    pub fn year(text: &str) -> Predicate {
        let mut spans = Vec::new();
        for part in text.split(',') {
            let part = part.trim();
            let bounds: Vec<&str> = part.split(['-', '–', '—']).collect();
            let span = match bounds.as_slice() {
                [lo, hi] => match (lo.parse(), hi.parse()) {
                    (Ok(lo), Ok(hi)) => Some(YearSpan::Range(lo, hi)),
                    _ => None,
                },
                [one] if !one.is_empty() && one.chars().all(|c| c.is_ascii_digit()) => {
                    one.parse().ok().map(|y| YearSpan::Range(y, y))
                }
                [one] if !one.is_empty() && one.chars().all(|c| c.is_ascii_alphanumeric()) => {
                    Some(YearSpan::Named(one.to_uppercase()))
                }
                _ => None,
            };
            match span {
                Some(span) => spans.push(span),
                None => return Predicate::Year(Vec::new()),
            }
        }
        Predicate::Year(spans)
    }

    fn serialize(&self) -> String {
        match self {
            Predicate::Is(status) => format!("is:{}", status.name()),
            Predicate::Year(spans) => {
                let parts: Vec<String> = spans
                    .iter()
                    .map(|span| match span {
                        YearSpan::Range(lo, hi) if lo == hi => lo.to_string(),
                        YearSpan::Range(lo, hi) => format!("{lo}-{hi}"),
                        YearSpan::Named(name) => name.clone(),
                    })
                    .collect();
                format!("year:{}", parts.join(","))
            }
            Predicate::NameMatch(pattern)
                if !pattern.is_empty() && pattern.chars().all(lexer::is_pattern_char) =>
            {
                format!("namematch:{pattern}")
            }
            Predicate::NameMatch(pattern) => format!("namematch:\"{pattern}\""),
        }
    }
}

/// Expression nodes in the formula tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(Value),
    /// Stored value of a non-formula grade entry.
    GradeEntry {
        pset: String,
        entry: String,
        kind: ValueKind,
    },
    PsetTotal {
        pset: String,
        no_extra: bool,
        normalized: bool,
    },
    CategoryTotal {
        category: String,
        no_extra: bool,
        normalized: bool,
    },
    Unary {
        op: UnaryOp,
        expr: FormulaRef,
    },
    Not(FormulaRef),
    Binary {
        op: BinaryOp,
        left: FormulaRef,
        right: FormulaRef,
    },
    Relation {
        op: RelationOp,
        left: FormulaRef,
        right: FormulaRef,
    },
    Nullable {
        op: NullableOp,
        left: FormulaRef,
        right: FormulaRef,
    },
    Ternary {
        condition: FormulaRef,
        then_expr: FormulaRef,
        else_expr: FormulaRef,
    },
    Function {
        func: Function,
        args: Vec<FormulaRef>,
    },
    Predicate(Predicate),
    Now,
    Time(i64),
    /// Placeholder for a formula that failed to compile.
    Error,
}

impl Expr {
    pub fn children(&self) -> Vec<&FormulaRef> {
        match self {
            Expr::Unary { expr, .. } | Expr::Not(expr) => vec![expr],
            Expr::Binary { left, right, .. }
            | Expr::Relation { left, right, .. }
            | Expr::Nullable { left, right, .. } => vec![left, right],
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => vec![condition, then_expr, else_expr],
            Expr::Function { args, .. } => args.iter().collect(),
            _ => Vec::new(),
        }
    }

    fn kind(&self) -> ValueKind {
        match self {
            Expr::Constant(v) => v.kind().unwrap_or(ValueKind::Untyped),
            Expr::GradeEntry { kind, .. } => *kind,
            Expr::PsetTotal { .. } | Expr::CategoryTotal { .. } => ValueKind::Number,
            Expr::Unary { op, expr } => match (op, expr.kind()) {
                (UnaryOp::Neg, ValueKind::Duration) => ValueKind::Duration,
                _ => ValueKind::Number,
            },
            Expr::Binary { op, left, right } => match op {
                BinaryOp::Add => ValueKind::additive(left.kind(), right.kind(), false),
                BinaryOp::Sub => ValueKind::additive(left.kind(), right.kind(), true),
                _ => ValueKind::Number,
            },
            Expr::Not(_) | Expr::Relation { .. } | Expr::Predicate(_) => ValueKind::Boolean,
            Expr::Nullable { op, left, right } => match op {
                NullableOp::AddOrZero => ValueKind::Number,
                NullableOp::Xor => ValueKind::Boolean,
                _ => ValueKind::unify(left.kind(), right.kind()),
            },
            Expr::Ternary {
                then_expr,
                else_expr,
                ..
            } => ValueKind::unify(then_expr.kind(), else_expr.kind()),
            Expr::Function { func, args } => match func {
                Function::Rank => ValueKind::Number,
                Function::Rlookup(_) => args.get(1).map_or(ValueKind::Untyped, |a| a.kind()),
                Function::Min | Function::Max => args
                    .iter()
                    .map(|a| a.kind())
                    .reduce(ValueKind::unify)
                    .unwrap_or(ValueKind::Untyped),
            },
            Expr::Now | Expr::Time(_) => ValueKind::Time,
            Expr::Error => ValueKind::Untyped,
        }
    }

    /// Source text of a leaf that names a grade, total or predicate.
    fn reference_text(&self) -> Option<String> {
        match self {
            Expr::GradeEntry { pset, entry, .. } => Some(format!("{pset}.{entry}")),
            Expr::PsetTotal {
                pset,
                no_extra,
                normalized,
            } => Some(format!(
                "{pset}.total{}{}",
                if *no_extra { "_noextra" } else { "" },
                if *normalized { "_norm" } else { "" }
            )),
            Expr::CategoryTotal {
                category,
                no_extra,
                normalized,
            } => Some(format!(
                "{category}.total{}{}",
                if *no_extra { "_noextra" } else { "" },
                if *normalized { "" } else { "_raw" }
            )),
            Expr::Predicate(p) => Some(p.serialize()),
            _ => None,
        }
    }

    /// Canonical key built from the children's keys.
    fn canonical(&self) -> String {
        let node = |op: &str, children: Vec<&FormulaRef>| {
            let mut parts = vec![Json::from(op).to_string()];
            parts.extend(children.into_iter().map(|c| c.key.clone()));
            format!("[{}]", parts.join(","))
        };
        match self {
            Expr::Constant(v) => match *v {
                Value::Null => Json::Null,
                Value::Boolean(b) => Json::from(b),
                Value::Number(n) => Json::from(n),
                Value::Letter(n) => json!(["letter", n]),
                Value::Time(t) => Json::from(format!("@{t}")),
                Value::Duration(d) => json!(["duration", d]),
            }
            .to_string(),
            Expr::GradeEntry { .. }
            | Expr::PsetTotal { .. }
            | Expr::CategoryTotal { .. }
            | Expr::Predicate(_) => {
                Json::from(self.reference_text().unwrap_or_default()).to_string()
            }
            Expr::Unary { op, expr } => node(op.symbol(), vec![expr]),
            Expr::Not(expr) => node("!", vec![expr]),
            Expr::Binary { op, left, right } => node(op.symbol(), vec![left, right]),
            Expr::Relation { op, left, right } => node(op.symbol(), vec![left, right]),
            Expr::Nullable { op, left, right } => node(op.symbol(), vec![left, right]),
            Expr::Ternary { .. } => node("?:", self.children()),
            Expr::Function { func, args } => node(func.name(), args.iter().collect()),
            Expr::Now => Json::from("now").to_string(),
            Expr::Time(t) => Json::from(format!("@{t}")).to_string(),
            Expr::Error => node("error", Vec::new()),
        }
    }
}

/// A formula tree node with its inferred metadata.
#[derive(Debug)]
pub struct Formula {
    expr: Expr,
    kind: ValueKind,
    cacheable: bool,
    depth: usize,
    key: String,
}

impl Formula {
    pub fn new(expr: Expr) -> Self {
        let kind = expr.kind();
        let cacheable = match &expr {
            Expr::Function {
                func: Function::Rank,
                ..
            }
            | Expr::Error => false,
            _ => expr.children().iter().all(|c| c.cacheable),
        };
        let depth = 1 + expr.children().iter().map(|c| c.depth).max().unwrap_or(0);
        let key = expr.canonical();
        Formula {
            expr,
            kind,
            cacheable,
            depth,
            key,
        }
    }

    pub fn constant(v: Value) -> FormulaRef {
        Arc::new(Formula::new(Expr::Constant(v)))
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// False when one student's value depends on the whole roster.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Canonical serialization, e.g. `["+","pset1.total",1.0]`.
    pub fn canonical_key(&self) -> &str {
        &self.key
    }

    /// Length of the longest path from this node to a leaf, counting both.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Source text naming letter constants through `letters`, for display
    /// in a gradebook that uses that table.
    pub fn source<'a>(&'a self, letters: &'a LetterTable) -> Source<'a> {
        Source {
            formula: self,
            letters: Some(letters),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.expr, Expr::Constant(_))
    }

    /// Value of the formula if it does not depend on any student.
    pub fn constant_evaluate(&self) -> Option<Value> {
        match &self.expr {
            Expr::Constant(v) => Some(*v),
            Expr::Time(t) => Some(Value::Time(*t)),
            Expr::Unary { op, expr } => Some(op.apply(expr.constant_evaluate()?)),
            Expr::Not(expr) => Some(Value::Boolean(!expr.constant_evaluate()?.is_truthy())),
            Expr::Binary { op, left, right } => Some(
                op.apply(left.constant_evaluate()?, right.constant_evaluate()?),
            ),
            Expr::Relation { op, left, right } => Some(
                op.apply(left.constant_evaluate()?, right.constant_evaluate()?),
            ),
            Expr::Nullable { op, left, right } => {
                let (l, r) = (left.constant_evaluate()?, right.constant_evaluate()?);
                Some(op.apply(l, || r))
            }
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if condition.constant_evaluate()?.is_truthy() {
                    then_expr.constant_evaluate()
                } else {
                    else_expr.constant_evaluate()
                }
            }
            Expr::Function {
                func: func @ (Function::Min | Function::Max),
                args,
            } => {
                let values = args
                    .iter()
                    .map(|a| a.constant_evaluate())
                    .collect::<Option<Vec<_>>>()?;
                Some(Function::extreme(*func == Function::Max, values))
            }
            _ => None,
        }
    }
}

impl PartialEq for Formula {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

/// Source form that parses back to an equivalent formula under any letter
/// table. Letter constants are written by their encoding, as `letter(95)`.
impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Source {
            formula: self,
            letters: None,
        }
        .fmt(f)
    }
}

/// Display adapter returned by [`Formula::source`].
pub struct Source<'a> {
    formula: &'a Formula,
    letters: Option<&'a LetterTable>,
}

impl<'a> Source<'a> {
    fn sub(&self, formula: &'a Formula) -> Source<'a> {
        Source {
            formula,
            letters: self.letters,
        }
    }

    /// Name for `n` that compiles back to the same letter under the table.
    fn letter_name(&self, n: f64) -> Option<&'a str> {
        let letters = self.letters?;
        letters
            .name_of(n)
            .filter(|name| lexer::is_letter_grade(name) && letters.parse(name) == Some(n))
    }
}

impl fmt::Display for Source<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formula = self.formula;
        match &formula.expr {
            Expr::Constant(v) => match *v {
                Value::Null => f.write_str("null"),
                Value::Boolean(b) => write!(f, "{b}"),
                Value::Letter(n) => match self.letter_name(n) {
                    Some(name) => f.write_str(name),
                    None => write!(f, "letter({})", format_number(n)),
                },
                Value::Number(n) => write_number(f, n),
                Value::Time(t) => write!(f, "@{t:010}"),
                Value::Duration(d) => write_number(f, d as f64),
            },
            Expr::GradeEntry { .. }
            | Expr::PsetTotal { .. }
            | Expr::CategoryTotal { .. }
            | Expr::Predicate(_) => {
                f.write_str(&formula.expr.reference_text().unwrap_or_default())
            }
            Expr::Unary {
                op: UnaryOp::Neg,
                expr,
            } => write!(f, "(-{})", self.sub(expr)),
            Expr::Unary { op, expr } => write!(f, "{}({})", op.symbol(), self.sub(expr)),
            Expr::Not(expr) => write!(f, "!{}", self.sub(expr)),
            Expr::Binary { op, left, right } => {
                write!(f, "({} {} {})", self.sub(left), op.symbol(), self.sub(right))
            }
            Expr::Relation { op, left, right } => {
                write!(f, "({} {} {})", self.sub(left), op.symbol(), self.sub(right))
            }
            Expr::Nullable { op, left, right } => {
                write!(f, "({} {} {})", self.sub(left), op.symbol(), self.sub(right))
            }
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => write!(
                f,
                "({} ? {} : {})",
                self.sub(condition),
                self.sub(then_expr),
                self.sub(else_expr)
            ),
            Expr::Function { func, args } => {
                write!(f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", self.sub(arg))?;
                }
                f.write_str(")")
            }
            Expr::Now => f.write_str("now"),
            Expr::Time(t) => write!(f, "@{t:010}"),
            Expr::Error => f.write_str("error"),
        }
    }
}

fn write_number(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n < 0.0 {
        write!(f, "(-{})", format_number(-n))
    } else {
        f.write_str(&format_number(n))
    }
}
