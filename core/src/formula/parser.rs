//! Precedence-climbing compiler from formula source to [`Formula`] trees.
//!
//! Syntax errors stop compilation. Resolution errors (unknown names, bad
//! `rlookup` arguments, broken referenced formulas) are collected and the
//! offending operand is replaced by an error node so the rest of the source
//! is still checked.

use std::ops::Range;
use std::sync::Arc;

use tracing::debug;

use crate::config::{GradeEntry, Gradebook, LetterTable, NamedFormula, Pset};
use crate::error::{CompileError, FormulaError};
use crate::formula::ast::{
    BinaryOp, Expr, Formula, FormulaRef, Function, Predicate, Status, UnaryOp,
    TERNARY_PRECEDENCE, UNARY_PRECEDENCE,
};
use crate::formula::lexer::{self, Atom, Infix};
use crate::formula::registry::{FormulaRegistry, FormulaSlot};
use crate::formula::value::{Value, ValueKind};

/// Compiles formula source against one gradebook configuration.
#[derive(Debug, Clone)]
pub struct Compiler<'a> {
    book: &'a Gradebook,
    registry: &'a FormulaRegistry,
    pset: Option<&'a Pset>,
    entry: Option<&'a str>,
    label: String,
    canonical: bool,
    stack: Vec<FormulaSlot>,
}

impl<'a> Compiler<'a> {
    pub fn new(book: &'a Gradebook, registry: &'a FormulaRegistry) -> Self {
        registry.bind(book);
        Compiler {
            book,
            registry,
            pset: None,
            entry: None,
            label: "formula".to_string(),
            canonical: true,
            stack: Vec::new(),
        }
    }

    /// Resolve bare names against `pset`'s entries first.
    pub fn in_pset(mut self, pset: &'a Pset) -> Self {
        self.pset = Some(pset);
        self
    }

    /// Compile the expression of formula entry `entry`, which may not refer
    /// to itself by bare name.
    pub fn for_entry(mut self, pset: &'a Pset, entry: &'a GradeEntry) -> Self {
        self.pset = Some(pset);
        self.entry = Some(&entry.key);
        self.label = format!("{}.{}", pset.key, entry.key);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Do not share the nodes this compiler builds through the registry.
    pub(crate) fn ephemeral(mut self) -> Self {
        self.canonical = false;
        self
    }

    pub fn book(&self) -> &'a Gradebook {
        self.book
    }

    pub fn pset(&self) -> Option<&'a Pset> {
        self.pset
    }

    pub fn compile(&self, source: &str) -> Result<FormulaRef, Vec<CompileError>> {
        let mut parse = Parse {
            compiler: self,
            src: source,
            pos: 0,
            depth: self.stack.len() * REFERENCE_NESTING,
            errors: Vec::new(),
        };
        let result = parse.formula();
        let mut errors = parse.errors;
        match result {
            Ok(formula) if errors.is_empty() => return Ok(formula),
            Ok(_) => {}
            Err(e) => errors.push(e),
        }
        debug!(
            label = %self.label,
            source,
            span = ?errors[0].span,
            error = %errors[0].error,
            "formula failed to compile"
        );
        Err(errors)
    }

    /// Compile a configured named formula and remember the result.
    pub fn compile_named(&self, formula: &NamedFormula) -> Result<FormulaRef, Vec<CompileError>> {
        let slot = FormulaSlot::Named(formula.name.clone());
        let compiler = self.child(slot.clone()).with_label(&formula.name);
        let result = compiler.compile(&formula.expression);
        self.registry.store(slot, result.as_ref().ok().cloned());
        result
    }

    /// Compile a formula grade entry and remember the result.
    pub fn compile_entry(
        &self,
        pset: &'a Pset,
        entry: &'a GradeEntry,
    ) -> Result<FormulaRef, Vec<CompileError>> {
        let source = entry.formula.as_deref().unwrap_or_default();
        let slot = FormulaSlot::Entry {
            pset: pset.key.clone(),
            entry: entry.key.clone(),
        };
        let compiler = self.child(slot.clone()).for_entry(pset, entry);
        let result = compiler.compile(source);
        self.registry.store(slot, result.as_ref().ok().cloned());
        result
    }

    fn child(&self, slot: FormulaSlot) -> Compiler<'a> {
        let mut stack = self.stack.clone();
        stack.push(slot);
        Compiler {
            book: self.book,
            registry: self.registry,
            pset: None,
            entry: None,
            label: self.label.clone(),
            canonical: true,
            stack,
        }
    }

    /// Wrap `expr` in a node, folding constant operators and sharing the
    /// result through the registry.
    pub(crate) fn node(&self, expr: Expr) -> FormulaRef {
        let formula = Formula::new(expr);
        let formula = match foldable(&formula).then(|| formula.constant_evaluate()) {
            Some(Some(v)) => Formula::new(Expr::Constant(v)),
            _ => formula,
        };
        let formula = Arc::new(formula);
        if self.canonical {
            self.registry.canonicalize(formula)
        } else {
            formula
        }
    }

    /// Resolve a bare identifier such as `tests`, `final` or `pset1_norm`.
    pub(crate) fn resolve_word(
        &self,
        word: &str,
        no_local: bool,
    ) -> Result<Option<FormulaRef>, FormulaError> {
        if let Some(pset) = self.pset.filter(|_| !no_local) {
            if let Some(entry) = pset.grade(word).filter(|e| Some(e.key.as_str()) != self.entry) {
                return self.entry_ref(pset, entry).map(Some);
            }
            if let Some(flags) = total_flags(word) {
                return Ok(Some(self.pset_total(pset, flags)));
            }
        }
        if let Some(formula) = self.book.formula_by_name(word) {
            return self.referenced(
                FormulaSlot::Named(formula.name.clone()),
                &formula.expression,
                |c| c.with_label(&formula.name),
            )
            .map(Some);
        }
        let Some((base, no_extra, norm, raw)) = strip_suffixes(word) else {
            return Ok(None);
        };
        if let Some(pset) = self.book.pset_by_key_or_title(base) {
            return Ok(Some(self.node(Expr::PsetTotal {
                pset: pset.key.clone(),
                no_extra,
                normalized: norm,
            })));
        }
        if let Some(category) = self.book.category(base) {
            return Ok(Some(self.node(Expr::CategoryTotal {
                category: category.name.clone(),
                no_extra: no_extra && category.has_extra,
                normalized: !raw,
            })));
        }
        Ok(None)
    }

    /// Resolve `left.right`: `pset.entry`, `pset.total_norm`,
    /// `category.total_raw`, `self.entry` or `global.name`.
    pub(crate) fn resolve_pair(
        &self,
        left: &str,
        right: &str,
    ) -> Result<Option<FormulaRef>, FormulaError> {
        let pset = match (left, self.pset) {
            ("self", Some(pset)) => Some(pset),
            ("global", _) => return self.resolve_word(right, true),
            _ => self.book.pset_by_key_or_title(left),
        };
        if let Some(pset) = pset {
            return match (total_flags(right), pset.grade(right)) {
                (Some(flags), _) => Ok(Some(self.pset_total(pset, flags))),
                (None, Some(entry)) => self.entry_ref(pset, entry).map(Some),
                (None, None) => Ok(None),
            };
        }
        match (self.book.category(left), total_flags(right)) {
            (Some(category), Some(flags)) => Ok(Some(self.node(Expr::CategoryTotal {
                category: category.name.clone(),
                no_extra: flags & TOTAL_NOEXTRA != 0 && category.has_extra,
                normalized: flags & TOTAL_RAW == 0,
            }))),
            _ => Ok(None),
        }
    }

    fn pset_total(&self, pset: &Pset, flags: u8) -> FormulaRef {
        self.node(Expr::PsetTotal {
            pset: pset.key.clone(),
            no_extra: flags & TOTAL_NOEXTRA != 0,
            normalized: flags & TOTAL_NORM != 0,
        })
    }

    fn entry_ref(&self, pset: &'a Pset, entry: &'a GradeEntry) -> Result<FormulaRef, FormulaError> {
        match &entry.formula {
            Some(source) => self.referenced(
                FormulaSlot::Entry {
                    pset: pset.key.clone(),
                    entry: entry.key.clone(),
                },
                source,
                |c| c.for_entry(pset, entry),
            ),
            None => Ok(self.node(Expr::GradeEntry {
                pset: pset.key.clone(),
                entry: entry.key.clone(),
                kind: entry.kind(),
            })),
        }
    }

    /// Compiled form of another configured formula, compiled at most once
    /// per registry binding.
    fn referenced(
        &self,
        slot: FormulaSlot,
        source: &str,
        configure: impl FnOnce(Compiler<'a>) -> Compiler<'a>,
    ) -> Result<FormulaRef, FormulaError> {
        if self.stack.contains(&slot) {
            return Err(FormulaError::CircularReference(slot.to_string()));
        }
        let compiled = match self.registry.compiled(&slot) {
            Some(compiled) => compiled,
            None => {
                let result = configure(self.child(slot.clone())).compile(source);
                // cycles and nesting overflow depend on the reference path,
                // so they are not remembered
                if let Err(errors) = &result {
                    if let Some(e) = errors.iter().find(|e| e.error.depends_on_path()) {
                        return Err(e.error.clone());
                    }
                }
                let compiled = result.ok();
                self.registry.store(slot.clone(), compiled.clone());
                compiled
            }
        };
        compiled.ok_or_else(|| FormulaError::InvalidFormulaReference(slot.to_string()))
    }

    fn letter_value(&self, text: &str) -> f64 {
        self.book
            .letters()
            .parse(text)
            .or_else(|| LetterTable::default().parse(text))
            .unwrap_or_default()
    }
}

const TOTAL_NOEXTRA: u8 = 1;
const TOTAL_NORM: u8 = 2;
const TOTAL_RAW: u8 = 4;

/// Flags named by the entry half of `pset.total_noextra` and friends.
fn total_flags(key: &str) -> Option<u8> {
    Some(match key {
        "total" => 0,
        "total_noextra" => TOTAL_NOEXTRA,
        "total_norm" => TOTAL_NORM,
        "total_noextra_norm" | "total_norm_noextra" => TOTAL_NOEXTRA | TOTAL_NORM,
        "total_raw" => TOTAL_RAW,
        "total_noextra_raw" | "total_raw_noextra" => TOTAL_NOEXTRA | TOTAL_RAW,
        _ => return None,
    })
}

/// Split `name_noextra_norm` into `(name, no_extra, norm, raw)`. Each suffix
/// may appear once; `_norm` and `_raw` together resolve nothing.
fn strip_suffixes(word: &str) -> Option<(&str, bool, bool, bool)> {
    let (mut base, mut no_extra, mut norm, mut raw) = (word, false, false, false);
    loop {
        if let Some(b) = base.strip_suffix("_noextra").filter(|_| !no_extra) {
            (base, no_extra) = (b, true);
        } else if let Some(b) = base.strip_suffix("_norm").filter(|_| !norm) {
            (base, norm) = (b, true);
        } else if let Some(b) = base.strip_suffix("_raw").filter(|_| !raw) {
            (base, raw) = (b, true);
        } else {
            break;
        }
    }
    if (norm && raw) || base.is_empty() {
        None
    } else {
        Some((base, no_extra, norm, raw))
    }
}

fn foldable(formula: &Formula) -> bool {
    let expr = formula.expr();
    let children = expr.children();
    !children.is_empty()
        && !matches!(
            expr,
            Expr::Function {
                func: Function::Rank | Function::Rlookup(_),
                ..
            }
        )
        && children.iter().all(|c| {
            c.is_constant()
                && matches!(
                    c.kind(),
                    ValueKind::Number | ValueKind::Boolean | ValueKind::Untyped
                )
        })
}

fn rlookup_thresholds(args: &[FormulaRef]) -> Result<Vec<f64>, FormulaError> {
    if args.len() < 4 || args.len() % 2 != 0 {
        return Err(FormulaError::RlookupArguments(format!(
            "rlookup needs an even number of arguments, at least 4, got {}",
            args.len()
        )));
    }
    let mut thresholds: Vec<f64> = Vec::new();
    for arg in args[2..].iter().step_by(2) {
        match arg.constant_evaluate() {
            Some(Value::Number(t)) if thresholds.last().map_or(true, |last| *last <= t) => {
                thresholds.push(t)
            }
            _ => {
                return Err(FormulaError::RlookupArguments(
                    "rlookup thresholds must be non-decreasing numeric constants".to_string(),
                ))
            }
        }
    }
    Ok(thresholds)
}

type Step<T> = Result<T, CompileError>;

/// Deepest recursion the parser enters, counting parentheses, prefix
/// operators and right operands.
const MAX_NESTING: usize = 128;
/// Nesting charged for each formula reference being compiled.
const REFERENCE_NESTING: usize = 8;
/// Deepest formula tree a compile may produce, references included.
const MAX_TREE_DEPTH: usize = 512;

/// State of one compilation pass over a source string.
struct Parse<'p> {
    compiler: &'p Compiler<'p>,
    src: &'p str,
    pos: usize,
    depth: usize,
    errors: Vec<CompileError>,
}

impl<'p> Parse<'p> {
    fn rest(&self) -> &'p str {
        &self.src[self.pos..]
    }

    fn advance(&mut self, rest: &str) {
        self.pos = self.src.len() - rest.len();
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.advance(rest.trim_start());
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        match self.rest().strip_prefix(c) {
            Some(rest) => {
                self.advance(rest);
                true
            }
            None => false,
        }
    }

    fn error(&self, error: FormulaError, span: Range<usize>) -> CompileError {
        CompileError::new(error, span, self.compiler.label.clone())
    }

    fn syntax(&self, message: impl Into<String>, span: Range<usize>) -> CompileError {
        self.error(FormulaError::ParseError(message.into()), span)
    }

    /// Syntax error at the current position.
    fn unexpected(&self) -> CompileError {
        match self.rest().chars().next() {
            Some(c) => self.syntax(format!("unexpected `{c}`"), self.pos..self.pos + c.len_utf8()),
            None => self.syntax("unexpected end of formula", self.pos..self.pos),
        }
    }

    /// Record a resolution error and stand in an error node.
    fn fail(&mut self, error: FormulaError, span: Range<usize>) -> FormulaRef {
        self.errors.push(self.error(error, span));
        Arc::new(Formula::new(Expr::Error))
    }

    fn formula(&mut self) -> Step<FormulaRef> {
        self.skip_ws();
        if self.rest().is_empty() {
            return Err(self.error(FormulaError::EmptyExpression, 0..self.src.len()));
        }
        let formula = self.expr(TERNARY_PRECEDENCE)?;
        self.skip_ws();
        if !self.rest().is_empty() {
            return Err(self.unexpected());
        }
        Ok(formula)
    }

    fn expr(&mut self, min_prec: u8) -> Step<FormulaRef> {
        if self.depth >= MAX_NESTING {
            return Err(self.too_deep(self.pos));
        }
        self.depth += 1;
        let result = self.climb(min_prec);
        self.depth -= 1;
        result
    }

    fn too_deep(&self, start: usize) -> CompileError {
        self.error(FormulaError::TooDeeplyNested, start..self.pos)
    }

    /// Reject trees too deep to evaluate, such as long operator chains.
    fn bounded(&self, e: FormulaRef, start: usize) -> Step<FormulaRef> {
        if e.depth() > MAX_TREE_DEPTH {
            return Err(self.too_deep(start));
        }
        Ok(e)
    }

    fn climb(&mut self, min_prec: u8) -> Step<FormulaRef> {
        self.skip_ws();
        let start = self.pos;
        let mut e = self.prefix()?;
        e = self.bounded(e, start)?;
        loop {
            self.skip_ws();
            let Ok((rest, op)) = lexer::infix(self.rest()) else {
                return Ok(e);
            };
            let prec = op.precedence();
            if prec < min_prec {
                return Ok(e);
            }
            self.advance(rest);
            let c = self.compiler;
            e = match op {
                Infix::Question => {
                    let then_expr = self.expr(TERNARY_PRECEDENCE)?;
                    if !self.eat(':') {
                        return Err(self.syntax("expected `:`", self.pos..self.pos));
                    }
                    let else_expr = self.expr(TERNARY_PRECEDENCE)?;
                    c.node(Expr::Ternary {
                        condition: e,
                        then_expr,
                        else_expr,
                    })
                }
                Infix::Binary(BinaryOp::Pow) => {
                    let right = self.expr(prec)?;
                    c.node(Expr::Binary {
                        op: BinaryOp::Pow,
                        left: e,
                        right,
                    })
                }
                Infix::Binary(op) => {
                    let right = self.expr(prec + 1)?;
                    c.node(Expr::Binary { op, left: e, right })
                }
                Infix::Relation(op) => {
                    let right = self.expr(prec + 1)?;
                    c.node(Expr::Relation { op, left: e, right })
                }
                Infix::Nullable(op) => {
                    let right = self.expr(prec + 1)?;
                    c.node(Expr::Nullable { op, left: e, right })
                }
            };
            e = self.bounded(e, start)?;
        }
    }

    fn prefix(&mut self) -> Step<FormulaRef> {
        self.skip_ws();
        let start = self.pos;
        let Ok((rest, atom)) = lexer::atom(self.rest()) else {
            return Err(self.unexpected());
        };
        self.advance(rest);
        let span = start..self.pos;
        let c = self.compiler;
        Ok(match atom {
            Atom::Open => {
                let e = self.expr(TERNARY_PRECEDENCE)?;
                if !self.eat(')') {
                    return Err(self.syntax("missing `)`", start..self.pos));
                }
                e
            }
            Atom::Prefix(op) => {
                let e = self.expr(UNARY_PRECEDENCE)?;
                match op {
                    '-' => c.node(Expr::Unary {
                        op: UnaryOp::Neg,
                        expr: e,
                    }),
                    '!' => c.node(Expr::Not(e)),
                    _ => e,
                }
            }
            Atom::Number(n) => c.node(Expr::Constant(Value::Number(n))),
            Atom::Letter(text) => c.node(Expr::Constant(Value::Letter(c.letter_value(text)))),
            Atom::LetterCode(n) => c.node(Expr::Constant(Value::Letter(n))),
            Atom::Constant(v) => c.node(Expr::Constant(v)),
            Atom::Now => c.node(Expr::Now),
            Atom::Unary(op) => {
                let e = self.expr(UNARY_PRECEDENCE)?;
                c.node(Expr::Unary { op, expr: e })
            }
            Atom::Function(name) => self.function(name, start)?,
            Atom::Predicate(kind, arg) => c.node(Expr::Predicate(match kind {
                "is" => Predicate::Is(Status::parse(arg)),
                "year" => Predicate::year(arg),
                _ => Predicate::NameMatch(arg.to_string()),
            })),
            Atom::Time(text) => match lexer::parse_time(text) {
                Some(t) => c.node(Expr::Time(t)),
                None => self.fail(FormulaError::InvalidTime(text.to_string()), span),
            },
            Atom::Pair(left, right) => {
                let resolved = c.resolve_pair(left, right);
                self.reference(resolved, span)
            }
            Atom::Word(word) => {
                let resolved = c.resolve_word(word, false);
                self.reference(resolved, span)
            }
        })
    }

    fn reference(
        &mut self,
        resolved: Result<Option<FormulaRef>, FormulaError>,
        span: Range<usize>,
    ) -> FormulaRef {
        match resolved {
            Ok(Some(formula)) => formula,
            Ok(None) => {
                let name = self.src[span.clone()].to_string();
                self.fail(FormulaError::UndefinedReference(name), span)
            }
            Err(e) => self.fail(e, span),
        }
    }

    fn function(&mut self, name: &str, start: usize) -> Step<FormulaRef> {
        if !self.eat('(') {
            return Err(self.syntax(format!("expected `(` after `{name}`"), self.pos..self.pos));
        }
        let mut args = Vec::new();
        if !self.eat(')') {
            loop {
                args.push(self.expr(TERNARY_PRECEDENCE)?);
                if self.eat(',') {
                    continue;
                }
                if self.eat(')') {
                    break;
                }
                return Err(self.syntax("expected `,` or `)`", self.pos..self.pos));
            }
        }
        let span = start..self.pos;
        let func = match name {
            "min" => Function::Min,
            "max" => Function::Max,
            "rank" => Function::Rank,
            _ => match rlookup_thresholds(&args) {
                Ok(thresholds) => Function::Rlookup(thresholds),
                Err(e) => return Ok(self.fail(e, span)),
            },
        };
        let expected = match func {
            Function::Rank => (args.len() != 1).then_some("1"),
            Function::Min | Function::Max => args.is_empty().then_some("at least 1"),
            Function::Rlookup(_) => None,
        };
        if let Some(expected) = expected {
            let error = FormulaError::InvalidArgCount {
                function: name.to_string(),
                expected: expected.to_string(),
                got: args.len(),
            };
            return Ok(self.fail(error, span));
        }
        Ok(self.compiler.node(Expr::Function { func, args }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "psets": [
            { "key": "pset1", "title": "PS1", "category": "psets",
              "grades": [ { "key": "tests", "max": 50 },
                          { "key": "style", "max": 10 },
                          { "key": "bonus", "max": 5, "is_extra": true },
                          { "key": "combined", "formula": "tests + style" },
                          { "key": "selfish", "formula": "self.selfish + 1" } ] },
            { "key": "pset2", "category": "psets",
              "grades": [ { "key": "tests", "max": 50 } ] },
            { "key": "exam", "category": "exams",
              "grades": [ { "key": "score", "max": 100 },
                          { "key": "letter", "type": "letter", "no_total": true } ] }
        ],
        "formulas": [
            { "name": "hw", "formula": "psets.total" },
            { "name": "broken", "formula": "1 +" },
            { "name": "loop_a", "formula": "loop_b + 1" },
            { "name": "loop_b", "formula": "loop_a + 1" }
        ]
    }"#;

    fn book() -> Gradebook {
        Gradebook::from_json(CONFIG).unwrap()
    }

    fn key(book: &Gradebook, source: &str) -> String {
        let registry = FormulaRegistry::new();
        let f = Compiler::new(book, &registry).compile(source).unwrap();
        f.canonical_key().to_string()
    }

    fn errors(book: &Gradebook, source: &str) -> Vec<CompileError> {
        let registry = FormulaRegistry::new();
        Compiler::new(book, &registry).compile(source).unwrap_err()
    }

    #[test]
    fn test_constant_folding_and_precedence() {
        let book = book();
        assert_eq!(key(&book, "1 + 2 * 3"), "7.0");
        assert_eq!(key(&book, "(1 + 2) * 3"), "9.0");
        assert_eq!(key(&book, "2 ** 3 ** 2"), "512.0");
        assert_eq!(key(&book, "-2 ** 2"), "-4.0");
        assert_eq!(key(&book, "1 < 2 < 3"), "true");
        assert_eq!(key(&book, "10 - 4 - 3"), "3.0");
        assert_eq!(key(&book, "null ?? 4"), "4.0");
        assert_eq!(key(&book, "1 ? 2 : 3"), "2.0");
        assert_eq!(key(&book, "!0"), "true");
        assert_eq!(key(&book, "log(1)"), "0.0");
        assert_eq!(key(&book, "1 / 0"), "null");
    }

    #[test]
    fn test_references() {
        let book = book();
        assert_eq!(key(&book, "pset1.tests + 1"), r#"["+","pset1.tests",1.0]"#);
        assert_eq!(key(&book, "PS1 . tests"), r#""pset1.tests""#);
        assert_eq!(key(&book, "pset1.total_norm_noextra"), r#""pset1.total_noextra_norm""#);
        assert_eq!(key(&book, "pset1_noextra"), r#""pset1.total_noextra""#);
        assert_eq!(key(&book, "pset2_raw"), r#""pset2.total""#);
        assert_eq!(key(&book, "psets"), r#""psets.total""#);
        assert_eq!(key(&book, "psets_raw"), r#""psets.total_raw""#);
        assert_eq!(key(&book, "psets_noextra"), r#""psets.total_noextra""#);
        assert_eq!(key(&book, "exams_noextra"), r#""exams.total""#);
        assert_eq!(key(&book, "exams.total_raw_noextra"), r#""exams.total_raw""#);
        assert_eq!(key(&book, "hw * 2"), r#"["*","psets.total",2.0]"#);
        assert_eq!(key(&book, "global.hw"), r#""psets.total""#);
        assert_eq!(
            key(&book, "pset1.combined / 2"),
            r#"["/",["+","pset1.tests","pset1.style"],2.0]"#
        );
    }

    #[test]
    fn test_entry_context() {
        let book = book();
        let registry = FormulaRegistry::new();
        let pset = book.pset("pset1").unwrap();
        let entry = pset.grade("combined").unwrap();
        let compiler = Compiler::new(&book, &registry).for_entry(pset, entry);

        let f = compiler.compile("tests + self.style + total").unwrap();
        assert_eq!(
            f.canonical_key(),
            r#"["+",["+","pset1.tests","pset1.style"],"pset1.total"]"#
        );

        let errs = compiler.compile("combined").unwrap_err();
        assert_eq!(errs[0].label, "pset1.combined");
        assert!(matches!(errs[0].error, FormulaError::UndefinedReference(_)));

        let errs = compiler.compile("pset1.selfish").unwrap_err();
        assert!(matches!(errs[0].error, FormulaError::InvalidFormulaReference(_)));
    }

    #[test]
    fn test_letter_and_time_literals() {
        let book = book();
        let registry = FormulaRegistry::new();
        let compiler = Compiler::new(&book, &registry);
        let f = compiler.compile("exam.letter >= B+").unwrap();
        assert_eq!(f.kind(), ValueKind::Boolean);
        assert_eq!(
            compiler.compile("B-").unwrap().constant_evaluate(),
            Some(Value::Letter(82.0))
        );
        let t = compiler.compile("@2000-01-02").unwrap();
        assert_eq!(t.canonical_key(), r#""@946771200""#);
        assert_eq!(t.kind(), ValueKind::Time);
        let d = compiler.compile("now - @2000").unwrap();
        assert_eq!(d.kind(), ValueKind::Duration);
    }

    #[test]
    fn test_predicates() {
        let book = book();
        assert_eq!(key(&book, "is:X"), r#""is:x""#);
        assert_eq!(key(&book, "is:college && year:1-4,g"), r#"["&&","is:college","year:1-4,G"]"#);
        assert_eq!(key(&book, "namematch:ann ^^ is:maybe"), r#"["^^","namematch:ann","is:false"]"#);
    }

    #[test]
    fn test_syntax_errors() {
        let book = book();
        let errs = errors(&book, "   ");
        assert_eq!(errs[0].error, FormulaError::EmptyExpression);

        let errs = errors(&book, "(1 + 2");
        assert!(matches!(&errs[0].error, FormulaError::ParseError(m) if m.contains(')')));
        assert_eq!(errs[0].span, 0..6);

        let errs = errors(&book, "1 ? 2");
        assert!(matches!(&errs[0].error, FormulaError::ParseError(m) if m.contains(':')));
        assert_eq!(errs[0].span, 5..5);

        let errs = errors(&book, "1 2");
        assert_eq!(errs[0].span, 2..3);

        let errs = errors(&book, "1 + $");
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].span, 4..5);
    }

    #[test]
    fn test_resolution_errors_accumulate() {
        let book = book();
        let errs = errors(&book, "nope + pset1.nope * psets_norm_raw");
        assert_eq!(errs.len(), 3);
        assert_eq!(
            errs[0].error,
            FormulaError::UndefinedReference("nope".to_string())
        );
        assert_eq!(errs[0].span, 0..4);
        assert_eq!(errs[1].span, 7..17);
        assert_eq!(errs[0].label, "formula");

        let errs = errors(&book, "broken + 1");
        assert_eq!(
            errs[0].error,
            FormulaError::InvalidFormulaReference("broken".to_string())
        );
        assert_eq!(errs[0].to_string(), "formula: References invalid formula `broken`");

        let errs = errors(&book, "loop_a");
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].error, FormulaError::CircularReference("loop_a".to_string()));

        let errs = errors(&book, "@1999-01-01 + 1");
        assert_eq!(errs[0].error, FormulaError::InvalidTime("1999-01-01".to_string()));
    }

    #[test]
    fn test_function_arguments() {
        let book = book();
        assert_eq!(
            key(&book, "rlookup(pset1.tests, F, 60, D, 70, C, 90, A)"),
            r#"["rlookup","pset1.tests",["letter",50.0],60.0,["letter",65.0],70.0,["letter",75.0],90.0,["letter",95.0]]"#
        );
        assert_eq!(key(&book, "max(1, 2, null)"), "2.0");
        assert_eq!(key(&book, "min(pset1.tests, 3)"), r#"["min","pset1.tests",3.0]"#);
        assert_eq!(key(&book, "rank(pset1.tests)"), r#"["rank","pset1.tests"]"#);

        for source in [
            "rlookup(pset1.tests, F, 60)",
            "rlookup(pset1.tests, F, 70, D, 60, C)",
            "rlookup(pset1.tests, F, pset1.style, D)",
        ] {
            let errs = errors(&book, source);
            assert!(matches!(errs[0].error, FormulaError::RlookupArguments(_)), "{source}");
        }
        assert!(matches!(
            errors(&book, "rank(1, 2)")[0].error,
            FormulaError::InvalidArgCount { got: 2, .. }
        ));
        assert!(matches!(
            errors(&book, "min()")[0].error,
            FormulaError::InvalidArgCount { got: 0, .. }
        ));
        assert!(matches!(
            errors(&book, "max 3")[0].error,
            FormulaError::ParseError(_)
        ));
    }

    #[test]
    fn test_structural_sharing() {
        let book = book();
        let registry = FormulaRegistry::new();
        let compiler = Compiler::new(&book, &registry);
        let a = compiler.compile("rank(pset1.tests + 1)").unwrap();
        let b = compiler.compile("rank((pset1 . tests) + 1.0)").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let search = Compiler::new(&book, &registry).ephemeral();
        let c = search.compile("rank(pset1.tests + 1)").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_strip_suffixes() {
        assert_eq!(strip_suffixes("a_norm_noextra"), Some(("a", true, true, false)));
        assert_eq!(strip_suffixes("a_noextra_noextra"), Some(("a_noextra", true, false, false)));
        assert_eq!(strip_suffixes("a_norm_raw"), None);
        assert_eq!(strip_suffixes("_raw"), None);
        assert_eq!(strip_suffixes("plain"), Some(("plain", false, false, false)));
    }

    #[test]
    fn test_deep_nesting_is_an_error() {
        let book = book();
        for source in [
            format!("{}1", "-".repeat(400)),
            format!("{}1{}", "(".repeat(50_000), ")".repeat(50_000)),
            format!("pset1.tests{}", " + pset1.tests".repeat(2_000)),
            format!("{}2", "2 ** ".repeat(1_000)),
        ] {
            let errs = errors(&book, &source);
            assert_eq!(errs[0].error, FormulaError::TooDeeplyNested);
        }

        assert_eq!(key(&book, &format!("{}1{}", "(".repeat(100), ")".repeat(100))), "1.0");
        assert_eq!(key(&book, &format!("{}1", "-".repeat(100))), "1.0");
        let registry = FormulaRegistry::new();
        let sum = Compiler::new(&book, &registry)
            .compile(&format!("pset1.tests{}", " + pset1.style".repeat(300)))
            .unwrap();
        assert_eq!(sum.depth(), 301);
    }

    #[test]
    fn test_long_reference_chains() {
        let formulas: Vec<String> = (0..20)
            .map(|i| format!(r#"{{ "name": "f{i}", "formula": "f{} + 1" }}"#, i + 1))
            .chain([r#"{ "name": "f20", "formula": "pset1.tests" }"#.to_string()])
            .collect();
        let config = format!(
            r#"{{ "psets": [ {{ "key": "pset1", "grades": [ {{ "key": "tests" }} ] }} ],
                 "formulas": [ {} ] }}"#,
            formulas.join(", ")
        );
        let book = Gradebook::from_json(&config).unwrap();
        let registry = FormulaRegistry::new();
        let compiler = Compiler::new(&book, &registry);

        let errs = compiler.compile("f0").unwrap_err();
        assert_eq!(errs[0].error, FormulaError::TooDeeplyNested);
        // the failure above is not remembered for the shorter chain
        let f = compiler.compile("f10").unwrap();
        assert_eq!(f.depth(), 11);
    }
}
