//! Compiles search queries into formula trees.
//!
//! Terms that cannot be resolved compile to `false` rather than reporting
//! an error, so a mistyped keyword silently matches nobody.

use nom::{
    bytes::complete::take_while1,
    character::complete::{char, multispace0},
    combinator::{all_consuming, opt, recognize},
    sequence::{delimited, preceded},
    IResult, Parser,
};

use crate::config::{Gradebook, Pset};
use crate::formula::ast::{Expr, Formula, FormulaRef, NullableOp, Predicate, RelationOp, Status};
use crate::formula::lexer;
use crate::formula::parser::Compiler;
use crate::formula::query::{SearchQuery, SearchTerm};
use crate::formula::registry::FormulaRegistry;
use crate::formula::value::Value;

/// Builds uncached formula nodes for search queries.
pub struct SearchCompiler<'a> {
    compiler: Compiler<'a>,
}

impl<'a> SearchCompiler<'a> {
    pub fn new(book: &'a Gradebook, registry: &'a FormulaRegistry) -> Self {
        SearchCompiler {
            compiler: Compiler::new(book, registry).with_label("search").ephemeral(),
        }
    }

    /// Resolve bare keywords against `pset`'s entries first.
    pub fn in_pset(mut self, pset: &'a Pset) -> Self {
        self.compiler = self.compiler.in_pset(pset);
        self
    }

    /// Parse and compile query text.
    pub fn compile_str(&self, text: &str) -> FormulaRef {
        self.compile(&SearchQuery::parse(text))
    }

    pub fn compile(&self, query: &SearchQuery) -> FormulaRef {
        match query {
            SearchQuery::Not(None) => Formula::constant(Value::Boolean(true)),
            SearchQuery::Not(Some(inner)) => self.compiler.node(Expr::Not(self.compile(inner))),
            SearchQuery::And(items) => self.fold(NullableOp::And, items),
            SearchQuery::Or(items) => self.fold(NullableOp::Or, items),
            SearchQuery::Xor(items) => self.fold(NullableOp::Xor, items),
            SearchQuery::Term(term) => self.term(term),
        }
    }

    /// Combine `items` pairwise so the tree stays shallow for long queries.
    fn fold(&self, op: NullableOp, items: &[SearchQuery]) -> FormulaRef {
        match items {
            [] => Formula::constant(Value::Null),
            [item] => self.compile(item),
            _ => {
                let (left, right) = items.split_at(items.len() / 2);
                self.compiler.node(Expr::Nullable {
                    op,
                    left: self.fold(op, left),
                    right: self.fold(op, right),
                })
            }
        }
    }

    fn term(&self, term: &SearchTerm) -> FormulaRef {
        if let Some(keyword) = &term.keyword {
            return self.keyword(keyword, &term.text);
        }
        if !term.quoted {
            if matches!(term.text.as_str(), "" | "*" | "ANY" | "ALL") {
                return Formula::constant(Value::Boolean(true));
            }
            if let Some((keyword, comparison)) = split_comparison(&term.text) {
                return self.keyword(keyword, comparison);
            }
        }
        self.predicate(Predicate::NameMatch(term.text.clone()))
    }

    fn keyword(&self, keyword: &str, text: &str) -> FormulaRef {
        match keyword {
            "year" => return self.predicate(Predicate::year(text)),
            "is" => return self.predicate(Predicate::Is(Status::parse(text))),
            "name" => return self.predicate(Predicate::NameMatch(text.to_string())),
            _ => {}
        }
        let resolved = match keyword.split_once('.') {
            Some((left, right)) => self.compiler.resolve_pair(left, right),
            None => self.compiler.resolve_word(keyword, false),
        };
        match (resolved, comparison(text)) {
            (Ok(Some(left)), Some((op, number))) => self.compiler.node(Expr::Relation {
                op,
                left,
                right: Formula::constant(Value::Number(number)),
            }),
            _ => Formula::constant(Value::Boolean(false)),
        }
    }

    fn predicate(&self, predicate: Predicate) -> FormulaRef {
        self.compiler.node(Expr::Predicate(predicate))
    }
}

/// Split a fused term such as `pset1.tests>=80` into its identifier and
/// the comparison that follows it.
fn split_comparison(text: &str) -> Option<(&str, &str)> {
    let parsed: IResult<&str, &str> = recognize((
        take_while1(lexer::is_word_char),
        opt((char('.'), take_while1(lexer::is_word_char))),
    ))
    .parse(text);
    let (rest, keyword) = parsed.ok()?;
    lexer::relation(rest).ok()?;
    Some((keyword, rest))
}

/// `>=80`, `<-1.5` or a bare `90`, which compares for equality.
fn comparison(text: &str) -> Option<(RelationOp, f64)> {
    let (_, (op, number)) = all_consuming(delimited(
        multispace0,
        (
            opt(lexer::relation),
            preceded(multispace0, lexer::signed_number),
        ),
        multispace0,
    ))
    .parse(text)
    .ok()?;
    Some((op.unwrap_or(RelationOp::Eq), number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::evaluator::{evaluate, EvalEnv};
    use crate::roster::{GradeTable, Roster, Student, StudentId};

    const CONFIG: &str = r#"{
        "psets": [
            { "key": "pset1", "category": "psets",
              "grades": [ { "key": "tests", "max": 100 },
                          { "key": "style", "max": 10 } ] },
            { "key": "pset2", "category": "psets",
              "grades": [ { "key": "tests", "max": 100 } ] }
        ]
    }"#;

    fn roster() -> Roster {
        let student = |id, first: &str, last: &str, year: &str| Student {
            id: StudentId(id),
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: format!("{}@example.edu", first.to_lowercase()),
            year: year.to_string(),
            ..Student::default()
        };
        Roster::new(vec![
            Student {
                extension: true,
                ..student(1, "Ada", "Lovelace", "2")
            },
            student(2, "Alan", "Turing", "4"),
            Student {
                dropped: true,
                ..student(3, "Grace", "Hopper", "G")
            },
        ])
    }

    fn grades() -> GradeTable {
        GradeTable::new()
            .with(1, "pset1", "tests", 90.0)
            .with(2, "pset1", "tests", 70.0)
            .with(1, "pset2", "tests", 40.0)
            .with(2, "pset2", "tests", 100.0)
            .with(3, "pset2", "tests", 100.0)
    }

    fn matching(query: &str, pset: Option<&str>) -> Vec<u64> {
        let book = Gradebook::from_json(CONFIG).unwrap();
        let registry = FormulaRegistry::new();
        let mut search = SearchCompiler::new(&book, &registry);
        if let Some(pset) = pset {
            search = search.in_pset(book.pset(pset).unwrap());
        }
        let formula = search.compile_str(query);
        let (roster, grades) = (roster(), grades());
        let env = EvalEnv::new(&book, &roster, &grades);
        roster
            .iter()
            .filter(|s| evaluate(&formula, &env, s).is_truthy())
            .map(|s| s.id.0)
            .collect()
    }

    #[test]
    fn test_free_text() {
        assert_eq!(matching("lovelace", None), vec![1]);
        assert_eq!(matching("AL", None), vec![2]);
        assert_eq!(matching("alan@", None), vec![2]);
        assert_eq!(matching(r#""a l""#, None), Vec::<u64>::new());
        assert_eq!(matching("*", None), vec![1, 2, 3]);
        assert_eq!(matching("ALL", None), vec![1, 2, 3]);
        assert_eq!(matching("", None), vec![1, 2, 3]);
    }

    #[test]
    fn test_keywords() {
        assert_eq!(matching("is:x", None), vec![1]);
        assert_eq!(matching("is:college", None), vec![2, 3]);
        assert_eq!(matching("is:dropped", None), vec![3]);
        assert_eq!(matching("is:nonsense", None), Vec::<u64>::new());
        assert_eq!(matching("year:1-3", None), vec![1]);
        assert_eq!(matching("year:g,4", None), vec![2, 3]);
        assert_eq!(matching("name:hop", None), vec![3]);
    }

    #[test]
    fn test_grade_comparisons() {
        assert_eq!(matching("pset1.tests:>=80", None), vec![1]);
        assert_eq!(matching("pset1.tests>=70", None), vec![1, 2]);
        assert_eq!(matching("pset2.tests:100", None), vec![2, 3]);
        assert_eq!(matching("pset2.tests:!=100", None), vec![1]);
        assert_eq!(matching("pset2.tests<50", None), vec![1]);
        assert_eq!(matching("tests:<80", Some("pset1")), vec![2]);
        assert_eq!(matching("tests<80", Some("pset2")), vec![1]);
        assert_eq!(matching("pset1:>=80", None), vec![1]);
    }

    #[test]
    fn test_unresolved_terms_match_nobody() {
        assert_eq!(matching("pset9.tests:>3", None), Vec::<u64>::new());
        assert_eq!(matching("pset1.tests:high", None), Vec::<u64>::new());
        assert_eq!(matching("NOT pset9.tests:>3", None), vec![1, 2, 3]);
    }

    #[test]
    fn test_boolean_structure() {
        assert_eq!(matching("is:college pset2.tests:100", None), vec![2, 3]);
        assert_eq!(matching("lovelace OR turing", None), vec![1, 2]);
        assert_eq!(matching("-is:dropped", None), vec![1, 2]);
        assert_eq!(matching("is:college ^^ pset2.tests:100", None), Vec::<u64>::new());
        assert_eq!(matching("is:x XOR pset2.tests>50", None), vec![1, 2, 3]);
        assert_eq!(matching("NOT", None), vec![1, 2, 3]);
        assert_eq!(matching("()", None), Vec::<u64>::new());
    }

    #[test]
    fn test_long_queries_stay_shallow() {
        let book = Gradebook::from_json(CONFIG).unwrap();
        let registry = FormulaRegistry::new();
        let search = SearchCompiler::new(&book, &registry);
        let query = vec!["is:college"; 1000].join(" OR ");
        let formula = search.compile_str(&query);
        assert!(formula.depth() <= 12);
        assert_eq!(matching(&query, None), vec![2, 3]);

        let nested = format!("{}lovelace{}", "(".repeat(50_000), ")".repeat(50_000));
        let formula = search.compile_str(&nested);
        assert!(formula.depth() < 100);
        assert_eq!(matching(&nested, None), Vec::<u64>::new());
        let negated = search.compile_str(&format!("{}lovelace", "-".repeat(50_000)));
        assert!(negated.depth() < 100);
    }

    #[test]
    fn test_quoted_phrase_round_trip() {
        let book = Gradebook::from_json(CONFIG).unwrap();
        let registry = FormulaRegistry::new();
        let search = SearchCompiler::new(&book, &registry);
        for query in [r#""ada lovelace""#, r#"name:"(x)""#, r#"name:"""#, "lovelace"] {
            let text = search.compile_str(query).to_string();
            let compiled = book.compile(&registry, &text);
            assert!(compiled.is_ok(), "`{text}` from `{query}`");
        }
        assert_eq!(
            search.compile_str(r#""ada lovelace""#).to_string(),
            r#"namematch:"ada lovelace""#
        );
        assert_eq!(search.compile_str("lovelace").to_string(), "namematch:lovelace");
    }

    #[test]
    fn test_split_comparison() {
        assert_eq!(split_comparison("tests>=80"), Some(("tests", ">=80")));
        assert_eq!(split_comparison("pset1.tests=5"), Some(("pset1.tests", "=5")));
        assert_eq!(split_comparison("lovelace"), None);
        assert_eq!(split_comparison(">5"), None);
        assert_eq!(comparison("<= -2.5"), Some((RelationOp::Le, -2.5)));
        assert_eq!(comparison("90"), Some((RelationOp::Eq, 90.0)));
        assert_eq!(comparison("90x"), None);
    }
}
