//! Gradebook configuration: problem sets, grade entries, categories and
//! named formulas.
//!
//! Raw JSON records deserialize into the `*Config` types; [`Gradebook::new`]
//! validates them once and builds the typed lookup tables the formula
//! compiler resolves identifiers against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::formula::ValueKind;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GradebookConfig {
    #[serde(default)]
    pub psets: Vec<PsetConfig>,
    #[serde(default)]
    pub formulas: Vec<FormulaConfig>,
    #[serde(default)]
    pub letter_grades: Option<IndexMap<String, f64>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PsetConfig {
    pub key: String,
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub grades: Vec<GradeEntryConfig>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    #[default]
    Numeric,
    Checkbox,
    Letter,
    Duration,
    Timermark,
    Formula,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GradeEntryConfig {
    pub key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default, rename = "type")]
    pub entry_type: Option<EntryType>,
    #[serde(default)]
    pub is_extra: bool,
    #[serde(default)]
    pub no_total: bool,
    #[serde(default)]
    pub formula: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FormulaConfig {
    pub name: String,
    #[serde(alias = "formula")]
    pub expression: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A validated grade entry.
#[derive(Clone, Debug)]
pub struct GradeEntry {
    pub key: String,
    pub title: String,
    pub max: Option<f64>,
    pub entry_type: EntryType,
    pub is_extra: bool,
    pub no_total: bool,
    pub formula: Option<String>,
}

impl GradeEntry {
    pub fn is_formula(&self) -> bool {
        self.entry_type == EntryType::Formula
    }

    /// Kind of the stored value. Formula entries take the kind of their
    /// compiled expression instead.
    pub fn kind(&self) -> ValueKind {
        match self.entry_type {
            EntryType::Numeric | EntryType::Checkbox => ValueKind::Number,
            EntryType::Letter => ValueKind::Letter,
            EntryType::Duration => ValueKind::Duration,
            EntryType::Timermark => ValueKind::Time,
            EntryType::Formula => ValueKind::Untyped,
        }
    }

    /// Whether the entry contributes to its problem set's total.
    pub fn in_total(&self, no_extra: bool) -> bool {
        !self.no_total && !self.is_formula() && !(no_extra && self.is_extra)
    }
}

/// A validated problem set.
#[derive(Clone, Debug)]
pub struct Pset {
    pub id: u32,
    pub key: String,
    pub title: String,
    pub category: Option<String>,
    pub weight: Option<f64>,
    pub disabled: bool,
    pub has_extra: bool,
    grades: IndexMap<String, GradeEntry>,
}

impl Pset {
    pub fn grade(&self, key: &str) -> Option<&GradeEntry> {
        self.grades.get(key)
    }

    pub fn grades(&self) -> impl Iterator<Item = &GradeEntry> {
        self.grades.values()
    }

    /// Highest achievable non-extra total.
    pub fn max_total(&self) -> f64 {
        self.grades()
            .filter(|ge| ge.in_total(true))
            .filter_map(|ge| ge.max)
            .sum()
    }
}

/// Problem sets grouped under one category name.
#[derive(Clone, Debug)]
pub struct Category {
    pub name: String,
    pub has_extra: bool,
    psets: Vec<String>,
    weights: Option<HashMap<String, f64>>,
}

impl Category {
    pub fn psets(&self) -> impl Iterator<Item = &str> {
        self.psets.iter().map(String::as_str)
    }

    /// Normalized weight of `pset` within the category, or `None` when the
    /// category declares weights on only some of its problem sets.
    pub fn weight_factor(&self, pset: &str) -> Option<f64> {
        self.weights.as_ref()?.get(pset).copied()
    }

    fn new(name: &str, psets: &[&Pset]) -> Self {
        let declared = psets.iter().filter(|p| p.weight.is_some()).count();
        let weights = if declared != 0 && declared != psets.len() {
            warn!(
                category = name,
                declared,
                total = psets.len(),
                "category weights partially declared; normalization disabled"
            );
            None
        } else {
            let counts = |p: &Pset| p.weight.unwrap_or(1.0) > 0.0 && p.max_total() > 0.0;
            let total: f64 = psets
                .iter()
                .filter(|p| counts(**p))
                .map(|p| p.weight.unwrap_or(1.0))
                .sum();
            Some(
                psets
                    .iter()
                    .map(|p| {
                        let w = if counts(*p) && total > 0.0 {
                            p.weight.unwrap_or(1.0) / total
                        } else {
                            0.0
                        };
                        (p.key.clone(), w)
                    })
                    .collect(),
            )
        };
        Category {
            name: name.to_string(),
            has_extra: psets.iter().any(|p| p.has_extra),
            psets: psets.iter().map(|p| p.key.clone()).collect(),
            weights,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NamedFormula {
    pub name: String,
    pub expression: String,
    pub description: Option<String>,
}

/// Letter grade names and their numeric encodings.
#[derive(Clone, Debug, PartialEq)]
pub struct LetterTable {
    entries: Vec<(String, f64)>,
}

impl Default for LetterTable {
    fn default() -> Self {
        let entries = [
            ("A+", 98.0),
            ("A", 95.0),
            ("A-", 92.0),
            ("B+", 88.0),
            ("B", 85.0),
            ("B-", 82.0),
            ("C+", 78.0),
            ("C", 75.0),
            ("C-", 72.0),
            ("D+", 68.0),
            ("D", 65.0),
            ("D-", 62.0),
            ("F", 50.0),
            ("E", 50.0),
        ];
        LetterTable {
            entries: entries
                .iter()
                .map(|(name, v)| (name.to_string(), *v))
                .collect(),
        }
    }
}

impl LetterTable {
    pub fn new(entries: impl IntoIterator<Item = (String, f64)>) -> Self {
        LetterTable {
            entries: entries
                .into_iter()
                .map(|(name, v)| (normalize_letter(&name), v))
                .collect(),
        }
    }

    /// Numeric value of a letter grade such as `B+` (case-insensitive).
    pub fn parse(&self, text: &str) -> Option<f64> {
        let text = normalize_letter(text.trim());
        self.entries
            .iter()
            .find(|(name, _)| *name == text)
            .map(|(_, v)| *v)
    }

    /// First letter grade whose encoding is exactly `v`.
    pub fn name_of(&self, v: f64) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, x)| *x == v)
            .map(|(name, _)| name.as_str())
    }
}

fn normalize_letter(text: &str) -> String {
    text.to_uppercase().replace(['–', '−'], "-")
}

/// Validated configuration with typed lookup tables.
#[derive(Clone, Debug)]
pub struct Gradebook {
    generation: u64,
    psets: IndexMap<String, Pset>,
    categories: IndexMap<String, Category>,
    formulas: IndexMap<String, NamedFormula>,
    letters: LetterTable,
}

impl Gradebook {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: GradebookConfig = serde_json::from_str(json)?;
        Self::new(config)
    }

    pub fn new(config: GradebookConfig) -> Result<Self, ConfigError> {
        let mut psets = IndexMap::new();
        for (i, pc) in config.psets.into_iter().enumerate() {
            let pset = build_pset(pc, i)?;
            if psets.contains_key(&pset.key) {
                return Err(ConfigError::DuplicatePset(pset.key));
            }
            psets.insert(pset.key.clone(), pset);
        }

        let mut grouped: IndexMap<String, Vec<&Pset>> = IndexMap::new();
        for pset in psets.values().filter(|p| !p.disabled) {
            if let Some(cat) = pset.category.as_deref().filter(|c| !c.is_empty()) {
                grouped.entry(cat.to_string()).or_default().push(pset);
            }
        }
        let mut categories: IndexMap<String, Category> = grouped
            .iter()
            .map(|(name, members)| (name.clone(), Category::new(name, members)))
            .collect();
        categories.sort_by(|a, _, b, _| a.to_lowercase().cmp(&b.to_lowercase()));

        let mut formulas = IndexMap::new();
        for fc in config.formulas {
            if formulas.contains_key(&fc.name) {
                return Err(ConfigError::DuplicateFormula(fc.name));
            }
            formulas.insert(
                fc.name.clone(),
                NamedFormula {
                    name: fc.name,
                    expression: fc.expression,
                    description: fc.description,
                },
            );
        }

        let letters = match config.letter_grades {
            Some(map) => LetterTable::new(map),
            None => LetterTable::default(),
        };

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        info!(
            generation,
            psets = psets.len(),
            categories = categories.len(),
            formulas = formulas.len(),
            "gradebook configuration loaded"
        );
        Ok(Gradebook {
            generation,
            psets,
            categories,
            formulas,
            letters,
        })
    }

    /// Distinguishes this configuration from every other one loaded by the
    /// process; formula registries rebind when it changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn psets(&self) -> impl Iterator<Item = &Pset> {
        self.psets.values()
    }

    pub fn pset(&self, key: &str) -> Option<&Pset> {
        self.psets.get(key)
    }

    pub fn pset_by_key_or_title(&self, name: &str) -> Option<&Pset> {
        self.psets
            .get(name)
            .or_else(|| self.psets.values().find(|p| p.title == name))
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.values()
    }

    pub fn category(&self, name: &str) -> Option<&Category> {
        self.categories.get(name)
    }

    pub fn formulas(&self) -> impl Iterator<Item = &NamedFormula> {
        self.formulas.values()
    }

    pub fn formula_by_name(&self, name: &str) -> Option<&NamedFormula> {
        self.formulas.get(name)
    }

    pub fn letters(&self) -> &LetterTable {
        &self.letters
    }
}

fn valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn build_pset(pc: PsetConfig, index: usize) -> Result<Pset, ConfigError> {
    if !valid_key(&pc.key) || pc.key.starts_with('_') {
        return Err(ConfigError::PsetKey(pc.key));
    }
    let mut grades = IndexMap::new();
    for gc in pc.grades {
        if !valid_key(&gc.key) || gc.key.starts_with('_') || gc.key == "total" {
            return Err(ConfigError::EntryKey {
                pset: pc.key,
                key: gc.key,
            });
        }
        if grades.contains_key(&gc.key) {
            return Err(ConfigError::DuplicateEntry {
                pset: pc.key,
                key: gc.key,
            });
        }
        let entry_type = match (&gc.formula, gc.entry_type) {
            (Some(_), _) => EntryType::Formula,
            (None, Some(EntryType::Formula)) => {
                return Err(ConfigError::MissingExpression {
                    pset: pc.key,
                    key: gc.key,
                })
            }
            (None, t) => t.unwrap_or_default(),
        };
        let entry = GradeEntry {
            title: gc.title.unwrap_or_else(|| gc.key.clone()),
            key: gc.key,
            max: gc.max,
            entry_type,
            is_extra: gc.is_extra,
            no_total: gc.no_total,
            formula: gc.formula,
        };
        grades.insert(entry.key.clone(), entry);
    }
    Ok(Pset {
        id: pc.id.unwrap_or(index as u32 + 1),
        title: pc.title.unwrap_or_else(|| pc.key.clone()),
        has_extra: grades.values().any(|ge: &GradeEntry| ge.is_extra),
        key: pc.key,
        category: pc.category,
        weight: pc.weight,
        disabled: pc.disabled,
        grades,
    })
}
