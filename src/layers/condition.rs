use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layers::Paper;

const REQUIRED_TAG: &str = "required:";
const OPTIONAL_TAG: &str = "optional:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty keyword in clause '{0}'")]
    EmptyTerm(String),

    #[error("empty clause between ',' separators in '{0}'")]
    EmptyClause(String),

    #[error("'{0}' given more than once")]
    DuplicateTag(&'static str),
}

/// A disjunction of terms. Never empty once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause(Vec<String>);

impl Clause {
    pub fn new<I, S>(terms: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        let mut kept = Vec::new();
        for term in terms {
            let term = normalize_term(term.as_ref());
            if term.is_empty() {
                continue;
            }
            if seen.insert(term.to_lowercase()) {
                kept.push(term);
            }
        }
        (!kept.is_empty()).then_some(Self(kept))
    }

    pub fn terms(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    fn matches(&self, haystack: &str) -> bool {
        self.0
            .iter()
            .any(|term| haystack.contains(&term.to_lowercase()))
    }

    fn normalized(&self) -> BTreeSet<String> {
        self.0.iter().map(|t| t.to_lowercase()).collect()
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" or "))
    }
}

/// Conjunction of clauses. Required and optional clauses match identically;
/// the split only records how a group configured them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionModel {
    #[serde(default)]
    pub required: Vec<Clause>,
    #[serde(default)]
    pub optional: Vec<Clause>,
}

impl ConditionModel {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let sections = split_sections(text)?;
        Ok(Self {
            required: parse_clauses(sections.required.unwrap_or_default())?,
            optional: parse_clauses(sections.optional.unwrap_or_default())?,
        })
    }

    pub fn clauses(&self) -> impl Iterator<Item = &Clause> {
        self.required.iter().chain(self.optional.iter())
    }

    pub fn clause_count(&self) -> usize {
        self.required.len() + self.optional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clause_count() == 0
    }

    pub fn is_satisfied_by(&self, paper: &Paper) -> bool {
        if self.is_empty() {
            return true;
        }
        let haystack = format!("{}\n{}", paper.title, paper.abstract_text).to_lowercase();
        self.clauses().all(|clause| clause.matches(&haystack))
    }

    /// Same clause and term sets, ignoring order and case.
    pub fn equivalent(&self, other: &Self) -> bool {
        fn sets(model: &ConditionModel) -> (BTreeSet<BTreeSet<String>>, BTreeSet<BTreeSet<String>>) {
            (
                model.required.iter().map(Clause::normalized).collect(),
                model.optional.iter().map(Clause::normalized).collect(),
            )
        }
        sets(self) == sets(other)
    }
}

impl fmt::Display for ConditionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |clauses: &[Clause]| {
            clauses
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut parts = Vec::new();
        if !self.required.is_empty() {
            parts.push(format!("{} {}", REQUIRED_TAG, join(&self.required)));
        }
        if !self.optional.is_empty() {
            parts.push(format!("{} {}", OPTIONAL_TAG, join(&self.optional)));
        }
        write!(f, "{}", parts.join(" "))
    }
}

#[derive(Default)]
struct Sections<'a> {
    required: Option<&'a str>,
    optional: Option<&'a str>,
}

fn normalize_term(term: &str) -> String {
    term.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Finds `required:` / `optional:` tags that start at a word boundary.
fn find_tags(text: &str) -> Vec<(usize, &'static str)> {
    let lower = text.to_ascii_lowercase();
    let mut tags = Vec::new();
    for tag in [REQUIRED_TAG, OPTIONAL_TAG] {
        let mut from = 0;
        while let Some(pos) = lower[from..].find(tag) {
            let at = from + pos;
            let boundary = lower[..at]
                .chars()
                .next_back()
                .map_or(true, |c| c.is_whitespace() || c == ',');
            if boundary {
                tags.push((at, tag));
            }
            from = at + tag.len();
        }
    }
    tags.sort_by_key(|(at, _)| *at);
    tags
}

fn split_sections(text: &str) -> Result<Sections<'_>, ParseError> {
    let tags = find_tags(text);
    let mut sections = Sections::default();

    let head_end = tags.first().map_or(text.len(), |(at, _)| *at);
    let head = text[..head_end].trim();
    if !head.is_empty() {
        sections.required = Some(head);
    }

    for (i, (at, tag)) in tags.iter().enumerate() {
        let start = at + tag.len();
        let end = tags.get(i + 1).map_or(text.len(), |(next, _)| *next);
        let body = text[start..end].trim();
        let slot = if *tag == REQUIRED_TAG {
            &mut sections.required
        } else {
            &mut sections.optional
        };
        if slot.is_some() {
            return Err(ParseError::DuplicateTag(*tag));
        }
        *slot = Some(body);
    }
    Ok(sections)
}

fn parse_clauses(body: &str) -> Result<Vec<Clause>, ParseError> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(Vec::new());
    }
    body.split(',').map(|raw| parse_clause(raw, body)).collect()
}

fn parse_clause(raw: &str, body: &str) -> Result<Clause, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::EmptyClause(body.to_string()));
    }
    let mut terms = vec![Vec::new()];
    for word in raw.split_whitespace() {
        if word.eq_ignore_ascii_case("or") {
            terms.push(Vec::new());
        } else if let Some(current) = terms.last_mut() {
            current.push(word);
        }
    }
    if terms.iter().any(|words| words.is_empty()) {
        return Err(ParseError::EmptyTerm(raw.trim().to_string()));
    }
    Clause::new(terms.iter().map(|words| words.join(" ")))
        .ok_or_else(|| ParseError::EmptyTerm(raw.trim().to_string()))
}
