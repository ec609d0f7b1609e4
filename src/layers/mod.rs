use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Paper {
    pub id: String,
    pub title: String,
    pub abstract_text: String,
    pub categories: Vec<String>,
    pub published: NaiveDate,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Paper {
    pub fn abs_url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("https://arxiv.org/abs/{}", self.id))
    }

    pub fn pdf_link(&self) -> String {
        self.pdf_url
            .clone()
            .unwrap_or_else(|| format!("https://arxiv.org/pdf/{}", self.id))
    }
}

pub mod condition;
pub mod discovery;
pub mod export;
pub mod filter;
pub mod planner;
pub mod resolution;
pub mod scope;
pub mod store;

#[cfg(test)]
pub(crate) mod testing {
    use super::condition::{Clause, ConditionModel};
    use super::Paper;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    pub fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    pub fn paper(id: &str, title: &str, abstract_text: &str, categories: &[&str], published: &str) -> Paper {
        Paper {
            id: id.to_string(),
            title: title.to_string(),
            abstract_text: abstract_text.to_string(),
            categories: categories.iter().map(|c| c.to_string()).collect(),
            published: date(published),
            authors: vec!["A. Author".to_string()],
            url: None,
            pdf_url: None,
            comment: None,
        }
    }

    fn term() -> impl Strategy<Value = String> {
        prop::sample::select(vec![
            "agent", "llm", "vision", "language model", "graph", "robot", "diffusion", "rl",
        ])
        .prop_map(str::to_string)
    }

    fn clause() -> impl Strategy<Value = Clause> {
        prop::collection::vec(term(), 1..4).prop_map(|terms| Clause::new(terms).unwrap())
    }

    pub fn model() -> impl Strategy<Value = ConditionModel> {
        (prop::collection::vec(clause(), 0..3), prop::collection::vec(clause(), 0..3))
            .prop_map(|(required, optional)| ConditionModel { required, optional })
    }
}
