use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs::{create_dir_all, File};
use tokio::io::AsyncWriteExt;

use crate::layers::condition::ConditionModel;
use crate::layers::resolution::{Outcome, ResolveError};
use crate::layers::Paper;

const CURSOR_FILE: &str = "cursor.json";

/// Which digest a chat is browsing and the paper it sees next.
#[derive(Debug, Serialize, Deserialize)]
struct Cursor {
    digest: String,
    next: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Browsed {
    /// Zero-based position in the digest.
    pub position: usize,
    pub total: usize,
    pub paper: Paper,
}

pub struct DigestExporter {
    base_dir: PathBuf,
}

impl DigestExporter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn chat_dir(&self, chat_id: &str) -> PathBuf {
        self.base_dir.join(sanitize(chat_id))
    }

    /// Writes `<chat>/<date>.md` and `<chat>/<date>.json`. Returns the Markdown path.
    pub async fn export(
        &self,
        chat_id: &str,
        date: NaiveDate,
        papers: &[Paper],
        model: &ConditionModel,
    ) -> Result<PathBuf> {
        let stem = date.format("%Y-%m-%d").to_string();
        self.write(chat_id, &stem, &stem, papers, model).await
    }

    /// Writes `<chat>/<from>_<until>.md` and the matching `.json`.
    pub async fn export_range(
        &self,
        chat_id: &str,
        from: NaiveDate,
        until: NaiveDate,
        papers: &[Paper],
        model: &ConditionModel,
    ) -> Result<PathBuf> {
        let stem = format!("{}_{}", from.format("%Y-%m-%d"), until.format("%Y-%m-%d"));
        let title = format!("{} to {}", from.format("%Y-%m-%d"), until.format("%Y-%m-%d"));
        self.write(chat_id, &stem, &title, papers, model).await
    }

    async fn write(
        &self,
        chat_id: &str,
        stem: &str,
        title: &str,
        papers: &[Paper],
        model: &ConditionModel,
    ) -> Result<PathBuf> {
        let target_dir = self.chat_dir(chat_id);
        create_dir_all(&target_dir).await?;

        let markdown_path = target_dir.join(format!("{}.md", stem));
        tracing::info!("Writing digest to: {:?}", markdown_path);
        let mut file = File::create(&markdown_path).await?;
        file.write_all(render_markdown(title, papers, model).as_bytes()).await?;

        let json_path = target_dir.join(format!("{}.json", stem));
        let json = serde_json::to_string_pretty(papers)?;
        let mut json_file = File::create(&json_path).await?;
        json_file.write_all(json.as_bytes()).await?;

        // a new digest restarts browsing
        let cursor = Cursor {
            digest: stem.to_string(),
            next: 0,
        };
        self.save_cursor(chat_id, &cursor).await?;
        Ok(markdown_path)
    }

    /// Steps through the chat's latest digest one paper at a time, wrapping
    /// around at the end. `None` until a non-empty digest has been written.
    pub async fn next(&self, chat_id: &str) -> Result<Option<Browsed>> {
        let dir = self.chat_dir(chat_id);
        let raw = match tokio::fs::read_to_string(dir.join(CURSOR_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading cursor for {}", chat_id)),
        };
        let mut cursor: Cursor = serde_json::from_str(&raw).context("parsing digest cursor")?;

        let digest_path = dir.join(format!("{}.json", cursor.digest));
        let json = tokio::fs::read_to_string(&digest_path)
            .await
            .with_context(|| format!("reading digest {:?}", digest_path))?;
        let papers: Vec<Paper> = serde_json::from_str(&json)?;
        if papers.is_empty() {
            return Ok(None);
        }

        let position = cursor.next % papers.len();
        cursor.next = (position + 1) % papers.len();
        self.save_cursor(chat_id, &cursor).await?;
        Ok(Some(Browsed {
            position,
            total: papers.len(),
            paper: papers[position].clone(),
        }))
    }

    async fn save_cursor(&self, chat_id: &str, cursor: &Cursor) -> Result<()> {
        let path = self.chat_dir(chat_id).join(CURSOR_FILE);
        tokio::fs::write(&path, serde_json::to_vec(cursor)?)
            .await
            .with_context(|| format!("writing {:?}", path))
    }
}

fn sanitize(raw: &str) -> String {
    let cleaned = raw.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_");
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

pub fn render_markdown(title: &str, papers: &[Paper], model: &ConditionModel) -> String {
    let mut out = String::new();
    let condition = if model.is_empty() {
        "(none)".to_string()
    } else {
        model.to_string()
    };
    let _ = writeln!(out, "# arXiv digest: {}\n", title);
    let _ = writeln!(out, "> Condition: {}", condition);
    let _ = writeln!(out, "> {} papers\n", papers.len());

    for paper in papers {
        let _ = writeln!(out, "### {}", paper.title);
        let _ = writeln!(out, "[[arxiv]({})] [[pdf]({})]", paper.abs_url(), paper.pdf_link());
        if !paper.authors.is_empty() {
            let _ = writeln!(out, "> **Authors**: {}", paper.authors.join(", "));
        }
        let _ = writeln!(out, "> **Published**: {}", paper.published.format("%Y-%m-%d"));
        let _ = writeln!(out, "> **Categories**: {}", paper.categories.join(", "));
        if let Some(comment) = &paper.comment {
            let _ = writeln!(out, "> **Comment**: {}", comment);
        }
        let _ = writeln!(out, "\n{}\n", paper.abstract_text);
    }
    out
}

/// One-line report for a chat, distinguishing "nothing published" from "could not check".
pub fn summary(chat_id: &str, model: &ConditionModel, result: &Result<Outcome, ResolveError>) -> String {
    match result {
        Ok(Outcome::Found { date, papers }) => {
            format!("[{}] {} papers matching '{}' published on {}", chat_id, papers.len(), model, date)
        }
        Ok(Outcome::Exhausted) => format!(
            "[{}] no papers matching '{}' were published in the search window",
            chat_id, model
        ),
        Ok(Outcome::Collected { from, until, papers }) if papers.is_empty() => format!(
            "[{}] no papers matching '{}' were published between {} and {}",
            chat_id, model, from, until
        ),
        Ok(Outcome::Collected { from, until, papers }) => format!(
            "[{}] {} papers matching '{}' published between {} and {}",
            chat_id,
            papers.len(),
            model,
            from,
            until
        ),
        Err(ResolveError::SourceUnavailable { date, .. }) => format!(
            "[{}] could not check arXiv for {}; try again later",
            chat_id, date
        ),
        Err(e) => format!("[{}] lookup failed: {}", chat_id, e),
    }
}
