use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::layers::condition::ConditionModel;
use crate::layers::discovery::ArxivOptions;
use crate::layers::resolution::ResolverPolicy;

const DEFAULT_CONDITION: &str = "required: agent optional: research or browse";

#[derive(Debug, Clone)]
pub struct Settings {
    pub arxiv: ArxivOptions,
    pub policy: ResolverPolicy,
    pub data_dir: PathBuf,
    /// Set from `EXPORT_DIR`; otherwise digests live under the data directory.
    pub export_dir: Option<PathBuf>,
    pub default_condition: ConditionModel,
}

fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let mut arxiv = ArxivOptions::default();
        if let Ok(endpoint) = env::var("ARXIV_ENDPOINT") {
            url::Url::parse(endpoint.trim()).with_context(|| format!("invalid ARXIV_ENDPOINT '{}'", endpoint))?;
            arxiv.endpoint = endpoint.trim().to_string();
        }
        arxiv.timeout = Duration::from_secs(var_or("REQUEST_TIMEOUT_SECS", 30u64)?);
        arxiv.page_size = var_or("PAGE_SIZE", arxiv.page_size)?;
        arxiv.max_pages = var_or("MAX_PAGES", arxiv.max_pages)?;

        let policy = ResolverPolicy {
            window_days: var_or("SEARCH_WINDOW_DAYS", 4u32)?,
            // request time for every page of one query; rate limiter waits are not counted
            fetch_timeout: arxiv.timeout * arxiv.max_pages.max(1) as u32,
            retry_backoff: Duration::from_millis(var_or("RETRY_BACKOFF_MS", 3000u64)?),
        };

        let condition_text = env::var("DEFAULT_CONDITION").unwrap_or_else(|_| DEFAULT_CONDITION.to_string());
        let default_condition = ConditionModel::parse(&condition_text)
            .with_context(|| format!("invalid DEFAULT_CONDITION '{}'", condition_text))?;

        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
        let export_dir = env::var("EXPORT_DIR").ok().map(PathBuf::from);

        Ok(Self {
            arxiv,
            policy,
            data_dir,
            export_dir,
            default_condition,
        })
    }

    pub fn export_dir(&self) -> PathBuf {
        self.export_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("digests"))
    }

    pub fn papers_dir(&self) -> PathBuf {
        self.data_dir.join("papers")
    }

    pub fn scopes_path(&self) -> PathBuf {
        self.data_dir.join("scopes.json")
    }
}
