use chrono::NaiveDate;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::layers::condition::ConditionModel;
use crate::layers::discovery::PaperSource;
use crate::layers::filter::ResultFilter;
use crate::layers::planner::{LinearQuery, Planner};
use crate::layers::store::PaperStore;
use crate::layers::Paper;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("paper source unavailable while checking {date}: {source:#}")]
    SourceUnavailable {
        date: NaiveDate,
        #[source]
        source: anyhow::Error,
    },

    #[error("paper store failed: {0:#}")]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CheckCache(NaiveDate),
    SearchRemote(NaiveDate),
    Exhausted,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::CheckCache(d) => write!(f, "CheckCache({})", d),
            Step::SearchRemote(d) => write!(f, "SearchRemote({})", d),
            Step::Exhausted => write!(f, "Exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Found { date: NaiveDate, papers: Vec<Paper> },
    Exhausted,
    /// Every satisfying paper of an explicit date range, possibly none.
    Collected {
        from: NaiveDate,
        until: NaiveDate,
        papers: Vec<Paper>,
    },
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: Outcome,
    pub trace: Vec<Step>,
}

impl Resolution {
    pub fn papers(&self) -> &[Paper] {
        match &self.outcome {
            Outcome::Found { papers, .. } | Outcome::Collected { papers, .. } => papers,
            Outcome::Exhausted => &[],
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        match &self.outcome {
            Outcome::Found { date, .. } => Some(*date),
            Outcome::Collected { until, .. } => Some(*until),
            Outcome::Exhausted => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverPolicy {
    /// Calendar dates examined, the target date included.
    pub window_days: u32,
    pub fetch_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            window_days: 4,
            fetch_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(3),
        }
    }
}

pub struct Resolver {
    source: Arc<dyn PaperSource>,
    store: Arc<dyn PaperStore>,
    policy: ResolverPolicy,
}

impl Resolver {
    pub fn new(source: Arc<dyn PaperSource>, store: Arc<dyn PaperStore>, policy: ResolverPolicy) -> Self {
        Self { source, store, policy }
    }

    pub async fn resolve(&self, model: &ConditionModel, target: NaiveDate) -> Result<Resolution, ResolveError> {
        let queries = Planner::plan(model);
        let oldest = target - chrono::Duration::days(i64::from(self.policy.window_days.max(1)) - 1);
        let mut trace = Vec::new();
        let mut step = Step::CheckCache(target);

        loop {
            tracing::debug!("resolver step {}", step);
            trace.push(step);
            step = match step {
                Step::CheckCache(date) => match self.check_cache(model, date).await? {
                    Some(papers) => {
                        tracing::info!("{} cached papers satisfy '{}' on {}", papers.len(), model, date);
                        return Ok(Resolution {
                            outcome: Outcome::Found { date, papers },
                            trace,
                        });
                    }
                    None => Step::SearchRemote(date),
                },
                Step::SearchRemote(date) => {
                    let papers = self.search_remote(&queries, model, date).await?;
                    if !papers.is_empty() {
                        tracing::info!("{} papers satisfy '{}' on {}", papers.len(), model, date);
                        return Ok(Resolution {
                            outcome: Outcome::Found { date, papers },
                            trace,
                        });
                    }
                    match date.pred_opt() {
                        Some(previous) if date > oldest => Step::CheckCache(previous),
                        _ => Step::Exhausted,
                    }
                }
                Step::Exhausted => {
                    tracing::info!("No papers satisfy '{}' between {} and {}", model, oldest, target);
                    return Ok(Resolution {
                        outcome: Outcome::Exhausted,
                        trace,
                    });
                }
            };
        }
    }

    /// Collects the satisfying papers of every date in `from..=until`. Dates are
    /// visited oldest first; each is checked against the cache, then searched once.
    pub async fn resolve_range(
        &self,
        model: &ConditionModel,
        from: NaiveDate,
        until: NaiveDate,
    ) -> Result<Resolution, ResolveError> {
        let queries = Planner::plan(model);
        let mut trace = Vec::new();
        let mut merged = BTreeMap::new();

        for date in from.iter_days().take_while(|d| *d <= until) {
            trace.push(Step::CheckCache(date));
            let papers = match self.check_cache(model, date).await? {
                Some(papers) => papers,
                None => {
                    trace.push(Step::SearchRemote(date));
                    self.search_remote(&queries, model, date).await?
                }
            };
            tracing::debug!("{} papers satisfy '{}' on {}", papers.len(), model, date);
            for paper in papers {
                merged.entry(paper.id.clone()).or_insert(paper);
            }
        }

        let papers = ResultFilter::filter(merged.into_values().collect(), model);
        tracing::info!("{} papers satisfy '{}' between {} and {}", papers.len(), model, from, until);
        Ok(Resolution {
            outcome: Outcome::Collected { from, until, papers },
            trace,
        })
    }

    /// Satisfying papers of a complete cache entry, `None` when there are none.
    async fn check_cache(&self, model: &ConditionModel, date: NaiveDate) -> Result<Option<Vec<Paper>>, ResolveError> {
        let cached = self.store.get(date).await.map_err(ResolveError::Store)?;
        Ok(cached
            .map(|papers| ResultFilter::filter(papers, model))
            .filter(|papers| !papers.is_empty()))
    }

    /// Fetches `date`, caches its pure-CS papers and returns those satisfying `model`.
    async fn search_remote(
        &self,
        queries: &[LinearQuery],
        model: &ConditionModel,
        date: NaiveDate,
    ) -> Result<Vec<Paper>, ResolveError> {
        let fetched = self.fetch_date(queries, date).await?;
        let pure = ResultFilter::pure_cs(fetched);
        self.store
            .put(date, pure.clone())
            .await
            .map_err(ResolveError::Store)?;
        Ok(ResultFilter::filter(pure, model))
    }

    /// Runs every planned query for `date` concurrently and waits for all of them.
    /// Either all succeed or the date is reported unavailable; partial results are
    /// discarded.
    async fn fetch_date(&self, queries: &[LinearQuery], date: NaiveDate) -> Result<Vec<Paper>, ResolveError> {
        let dated: Vec<LinearQuery> = queries.iter().cloned().map(|q| q.on(date)).collect();
        let batches = join_all(dated.iter().map(|q| self.fetch_with_retry(q)))
            .await
            .into_iter()
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|source| ResolveError::SourceUnavailable { date, source })?;

        let mut merged = BTreeMap::new();
        for paper in batches.into_iter().flatten() {
            if paper.published != date {
                tracing::debug!("Ignoring {} published on {} while searching {}", paper.id, paper.published, date);
                continue;
            }
            merged.entry(paper.id.clone()).or_insert(paper);
        }
        Ok(merged.into_values().collect())
    }

    async fn fetch_with_retry(&self, query: &LinearQuery) -> anyhow::Result<Vec<Paper>> {
        match self.fetch_once(query).await {
            Ok(papers) => Ok(papers),
            Err(e) => {
                tracing::warn!("Search '{}' failed, retrying in {:?}: {:#}", query, self.policy.retry_backoff, e);
                tokio::time::sleep(self.policy.retry_backoff).await;
                self.fetch_once(query).await
            }
        }
    }

    async fn fetch_once(&self, query: &LinearQuery) -> anyhow::Result<Vec<Paper>> {
        self.source.search_within(query, self.policy.fetch_timeout).await
    }
}
