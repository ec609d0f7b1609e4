mod config;
mod layers;

use crate::config::Settings;
use crate::layers::condition::ConditionModel;
use crate::layers::discovery::ArxivClient;
use crate::layers::export::{self, DigestExporter};
use crate::layers::resolution::{Outcome, Resolver};
use crate::layers::scope::{self, JsonScopeStore, Scope, ScopeStore, DEFAULT_SCOPE};
use crate::layers::store::JsonPaperStore;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use futures_util::future::join_all;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arxiv-digest", about = "Daily arXiv CS digests filtered by per-group keyword conditions")]
struct Cli {
    /// Overrides DATA_DIR
    #[arg(long, global = true)]
    data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replace a group's condition, e.g. `config --chat oc_1 optional: agent or LLM, PPO required: rl`
    Config {
        #[arg(long)]
        chat: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        expr: Vec<String>,
    },
    /// Print the effective condition of a group
    Show {
        #[arg(long, default_value = DEFAULT_SCOPE)]
        chat: String,
    },
    /// Resolve papers for one group
    Daily {
        #[arg(long, default_value = DEFAULT_SCOPE)]
        chat: String,
        /// Target date (YYYY-MM-DD), defaults to today (UTC)
        #[arg(long, conflicts_with = "from")]
        date: Option<NaiveDate>,
        /// Collect every match from this date on, without falling back
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last date of the range, clamped to today (UTC)
        #[arg(long, requires = "from")]
        until: Option<NaiveDate>,
        #[arg(long)]
        no_export: bool,
    },
    /// Show the next paper of a group's latest digest
    Next {
        #[arg(long, default_value = DEFAULT_SCOPE)]
        chat: String,
    },
    /// Resolve papers for the default scope and every configured group
    Broadcast {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run `broadcast` every day at a local time
    Schedule {
        /// HH:MM, local time
        #[arg(long, default_value = "20:30", value_parser = parse_clock)]
        at: NaiveTime,
    },
}

/// What a lookup covers: one date with fallback, or an explicit range.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Span {
    Day(NaiveDate),
    Range { from: NaiveDate, until: NaiveDate },
}

/// `until` defaults to and is clamped to `today`.
fn date_range(from: NaiveDate, until: Option<NaiveDate>, today: NaiveDate) -> Result<Span> {
    let until = until.unwrap_or(today).min(today);
    if from > until {
        bail!("--from {} is after {}", from, until);
    }
    Ok(Span::Range { from, until })
}

fn parse_clock(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|e| format!("expected HH:MM: {}", e))
}

struct App {
    settings: Settings,
    resolver: Resolver,
    scopes: Arc<dyn ScopeStore>,
    exporter: DigestExporter,
}

impl App {
    async fn build(settings: Settings) -> Result<Self> {
        let source = Arc::new(ArxivClient::new(settings.arxiv.clone())?);
        let store = Arc::new(JsonPaperStore::open(settings.papers_dir()).await?);
        let scopes = Arc::new(JsonScopeStore::open(settings.scopes_path()).await?);
        let resolver = Resolver::new(source, store, settings.policy.clone());
        let exporter = DigestExporter::new(settings.export_dir());
        Ok(Self {
            settings,
            resolver,
            scopes,
            exporter,
        })
    }

    async fn condition_for(&self, chat_id: &str) -> Result<ConditionModel> {
        scope::effective_condition(self.scopes.as_ref(), chat_id, &self.settings.default_condition).await
    }

    /// Replaces a group's condition. Invalid text is an error and stores nothing.
    async fn configure(&self, chat_id: &str, text: &str) -> Result<ConditionModel> {
        let model = scope::parse_config_command(text)
            .with_context(|| format!("[{}] invalid condition '{}'", chat_id, text))?;
        self.scopes
            .replace(Scope::new(chat_id, model.clone()))
            .await
            .context("saving scope")?;
        Ok(model)
    }

    /// Resolves one group and reports the outcome. Failures stay local to the group.
    async fn run_for(&self, chat_id: &str, span: Span, write_digest: bool) -> Result<String> {
        let model = self.condition_for(chat_id).await?;
        let resolution = match span {
            Span::Day(date) => self.resolver.resolve(&model, date).await,
            Span::Range { from, until } => self.resolver.resolve_range(&model, from, until).await,
        };
        let result = resolution.map(|r| {
            tracing::debug!(
                "{} resolved via {:?}: {} papers from {:?}",
                chat_id,
                r.trace,
                r.papers().len(),
                r.date()
            );
            r.outcome
        });

        let written = match (write_digest, &result) {
            (true, Ok(Outcome::Found { date, papers })) => {
                Some(self.exporter.export(chat_id, *date, papers, &model).await?)
            }
            (true, Ok(Outcome::Collected { from, until, papers })) if !papers.is_empty() => {
                Some(self.exporter.export_range(chat_id, *from, *until, papers, &model).await?)
            }
            _ => None,
        };
        if let Some(path) = written {
            tracing::info!("Digest for {} written to {:?}", chat_id, path);
        }
        Ok(export::summary(chat_id, &model, &result))
    }

    async fn broadcast(&self, date: NaiveDate) -> Result<()> {
        let mut chats = vec![DEFAULT_SCOPE.to_string()];
        chats.extend(
            self.scopes
                .list()
                .await?
                .into_iter()
                .map(|s| s.chat_id)
                .filter(|id| id != DEFAULT_SCOPE),
        );
        tracing::info!("Broadcasting {} to {} scopes", date, chats.len());

        let reports = join_all(chats.iter().map(|chat| self.run_for(chat, Span::Day(date), true))).await;
        for (chat, report) in chats.iter().zip(reports) {
            match report {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!("Broadcast to {} failed: {:#}", chat, e),
            }
        }
        Ok(())
    }

    async fn schedule(&self, at: NaiveTime) -> Result<()> {
        loop {
            let now = Local::now();
            let mut next = now
                .date_naive()
                .and_time(at)
                .and_local_timezone(Local)
                .earliest()
                .ok_or_else(|| anyhow!("{} does not exist in the local timezone today", at))?;
            if next <= now {
                next += chrono::Duration::days(1);
            }
            let wait = (next - now).to_std().unwrap_or_default();
            tracing::info!("Next broadcast at {}", next);
            tokio::time::sleep(wait).await;

            if let Err(e) = self.broadcast(Utc::now().date_naive()).await {
                tracing::error!("Scheduled broadcast failed: {:#}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Auto-create .env if it doesn't exist (copy from .env.example)
    if !std::path::Path::new(".env").exists() && std::path::Path::new(".env.example").exists() {
        std::fs::copy(".env.example", ".env")?;
    }
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }

    let app = App::build(settings).await?;
    match cli.command {
        Command::Config { chat, expr } => {
            let model = app.configure(&chat, &expr.join(" ")).await?;
            if model.is_empty() {
                println!("[{}] condition cleared; the default condition applies", chat);
            } else {
                println!("[{}] condition set to: {}", chat, model);
            }
        }
        Command::Show { chat } => {
            let model = app.condition_for(&chat).await?;
            println!("[{}] {}", chat, model);
        }
        Command::Daily {
            chat,
            date,
            from,
            until,
            no_export,
        } => {
            let today = Utc::now().date_naive();
            let span = match from {
                Some(from) => date_range(from, until, today)?,
                None => Span::Day(date.unwrap_or(today)),
            };
            println!("{}", app.run_for(&chat, span, !no_export).await?);
        }
        Command::Next { chat } => match app.exporter.next(&chat).await? {
            Some(browsed) => println!(
                "[{}] ({}/{}) {}\n{}\n{}",
                chat,
                browsed.position + 1,
                browsed.total,
                browsed.paper.title,
                browsed.paper.abs_url(),
                browsed.paper.abstract_text
            ),
            None => println!("[{}] no digest to browse yet; run `daily` first", chat),
        },
        Command::Broadcast { date } => {
            app.broadcast(date.unwrap_or_else(|| Utc::now().date_naive())).await?;
        }
        Command::Schedule { at } => app.schedule(at).await?,
    }

    Ok(())
}
