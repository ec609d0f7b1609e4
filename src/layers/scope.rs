use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::layers::condition::{ConditionModel, ParseError};

pub const DEFAULT_SCOPE: &str = "default";

/// Keyword configuration of one chat group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub chat_id: String,
    pub condition: ConditionModel,
    pub updated_at: DateTime<Utc>,
}

impl Scope {
    pub fn new(chat_id: impl Into<String>, condition: ConditionModel) -> Self {
        Self {
            chat_id: chat_id.into(),
            condition,
            updated_at: Utc::now(),
        }
    }
}

/// Accepts `/config optional:A or B, C required:x` or just the part after `/config`.
pub fn parse_config_command(text: &str) -> Result<ConditionModel, ParseError> {
    let text = text.trim();
    let body = text
        .strip_prefix("/config")
        .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        .unwrap_or(text);
    ConditionModel::parse(body)
}

#[async_trait]
pub trait ScopeStore: Send + Sync {
    async fn get(&self, chat_id: &str) -> Result<Option<Scope>>;

    /// Full replace. An empty condition removes the scope.
    async fn replace(&self, scope: Scope) -> Result<()>;

    async fn list(&self) -> Result<Vec<Scope>>;
}

/// Resolves the condition for a chat, falling back to the default condition.
pub async fn effective_condition(
    store: &dyn ScopeStore,
    chat_id: &str,
    default: &ConditionModel,
) -> Result<ConditionModel> {
    Ok(store
        .get(chat_id)
        .await?
        .map(|scope| scope.condition)
        .unwrap_or_else(|| default.clone()))
}

fn apply(scopes: &mut BTreeMap<String, Scope>, scope: Scope) {
    if scope.condition.is_empty() {
        scopes.remove(&scope.chat_id);
    } else {
        scopes.insert(scope.chat_id.clone(), scope);
    }
}

#[derive(Default)]
pub struct MemoryScopeStore {
    scopes: RwLock<BTreeMap<String, Scope>>,
}

#[async_trait]
impl ScopeStore for MemoryScopeStore {
    async fn get(&self, chat_id: &str) -> Result<Option<Scope>> {
        Ok(self.scopes.read().await.get(chat_id).cloned())
    }

    async fn replace(&self, scope: Scope) -> Result<()> {
        apply(&mut *self.scopes.write().await, scope);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Scope>> {
        Ok(self.scopes.read().await.values().cloned().collect())
    }
}

/// All scopes in a single JSON file, rewritten on every replace.
pub struct JsonScopeStore {
    path: PathBuf,
    scopes: RwLock<BTreeMap<String, Scope>>,
}

impl JsonScopeStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let scopes = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).with_context(|| format!("decoding {:?}", path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
        };
        Ok(Self {
            path,
            scopes: RwLock::new(scopes),
        })
    }

    async fn persist(&self, scopes: &BTreeMap<String, Scope>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(scopes)?;
        let mut file = File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {:?}", self.path))?;
        Ok(())
    }
}

#[async_trait]
impl ScopeStore for JsonScopeStore {
    async fn get(&self, chat_id: &str) -> Result<Option<Scope>> {
        Ok(self.scopes.read().await.get(chat_id).cloned())
    }

    async fn replace(&self, scope: Scope) -> Result<()> {
        let mut scopes = self.scopes.write().await;
        let mut next = scopes.clone();
        tracing::info!("Replacing scope for {}: {}", scope.chat_id, scope.condition);
        apply(&mut next, scope);
        self.persist(&next).await?;
        *scopes = next;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Scope>> {
        Ok(self.scopes.read().await.values().cloned().collect())
    }
}
