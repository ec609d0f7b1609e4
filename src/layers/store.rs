use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{create_dir_all, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::layers::Paper;

type Entry = Arc<BTreeMap<String, Paper>>;

/// Date-keyed paper cache. `None` from `get` means the date was never stored;
/// `Some(vec![])` means it was checked and nothing was published.
#[async_trait]
pub trait PaperStore: Send + Sync {
    async fn get(&self, date: NaiveDate) -> Result<Option<Vec<Paper>>>;

    /// Union merge keyed by paper id. Readers see the entry either before or
    /// after the whole merge.
    async fn put(&self, date: NaiveDate, papers: Vec<Paper>) -> Result<()>;
}

fn merged(current: Option<&Entry>, papers: Vec<Paper>) -> BTreeMap<String, Paper> {
    let mut next = current.map(|e| (**e).clone()).unwrap_or_default();
    for paper in papers {
        next.insert(paper.id.clone(), paper);
    }
    next
}

#[derive(Default)]
pub struct MemoryPaperStore {
    entries: RwLock<HashMap<NaiveDate, Entry>>,
}

impl MemoryPaperStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaperStore for MemoryPaperStore {
    async fn get(&self, date: NaiveDate) -> Result<Option<Vec<Paper>>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&date).map(|e| e.values().cloned().collect()))
    }

    async fn put(&self, date: NaiveDate, papers: Vec<Paper>) -> Result<()> {
        let mut entries = self.entries.write().await;
        let next = merged(entries.get(&date), papers);
        entries.insert(date, Arc::new(next));
        Ok(())
    }
}

/// One `YYYY-MM-DD.json` file per date under `base_dir`, loaded lazily.
pub struct JsonPaperStore {
    base_dir: PathBuf,
    entries: RwLock<HashMap<NaiveDate, Entry>>,
}

impl JsonPaperStore {
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        create_dir_all(&base_dir)
            .await
            .with_context(|| format!("creating paper store at {:?}", base_dir))?;
        Ok(Self {
            base_dir,
            entries: RwLock::new(HashMap::new()),
        })
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.base_dir.join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    async fn load(&self, date: NaiveDate) -> Result<Option<Entry>> {
        let path = self.path_for(date);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
        };
        let papers: Vec<Paper> =
            serde_json::from_slice(&raw).with_context(|| format!("decoding {:?}", path))?;
        Ok(Some(Arc::new(
            papers.into_iter().map(|p| (p.id.clone(), p)).collect(),
        )))
    }

    async fn persist(&self, date: NaiveDate, entry: &BTreeMap<String, Paper>) -> Result<()> {
        let path = self.path_for(date);
        let tmp = path.with_extension("json.tmp");
        let papers: Vec<&Paper> = entry.values().collect();
        let json = serde_json::to_string_pretty(&papers)?;

        let mut file = File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {:?}", path))?;
        Ok(())
    }
}

#[async_trait]
impl PaperStore for JsonPaperStore {
    async fn get(&self, date: NaiveDate) -> Result<Option<Vec<Paper>>> {
        if let Some(entry) = self.entries.read().await.get(&date) {
            return Ok(Some(entry.values().cloned().collect()));
        }
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&date) {
            match self.load(date).await? {
                Some(entry) => {
                    entries.insert(date, entry);
                }
                None => return Ok(None),
            }
        }
        Ok(entries.get(&date).map(|e| e.values().cloned().collect()))
    }

    async fn put(&self, date: NaiveDate, papers: Vec<Paper>) -> Result<()> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&date) {
            if let Some(entry) = self.load(date).await? {
                entries.insert(date, entry);
            }
        }
        let next = merged(entries.get(&date), papers);
        self.persist(date, &next).await?;
        tracing::debug!("Stored {} papers for {}", next.len(), date);
        entries.insert(date, Arc::new(next));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::{date, paper};

    #[tokio::test]
    async fn test_memory_get_miss_then_complete() {
        let store = MemoryPaperStore::new();
        let day = date("2025-08-26");
        assert!(store.get(day).await.unwrap().is_none());
        store.put(day, Vec::new()).await.unwrap();
        assert_eq!(store.get(day).await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_put_is_union_by_id() {
        let store = MemoryPaperStore::new();
        let day = date("2025-08-26");
        store
            .put(day, vec![paper("1", "a", "", &["cs.AI"], "2025-08-26")])
            .await
            .unwrap();
        store
            .put(
                day,
                vec![
                    paper("1", "a", "", &["cs.AI"], "2025-08-26"),
                    paper("2", "b", "", &["cs.AI"], "2025-08-26"),
                ],
            )
            .await
            .unwrap();
        let ids: Vec<_> = store.get(day).await.unwrap().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, ["1", "2"]);
    }

    #[tokio::test]
    async fn test_concurrent_puts_commute() {
        let store = Arc::new(MemoryPaperStore::new());
        let day = date("2025-08-26");
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let p = paper(&format!("{:02}", i), "t", "", &["cs.AI"], "2025-08-26");
                    store.put(day, vec![p]).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get(day).await.unwrap().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let day = date("2025-08-26");
        {
            let store = JsonPaperStore::open(dir.path()).await.unwrap();
            assert!(store.get(day).await.unwrap().is_none());
            store
                .put(day, vec![paper("1", "a", "", &["cs.AI"], "2025-08-26")])
                .await
                .unwrap();
        }
        let store = JsonPaperStore::open(dir.path()).await.unwrap();
        store
            .put(day, vec![paper("2", "b", "", &["cs.CL"], "2025-08-26")])
            .await
            .unwrap();
        let papers = store.get(day).await.unwrap().unwrap();
        assert_eq!(papers.len(), 2);
        assert!(dir.path().join("2025-08-26.json").exists());
        assert!(!dir.path().join("2025-08-26.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_empty_put_marks_complete() {
        let dir = tempfile::tempdir().unwrap();
        let day = date("2025-08-24");
        let store = JsonPaperStore::open(dir.path()).await.unwrap();
        store.put(day, Vec::new()).await.unwrap();
        let reopened = JsonPaperStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get(day).await.unwrap(), Some(Vec::new()));
    }
}
