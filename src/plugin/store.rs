use crate::message::{Request, Response};
use crate::plugin::cache::Cache;
use crate::plugin::{Handler, Next};
use crate::trie::ZoneTrie;
use crate::types::{Record, RecordType};
use anyhow::Result;
use std::sync::Arc;

/// Record storage that can also answer queries.
#[async_trait::async_trait]
pub trait Store: Handler {
    async fn get(&self, zone: &str, rtype: Option<RecordType>) -> Result<Option<Vec<Record>>>;
    async fn set(&self, zone: &str, rtype: RecordType, records: Vec<Record>) -> Result<()>;
    async fn append(&self, zone: &str, rtype: RecordType, record: Record) -> Result<()>;
    async fn delete(&self, zone: &str, rtype: Option<RecordType>, record: Option<&Record>) -> Result<()>;
}

/// In-memory zone data backed by a [`ZoneTrie`].
pub struct ZoneStore {
    trie: Arc<ZoneTrie>,
    cache: Option<Arc<Cache>>,
}

impl ZoneStore {
    pub fn new() -> Self {
        Self { trie: Arc::new(ZoneTrie::new()), cache: None }
    }

    pub fn with_trie(trie: Arc<ZoneTrie>) -> Self { Self { trie, cache: None } }

    /// Answers also populate `cache`, keyed on the matching trie pattern.
    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn trie(&self) -> &Arc<ZoneTrie> { &self.trie }

    fn invalidate(&self, zone: &str, rtype: Option<RecordType>) {
        let Some(cache) = &self.cache else { return };
        match rtype {
            Some(rtype) => cache.delete(zone, rtype, None),
            None => cache.clear(),
        }
    }
}

impl Default for ZoneStore {
    fn default() -> Self { Self::new() }
}

#[async_trait::async_trait]
impl Store for ZoneStore {
    async fn get(&self, zone: &str, rtype: Option<RecordType>) -> Result<Option<Vec<Record>>> {
        Ok(self.trie.get(zone, rtype))
    }

    async fn set(&self, zone: &str, rtype: RecordType, records: Vec<Record>) -> Result<()> {
        self.trie.add(zone, rtype, records);
        self.invalidate(zone, Some(rtype));
        Ok(())
    }

    async fn append(&self, zone: &str, rtype: RecordType, record: Record) -> Result<()> {
        self.trie.append(zone, rtype, record);
        self.invalidate(zone, Some(rtype));
        Ok(())
    }

    async fn delete(&self, zone: &str, rtype: Option<RecordType>, record: Option<&Record>) -> Result<()> {
        self.trie.delete(zone, rtype, record);
        self.invalidate(zone, rtype);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Handler for ZoneStore {
    fn name(&self) -> &str { "store" }

    async fn handle(&self, req: &Request, res: &mut Response, next: Next<'_>) -> Result<()> {
        if res.is_finished() { return next.run(req, res).await; }
        let Some(question) = req.question() else { return next.run(req, res).await };

        let Some(records) = self.trie.get(&question.name, Some(question.qtype)) else {
            tracing::debug!("     |-- [store] no data for {} {}", question.name, question.qtype);
            return next.run(req, res).await;
        };

        if let (Some(cache), Some(pattern)) = (&self.cache, self.trie.resolve(&question.name)) {
            // Stored under the pattern, so the wildcard-substituted names are put back.
            let raw = self.trie.get(&pattern, Some(question.qtype)).unwrap_or_else(|| records.clone());
            cache.set(&pattern, question.qtype, raw);
        }

        tracing::debug!("     |-- [store] {} answer(s) for {} {}", records.len(), question.name, question.qtype);
        res.answer(records)?;
        next.run(req, res).await
    }
}
