use crate::message::{Request, Response};
use crate::plugin::{Handler, Next};
use crate::trie::ZoneTrie;
use crate::types::{Record, RecordType};
use anyhow::Result;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Notification emitted by [`CacheHandler`] for every lookup it performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Hit { zone: String, rtype: RecordType },
    Miss { zone: String, rtype: RecordType },
}

/// Bounded `zone:TYPE` -> record set store.
///
/// The bound counts distinct keys, not records. When full, a random key is
/// evicted before a new key goes in; popular names come back quickly, so no
/// recency bookkeeping is kept. `max_entries = Some(0)` turns writes into no-ops.
pub struct Cache {
    entries: RwLock<HashMap<String, Arc<[Record]>>>,
    max_entries: Option<usize>,
    events: broadcast::Sender<CacheEvent>,
}

impl Cache {
    pub fn new(max_entries: Option<usize>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { entries: RwLock::new(HashMap::new()), max_entries, events }
    }

    pub fn key(zone: &str, rtype: RecordType) -> String {
        format!("{}:{}", zone.trim_end_matches('.').to_ascii_lowercase(), rtype)
    }

    pub fn max_entries(&self) -> Option<usize> { self.max_entries }

    pub fn get(&self, zone: &str, rtype: RecordType) -> Option<Vec<Record>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&Self::key(zone, rtype)).map(|set| set.to_vec())
    }

    pub fn set(&self, zone: &str, rtype: RecordType, records: Vec<Record>) {
        if self.max_entries == Some(0) { return; }
        let key = Self::key(zone, rtype);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.make_room(&mut entries, &key);
        entries.insert(key, records.into());
    }

    pub fn append(&self, zone: &str, rtype: RecordType, record: Record) {
        if self.max_entries == Some(0) { return; }
        let key = Self::key(zone, rtype);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.make_room(&mut entries, &key);
        let mut grown = entries.get(&key).map(|set| set.to_vec()).unwrap_or_default();
        grown.push(record);
        entries.insert(key, grown.into());
    }

    /// Removes the whole set, or only entries equal to `record`.
    pub fn delete(&self, zone: &str, rtype: RecordType, record: Option<&Record>) {
        let key = Self::key(zone, rtype);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = record else {
            entries.remove(&key);
            return;
        };
        if let Some(set) = entries.get(&key) {
            let kept: Vec<Record> = set.iter().filter(|r| *r != record).cloned().collect();
            if kept.is_empty() {
                entries.remove(&key);
            } else {
                entries.insert(key, kept.into());
            }
        }
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> { self.events.subscribe() }

    fn notify(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn make_room(&self, entries: &mut HashMap<String, Arc<[Record]>>, incoming: &str) {
        let Some(max) = self.max_entries else { return };
        if entries.contains_key(incoming) { return; }
        while !entries.is_empty() && entries.len() >= max {
            let victim_idx = rand::thread_rng().gen_range(0..entries.len());
            if let Some(victim) = entries.keys().nth(victim_idx).cloned() {
                tracing::debug!("     |-- [cache] Evicting '{}' to admit '{}'", victim, incoming);
                entries.remove(&victim);
            }
        }
    }
}

impl Default for Cache {
    fn default() -> Self { Self::new(None) }
}

/// Answers queries straight from a [`Cache`].
///
/// With a trie attached, lookups key on the trie's resolved pattern so every
/// name under one wildcard shares a single entry.
pub struct CacheHandler {
    cache: Arc<Cache>,
    resolver: Option<Arc<ZoneTrie>>,
}

impl CacheHandler {
    pub fn new(cache: Arc<Cache>) -> Self { Self { cache, resolver: None } }

    pub fn with_resolver(cache: Arc<Cache>, resolver: Arc<ZoneTrie>) -> Self {
        Self { cache, resolver: Some(resolver) }
    }

    pub fn cache(&self) -> &Arc<Cache> { &self.cache }
}

#[async_trait::async_trait]
impl Handler for CacheHandler {
    fn name(&self) -> &str { "cache" }

    async fn handle(&self, req: &Request, res: &mut Response, next: Next<'_>) -> Result<()> {
        if res.is_finished() { return next.run(req, res).await; }
        let Some(question) = req.question() else { return next.run(req, res).await };

        let zone = self.resolver.as_ref()
            .and_then(|trie| trie.resolve(&question.name))
            .unwrap_or_else(|| question.name.clone());

        match self.cache.get(&zone, question.qtype) {
            Some(records) if !records.is_empty() => {
                tracing::debug!("     |-- [cache] HIT {} {} TxID: {:#06x}", zone, question.qtype, req.id());
                let answers = records.into_iter().map(|mut r| { r.name = question.name.clone(); r }).collect();
                res.answer(answers)?;
                self.cache.notify(CacheEvent::Hit { zone, rtype: question.qtype });
            }
            _ => self.cache.notify(CacheEvent::Miss { zone, rtype: question.qtype }),
        }
        next.run(req, res).await
    }
}
