//! Wildcard-aware zone trie.
//!
//! Names are split into labels and walked root-first (`www.example.com` is
//! stored under `com -> example -> www`). A `*` label is terminal: anything
//! after it in an inserted name is discarded, and the wildcard node answers
//! for every name below its parent that has no exact entry.
//!
//! Each node guards its children and its record sets with its own `RwLock`.
//! Record sets are replaced wholesale (`Arc<[Record]>`), so a reader sees
//! either the old set or the new one.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{Record, RecordType};

const WILDCARD: &str = "*";

type RecordSets = Vec<(RecordType, Arc<[Record]>)>;

#[derive(Default)]
struct Node {
    children: RwLock<HashMap<String, Arc<Node>>>,
    data: RwLock<RecordSets>,
}

impl Node {
    fn child(&self, label: &str) -> Option<Arc<Node>> {
        read(&self.children).get(label).cloned()
    }

    fn child_or_insert(&self, label: &str) -> Arc<Node> {
        write(&self.children).entry(label.to_string()).or_default().clone()
    }

    fn has_data(&self) -> bool {
        !read(&self.data).is_empty()
    }

    /// Records for one type, or every type when `rtype` is `None`/`ANY`. Never an empty vec.
    fn records(&self, rtype: Option<RecordType>) -> Option<Vec<Record>> {
        let data = read(&self.data);
        let found: Vec<Record> = match rtype {
            Some(t) if t != RecordType::ANY => data.iter().find(|(k, _)| *k == t).map(|(_, v)| v.to_vec()).unwrap_or_default(),
            _ => data.iter().flat_map(|(_, v)| v.iter().cloned()).collect(),
        };
        if found.is_empty() { None } else { Some(found) }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Lowercased labels, root-first. The root name (`""` or `"."`) has none.
fn labels(domain: &str) -> Vec<String> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('.').rev().map(|l| l.to_ascii_lowercase()).collect()
}

fn join_root_first(labels: &[String]) -> String {
    labels.iter().rev().cloned().collect::<Vec<_>>().join(".")
}

#[derive(Default)]
pub struct ZoneTrie {
    root: Arc<Node>,
}

impl ZoneTrie {
    pub fn new() -> Self { Self::default() }

    fn find(&self, labels: &[String]) -> Option<Arc<Node>> {
        let mut node = self.root.clone();
        for label in labels {
            node = node.child(label)?;
        }
        Some(node)
    }

    fn find_or_create(&self, domain: &str) -> Arc<Node> {
        let mut node = self.root.clone();
        for label in labels(domain) {
            node = node.child_or_insert(&label);
            if label == WILDCARD {
                break;
            }
        }
        node
    }

    /// Stores `records` as the set for `rtype` at `domain`, replacing any prior set.
    pub fn add(&self, domain: &str, rtype: RecordType, records: Vec<Record>) {
        let node = self.find_or_create(domain);
        let mut data = write(&node.data);
        let set: Arc<[Record]> = records.into();
        match data.iter_mut().find(|(k, _)| *k == rtype) {
            Some(slot) => slot.1 = set,
            None => data.push((rtype, set)),
        }
    }

    pub fn append(&self, domain: &str, rtype: RecordType, record: Record) {
        let node = self.find_or_create(domain);
        let mut data = write(&node.data);
        match data.iter_mut().find(|(k, _)| *k == rtype) {
            Some(slot) => {
                let mut grown = slot.1.to_vec();
                grown.push(record);
                slot.1 = grown.into();
            }
            None => data.push((rtype, vec![record].into())),
        }
    }

    /// Looks up records, preferring an exact match over any wildcard.
    ///
    /// Wildcard answers have the `*` in their record names replaced by the
    /// labels the wildcard stood in for.
    pub fn get(&self, domain: &str, rtype: Option<RecordType>) -> Option<Vec<Record>> {
        let labels = labels(domain);
        if let Some(exact) = self.find(&labels).and_then(|n| n.records(rtype)) {
            return Some(exact);
        }

        let (wildcard, depth) = self.closest_wildcard(&labels)?;
        let records = wildcard.records(rtype)?;

        let original: Vec<&str> = domain.trim().trim_end_matches('.').split('.').collect();
        let covered = original[..labels.len() - depth].join(".");
        Some(records.into_iter().map(|mut r| {
            if r.name.contains(WILDCARD) {
                r.name = r.name.replacen(WILDCARD, &covered, 1);
            }
            r
        }).collect())
    }

    /// Deepest wildcard node strictly above the queried name, with the number of labels above it.
    fn closest_wildcard(&self, labels: &[String]) -> Option<(Arc<Node>, usize)> {
        let mut node = self.root.clone();
        let mut best = None;
        for (depth, label) in labels.iter().enumerate() {
            if let Some(wildcard) = node.child(WILDCARD) {
                best = Some((wildcard, depth));
            }
            match node.child(label) {
                Some(next) => node = next,
                None => break,
            }
        }
        best
    }

    /// Removes data at the exact node for `domain`.
    ///
    /// With a record, only equal entries of that type go; a node left with no
    /// types also loses its children. With a type only, that set goes. With
    /// neither, every set at the node goes.
    pub fn delete(&self, domain: &str, rtype: Option<RecordType>, record: Option<&Record>) {
        let Some(node) = self.find(&labels(domain)) else { return };

        let emptied = {
            let mut data = write(&node.data);
            match (rtype, record) {
                (Some(t), Some(record)) => {
                    if let Some(idx) = data.iter().position(|(k, _)| *k == t) {
                        let kept: Vec<Record> = data[idx].1.iter().filter(|r| *r != record).cloned().collect();
                        if kept.is_empty() {
                            data.remove(idx);
                        } else {
                            data[idx].1 = kept.into();
                        }
                    }
                    data.is_empty()
                }
                (Some(t), None) => {
                    data.retain(|(k, _)| *k != t);
                    false
                }
                (None, _) => {
                    data.clear();
                    false
                }
            }
        };

        if emptied {
            write(&node.children).clear();
        }
    }

    /// The registered name that would answer `domain`: the name itself when it
    /// holds data, else the most specific wildcard pattern covering it.
    pub fn resolve(&self, domain: &str) -> Option<String> {
        let labels = labels(domain);
        if self.find(&labels).is_some_and(|n| n.has_data()) {
            return Some(join_root_first(&labels));
        }

        let mut node = self.root.clone();
        let mut best: Option<usize> = None;
        for (depth, label) in labels.iter().enumerate() {
            if node.child(WILDCARD).is_some_and(|w| w.has_data()) {
                best = Some(depth);
            }
            match node.child(label) {
                Some(next) => node = next,
                None => break,
            }
        }

        best.map(|depth| {
            let parent = join_root_first(&labels[..depth]);
            if parent.is_empty() { WILDCARD.to_string() } else { format!("*.{}", parent) }
        })
    }

    pub fn has(&self, domain: &str) -> bool {
        self.find(&labels(domain)).is_some_and(|n| n.has_data())
    }

    pub fn clear(&self) {
        write(&self.root.children).clear();
        write(&self.root.data).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RData;
    use std::net::Ipv4Addr;

    fn a(name: &str, last: u8) -> Record {
        Record::new(name, 300, RData::A(Ipv4Addr::new(10, 0, 0, last)))
    }

    #[test]
    fn exact_beats_wildcard_regardless_of_insert_order() {
        let trie = ZoneTrie::new();
        trie.add("example.com", RecordType::A, vec![a("example.com", 1)]);
        trie.add("www.example.com", RecordType::A, vec![a("www.example.com", 2)]);
        trie.add("*.example.com", RecordType::A, vec![a("*.example.com", 9)]);

        assert_eq!(trie.get("www.example.com", Some(RecordType::A)).unwrap(), vec![a("www.example.com", 2)]);
        assert_eq!(trie.get("example.com", Some(RecordType::A)).unwrap(), vec![a("example.com", 1)]);
    }

    #[test]
    fn wildcard_answers_carry_the_queried_name() {
        let trie = ZoneTrie::new();
        trie.add("*.example.com", RecordType::A, vec![a("*.example.com", 9)]);

        let got = trie.get("Sub.example.com", Some(RecordType::A)).unwrap();
        assert_eq!(got, vec![a("Sub.example.com", 9)]);

        let deep = trie.get("a.b.example.com", Some(RecordType::A)).unwrap();
        assert_eq!(deep[0].name, "a.b.example.com");

        assert!(trie.get("example.com", Some(RecordType::A)).is_none());
        assert!(trie.get("sub.example.com", Some(RecordType::MX)).is_none());
    }

    #[test]
    fn labels_after_a_wildcard_are_dropped_on_insert() {
        let trie = ZoneTrie::new();
        trie.add("deeper.*.example.com", RecordType::A, vec![a("*.example.com", 4)]);
        assert!(trie.has("*.example.com"));
        assert_eq!(trie.get("x.example.com", Some(RecordType::A)).unwrap().len(), 1);
    }

    #[test]
    fn resolve_prefers_the_deepest_wildcard() {
        let trie = ZoneTrie::new();
        trie.add("*.example.com", RecordType::A, vec![a("*.example.com", 1)]);
        trie.add("*.sub.example.com", RecordType::A, vec![a("*.sub.example.com", 2)]);
        trie.add("exact.example.com", RecordType::A, vec![a("exact.example.com", 3)]);

        assert_eq!(trie.resolve("x.sub.example.com").as_deref(), Some("*.sub.example.com"));
        assert_eq!(trie.resolve("y.example.com").as_deref(), Some("*.example.com"));
        assert_eq!(trie.resolve("exact.example.com").as_deref(), Some("exact.example.com"));
        assert_eq!(trie.resolve("nothing.org"), None);
        assert_eq!(trie.get("x.sub.example.com", Some(RecordType::A)).unwrap(), vec![a("x.sub.example.com", 2)]);
    }

    #[test]
    fn untyped_get_returns_every_type() {
        let trie = ZoneTrie::new();
        trie.add("example.com", RecordType::A, vec![a("example.com", 1)]);
        trie.add("example.com", RecordType::TXT, vec![Record::new("example.com", 60, RData::TXT(vec!["v=spf1".into()]))]);
        assert_eq!(trie.get("example.com", None).unwrap().len(), 2);
        assert_eq!(trie.get("example.com", Some(RecordType::ANY)).unwrap().len(), 2);
    }

    #[test]
    fn append_and_delete() {
        let trie = ZoneTrie::new();
        trie.append("example.com", RecordType::A, a("example.com", 1));
        trie.append("example.com", RecordType::A, a("example.com", 2));
        trie.add("www.example.com", RecordType::A, vec![a("www.example.com", 3)]);
        assert_eq!(trie.get("example.com", Some(RecordType::A)).unwrap().len(), 2);

        trie.delete("example.com", Some(RecordType::A), Some(&a("example.com", 1)));
        assert_eq!(trie.get("example.com", Some(RecordType::A)).unwrap(), vec![a("example.com", 2)]);

        // last record of the last type: the node's subtree goes with it
        trie.delete("example.com", Some(RecordType::A), Some(&a("example.com", 2)));
        assert!(trie.get("example.com", Some(RecordType::A)).is_none());
        assert!(!trie.has("www.example.com"));
    }

    #[test]
    fn delete_by_type_and_whole_node() {
        let trie = ZoneTrie::new();
        trie.add("example.com", RecordType::A, vec![a("example.com", 1)]);
        trie.add("example.com", RecordType::TXT, vec![Record::new("example.com", 60, RData::TXT(vec!["t".into()]))]);

        trie.delete("example.com", Some(RecordType::TXT), None);
        assert!(trie.get("example.com", Some(RecordType::TXT)).is_none());
        assert!(trie.has("example.com"));

        trie.delete("example.com", None, None);
        assert!(!trie.has("example.com"));
        trie.delete("missing.example.com", None, None);
    }
}
