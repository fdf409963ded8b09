//! Latest decoded value per dependency, keyed by identity.
//!
//! Entries are created on first arrival and overwritten on each subsequent
//! arrival; they outlive any child process.

use std::collections::HashMap;

use crate::deps::DependencyData;

/// The supervisor's view of the most recent data per dependency.
#[derive(Debug, Default)]
pub struct Snapshot {
    entries: HashMap<String, DependencyData>,
}

impl Snapshot {
    /// Stores `data` under `identity`, returning true on first arrival.
    pub fn insert(&mut self, identity: String, data: DependencyData) -> bool {
        self.entries.insert(identity, data).is_none()
    }

    pub fn get(&self, identity: &str) -> Option<&DependencyData> {
        self.entries.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{DependencyData, KvPair};

    #[test]
    fn insert_reports_first_arrival() {
        let mut snap = Snapshot::default();
        let data = DependencyData::KvPairs(vec![KvPair::new("a", "1")]);
        assert!(snap.insert("kv.list(app)".to_string(), data.clone()));
        assert!(!snap.insert("kv.list(app)".to_string(), data));
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn later_arrivals_overwrite() {
        let mut snap = Snapshot::default();
        snap.insert(
            "kv.list(app)".to_string(),
            DependencyData::KvPairs(vec![KvPair::new("a", "1")]),
        );
        snap.insert(
            "kv.list(app)".to_string(),
            DependencyData::KvPairs(vec![KvPair::new("a", "2")]),
        );
        match snap.get("kv.list(app)").unwrap() {
            DependencyData::KvPairs(pairs) => assert_eq!(pairs[0].value, "2"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
