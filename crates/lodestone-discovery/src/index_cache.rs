//! Occurrence-counted multimap from an index key to member ids.
//!
//! Members are kept in append order and duplicates are meaningful: two
//! independent references to the same id need two deletes before the id
//! disappears from the key.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct IndexCache {
    entries: RwLock<HashMap<String, Vec<String>>>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, member: impl Into<String>) {
        self.entries
            .write()
            .entry(key.into())
            .or_default()
            .push(member.into());
    }

    /// Snapshot of the members of `key`, `None` when the key is absent.
    pub fn get(&self, key: &str) -> Option<Vec<String>> {
        self.entries.read().get(key).cloned()
    }

    /// Removes the first occurrence of `member`; drops the key once it is empty.
    pub fn delete(&self, key: &str, member: &str) -> bool {
        let mut entries = self.entries.write();
        let Some(members) = entries.get_mut(key) else {
            return false;
        };
        let Some(pos) = members.iter().position(|m| m == member) else {
            return false;
        };
        members.remove(pos);
        if members.is_empty() {
            entries.remove(key);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
