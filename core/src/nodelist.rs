//! Bounded per-node record lists
//!
//! Used for the transport's neighbor table and the router's peer table. The
//! list never grows beyond its capacity: inserting into a full list replaces
//! a randomly chosen victim.

use crate::NodeId;
use rand::Rng;
use tracing::debug;

/// A record keyed by node id
pub trait NodeEntry {
    fn id(&self) -> NodeId;
}

#[derive(Debug, Clone)]
pub struct NodeList<T> {
    name: &'static str,
    entries: Vec<T>,
    capacity: usize,
}

impl<T: NodeEntry> NodeList<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn find(&self, id: NodeId) -> Option<&T> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn find_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.entries.iter_mut().find(|e| e.id() == id)
    }

    /// Insert a record, evicting a random one if the list is full
    pub fn insert(&mut self, entry: T) -> &mut T {
        let idx = if self.entries.len() < self.capacity {
            self.entries.push(entry);
            self.entries.len() - 1
        } else {
            let idx = rand::thread_rng().gen_range(0..self.entries.len());
            debug!(
                "list '{}': evicted node {} at {}",
                self.name,
                self.entries[idx].id(),
                idx
            );
            self.entries[idx] = entry;
            idx
        };
        debug!("list '{}': added node {} at {}", self.name, self.entries[idx].id(), idx);
        &mut self.entries[idx]
    }

    /// Existing record for `id`, or a new one built by `make`
    pub fn find_or_insert_with(&mut self, id: NodeId, make: impl FnOnce() -> T) -> &mut T {
        match self.entries.iter().position(|e| e.id() == id) {
            Some(idx) => &mut self.entries[idx],
            None => self.insert(make()),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|e| e.id())
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Rec {
        id: NodeId,
        value: u8,
    }

    impl NodeEntry for Rec {
        fn id(&self) -> NodeId {
            self.id
        }
    }

    #[test]
    fn test_find_or_insert_reuses_existing() {
        let mut list = NodeList::new("test", 3);
        list.find_or_insert_with(2, || Rec { id: 2, value: 0 }).value = 9;
        let rec = list.find_or_insert_with(2, || Rec { id: 2, value: 0 });
        assert_eq!(rec.value, 9);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_full_list_evicts_instead_of_growing() {
        let mut list = NodeList::new("test", 2);
        list.insert(Rec { id: 1, value: 0 });
        list.insert(Rec { id: 2, value: 0 });
        list.insert(Rec { id: 3, value: 0 });

        assert_eq!(list.len(), 2);
        assert!(list.find(3).is_some());
        // exactly one of the originals survived
        assert_eq!(list.find(1).is_some() as u8 + list.find(2).is_some() as u8, 1);
    }

    #[test]
    fn test_clear() {
        let mut list = NodeList::new("test", 2);
        list.insert(Rec { id: 4, value: 1 });
        list.clear();
        assert!(list.is_empty());
        assert!(list.find(4).is_none());
        assert_eq!(list.capacity(), 2);
    }
}
