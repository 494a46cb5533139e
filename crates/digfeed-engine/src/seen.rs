use std::collections::{HashSet, VecDeque};

/// Bounded set of recently returned ids, evicting oldest-first.
#[derive(Debug, Clone)]
pub struct SeenSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Rebuild from a persisted list, oldest first. Only the newest
    /// `capacity` ids survive.
    pub fn from_ids(capacity: usize, ids: impl IntoIterator<Item = String>) -> Self {
        let mut set = Self::new(capacity);
        for id in ids {
            set.insert(id);
        }
        set
    }

    /// Record `id`. Re-inserting a known id does not refresh its age.
    /// Returns false when the id was already present.
    pub fn insert(&mut self, id: String) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids oldest first, for persistence.
    pub fn to_vec(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_exceeds_capacity() {
        let mut seen = SeenSet::new(3);
        for i in 0..10 {
            seen.insert(i.to_string());
            assert!(seen.len() <= 3);
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.to_vec(), vec!["7", "8", "9"]);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut seen = SeenSet::new(2);
        seen.insert("a".into());
        seen.insert("b".into());
        seen.insert("c".into());
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert!(seen.contains("c"));
    }

    #[test]
    fn test_duplicate_insert_keeps_original_position() {
        let mut seen = SeenSet::new(2);
        assert!(seen.insert("a".into()));
        assert!(seen.insert("b".into()));
        assert!(!seen.insert("a".into()));
        seen.insert("c".into());
        // "a" was still the oldest entry
        assert!(!seen.contains("a"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_from_ids_keeps_newest() {
        let seen = SeenSet::from_ids(2, vec!["1".into(), "2".into(), "3".into()]);
        assert_eq!(seen.to_vec(), vec!["2", "3"]);
        assert_eq!(seen.capacity(), 2);
    }
}
