//! Pointer to small integer registry.
//!
//! Raw pointers differ from run to run, so anything identifying an object in
//! the recording goes through a [`ValueIndex`]: values get consecutive
//! indexes in registration order, which replay reproduces.

use hashbrown::HashMap;

/// Two-way map between values and the indexes they were given.
#[derive(Debug, Clone)]
pub struct ValueIndex {
    by_value: HashMap<usize, usize>,
    by_index: HashMap<usize, usize>,
    next: usize,
}

impl Default for ValueIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueIndex {
    /// Empty index handing out indexes from 1, leaving 0 for "none".
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Empty index handing out indexes from `first`.
    pub fn starting_at(first: usize) -> Self {
        Self {
            by_value: HashMap::new(),
            by_index: HashMap::new(),
            next: first,
        }
    }

    /// Give `value` the next index. A value already present loses its old
    /// index first. Indexes are never reused.
    pub fn insert(&mut self, value: usize) -> usize {
        self.remove(value);
        let index = self.next;
        self.next += 1;
        self.by_value.insert(value, index);
        self.by_index.insert(index, value);
        index
    }

    /// Forget `value`, returning its index.
    pub fn remove(&mut self, value: usize) -> Option<usize> {
        let index = self.by_value.remove(&value)?;
        self.by_index.remove(&index);
        Some(index)
    }

    /// Index of `value`.
    #[inline]
    pub fn get_index(&self, value: usize) -> Option<usize> {
        self.by_value.get(&value).copied()
    }

    /// Value holding `index`.
    #[inline]
    pub fn get_value(&self, index: usize) -> Option<usize> {
        self.by_index.get(&index).copied()
    }

    /// Whether `value` is registered.
    #[inline]
    pub fn contains(&self, value: usize) -> bool {
        self.by_value.contains_key(&value)
    }

    /// Registered values.
    pub fn len(&self) -> usize {
        self.by_value.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_value.is_empty()
    }

    /// Index the next insertion receives.
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// `(value, index)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.by_value.iter().map(|(value, index)| (*value, *index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn indexes_follow_registration_order() {
        let mut index = ValueIndex::new();
        assert_eq!(index.insert(0x7000), 1);
        assert_eq!(index.insert(0x1000), 2);
        assert_eq!(index.get_index(0x7000), Some(1));
        assert_eq!(index.get_value(2), Some(0x1000));
        assert_eq!(index.remove(0x7000), Some(1));
        assert_eq!(index.get_value(1), None);
        assert_eq!(index.insert(0x7000), 3);
    }

    #[test]
    fn reinsertion_moves_to_a_fresh_index() {
        let mut index = ValueIndex::starting_at(0);
        assert_eq!(index.insert(0xa0), 0);
        assert_eq!(index.insert(0xa0), 1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get_value(0), None);
        assert_eq!(index.get_value(1), Some(0xa0));
    }

    proptest! {
        #[test]
        fn both_directions_agree(ops in proptest::collection::vec((any::<bool>(), 0usize..32), 1..200)) {
            let mut index = ValueIndex::new();
            let mut highest = 0;
            for (insert, value) in ops {
                if insert {
                    let given = index.insert(value);
                    prop_assert!(given > highest);
                    highest = given;
                } else {
                    index.remove(value);
                }
                for (value, given) in index.iter() {
                    prop_assert_eq!(index.get_value(given), Some(value));
                }
                prop_assert_eq!(index.len(), index.iter().count());
            }
        }
    }
}
