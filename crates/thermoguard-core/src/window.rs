//! Fixed-capacity observation window.
//!
//! Owned by exactly one monitoring task; never shared or persisted.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct ObservationWindow<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> ObservationWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `item`, evicting the oldest when full.
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Items oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// The most recent `n` items, oldest first.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let mut w = ObservationWindow::new(3);
        for i in 0..5 {
            w.push(i);
        }
        assert!(w.is_full());
        assert_eq!(w.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(w.latest(), Some(&4));
    }

    #[test]
    fn test_tail() {
        let mut w = ObservationWindow::new(10);
        for i in 0..6 {
            w.push(i);
        }
        assert_eq!(w.tail(2).copied().collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(w.tail(50).count(), 6);
        w.clear();
        assert!(w.is_empty());
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut w = ObservationWindow::new(0);
        w.push('a');
        w.push('b');
        assert_eq!(w.len(), 1);
        assert_eq!(w.capacity(), 1);
    }
}
