//! Bounded FIFO holding requests while every worker is busy

use std::collections::VecDeque;

/// Fixed-capacity FIFO; a push beyond capacity hands the item back instead of blocking
#[derive(Debug, Clone)]
pub struct RequestQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RequestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append to the tail, or return the item when the queue is full
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Remove the head
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Remove every item matching `predicate`, keeping the order of the rest
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if predicate(&item) {
                removed.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        removed
    }

    /// Change the capacity; items beyond it are removed newest first
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<T> {
        self.capacity = capacity;
        let mut overflow = Vec::new();
        while self.items.len() > capacity {
            if let Some(item) = self.items.pop_back() {
                overflow.push(item);
            }
        }
        overflow
    }

    /// Empty the queue in FIFO order
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = RequestQueue::new(3);
        for i in 0..3 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_push_beyond_capacity_returns_item() {
        let mut queue = RequestQueue::new(1);
        queue.push("a").unwrap();
        assert_eq!(queue.push("b"), Err("b"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut queue = RequestQueue::new(0);
        assert!(queue.is_full());
        assert_eq!(queue.push(7), Err(7));
    }

    #[test]
    fn test_shrinking_drops_newest_first() {
        let mut queue = RequestQueue::new(4);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.set_capacity(2), vec![3, 2]);
        assert_eq!(queue.drain(), vec![0, 1]);
    }

    #[test]
    fn test_remove_where_keeps_order() {
        let mut queue = RequestQueue::new(5);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        let removed = queue.remove_where(|i| i % 2 == 1);
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![0, 2, 4]);
    }
}
