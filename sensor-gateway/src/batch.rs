//! Generic size-or-time batching buffer.
//!
//! Generalizes the teacher's `BatchBuffer` for Line Protocol strings
//! (`hdds-influx-sink/src/buffer.rs`) to any item type, since both the
//! Cache Writer (§4.5, 64 items / 50ms) and the Document Writer (§4.6, 500
//! items / 1s) need the same size-or-time flush trigger over different
//! element types and thresholds.

use std::time::{Duration, Instant};

pub struct BatchBuffer<T> {
    items: Vec<T>,
    max_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl<T> BatchBuffer<T> {
    pub fn new(max_size: usize, flush_interval: Duration) -> Self {
        Self {
            items: Vec::with_capacity(max_size),
            max_size,
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    /// Returns `Some(batch)` if adding `item` filled the buffer.
    pub fn add(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.max_size {
            Some(self.flush())
        } else {
            None
        }
    }

    pub fn should_flush(&self) -> bool {
        !self.items.is_empty() && self.last_flush.elapsed() >= self.flush_interval
    }

    pub fn flush(&mut self) -> Vec<T> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_on_size() {
        let mut buf = BatchBuffer::new(2, Duration::from_secs(60));
        assert!(buf.add(1).is_none());
        let batch = buf.add(2).unwrap();
        assert_eq!(batch, vec![1, 2]);
        assert!(buf.is_empty());
    }

    #[test]
    fn flushes_on_time() {
        let mut buf: BatchBuffer<i32> = BatchBuffer::new(1000, Duration::from_millis(0));
        buf.add(1);
        assert!(buf.should_flush());
        assert_eq!(buf.flush(), vec![1]);
    }

    #[test]
    fn empty_buffer_never_due() {
        let buf: BatchBuffer<i32> = BatchBuffer::new(10, Duration::from_millis(0));
        assert!(!buf.should_flush());
    }
}
