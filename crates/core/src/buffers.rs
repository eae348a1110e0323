//! Pool of pixel buffers handed back by callers for reuse

use parking_lot::Mutex;

/// Bounded stack of spare pixel buffers
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take the most recently returned buffer
    pub fn take(&self) -> Option<Vec<u8>> {
        self.buffers.lock().pop()
    }

    /// Return a buffer. Dropped when the pool is full or the buffer is empty.
    pub fn put(&self, buffer: Vec<u8>) -> bool {
        if buffer.capacity() == 0 {
            return false;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() >= self.capacity {
            return false;
        }
        buffers.push(buffer);
        true
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_returns_last_put() {
        let pool = BufferPool::new(4);
        assert!(pool.take().is_none());

        pool.put(vec![1; 10]);
        pool.put(vec![2; 20]);

        assert_eq!(pool.take().map(|b| b.len()), Some(20));
        assert_eq!(pool.take().map(|b| b.len()), Some(10));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let pool = BufferPool::new(1);
        assert!(pool.put(vec![0; 4]));
        assert!(!pool.put(vec![0; 4]));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_empty_buffers_rejected() {
        let pool = BufferPool::new(2);
        assert!(!pool.put(Vec::new()));
        assert!(pool.is_empty());
    }
}
