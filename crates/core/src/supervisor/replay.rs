use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, RingBuffer};

/// Bounded cache of the most recently sent audio chunks.
///
/// Pushing past capacity evicts the oldest chunk.
pub struct ReplayBuffer {
    chunks: HeapRb<Vec<u8>>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: HeapRb::new(capacity.max(1)),
        }
    }

    /// Returns the evicted chunk, if any.
    pub fn push(&mut self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        self.chunks.push_overwrite(chunk)
    }

    pub fn len(&self) -> usize {
        self.chunks.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.chunks.capacity().get()
    }

    /// Empties the buffer, returning chunks oldest first.
    pub fn take_all(&mut self) -> Vec<Vec<u8>> {
        self.chunks.pop_iter().collect()
    }

    pub fn clear(&mut self) {
        self.take_all();
    }
}
