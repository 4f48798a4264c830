//! A free list of pre-allocated packet buffers.
//!
//! The arena caps ingress memory and avoids per-packet allocation. After the
//! arena is created, a buffer can be requested by calling [Arena::pop]; the
//! caller is responsible for calling [Arena::push], which restores the
//! buffer to full capacity and puts it back in the queue. Popped bytes are
//! *not* zeroed, so callers should only read positions they know to have
//! been overwritten, by shortening the buffer to the byte count returned by
//! the read.

#[derive(Debug, Clone)]
pub struct Arena {
    block_size: usize,
    free_tx: flume::Sender<Vec<u8>>,
    free_rx: flume::Receiver<Vec<u8>>,
}

impl Arena {
    pub fn new(block_size: usize, num_blocks: usize) -> Arena {
        let (free_tx, free_rx) = flume::bounded(num_blocks);
        for _ in 0..num_blocks {
            free_tx
                .send(vec![0u8; block_size])
                .expect("arena channel sized to fit all blocks");
        }
        Arena {
            block_size,
            free_tx,
            free_rx,
        }
    }

    /// Take a buffer out of the pool, blocking until one is free.
    pub fn pop(&self) -> Vec<u8> {
        self.free_rx
            .recv()
            .expect("arena holds both channel ends")
    }

    /// Return a buffer to the pool at full capacity. Buffers from elsewhere
    /// are dropped once the pool is full.
    pub fn push(&self, mut block: Vec<u8>) {
        block.resize(self.block_size, 0);
        let _ = self.free_tx.try_send(block);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pop_and_push_cycle_buffers() {
        let arena = Arena::new(16, 2);

        let mut first = arena.pop();
        let second = arena.pop();
        assert_eq!(first.len(), 16);
        assert_eq!(second.len(), 16);

        first.truncate(3);
        arena.push(first);

        let recycled = arena.pop();
        assert_eq!(recycled.len(), 16, "push restores full capacity");
    }

    #[test]
    fn excess_buffers_are_dropped() {
        let arena = Arena::new(16, 1);
        let block = arena.pop();
        arena.push(block);
        // A foreign buffer on a full pool is silently discarded.
        arena.push(vec![0u8; 16]);
        assert_eq!(arena.pop().len(), 16);
    }
}
