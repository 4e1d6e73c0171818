//! Distributed coordination used by the checkpoint manager.
//!
//! The manager needs two primitives: "am I the primary writer?" and a
//! collective barrier. Transport is the backend's business.
use std::sync::{Arc, Barrier};

/// Trait for distributed coordination.
pub trait DistributedBackend: Send + Sync {
    /// Barrier synchronization
    fn barrier(&self);

    /// Get world size
    fn world_size(&self) -> usize;

    /// Get current rank
    fn rank(&self) -> usize;

    /// Check if this is the primary (writer) process
    fn is_primary(&self) -> bool {
        self.rank() == 0
    }
}

/// A lone process: always primary, barriers return immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl DistributedBackend for SingleProcess {
    fn barrier(&self) {}

    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

/// In-process ranks sharing one barrier (thread-local data parallelism).
#[derive(Clone, Debug)]
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    barrier: Arc<Barrier>,
}

impl ThreadGroup {
    /// Create one backend per rank, all sharing a barrier.
    pub fn new(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let barrier = Arc::new(Barrier::new(world_size));
        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }
}

impl DistributedBackend for ThreadGroup {
    fn barrier(&self) {
        self.barrier.wait();
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }
}
