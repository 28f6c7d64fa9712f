use std::{pin::pin, sync::Arc};

use comms::Scalar;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tokio::sync::Notify;

use super::{Collective, CollectiveErr, Result};

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: Option<String>,
}

/// A reusable barrier that can be torn down, waking every waiter with an error.
struct GroupBarrier {
    size: usize,
    state: Mutex<BarrierState>,
    notify: Notify,
}

impl GroupBarrier {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(BarrierState::default()),
            notify: Notify::new(),
        }
    }

    fn aborted(reason: &str) -> CollectiveErr {
        CollectiveErr::Aborted {
            reason: reason.to_string(),
        }
    }

    /// Waits until `size` callers arrived.
    async fn wait(&self) -> Result<()> {
        let generation = {
            let mut state = self.state.lock();
            if let Some(reason) = &state.aborted {
                return Err(Self::aborted(reason));
            }

            state.arrived += 1;
            if state.arrived == self.size {
                state.arrived = 0;
                state.generation += 1;
                self.notify.notify_waiters();
                return Ok(());
            }

            state.generation
        };

        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.generation != generation {
                    return Ok(());
                }

                if let Some(reason) = &state.aborted {
                    return Err(Self::aborted(reason));
                }
            }

            notified.await;
        }
    }

    fn abort(&self, reason: String) {
        let mut state = self.state.lock();
        if state.aborted.is_none() {
            state.aborted = Some(reason);
        }
        self.notify.notify_waiters();
    }
}

struct Shared<T> {
    barrier: GroupBarrier,
    slots: RwLock<Vec<Vec<T>>>,
}

/// Builds an in-process worker group.
pub struct LocalGroup;

impl LocalGroup {
    /// Creates the handles of a group of `world_size` workers, indexed by rank.
    ///
    /// # Arguments
    /// * `world_size` - The amount of workers in the group.
    ///
    /// # Returns
    /// One `LocalCollective` per rank.
    pub fn new<T: Scalar>(world_size: usize) -> Vec<LocalCollective<T>> {
        let shared = Arc::new(Shared {
            barrier: GroupBarrier::new(world_size),
            slots: RwLock::new(vec![Vec::new(); world_size]),
        });

        (0..world_size)
            .map(|rank| LocalCollective {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// A worker of an in-process group, every worker lives in the same process.
///
/// Dropping a handle tears the group down: the remaining workers' pending and
/// later calls fail with `CollectiveErr::Aborted`.
pub struct LocalCollective<T> {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared<T>>,
}

impl<T: Scalar> LocalCollective<T> {
    /// Tears the group down.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(rank = self.rank; "aborting the worker group: {reason}");
        self.shared.barrier.abort(reason);
    }

    fn publish(&self, buf: &[T]) {
        let mut slots = self.shared.slots.write();
        let slot = &mut slots[self.rank];
        slot.clear();
        slot.extend_from_slice(buf);
    }

    fn check_lengths(&self, slots: &[Vec<T>], expected: usize) -> Result<()> {
        match slots.iter().position(|slot| slot.len() != expected) {
            Some(rank) => Err(CollectiveErr::LengthMismatch {
                rank,
                got: slots[rank].len(),
                expected,
            }),
            None => Ok(()),
        }
    }
}

impl<T: Scalar> Collective<T> for LocalCollective<T> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&mut self, buf: &mut [T], root: usize) -> Result<()> {
        if root >= self.world_size {
            return Err(CollectiveErr::InvalidRoot {
                root,
                world_size: self.world_size,
            });
        }

        if self.rank == root {
            self.publish(buf);
        }

        self.shared.barrier.wait().await?;

        if self.rank != root {
            let slots = self.shared.slots.read();
            let src = &slots[root];
            if src.len() != buf.len() {
                return Err(CollectiveErr::LengthMismatch {
                    rank: root,
                    got: src.len(),
                    expected: buf.len(),
                });
            }

            buf.copy_from_slice(src);
        }

        self.shared.barrier.wait().await?;
        debug!(rank = self.rank, root = root; "broadcast {} elements", buf.len());
        Ok(())
    }

    async fn all_reduce_sum(&mut self, buf: &mut [T]) -> Result<()> {
        self.publish(buf);
        self.shared.barrier.wait().await?;

        {
            let guard = self.shared.slots.read();
            let slots: &[Vec<T>] = &guard;
            self.check_lengths(slots, slots[0].len())?;

            buf.par_iter_mut().enumerate().for_each(|(i, out)| {
                let mut acc = slots[0][i];
                for slot in &slots[1..] {
                    acc += slot[i];
                }
                *out = acc;
            });
        }

        self.shared.barrier.wait().await?;
        Ok(())
    }
}

impl<T> Drop for LocalCollective<T> {
    fn drop(&mut self) {
        self.shared
            .barrier
            .abort(format!("rank {} left the group", self.rank));
    }
}
