// src/core/applier.rs

//! The bounded worker pool that applies remote write sets.
//!
//! Appliers run in parallel, but a write set must never execute alongside
//! another write set it depends on. Admission into the pool is therefore
//! gated by a pairwise conflict check supplied by the engine: a job parks
//! in [`ApplierPool::start_job`] until no active job conflicts with it.
//! Commit ordering is not this pool's business — the commit queue
//! re-serializes the durable step afterwards.

use crate::core::seqno::Seqno;
use crate::core::writeset::WriteSet;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// The unit of work an applier slot executes: one write set at its local
/// delivery position. The global seqno rides along because the pairwise
/// conflict probe addresses certified write sets by it.
#[derive(Clone)]
pub struct JobContext {
    pub seqno: Seqno,
    pub global_seqno: Seqno,
    pub write_set: Arc<WriteSet>,
}

/// Decides whether a candidate job must wait for an active one.
pub trait ConflictCheck: Send + Sync {
    /// Returns `true` if `candidate` depends on `active` and must wait for
    /// it to finish.
    fn jobs_conflict(&self, candidate: &JobContext, active: &JobContext) -> bool;
}

/// All worker slots are taken.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("applier pool saturated: {active} of {capacity} workers in use")]
pub struct PoolSaturated {
    pub active: usize,
    pub capacity: usize,
}

enum SlotState {
    /// Not handed out.
    Free,
    /// Handed out, no job running.
    Idle,
    /// Running a job.
    Active(JobContext),
}

/// A handle to one pool slot. Obtained from [`ApplierPool::new_worker`] and
/// given back with [`ApplierPool::remove_worker`]; not cloneable, so a slot
/// has exactly one owner.
pub struct Worker {
    id: usize,
}

impl Worker {
    pub fn id(&self) -> usize {
        self.id
    }
}

/// A fixed-size pool of applier slots with dependency-aware admission.
pub struct ApplierPool {
    slots: Mutex<Vec<SlotState>>,
    /// Signalled whenever a job ends, re-waking parked admissions.
    job_ended: Notify,
    conflicts: Arc<dyn ConflictCheck>,
}

impl ApplierPool {
    pub fn new(capacity: usize, conflicts: Arc<dyn ConflictCheck>) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || SlotState::Free);
        Self {
            slots: Mutex::new(slots),
            job_ended: Notify::new(),
            conflicts,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of slots currently handed out.
    pub fn active_workers(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| !matches!(s, SlotState::Free))
            .count()
    }

    /// Takes a free slot out of the pool.
    pub fn new_worker(&self) -> Result<Worker, PoolSaturated> {
        let mut slots = self.slots.lock();
        let free = slots.iter().position(|s| matches!(s, SlotState::Free));
        match free {
            Some(id) => {
                slots[id] = SlotState::Idle;
                debug!("applier worker {id} checked out");
                Ok(Worker { id })
            }
            None => Err(PoolSaturated {
                active: slots.len(),
                capacity: slots.len(),
            }),
        }
    }

    /// Marks `worker` active with `ctx`, waiting first until no other
    /// active job conflicts with it.
    pub async fn start_job(&self, worker: &Worker, ctx: JobContext) {
        loop {
            let notified = {
                let mut slots = self.slots.lock();
                let blocked = slots.iter().enumerate().any(|(id, slot)| {
                    id != worker.id
                        && matches!(slot, SlotState::Active(active)
                            if self.conflicts.jobs_conflict(&ctx, active))
                });
                if !blocked {
                    slots[worker.id] = SlotState::Active(ctx);
                    return;
                }
                debug!(
                    "applier worker {} waiting on a conflicting job for seqno {}",
                    worker.id, ctx.seqno
                );
                let mut notified = Box::pin(self.job_ended.notified());
                notified.as_mut().enable();
                notified
            };
            notified.await;
        }
    }

    /// Clears `worker`'s activity and wakes parked admissions.
    pub fn end_job(&self, worker: &Worker) {
        let mut slots = self.slots.lock();
        slots[worker.id] = SlotState::Idle;
        drop(slots);
        self.job_ended.notify_waiters();
    }

    /// Returns the slot to the pool.
    pub fn remove_worker(&self, worker: Worker) {
        let mut slots = self.slots.lock();
        slots[worker.id] = SlotState::Free;
        debug!("applier worker {} returned", worker.id);
    }

    /// Sequence numbers of the jobs running right now (test observability).
    pub fn active_job_seqnos(&self) -> Vec<Seqno> {
        self.slots
            .lock()
            .iter()
            .filter_map(|s| match s {
                SlotState::Active(ctx) => Some(ctx.seqno),
                _ => None,
            })
            .collect()
    }
}
