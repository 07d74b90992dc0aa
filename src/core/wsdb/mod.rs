// src/core/wsdb/mod.rs

//! The write-set store port.
//!
//! The store owns everything the engine treats as durable collaborator
//! state: composition of write sets from host appends, the certification
//! index, and the bookkeeping records for local transactions and
//! connections. The engine only drives the protocol; a host may plug in
//! its own store, and [`memory::MemoryWriteSetStore`] is the bundled
//! in-process implementation.

pub mod memory;

use crate::core::applier::{ConflictCheck, JobContext};
use crate::core::seqno::{SEQNO_NIL, Seqno};
use crate::core::writeset::{RowKey, WriteSet};
use std::sync::Arc;
use thiserror::Error;

pub type TrxId = u64;
pub type ConnId = u64;

/// Lifecycle of a host-originated transaction as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum TrxState {
    /// Known, but commit has not started.
    Void,
    /// Broadcast in flight; no seqnos yet.
    Replicating,
    /// Seqnos assigned; inside the ordering pipeline.
    Replicated,
    /// Brute-force aborted (or cancelled before replication).
    Aborted,
    /// Not known to the store.
    Missing,
}

/// Where a brute-force-aborted transaction was interrupted, which decides
/// how much of the pipeline a replay must re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum TrxPosition {
    ToQueue,
    CommitQueue,
}

/// A snapshot of a local transaction's bookkeeping record.
#[derive(Clone)]
pub struct TrxInfo {
    pub state: TrxState,
    pub seqno_l: Seqno,
    pub seqno_g: Seqno,
    pub position: TrxPosition,
    /// The pinned write set of a brute-force-aborted transaction, kept for
    /// replay.
    pub write_set: Option<Arc<WriteSet>>,
}

impl TrxInfo {
    /// The record returned for an unknown transaction id.
    pub fn missing() -> Self {
        Self {
            state: TrxState::Missing,
            seqno_l: SEQNO_NIL,
            seqno_g: SEQNO_NIL,
            position: TrxPosition::ToQueue,
            write_set: None,
        }
    }
}

/// The verdict of a certification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Certification {
    /// The write set still commutes with everything committed after its
    /// anchor.
    Certified,
    /// A write-write conflict was found; the transaction must roll back.
    Failed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown transaction {0}")]
    UnknownTransaction(TrxId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
}

/// The store interface the engine replicates through.
///
/// Implementations must be internally synchronized; the engine calls them
/// from the host threads, the receive loop, and the applier workers
/// concurrently.
pub trait WriteSetStore: Send + Sync {
    // --- Write-set composition ---

    /// Records a statement in the transaction's write set, creating the
    /// transaction record (and capturing its certification anchor) on first
    /// use.
    fn append_query(
        &self,
        trx: TrxId,
        sql: &str,
        timestamp: i64,
        randseed: u32,
    ) -> Result<(), StoreError>;

    /// Records a raw row payload for row-level replication.
    fn append_row(&self, trx: TrxId, data: &[u8]) -> Result<(), StoreError>;

    /// Records a certification key for a row the transaction wrote.
    fn append_row_key(&self, trx: TrxId, key: RowKey) -> Result<(), StoreError>;

    /// Records a session-variable assignment on the connection; replayed
    /// ahead of any query-level write set from that connection.
    fn set_variable(&self, conn: ConnId, key: &str, query: &str) -> Result<(), StoreError>;

    /// Records the connection's selected database.
    fn set_database(&self, conn: ConnId, query: &str) -> Result<(), StoreError>;

    /// Composes the transaction's full write set, including the
    /// connection's setup statements and the host-supplied RBR buffer.
    /// `None` when the transaction has no write set (autocommit no-op).
    fn get_write_set(&self, trx: TrxId, conn: ConnId, rbr: &[u8]) -> Option<WriteSet>;

    /// Composes a connection-scoped write set for total-order execution.
    fn conn_write_set(&self, conn: ConnId) -> Option<WriteSet>;

    // --- Certification index ---

    /// Certifies the write set against the index and, on success, records
    /// it at `seqno_g`. Must be called in ascending `seqno_g` order (the
    /// engine guarantees this by holding the total-order queue).
    fn append_write_set(&self, seqno_g: Seqno, ws: &WriteSet) -> Certification;

    /// Certifies without recording. Used for the best-effort recheck of a
    /// brute-force-aborted local transaction.
    fn certification_test(&self, ws: &WriteSet, seqno_g: Seqno) -> Certification;

    /// Pairwise conflict probe: does `ws` touch anything written by the
    /// write set recorded at `committed_at`?
    fn conflicts(&self, ws: &WriteSet, committed_at: Seqno) -> bool;

    /// Drops certification history below `seqno`.
    fn purge_upto(&self, seqno: Seqno);

    /// The highest seqno whose history the whole cluster may discard.
    fn safe_to_discard_seqno(&self) -> Seqno;

    /// Marks a remotely originated write set committed at `seqno_g`.
    fn set_global_trx_committed(&self, seqno_g: Seqno);

    /// Marks a local transaction committed.
    fn set_local_trx_committed(&self, trx: TrxId);

    // --- Local transaction bookkeeping ---

    /// The transaction's record, or [`TrxInfo::missing`] if unknown.
    fn local_trx(&self, trx: TrxId) -> TrxInfo;

    fn assign_trx_state(&self, trx: TrxId, state: TrxState);

    /// Records the seqno pair assigned by the broadcast and transitions the
    /// record to `state` in one step.
    fn assign_trx_seqno(&self, trx: TrxId, seqno_l: Seqno, seqno_g: Seqno, state: TrxState);

    /// Pins the write set of a brute-force-aborted transaction for replay.
    fn assign_trx_write_set(&self, trx: TrxId, ws: Arc<WriteSet>);

    fn assign_trx_position(&self, trx: TrxId, position: TrxPosition);

    /// Drops the transaction's composed write-set data, keeping the
    /// bookkeeping record.
    fn delete_local_trx(&self, trx: TrxId) -> Result<(), StoreError>;

    /// Drops the bookkeeping record.
    fn delete_local_trx_info(&self, trx: TrxId);

    // --- Connection bookkeeping ---

    /// Remembers the local seqno of the connection's in-flight total-order
    /// execution.
    fn conn_set_seqno(&self, conn: ConnId, seqno_l: Seqno);

    fn conn_seqno(&self, conn: ConnId) -> Option<Seqno>;

    fn conn_reset_seqno(&self, conn: ConnId);
}

/// Bridges the applier pool's admission check to the store's pairwise
/// conflict probe. The job ordered first can never depend on a later one,
/// so only the younger side of each pair is probed.
pub struct StoreConflictCheck(pub Arc<dyn WriteSetStore>);

impl ConflictCheck for StoreConflictCheck {
    fn jobs_conflict(&self, candidate: &JobContext, active: &JobContext) -> bool {
        if candidate.seqno < active.seqno {
            return false;
        }
        self.0.conflicts(&candidate.write_set, active.global_seqno)
    }
}
