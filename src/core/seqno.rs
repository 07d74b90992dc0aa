// src/core/seqno.rs

//! Sequence-number types shared by every part of the replication pipeline.
//!
//! Two monotonic counters attach to every delivered group-communication
//! action: `seqno_g`, the cluster-wide global order agreed by the transport,
//! and `seqno_l`, the per-node delivery order. `seqno_l` is dense on a node;
//! `seqno_g` may be sparse because the transport can skip a node's ordinal.

/// A replication sequence number, global (`seqno_g`) or local (`seqno_l`).
pub type Seqno = i64;

/// A sequence number that has never been assigned.
pub const SEQNO_NIL: Seqno = 0;

/// An error marker: the transport failed to assign a sequence number.
pub const SEQNO_ILL: Seqno = -1;

/// The first sequence number handed out by the ordering monitors.
pub const SEQNO_FIRST: Seqno = 1;

/// Returns `true` for a sequence number that was actually assigned.
pub fn is_assigned(seqno: Seqno) -> bool {
    seqno > SEQNO_NIL
}
