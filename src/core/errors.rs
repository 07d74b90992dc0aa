// src/core/errors.rs

//! Defines the primary error type returned to the database host.

use thiserror::Error;

/// The main error enum, representing the failure classes the engine reports
/// to the host. Success and benign no-ops are `Ok(())`; anomalies that need
/// no host action are logged at `warn` level instead of being returned.
/// Broken ordering invariants are not represented here at all: they abort
/// the process, because no rollback can repair a violated total order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncraError {
    /// The transaction lost certification (or was aborted before it could
    /// replicate) and must be rolled back by the host.
    #[error("transaction must be rolled back")]
    TransactionFailed,

    /// The transaction id is not known to the write-set store.
    #[error("transaction is not known to the write-set store")]
    TransactionMissing,

    /// The transaction was brute-force aborted while inside the replication
    /// pipeline. Its write set is pinned; the host must call `replay_trx`.
    #[error("transaction was brute-force aborted and must be replayed")]
    BfAborted,

    /// The group-communication layer failed; the host should retry or
    /// reconnect.
    #[error("group communication failure: {0}")]
    ConnectionFailed(String),

    /// The engine cannot operate (no group connection, applier pool
    /// exhausted, replay of a transaction in the wrong state).
    #[error("replication engine cannot operate: {0}")]
    NodeFailed(String),

    /// The engine configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}
