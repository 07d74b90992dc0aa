// src/core/writeset/mod.rs

//! The write set: everything a transaction wants to replicate, plus the
//! certification anchor (`last_seen_trx`) that defines which concurrently
//! committed write sets it must be checked against.

pub mod codec;

use crate::core::seqno::{SEQNO_NIL, Seqno};
use serde::{Deserialize, Serialize};

/// What produced the write set.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    strum_macros::Display,
)]
pub enum WriteSetKind {
    /// A transaction: certified, then applied.
    Trx,
    /// Connection-scoped statements: applied in total order, never
    /// certified.
    Conn,
}

/// How the payload is expressed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    strum_macros::Display,
)]
pub enum ReplicationLevel {
    /// SQL statements.
    Query,
    /// Row descriptors applied one by one.
    DataRow,
    /// An opaque row-based-replication buffer applied by the host.
    DataRbr,
    /// Column-level payloads. Not supported by the apply path.
    DataCols,
}

/// One replicated SQL statement with the session context needed to re-run
/// it deterministically on another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Query {
    pub sql: String,
    /// Statement wall-clock, so `NOW()`-style functions replay identically.
    pub timestamp: i64,
    /// Seed for `RAND()`-style functions.
    pub randseed: u32,
}

impl Query {
    pub fn new(sql: impl Into<String>, timestamp: i64, randseed: u32) -> Self {
        Self {
            sql: sql.into(),
            timestamp,
            randseed,
        }
    }
}

/// The action recorded for a row key.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    strum_macros::Display,
)]
pub enum RowAction {
    Update,
    Delete,
    Insert,
}

/// A certification key: which row of which table the transaction wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RowKey {
    pub dbtable: String,
    pub key: Vec<u8>,
    pub action: RowAction,
}

/// A raw row payload for `DataRow`-level replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RowData {
    pub data: Vec<u8>,
}

/// The replicated unit: mutations plus the certification anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct WriteSet {
    pub kind: WriteSetKind,
    pub level: ReplicationLevel,
    /// Connection-scoped setup statements (selected database, session
    /// variables) replayed before the payload on query-level write sets.
    pub conn_queries: Vec<Query>,
    pub queries: Vec<Query>,
    pub row_keys: Vec<RowKey>,
    pub rows: Vec<RowData>,
    pub rbr: Vec<u8>,
    /// The highest global seqno this transaction had seen when it started.
    /// Any write set committed after it and before this one's own global
    /// seqno is a potential conflict.
    pub last_seen_trx: Seqno,
}

impl WriteSet {
    /// An empty transactional write set anchored at `last_seen_trx`.
    pub fn new_trx(last_seen_trx: Seqno) -> Self {
        Self {
            kind: WriteSetKind::Trx,
            level: ReplicationLevel::Query,
            conn_queries: Vec::new(),
            queries: Vec::new(),
            row_keys: Vec::new(),
            rows: Vec::new(),
            rbr: Vec::new(),
            last_seen_trx,
        }
    }

    /// An empty connection write set.
    pub fn new_conn() -> Self {
        Self {
            kind: WriteSetKind::Conn,
            ..Self::new_trx(SEQNO_NIL)
        }
    }

    /// A write set with nothing to replicate. Committing one is a no-op.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.rows.is_empty() && self.rbr.is_empty()
    }
}
