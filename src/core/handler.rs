// src/core/handler.rs

//! The host-side apply interface.
//!
//! The engine decides *when* a write set runs; the host decides *how* a
//! statement, row, or RBR buffer turns into storage changes. A host
//! implements [`ApplyHandler`] once and hands it to the engine; the
//! handler carries whatever connection or session context the host needs.

use crate::core::seqno::Seqno;
use crate::core::writeset::Query;
use async_trait::async_trait;
use thiserror::Error;

/// A failure reported by the host while applying replicated data. The
/// engine retries or escalates according to its own policy; the handler
/// only reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("statement apply failed: {0}")]
    Statement(String),

    #[error("row apply failed: {0}")]
    Row(String),

    #[error("rbr apply failed: {0}")]
    Rbr(String),

    #[error("payload not supported: {0}")]
    Unsupported(String),
}

/// Callbacks the database host supplies for write-set application.
#[async_trait]
pub trait ApplyHandler: Send + Sync {
    /// Executes one replicated SQL statement.
    async fn execute(&self, query: &Query) -> Result<(), ApplyError>;

    /// Applies a row-based-replication buffer.
    async fn execute_rbr(&self, rbr: &[u8]) -> Result<(), ApplyError>;

    /// Applies a single row descriptor.
    async fn apply_row(&self, row: &[u8]) -> Result<(), ApplyError>;

    /// Application of the write set delivered at `seqno_l` is about to
    /// begin.
    fn ws_start(&self, _seqno_l: Seqno) {}

    /// Application of the current write set finished.
    fn ws_end(&self) {}
}
