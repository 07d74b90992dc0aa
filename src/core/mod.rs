// src/core/mod.rs

//! The central module containing the core logic and data structures of the
//! replication engine.

pub mod applier;
pub mod engine;
pub mod errors;
pub mod gcs;
pub mod handler;
pub mod ordering;
pub mod seqno;
pub mod writeset;
pub mod wsdb;

pub use errors::SyncraError;
pub use seqno::Seqno;
pub use writeset::WriteSet;
