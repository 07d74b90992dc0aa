// src/core/wsdb/memory.rs

//! The bundled in-process write-set store.
//!
//! Certification is first-committer-wins over `(dbtable, key)` pairs: the
//! index remembers, per key, the global seqno of the last write set that
//! touched it, and a candidate fails if any of its keys was written inside
//! its certification window `(last_seen_trx, seqno_g)`.

use super::{Certification, ConnId, StoreError, TrxId, TrxInfo, TrxPosition, TrxState};
use crate::core::seqno::{SEQNO_NIL, Seqno};
use crate::core::writeset::{Query, ReplicationLevel, RowData, RowKey, WriteSet};
use crate::core::wsdb::WriteSetStore;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

type CertKey = (String, Vec<u8>);

/// A local transaction's record: lifecycle state plus the accumulated
/// write-set data.
struct LocalTrx {
    state: TrxState,
    seqno_l: Seqno,
    seqno_g: Seqno,
    position: TrxPosition,
    /// Certification anchor captured when the transaction first appended.
    last_seen: Seqno,
    queries: Vec<Query>,
    row_keys: Vec<RowKey>,
    rows: Vec<RowData>,
    pinned: Option<Arc<WriteSet>>,
}

impl LocalTrx {
    fn new(last_seen: Seqno) -> Self {
        Self {
            state: TrxState::Void,
            seqno_l: SEQNO_NIL,
            seqno_g: SEQNO_NIL,
            position: TrxPosition::ToQueue,
            last_seen,
            queries: Vec::new(),
            row_keys: Vec::new(),
            rows: Vec::new(),
            pinned: None,
        }
    }
}

#[derive(Default)]
struct ConnState {
    database: Option<Query>,
    variables: BTreeMap<String, Query>,
    seqno: Option<Seqno>,
}

/// The certification history: per-seqno key lists for pairwise probes and
/// a flat key index for window checks.
#[derive(Default)]
struct CertIndex {
    history: BTreeMap<Seqno, Vec<CertKey>>,
    index: HashMap<CertKey, Seqno>,
}

impl CertIndex {
    fn test(&self, ws: &WriteSet, seqno_g: Seqno) -> Certification {
        for key in &ws.row_keys {
            let cert_key = (key.dbtable.clone(), key.key.clone());
            if let Some(&written_at) = self.index.get(&cert_key) {
                if written_at > ws.last_seen_trx && written_at < seqno_g {
                    return Certification::Failed;
                }
            }
        }
        Certification::Certified
    }
}

/// An in-memory [`WriteSetStore`].
#[derive(Default)]
pub struct MemoryWriteSetStore {
    trxs: DashMap<TrxId, LocalTrx>,
    conns: DashMap<ConnId, ConnState>,
    cert: Mutex<CertIndex>,
    /// Highest globally committed seqno; the anchor handed to new
    /// transactions.
    last_committed: AtomicI64,
}

impl MemoryWriteSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The anchor a transaction starting right now would receive.
    pub fn last_committed_seqno(&self) -> Seqno {
        self.last_committed.load(Ordering::SeqCst)
    }

    fn with_trx<T>(&self, trx: TrxId, f: impl FnOnce(&mut LocalTrx) -> T) -> Result<T, StoreError> {
        match self.trxs.get_mut(&trx) {
            Some(mut entry) => Ok(f(&mut entry)),
            None => Err(StoreError::UnknownTransaction(trx)),
        }
    }

    fn append_with(&self, trx: TrxId, f: impl FnOnce(&mut LocalTrx)) {
        let mut entry = self
            .trxs
            .entry(trx)
            .or_insert_with(|| LocalTrx::new(self.last_committed_seqno()));
        f(&mut entry);
    }
}

impl WriteSetStore for MemoryWriteSetStore {
    fn append_query(
        &self,
        trx: TrxId,
        sql: &str,
        timestamp: i64,
        randseed: u32,
    ) -> Result<(), StoreError> {
        self.append_with(trx, |t| {
            t.queries.push(Query::new(sql, timestamp, randseed));
        });
        Ok(())
    }

    fn append_row(&self, trx: TrxId, data: &[u8]) -> Result<(), StoreError> {
        self.append_with(trx, |t| {
            t.rows.push(RowData {
                data: data.to_vec(),
            });
        });
        Ok(())
    }

    fn append_row_key(&self, trx: TrxId, key: RowKey) -> Result<(), StoreError> {
        self.append_with(trx, |t| t.row_keys.push(key));
        Ok(())
    }

    fn set_variable(&self, conn: ConnId, key: &str, query: &str) -> Result<(), StoreError> {
        self.conns
            .entry(conn)
            .or_default()
            .variables
            .insert(key.to_string(), Query::new(query, 0, 0));
        Ok(())
    }

    fn set_database(&self, conn: ConnId, query: &str) -> Result<(), StoreError> {
        self.conns.entry(conn).or_default().database = Some(Query::new(query, 0, 0));
        Ok(())
    }

    fn get_write_set(&self, trx: TrxId, conn: ConnId, rbr: &[u8]) -> Option<WriteSet> {
        let entry = self.trxs.get(&trx)?;

        let mut ws = WriteSet::new_trx(entry.last_seen);
        ws.queries = entry.queries.clone();
        ws.row_keys = entry.row_keys.clone();
        ws.rows = entry.rows.clone();
        ws.rbr = rbr.to_vec();
        ws.level = if !ws.rbr.is_empty() {
            ReplicationLevel::DataRbr
        } else if !ws.rows.is_empty() {
            ReplicationLevel::DataRow
        } else {
            ReplicationLevel::Query
        };

        if let Some(conn_state) = self.conns.get(&conn) {
            if let Some(db) = &conn_state.database {
                ws.conn_queries.push(db.clone());
            }
            ws.conn_queries
                .extend(conn_state.variables.values().cloned());
        }
        Some(ws)
    }

    fn conn_write_set(&self, conn: ConnId) -> Option<WriteSet> {
        let mut ws = WriteSet::new_conn();
        ws.last_seen_trx = self.last_committed_seqno();
        if let Some(conn_state) = self.conns.get(&conn) {
            if let Some(db) = &conn_state.database {
                ws.conn_queries.push(db.clone());
            }
            ws.conn_queries
                .extend(conn_state.variables.values().cloned());
        }
        Some(ws)
    }

    fn append_write_set(&self, seqno_g: Seqno, ws: &WriteSet) -> Certification {
        let mut cert = self.cert.lock();
        let verdict = cert.test(ws, seqno_g);
        if verdict == Certification::Certified && !ws.row_keys.is_empty() {
            let keys: Vec<CertKey> = ws
                .row_keys
                .iter()
                .map(|k| (k.dbtable.clone(), k.key.clone()))
                .collect();
            for key in &keys {
                cert.index.insert(key.clone(), seqno_g);
            }
            cert.history.insert(seqno_g, keys);
        }
        verdict
    }

    fn certification_test(&self, ws: &WriteSet, seqno_g: Seqno) -> Certification {
        self.cert.lock().test(ws, seqno_g)
    }

    fn conflicts(&self, ws: &WriteSet, committed_at: Seqno) -> bool {
        let cert = self.cert.lock();
        let Some(keys) = cert.history.get(&committed_at) else {
            return false;
        };
        ws.row_keys
            .iter()
            .any(|k| keys.iter().any(|(t, v)| *t == k.dbtable && *v == k.key))
    }

    fn purge_upto(&self, seqno: Seqno) {
        let mut cert = self.cert.lock();
        cert.history.retain(|&s, _| s >= seqno);
        cert.index.retain(|_, &mut s| s >= seqno);
        debug!("certification history purged below {seqno}");
    }

    fn safe_to_discard_seqno(&self) -> Seqno {
        self.last_committed_seqno()
    }

    fn set_global_trx_committed(&self, seqno_g: Seqno) {
        self.last_committed.fetch_max(seqno_g, Ordering::SeqCst);
    }

    fn set_local_trx_committed(&self, trx: TrxId) {
        if let Some(entry) = self.trxs.get(&trx) {
            self.last_committed.fetch_max(entry.seqno_g, Ordering::SeqCst);
        }
    }

    fn local_trx(&self, trx: TrxId) -> TrxInfo {
        match self.trxs.get(&trx) {
            Some(entry) => TrxInfo {
                state: entry.state,
                seqno_l: entry.seqno_l,
                seqno_g: entry.seqno_g,
                position: entry.position,
                write_set: entry.pinned.clone(),
            },
            None => TrxInfo::missing(),
        }
    }

    fn assign_trx_state(&self, trx: TrxId, state: TrxState) {
        self.append_with(trx, |t| t.state = state);
    }

    fn assign_trx_seqno(&self, trx: TrxId, seqno_l: Seqno, seqno_g: Seqno, state: TrxState) {
        self.append_with(trx, |t| {
            t.seqno_l = seqno_l;
            t.seqno_g = seqno_g;
            t.state = state;
        });
    }

    fn assign_trx_write_set(&self, trx: TrxId, ws: Arc<WriteSet>) {
        self.append_with(trx, |t| t.pinned = Some(ws));
    }

    fn assign_trx_position(&self, trx: TrxId, position: TrxPosition) {
        self.append_with(trx, |t| t.position = position);
    }

    fn delete_local_trx(&self, trx: TrxId) -> Result<(), StoreError> {
        self.with_trx(trx, |t| {
            t.queries.clear();
            t.row_keys.clear();
            t.rows.clear();
        })
    }

    fn delete_local_trx_info(&self, trx: TrxId) {
        self.trxs.remove(&trx);
    }

    fn conn_set_seqno(&self, conn: ConnId, seqno_l: Seqno) {
        self.conns.entry(conn).or_default().seqno = Some(seqno_l);
    }

    fn conn_seqno(&self, conn: ConnId) -> Option<Seqno> {
        self.conns.get(&conn).and_then(|c| c.seqno)
    }

    fn conn_reset_seqno(&self, conn: ConnId) {
        if let Some(mut conn_state) = self.conns.get_mut(&conn) {
            conn_state.seqno = None;
        }
    }
}
