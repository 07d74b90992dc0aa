// src/core/engine/apply.rs

//! Application of remote write sets.
//!
//! Certification runs single-file under the total-order queue; the apply
//! work itself is handed to the applier pool so independent write sets run
//! in parallel; the commit queue then re-serializes the durable step. The
//! same functions run a replayed local transaction, which at this point is
//! indistinguishable from a remote one.

use super::ReplicationEngine;
use crate::core::applier::{JobContext, Worker};
use crate::core::errors::SyncraError;
use crate::core::handler::ApplyError;
use crate::core::seqno::Seqno;
use crate::core::writeset::{Query, ReplicationLevel, WriteSet, WriteSetKind, codec};
use crate::core::wsdb::Certification;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// The verdict for a remote write set at the total-order station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteVerdict {
    Certified,
    Failed,
    /// Outdated global seqno (delivered before state transfer caught up);
    /// skipped without certification.
    Skipped,
}

/// The statement that makes a remotely applied write set durable on the
/// host.
fn commit_statement() -> Query {
    Query::new("commit", 0, 0)
}

impl ReplicationEngine {
    /// Decodes and runs one delivered write-set action.
    pub(crate) async fn process_write_set(
        &self,
        worker: &Worker,
        payload: &[u8],
        seqno_g: Seqno,
        seqno_l: Seqno,
    ) {
        let ws = match codec::decode(payload) {
            Ok(ws) => ws,
            Err(e) => {
                // The slot still has to be passed over, or the whole node
                // stalls behind it.
                error!("write set decode failed at {seqno_l}: {e}");
                self.self_cancel_or_abort(&self.to_queue, seqno_l).await;
                self.self_cancel_or_abort(&self.commit_queue, seqno_l).await;
                return;
            }
        };

        self.handler.ws_start(seqno_l);
        let ws = Arc::new(ws);
        match ws.kind {
            WriteSetKind::Trx => {
                self.process_trx_write_set(worker, ws, seqno_g, seqno_l)
                    .await;
            }
            WriteSetKind::Conn => {
                self.process_conn_write_set(ws, seqno_g, seqno_l).await;
            }
        }
        self.handler.ws_end();
    }

    /// A transactional write set: certify in total order, apply through
    /// the pool, commit under the commit queue.
    pub(crate) async fn process_trx_write_set(
        &self,
        worker: &Worker,
        ws: Arc<WriteSet>,
        seqno_g: Seqno,
        seqno_l: Seqno,
    ) {
        self.grab_or_abort(&self.to_queue, seqno_l).await;
        let verdict = if self.update_global_seqno(seqno_g) {
            match self.store.append_write_set(seqno_g, &ws) {
                Certification::Certified => RemoteVerdict::Certified,
                Certification::Failed => RemoteVerdict::Failed,
            }
        } else {
            RemoteVerdict::Skipped
        };
        self.release_or_abort(&self.to_queue, seqno_l);

        debug!(
            "remote trx seqno: {seqno_l} {seqno_g} last_seen_trx: {} cert: {verdict:?}",
            ws.last_seen_trx
        );

        match verdict {
            RemoteVerdict::Certified => {
                let job = JobContext {
                    seqno: seqno_l,
                    global_seqno: seqno_g,
                    write_set: Arc::clone(&ws),
                };
                if let Err(e) = self.apply_and_commit(worker, job, seqno_g, seqno_l).await {
                    // A certified write set has committed elsewhere; a node
                    // that cannot apply it can only leave the cluster.
                    error!("could not apply trx {seqno_g}: {e}");
                    std::process::abort();
                }
            }
            RemoteVerdict::Failed => {
                warn!(
                    "trx certification failed: ({seqno_l} {seqno_g}) last_seen: {}",
                    ws.last_seen_trx
                );
                self.self_cancel_or_abort(&self.commit_queue, seqno_l).await;
            }
            RemoteVerdict::Skipped => {
                self.self_cancel_or_abort(&self.commit_queue, seqno_l).await;
            }
        }
    }

    /// The apply-commit tail of a certified write set: pool admission,
    /// host apply with retries, then the commit statement under the
    /// commit queue.
    pub(crate) async fn apply_and_commit(
        &self,
        worker: &Worker,
        job: JobContext,
        seqno_g: Seqno,
        seqno_l: Seqno,
    ) -> Result<(), SyncraError> {
        let ws = Arc::clone(&job.write_set);
        let mut holds_commit_queue = false;
        let mut attempts: u32 = 0;

        loop {
            self.appliers.start_job(worker, job.clone()).await;

            while let Err(e) = self.apply_write_set(&ws).await {
                if attempts == 0 {
                    warn!(
                        "write set apply failed for {seqno_g}, last_seen: {}: {e}",
                        ws.last_seen_trx
                    );
                }
                attempts += 1;
                if self.config.apply_retry_limit != 0 && attempts >= self.config.apply_retry_limit
                {
                    warn!("write set apply retry limit reached for {seqno_g}");
                    self.appliers.end_job(worker);
                    return Err(SyncraError::TransactionFailed);
                }
                tokio::time::sleep(self.config.flow_control_pause).await;
            }

            self.appliers.end_job(worker);

            if !holds_commit_queue {
                self.grab_or_abort(&self.commit_queue, seqno_l).await;
                holds_commit_queue = true;
            }

            match self.handler.execute(&commit_statement()).await {
                Ok(()) => break,
                Err(e) => {
                    // Re-run the apply from scratch, keeping our place in
                    // the commit queue.
                    warn!(
                        "write set commit failed for {seqno_g}, last_seen: {}: {e}",
                        ws.last_seen_trx
                    );
                }
            }
        }

        let do_report = self.report_check_counter();
        self.release_or_abort(&self.commit_queue, seqno_l);
        self.store.set_global_trx_committed(seqno_g);
        if do_report {
            self.report_last_committed().await;
        }
        Ok(())
    }

    /// A connection write set: apply in total order, no certification.
    pub(crate) async fn process_conn_write_set(
        &self,
        ws: Arc<WriteSet>,
        seqno_g: Seqno,
        seqno_l: Seqno,
    ) {
        self.grab_or_abort(&self.to_queue, seqno_l).await;
        if self.update_global_seqno(seqno_g) {
            if let Err(e) = self.apply_write_set(&ws).await {
                error!("connection write set apply failed: {e} trx: {seqno_l}");
            }
        }
        self.release_or_abort(&self.to_queue, seqno_l);

        self.grab_or_abort(&self.commit_queue, seqno_l).await;
        let do_report = self.report_check_counter();
        self.release_or_abort(&self.commit_queue, seqno_l);
        self.store.set_global_trx_committed(seqno_g);
        if do_report {
            self.report_last_committed().await;
        }
    }

    /// Dispatches a write set's payload to the host handlers.
    async fn apply_write_set(&self, ws: &WriteSet) -> Result<(), ApplyError> {
        if ws.level == ReplicationLevel::Query {
            for query in &ws.conn_queries {
                if let Err(e) = self.handler.execute(query).await {
                    error!("connection query apply failed: {}", query.sql);
                    return Err(e);
                }
            }
        }
        match ws.level {
            ReplicationLevel::Query => {
                for query in &ws.queries {
                    if let Err(e) = self.handler.execute(query).await {
                        error!("query apply failed: {}", query.sql);
                        return Err(e);
                    }
                }
            }
            ReplicationLevel::DataRow => {
                for row in &ws.rows {
                    if let Err(e) = self.handler.apply_row(&row.data).await {
                        warn!("row apply failed: {e}");
                        return Err(e);
                    }
                }
            }
            ReplicationLevel::DataRbr => {
                if let Err(e) = self.handler.execute_rbr(&ws.rbr).await {
                    error!("rbr apply failed: {e}");
                    return Err(e);
                }
            }
            ReplicationLevel::DataCols => {
                error!("column data replication is not supported yet");
                return Err(ApplyError::Unsupported(
                    "column-level write set".to_string(),
                ));
            }
        }
        Ok(())
    }
}
