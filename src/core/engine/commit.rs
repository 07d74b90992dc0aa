// src/core/engine/commit.rs

//! The local replication path: capture, broadcast, certify, commit.
//!
//! A host thread drives its transaction through here at commit time. The
//! write set is composed and broadcast, then the thread itself walks the
//! same total-order and commit-queue stations a remote write set would,
//! which is what makes every node agree on one serial history. A local
//! transaction waiting at either station may be brute-force aborted on
//! behalf of a conflicting remote write set and later replayed.

use super::ReplicationEngine;
use crate::core::applier::JobContext;
use crate::core::errors::SyncraError;
use crate::core::ordering::OrderingError;
use crate::core::seqno::{Seqno, is_assigned};
use crate::core::writeset::{Query, WriteSet, WriteSetKind, codec};
use crate::core::wsdb::{Certification, ConnId, TrxId, TrxPosition, TrxState};
use std::sync::Arc;
use tracing::{debug, error, warn};

impl ReplicationEngine {
    /// Replicates and certifies a local transaction.
    ///
    /// On `Ok(())` the commit queue is held: the host may write to its
    /// local storage and must then call [`committed`](Self::committed) (or
    /// [`rolledback`](Self::rolledback)) to release it. `BfAborted` means
    /// the transaction was brute-force aborted inside the pipeline and the
    /// host must call [`replay_trx`](Self::replay_trx).
    pub async fn commit(
        &self,
        trx_id: TrxId,
        conn_id: ConnId,
        rbr: &[u8],
    ) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }

        // Flow-control gate. The commit mutex is dropped across every
        // pause so appliers and other committers keep moving; the victim
        // check is re-run after each re-acquisition because a brute-force
        // abort may land while we sleep.
        let mut guard = self.commit_mtx.lock().await;
        loop {
            match self.store.local_trx(trx_id).state {
                TrxState::Aborted => {
                    debug!("trx has been cancelled already: {trx_id}");
                    if self.store.delete_local_trx(trx_id).is_err() {
                        debug!("could not delete trx: {trx_id}");
                    }
                    return Err(SyncraError::TransactionFailed);
                }
                TrxState::Missing => {
                    debug!("trx is missing from the write-set store: {trx_id}");
                    return Err(SyncraError::TransactionMissing);
                }
                _ => {}
            }
            if !self.gcs.flow_paused() {
                break;
            }
            drop(guard);
            tokio::time::sleep(self.config.flow_control_pause).await;
            guard = self.commit_mtx.lock().await;
        }

        // Compose the write set. A transaction with nothing to replicate
        // (autocommit read, for instance) commits locally as a no-op.
        let Some(ws) = self.store.get_write_set(trx_id, conn_id, rbr) else {
            debug!("empty local trx write set: {trx_id}");
            return Ok(());
        };
        if self.store.delete_local_trx(trx_id).is_err() {
            warn!("could not delete trx: {trx_id}");
        }
        if ws.is_empty() {
            warn!("empty write set for: {trx_id}");
            return Ok(());
        }

        let payload = match codec::encode(&ws) {
            Ok(payload) => payload,
            Err(e) => {
                error!("write set encode failed for {trx_id}: {e}");
                return Err(SyncraError::TransactionFailed);
            }
        };

        self.store.assign_trx_state(trx_id, TrxState::Replicating);
        drop(guard);

        // Broadcast through the group. Nothing of ours may be held while
        // the transport blocks.
        let (seqno_g, seqno_l) = match self.gcs.broadcast(payload).await {
            Ok(seqnos) => seqnos,
            Err(e) => {
                error!("group broadcast failed for {trx_id}: {e}");
                let _guard = self.commit_mtx.lock().await;
                self.store.assign_trx_state(trx_id, TrxState::Aborted);
                self.trx_replicated.notify_waiters();
                return Err(SyncraError::ConnectionFailed(e.to_string()));
            }
        };
        debug_assert!(is_assigned(seqno_g) && is_assigned(seqno_l));

        {
            let _guard = self.commit_mtx.lock().await;
            self.store
                .assign_trx_seqno(trx_id, seqno_l, seqno_g, TrxState::Replicated);
        }
        // Wake any cancel_commit waiting for the seqnos to exist.
        self.trx_replicated.notify_waiters();

        // Enter the total-order queue.
        match self.to_queue.grab(seqno_l).await {
            Ok(()) => {}
            Err(OrderingError::Interrupted(_)) => {
                warn!("total order grab interrupted: seqno {seqno_l}");
                return self
                    .bf_abort_at_total_order(trx_id, ws, seqno_l, seqno_g)
                    .await;
            }
            Err(e) => self.pipeline_broken("to_queue", "grab", seqno_l, e),
        }

        let in_order = self.update_global_seqno(seqno_g);
        let verdict = if in_order {
            let verdict = self.store.append_write_set(seqno_g, &ws);
            match verdict {
                Certification::Certified => {
                    debug!(
                        "local trx certified, seqno: {seqno_l} {seqno_g} last_seen_trx: {}",
                        ws.last_seen_trx
                    );
                }
                Certification::Failed => {
                    debug!(
                        "local trx commit certification failed: {seqno_l} - {}",
                        ws.last_seen_trx
                    );
                }
            }
            verdict
        } else {
            // Possible if the host replicates before its state transfer
            // has completed: the action is as good as cancelled.
            warn!(
                "local action replicated with outdated seqno: current {}, action {seqno_g}",
                self.global_seqno()
            );
            Certification::Failed
        };

        self.release_or_abort(&self.to_queue, seqno_l);

        if verdict != Certification::Certified {
            self.self_cancel_or_abort(&self.commit_queue, seqno_l).await;
            let _guard = self.commit_mtx.lock().await;
            self.store.assign_trx_state(trx_id, TrxState::Aborted);
            return Err(SyncraError::TransactionFailed);
        }

        // Enter the commit queue and hold it for the host's commit.
        match self.commit_queue.grab(seqno_l).await {
            Ok(()) => {
                if self.config.mark_commit_early {
                    self.store.set_local_trx_committed(trx_id);
                }
                Ok(())
            }
            Err(OrderingError::Canceled(_)) => {
                warn!("canceled in commit queue for {seqno_l}");
                let _guard = self.commit_mtx.lock().await;
                self.store.assign_trx_state(trx_id, TrxState::Aborted);
                Err(SyncraError::TransactionFailed)
            }
            Err(OrderingError::Interrupted(_)) => {
                // Certification already succeeded, so no recheck: pin the
                // write set and let the host replay the apply-commit tail.
                warn!("interrupted in commit queue for {seqno_l}");
                let _guard = self.commit_mtx.lock().await;
                self.store.assign_trx_write_set(trx_id, Arc::new(ws));
                self.store
                    .assign_trx_position(trx_id, TrxPosition::CommitQueue);
                self.store.assign_trx_state(trx_id, TrxState::Aborted);
                Err(SyncraError::BfAborted)
            }
            Err(e) => self.pipeline_broken("commit_queue", "grab", seqno_l, e),
        }
    }

    /// Decides the fate of a local transaction whose total-order wait was
    /// broken by a brute-force abort. If it would still certify, the write
    /// set is pinned for a full replay; otherwise both queues are passed
    /// over and the host must roll back.
    ///
    /// The recheck is deliberately best-effort: it runs against whatever
    /// has certified so far rather than waiting for the full prefix, since
    /// waiting could deadlock against the bounded applier pool. A
    /// pessimistic verdict costs a rollback, never consistency.
    async fn bf_abort_at_total_order(
        &self,
        trx_id: TrxId,
        ws: WriteSet,
        seqno_l: Seqno,
        seqno_g: Seqno,
    ) -> Result<(), SyncraError> {
        match self.store.certification_test(&ws, seqno_g) {
            Certification::Certified => {
                warn!(
                    "conflicting local trx has certified, seqno: {seqno_l} {seqno_g} \
                     last_seen_trx: {}",
                    ws.last_seen_trx
                );
                let _guard = self.commit_mtx.lock().await;
                self.store.assign_trx_write_set(trx_id, Arc::new(ws));
                self.store
                    .assign_trx_position(trx_id, TrxPosition::ToQueue);
                self.store.assign_trx_state(trx_id, TrxState::Aborted);
                Err(SyncraError::BfAborted)
            }
            Certification::Failed => {
                debug!(
                    "conflicting local trx certification failed: {seqno_l} - {}",
                    ws.last_seen_trx
                );
                self.self_cancel_or_abort(&self.to_queue, seqno_l).await;
                self.self_cancel_or_abort(&self.commit_queue, seqno_l).await;
                let _guard = self.commit_mtx.lock().await;
                self.store.assign_trx_state(trx_id, TrxState::Aborted);
                Err(SyncraError::TransactionFailed)
            }
        }
    }

    fn pipeline_broken(&self, queue: &str, op: &str, seqno_l: Seqno, err: OrderingError) -> ! {
        error!("failed to {op} {queue} at {seqno_l}: {err}");
        std::process::abort();
    }

    /// The host finished writing the transaction to its storage: release
    /// the commit queue and retire the record.
    pub async fn committed(&self, trx_id: TrxId) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }

        let mut do_report = false;
        {
            let _guard = self.commit_mtx.lock().await;
            let trx = self.store.local_trx(trx_id);
            if trx.state == TrxState::Replicated {
                do_report = self.report_check_counter();
                self.release_or_abort(&self.commit_queue, trx.seqno_l);
                if !self.config.mark_commit_early {
                    self.store.set_local_trx_committed(trx_id);
                }
                self.store.delete_local_trx_info(trx_id);
            } else if trx.state != TrxState::Missing {
                debug!("trx state {} at committed for: {}", trx.state, trx.seqno_l);
            }
        }

        if do_report {
            self.report_last_committed().await;
        }
        Ok(())
    }

    /// The host rolled the transaction back after a successful
    /// replication: release the commit queue and drop everything.
    pub async fn rolledback(&self, trx_id: TrxId) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }

        let _guard = self.commit_mtx.lock().await;
        let trx = self.store.local_trx(trx_id);
        if trx.state == TrxState::Replicated {
            self.release_or_abort(&self.commit_queue, trx.seqno_l);
            let _ = self.store.delete_local_trx(trx_id);
            self.store.delete_local_trx_info(trx_id);
        } else if trx.state != TrxState::Missing {
            debug!("trx state {} at rolledback for: {}", trx.state, trx.seqno_l);
        }
        Ok(())
    }

    /// Brute-force abort: break a local transaction out of the pipeline so
    /// a conflicting remote write set can proceed. Idempotent — repeating
    /// it on an already-aborted or unknown transaction does nothing.
    pub async fn cancel_commit(&self, victim_trx: TrxId) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }

        let mut guard = self.commit_mtx.lock().await;
        loop {
            let victim = self.store.local_trx(victim_trx);
            match victim.state {
                TrxState::Aborted => {
                    debug!("trx marked aborted already: {}", victim.seqno_l);
                    break;
                }
                TrxState::Missing => {
                    debug!("trx missing at cancel commit: {victim_trx}");
                    break;
                }
                TrxState::Void => {
                    self.store.assign_trx_state(victim_trx, TrxState::Aborted);
                    warn!("no seqno for trx, marked trx aborted: {victim_trx}");
                    break;
                }
                TrxState::Replicating => {
                    // No seqno to interrupt yet. Wait for the replication
                    // broadcast to finish; the commit path signals the
                    // transition out of Replicating.
                    debug!("victim trx is replicating: {victim_trx}");
                    let notified = self.trx_replicated.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(guard);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(self.config.flow_control_pause) => {}
                    }
                    guard = self.commit_mtx.lock().await;
                }
                TrxState::Replicated => {
                    debug!(
                        "interrupting trx commit: trx {victim_trx} seqno {}",
                        victim.seqno_l
                    );
                    if self.to_queue.interrupt(victim.seqno_l).is_err() {
                        debug!(
                            "trx past total order, interrupting commit queue: {}",
                            victim.seqno_l
                        );
                        if let Err(e) = self.commit_queue.interrupt(victim.seqno_l) {
                            warn!("trx interrupt failed in commit queue: {e}");
                        }
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Re-runs a brute-force-aborted transaction from its pinned write
    /// set. Produces the same committed state the original commit would
    /// have, since certification already fixed its place in the global
    /// order.
    pub async fn replay_trx(&self, trx_id: TrxId) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }

        let trx = self.store.local_trx(trx_id);
        debug!(
            "trx replay for: {} {} state: {}",
            trx.seqno_l, trx.seqno_g, trx.state
        );
        if trx.state != TrxState::Aborted {
            error!("replayed trx in bad state: {}", trx.state);
            return Err(SyncraError::NodeFailed(format!(
                "replay of trx {trx_id} in state {}",
                trx.state
            )));
        }
        let Some(ws) = trx.write_set.clone() else {
            error!("replayed trx has no pinned write set: {trx_id}");
            return Err(SyncraError::NodeFailed(format!(
                "no pinned write set for trx {trx_id}"
            )));
        };
        if ws.kind != WriteSetKind::Trx {
            error!("replayed trx write set has bad type: {}", ws.kind);
            return Err(SyncraError::NodeFailed(format!(
                "replayed trx {trx_id} has write set of type {}",
                ws.kind
            )));
        }

        let worker = self.appliers.new_worker().map_err(|e| {
            error!("could not create applier for replay: {e}");
            SyncraError::NodeFailed(e.to_string())
        })?;

        match trx.position {
            TrxPosition::ToQueue => {
                // Interrupted before certification: re-run the whole
                // remote pipeline from the total-order queue on.
                self.process_trx_write_set(&worker, Arc::clone(&ws), trx.seqno_g, trx.seqno_l)
                    .await;
            }
            TrxPosition::CommitQueue => {
                // Certification already succeeded; only apply and commit.
                let job = JobContext {
                    seqno: trx.seqno_l,
                    global_seqno: trx.seqno_g,
                    write_set: Arc::clone(&ws),
                };
                if let Err(e) = self
                    .apply_and_commit(&worker, job, trx.seqno_g, trx.seqno_l)
                    .await
                {
                    error!("could not re-apply trx {}: {e}", trx.seqno_g);
                    std::process::abort();
                }
            }
        }
        self.appliers.remove_worker(worker);

        {
            let _guard = self.commit_mtx.lock().await;
            self.store.assign_trx_state(trx_id, TrxState::Replicated);
        }
        Ok(())
    }

    /// Begins a total-order-isolated execution (DDL-style): broadcasts the
    /// statement with the connection's setup queries, waits for its turn
    /// in total order, and returns holding the commit queue so nothing can
    /// commit while the host executes. Must be paired with
    /// [`to_execute_end`](Self::to_execute_end).
    pub async fn to_execute_start(&self, conn_id: ConnId, query: &str) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }

        let Some(mut ws) = self.store.conn_write_set(conn_id) else {
            return Err(SyncraError::ConnectionFailed(format!(
                "no connection write set for {conn_id}"
            )));
        };
        ws.queries.push(Query::new(query, 0, 0));

        let payload = match codec::encode(&ws) {
            Ok(payload) => payload,
            Err(e) => {
                error!("write set encode failed for conn {conn_id}: {e}");
                return Err(SyncraError::ConnectionFailed(e.to_string()));
            }
        };

        while self.gcs.flow_paused() {
            tokio::time::sleep(self.config.flow_control_pause).await;
        }

        let (seqno_g, seqno_l) = match self.gcs.broadcast(payload).await {
            Ok(seqnos) => seqnos,
            Err(e) => {
                error!("group broadcast failed for conn {conn_id}: {e}");
                return Err(SyncraError::ConnectionFailed(e.to_string()));
            }
        };
        debug_assert!(is_assigned(seqno_g) && is_assigned(seqno_l));

        self.grab_or_abort(&self.to_queue, seqno_l).await;
        let do_execute = self.update_global_seqno(seqno_g);
        if do_execute {
            self.store.conn_set_seqno(conn_id, seqno_l);
        }
        self.release_or_abort(&self.to_queue, seqno_l);

        if do_execute {
            self.grab_or_abort(&self.commit_queue, seqno_l).await;
            Ok(())
        } else {
            warn!(
                "local action replicated with outdated seqno: current {}, action {seqno_g}",
                self.global_seqno()
            );
            self.self_cancel_or_abort(&self.commit_queue, seqno_l).await;
            Err(SyncraError::ConnectionFailed(
                "total order execution replicated with outdated seqno".into(),
            ))
        }
    }

    /// Ends a total-order-isolated execution, releasing the commit queue.
    pub async fn to_execute_end(&self, conn_id: ConnId) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }

        let Some(seqno_l) = self.store.conn_seqno(conn_id) else {
            warn!("missing connection seqno for: {conn_id}");
            return Err(SyncraError::ConnectionFailed(format!(
                "no total order execution in flight on connection {conn_id}"
            )));
        };

        let do_report = self.report_check_counter();
        self.release_or_abort(&self.commit_queue, seqno_l);
        self.store.conn_reset_seqno(conn_id);

        if do_report {
            self.report_last_committed().await;
        }
        Ok(())
    }
}
