// src/core/engine/recv.rs

//! The receive loop: the single consumer of the group-communication
//! stream.
//!
//! Every action the transport delivers — write sets, commit cuts,
//! membership views, state-transfer requests — enters the pipeline here.
//! The loop owns one applier-pool worker for the write sets it applies
//! itself; additional workers are taken only by transaction replays.

use super::ReplicationEngine;
use crate::core::applier::Worker;
use crate::core::errors::SyncraError;
use crate::core::gcs::ActionPayload;
use crate::core::seqno::{SEQNO_ILL, SEQNO_NIL};
use tracing::{debug, error, info};

impl ReplicationEngine {
    /// Runs the receive loop until the group connection fails or closes.
    ///
    /// A host calls this from a dedicated task right after
    /// [`enable`](Self::enable); it only returns on error.
    pub async fn recv(&self) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Err(SyncraError::NodeFailed(
                "receive loop requires an enabled engine".into(),
            ));
        }

        let worker = match self.appliers.new_worker() {
            Ok(worker) => worker,
            Err(e) => {
                error!("could not create applier for the receive loop: {e}");
                return Err(SyncraError::NodeFailed(e.to_string()));
            }
        };

        let result = self.recv_loop(&worker).await;
        self.appliers.remove_worker(worker);
        result
    }

    async fn recv_loop(&self, worker: &Worker) -> Result<(), SyncraError> {
        loop {
            let action = match self.gcs.recv().await {
                Ok(action) => action,
                Err(e) => {
                    error!("group receive failed: {e}");
                    return Err(SyncraError::ConnectionFailed(e.to_string()));
                }
            };
            debug_assert!(action.seqno_l != SEQNO_ILL);
            debug!(
                "worker {} received action at seqno {} {}",
                worker.id(),
                action.seqno_g,
                action.seqno_l
            );

            match action.payload {
                ActionPayload::WriteSet(payload) => {
                    debug_assert!(action.seqno_g != SEQNO_ILL);
                    self.process_write_set(worker, &payload, action.seqno_g, action.seqno_l)
                        .await;
                }
                ActionPayload::CommitCut(cut) => {
                    self.grab_or_abort(&self.to_queue, action.seqno_l).await;
                    self.truncate_trx_history(cut);
                    self.release_or_abort(&self.to_queue, action.seqno_l);

                    // Let other transactions continue to commit.
                    self.self_cancel_or_abort(&self.commit_queue, action.seqno_l)
                        .await;
                }
                ActionPayload::Configuration(view) => {
                    self.grab_or_abort(&self.to_queue, action.seqno_l).await;
                    let outcome = self.handle_configuration(&view, action.seqno_l).await;
                    debug!("configuration handled: {outcome:?}");
                    self.release_or_abort(&self.to_queue, action.seqno_l);
                }
                ActionPayload::StateRequest(_) => {
                    if action.seqno_l > SEQNO_NIL {
                        info!("got state transfer request");

                        // Quiesce the node: hold both queues while the
                        // host-driven donor snapshot runs.
                        self.grab_or_abort(&self.to_queue, action.seqno_l).await;
                        self.grab_or_abort(&self.commit_queue, action.seqno_l).await;

                        self.donor_snapshot().await;

                        self.release_or_abort(&self.to_queue, action.seqno_l);
                        self.release_or_abort(&self.commit_queue, action.seqno_l);

                        match self.gcs.join(action.seqno_g).await {
                            Ok(()) => info!("state transfer complete, join sent"),
                            Err(e) => error!("state transfer complete, join failed: {e}"),
                        }
                    }
                }
            }
        }
    }

    /// The donor-side snapshot hand-off. The snapshot mechanism itself is
    /// the host's business; the engine only guarantees that the node is
    /// quiescent while this runs.
    async fn donor_snapshot(&self) {
        info!("database quiescent for donor state transfer");
    }
}
