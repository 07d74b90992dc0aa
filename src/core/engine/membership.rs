// src/core/engine/membership.rs

//! Handling of membership views and joiner-side state transfer.
//!
//! A view change arrives as a totally-ordered action and is processed
//! while the total-order queue is held, so the whole node agrees on
//! exactly which write sets came before and after the change. A joiner
//! that is behind holds the commit queue across the state-transfer
//! request, keeping the host quiescent until a donor is assigned.

use super::ReplicationEngine;
use crate::core::gcs::{ClusterView, GcsError, StateTransferReply};
use crate::core::seqno::{SEQNO_NIL, Seqno};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How a membership view was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationOutcome {
    /// Quorum-less view; replication stalls until a primary view arrives.
    NonPrimary,
    /// Primary view, node already consistent.
    Member { index: i64 },
    /// Primary view absorbed after requesting a state transfer.
    StateTransfer { donor: i64 },
    /// The state-transfer request failed outright.
    Failed,
}

impl ReplicationEngine {
    /// Absorbs a membership view. Runs while the caller holds the
    /// total-order queue at `seqno_l`.
    pub(crate) async fn handle_configuration(
        &self,
        view: &ClusterView,
        seqno_l: Seqno,
    ) -> ConfigurationOutcome {
        info!(
            "new {} configuration: {}, seqno: {}, group UUID: {}, members: {}, my idx: {}",
            if view.conf_id >= 0 {
                "PRIMARY"
            } else {
                "NON-PRIMARY"
            },
            view.conf_id,
            view.seqno,
            view.group_uuid,
            view.members,
            view.my_idx
        );

        self.set_node_index(view.my_idx);

        if view.conf_id < 0 {
            self.self_cancel_or_abort(&self.commit_queue, seqno_l).await;
            return ConfigurationOutcome::NonPrimary;
        }

        let outcome = if view.state_transfer_required {
            info!(
                "state transfer required: local seqno {}, global seqno {}",
                self.global_seqno(),
                view.seqno
            );
            match self.request_state_transfer(seqno_l).await {
                Some(donor) => {
                    // The state-transfer mechanism itself is external; by
                    // the time the donor hand-off finishes, everything at
                    // or below the view seqno is part of this node's
                    // state and must be skipped.
                    match self.gcs.join(view.seqno).await {
                        Ok(()) => info!("state transfer complete, join sent"),
                        Err(e) => error!("state transfer complete, join failed: {e}"),
                    }
                    self.set_global_seqno(view.seqno);
                    ConfigurationOutcome::StateTransfer { donor }
                }
                None => ConfigurationOutcome::Failed,
            }
        } else {
            if self.global_seqno() != view.seqno {
                error!(
                    "seqno diverged from group at view change: local {}, group {}",
                    self.global_seqno(),
                    view.seqno
                );
                debug_assert_eq!(self.global_seqno(), view.seqno);
            }
            self.self_cancel_or_abort(&self.commit_queue, seqno_l).await;
            ConfigurationOutcome::Member {
                index: view.my_idx,
            }
        };

        self.adopt_group_uuid(view.group_uuid);
        outcome
    }

    /// Requests a state-transfer donor, holding the commit queue at the
    /// view's `seqno_l` so the host stays quiescent. Each request attempt
    /// consumes a local seqno of its own, which must be passed over in
    /// both monitors.
    async fn request_state_transfer(&self, seqno_l: Seqno) -> Option<i64> {
        self.grab_or_abort(&self.commit_queue, seqno_l).await;

        let donor = loop {
            match self.gcs.request_state_transfer(self.global_seqno()).await {
                Ok(StateTransferReply::Granted {
                    donor,
                    request_seqno_l,
                }) => {
                    self.pass_over_request_seqno(request_seqno_l).await;
                    break donor;
                }
                Ok(StateTransferReply::Busy { request_seqno_l }) => {
                    self.pass_over_request_seqno(request_seqno_l).await;
                    debug!("no state transfer donor available, retrying");
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    tokio::time::sleep(self.config.state_transfer_retry + jitter).await;
                }
                Err(e @ GcsError::Busy) => {
                    debug!("state transfer request busy: {e}");
                    tokio::time::sleep(self.config.state_transfer_retry).await;
                }
                Err(e) => {
                    error!("requesting state transfer failed: {e}");
                    self.release_or_abort(&self.commit_queue, seqno_l);
                    return None;
                }
            }
        };

        info!("requesting state transfer: success, donor {donor}");
        if donor == self.node_index() {
            warn!("selected as donor for own state transfer request");
        }

        self.release_or_abort(&self.commit_queue, seqno_l);
        Some(donor)
    }

    async fn pass_over_request_seqno(&self, request_seqno_l: Seqno) {
        if request_seqno_l > SEQNO_NIL {
            self.self_cancel_or_abort(&self.to_queue, request_seqno_l).await;
            self.self_cancel_or_abort(&self.commit_queue, request_seqno_l)
                .await;
        }
    }
}
