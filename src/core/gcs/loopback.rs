// src/core/gcs/loopback.rs

//! An in-process group-communication hub.
//!
//! Every node of the "cluster" attaches to one [`LoopbackHub`], which
//! assigns global seqnos under a single lock and fans each action out to
//! every open member with that member's own dense local seqno. This gives
//! real total-order semantics without a network and is what the multi-node
//! tests (and single-process hosts) run on.

use super::{Action, ActionPayload, ClusterView, GcsError, GroupComm, StateTransferReply};
use crate::core::seqno::{SEQNO_ILL, SEQNO_NIL, Seqno};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

struct Member {
    local_seqno: Seqno,
    tx: mpsc::UnboundedSender<Action>,
    open: bool,
}

struct HubInner {
    global_seqno: Seqno,
    conf_id: i64,
    members: Vec<Member>,
    /// Last-applied seqnos reported by members, by member id.
    last_applied: HashMap<usize, Seqno>,
}

/// The shared ordering point of a loopback cluster.
pub struct LoopbackHub {
    group_uuid: Uuid,
    inner: Mutex<HubInner>,
    paused: AtomicBool,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            group_uuid: Uuid::new_v4(),
            inner: Mutex::new(HubInner {
                global_seqno: SEQNO_NIL,
                conf_id: 0,
                members: Vec::new(),
                last_applied: HashMap::new(),
            }),
            paused: AtomicBool::new(false),
        })
    }

    pub fn group_uuid(&self) -> Uuid {
        self.group_uuid
    }

    /// Attaches a new member. The returned handle is closed until its
    /// `open()` is called.
    pub fn attach(self: &Arc<Self>) -> LoopbackGcs {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.members.len();
        inner.members.push(Member {
            local_seqno: SEQNO_NIL,
            tx,
            open: false,
        });
        LoopbackGcs {
            hub: Arc::clone(self),
            id,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Toggles the cluster-wide flow-control signal.
    pub fn set_flow_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// The last-applied seqno a member reported, if any.
    pub fn last_applied(&self, member: usize) -> Option<Seqno> {
        self.inner.lock().last_applied.get(&member).copied()
    }

    /// The current global seqno high-water mark.
    pub fn global_seqno(&self) -> Seqno {
        self.inner.lock().global_seqno
    }

    /// Delivers a commit cut carrying `seqno` to every open member.
    pub fn broadcast_commit_cut(&self, seqno: Seqno) {
        let mut inner = self.inner.lock();
        Self::deliver_to_all(&mut inner, SEQNO_ILL, ActionPayload::CommitCut(seqno));
    }

    /// Delivers a membership view to a single member, consuming one of its
    /// local seqnos. Returns the assigned local seqno.
    pub fn deliver_view_to(&self, member: usize, view: ClusterView) -> Seqno {
        let mut inner = self.inner.lock();
        Self::deliver_to(&mut inner, member, SEQNO_ILL, ActionPayload::Configuration(view))
    }

    /// A primary view describing the hub's current state, addressed to
    /// `member`.
    pub fn current_view_for(&self, member: usize, state_transfer_required: bool) -> ClusterView {
        let inner = self.inner.lock();
        ClusterView {
            conf_id: inner.conf_id + 1,
            seqno: inner.global_seqno,
            group_uuid: self.group_uuid,
            members: inner.members.iter().filter(|m| m.open).count(),
            my_idx: member as i64,
            state_transfer_required,
        }
    }

    fn deliver_to(
        inner: &mut HubInner,
        member: usize,
        seqno_g: Seqno,
        payload: ActionPayload,
    ) -> Seqno {
        let m = &mut inner.members[member];
        m.local_seqno += 1;
        let seqno_l = m.local_seqno;
        let _ = m.tx.send(Action {
            seqno_g,
            seqno_l,
            payload,
        });
        seqno_l
    }

    fn deliver_to_all(inner: &mut HubInner, seqno_g: Seqno, payload: ActionPayload) {
        let open: Vec<usize> = inner
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.open)
            .map(|(id, _)| id)
            .collect();
        for id in open {
            Self::deliver_to(inner, id, seqno_g, payload.clone());
        }
    }
}

/// One member's handle onto a [`LoopbackHub`].
pub struct LoopbackGcs {
    hub: Arc<LoopbackHub>,
    id: usize,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Action>>,
}

impl LoopbackGcs {
    pub fn member_id(&self) -> usize {
        self.id
    }

    pub fn hub(&self) -> &Arc<LoopbackHub> {
        &self.hub
    }
}

#[async_trait]
impl GroupComm for LoopbackGcs {
    async fn open(&self, channel: &str) -> Result<(), GcsError> {
        let mut inner = self.hub.inner.lock();
        inner.conf_id += 1;
        inner.members[self.id].open = true;
        debug!("loopback member {} opened channel '{channel}'", self.id);
        Ok(())
    }

    async fn close(&self) -> Result<(), GcsError> {
        let mut inner = self.hub.inner.lock();
        if !inner.members[self.id].open {
            return Err(GcsError::NotConnected);
        }
        inner.members[self.id].open = false;
        Ok(())
    }

    fn flow_paused(&self) -> bool {
        self.hub.paused.load(Ordering::SeqCst)
    }

    async fn broadcast(&self, payload: Bytes) -> Result<(Seqno, Seqno), GcsError> {
        let mut inner = self.hub.inner.lock();
        if !inner.members[self.id].open {
            return Err(GcsError::NotConnected);
        }
        inner.global_seqno += 1;
        let seqno_g = inner.global_seqno;

        // The originator does not receive its own action: its commit path
        // walks the ordering pipeline itself, so the slot is consumed here
        // and the seqno pair handed back.
        let own_seqno_l = {
            let m = &mut inner.members[self.id];
            m.local_seqno += 1;
            m.local_seqno
        };
        let others: Vec<usize> = inner
            .members
            .iter()
            .enumerate()
            .filter(|(id, m)| *id != self.id && m.open)
            .map(|(id, _)| id)
            .collect();
        for id in others {
            LoopbackHub::deliver_to(
                &mut inner,
                id,
                seqno_g,
                ActionPayload::WriteSet(payload.clone()),
            );
        }
        Ok((seqno_g, own_seqno_l))
    }

    async fn recv(&self) -> Result<Action, GcsError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(GcsError::Closed)
    }

    async fn join(&self, seqno: Seqno) -> Result<(), GcsError> {
        debug!("loopback member {} joined at seqno {seqno}", self.id);
        Ok(())
    }

    async fn set_last_applied(&self, seqno: Seqno) -> Result<(), GcsError> {
        let mut inner = self.hub.inner.lock();
        inner.last_applied.insert(self.id, seqno);
        Ok(())
    }

    async fn request_state_transfer(
        &self,
        have_seqno: Seqno,
    ) -> Result<StateTransferReply, GcsError> {
        let mut inner = self.hub.inner.lock();
        if !inner.members[self.id].open {
            return Err(GcsError::NotConnected);
        }

        // The request itself travels in total order, so it consumes one of
        // the requester's local seqnos even when no donor is available.
        let request_seqno_l = {
            let m = &mut inner.members[self.id];
            m.local_seqno += 1;
            m.local_seqno
        };

        let donor = inner
            .members
            .iter()
            .enumerate()
            .find(|(id, m)| *id != self.id && m.open)
            .map(|(id, _)| id);

        match donor {
            Some(donor_id) => {
                let request = Bytes::copy_from_slice(&have_seqno.to_le_bytes());
                LoopbackHub::deliver_to(
                    &mut inner,
                    donor_id,
                    SEQNO_ILL,
                    ActionPayload::StateRequest(request),
                );
                Ok(StateTransferReply::Granted {
                    donor: donor_id as i64,
                    request_seqno_l,
                })
            }
            None => Ok(StateTransferReply::Busy { request_seqno_l }),
        }
    }
}
