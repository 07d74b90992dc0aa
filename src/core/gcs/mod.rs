// src/core/gcs/mod.rs

//! The group-communication port.
//!
//! The transport delivers totally-ordered actions to every node of the
//! cluster and stamps each one with a global seqno (cluster-wide order)
//! and a local seqno (this node's dense delivery order). The engine never
//! sees sockets or membership protocols; it talks to this trait, and the
//! bundled [`loopback`] implementation wires several engines together in
//! one process for tests and embedded hosts.

pub mod loopback;

use crate::core::seqno::Seqno;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GcsError {
    #[error("not connected to a group")]
    NotConnected,

    #[error("group connection closed")]
    Closed,

    #[error("group is busy, try again")]
    Busy,

    #[error("transport failure: {0}")]
    Transport(String),
}

/// A membership view announced by the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    /// Monotonic view id; negative for a non-primary (quorum-less) view.
    pub conf_id: i64,
    /// The global seqno the group agreed on at the view change.
    pub seqno: Seqno,
    pub group_uuid: Uuid,
    /// Number of members in the view.
    pub members: usize,
    /// This node's index within the view.
    pub my_idx: i64,
    /// Whether this node must request a state transfer before it may
    /// apply anything.
    pub state_transfer_required: bool,
}

/// The payload of a delivered action.
#[derive(Debug, Clone)]
pub enum ActionPayload {
    /// An encoded write set.
    WriteSet(Bytes),
    /// All nodes have committed up to the carried global seqno.
    CommitCut(Seqno),
    /// A membership change.
    Configuration(ClusterView),
    /// This node was chosen as a state-transfer donor; the payload is the
    /// joiner's request blob.
    StateRequest(Bytes),
}

/// One totally-ordered delivery.
#[derive(Debug, Clone)]
pub struct Action {
    pub seqno_g: Seqno,
    pub seqno_l: Seqno,
    pub payload: ActionPayload,
}

/// The group's answer to a state-transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransferReply {
    /// A donor was selected. `request_seqno_l` is the local seqno the
    /// request itself consumed on this node; the caller must pass the
    /// ordering monitors over it.
    Granted { donor: i64, request_seqno_l: Seqno },
    /// No donor is available right now; retry. The request may still have
    /// consumed a local seqno.
    Busy { request_seqno_l: Seqno },
}

/// Totally-ordered group communication.
#[async_trait]
pub trait GroupComm: Send + Sync {
    /// Joins the named channel.
    async fn open(&self, channel: &str) -> Result<(), GcsError>;

    /// Leaves the group.
    async fn close(&self) -> Result<(), GcsError>;

    /// Whether the group currently asks this node to pause replication
    /// (flow control).
    fn flow_paused(&self) -> bool;

    /// Broadcasts an encoded write set and waits for the group to order
    /// it. Returns the assigned `(seqno_g, seqno_l)` pair.
    async fn broadcast(&self, payload: Bytes) -> Result<(Seqno, Seqno), GcsError>;

    /// The next totally-ordered action delivered to this node.
    async fn recv(&self) -> Result<Action, GcsError>;

    /// Announces that this node has caught up to `seqno` after a state
    /// transfer.
    async fn join(&self, seqno: Seqno) -> Result<(), GcsError>;

    /// Publishes the highest seqno this node has committed, for
    /// cluster-wide commit-cut computation.
    async fn set_last_applied(&self, seqno: Seqno) -> Result<(), GcsError>;

    /// Asks the group to select a state-transfer donor for this node,
    /// advertising the seqno it already has.
    async fn request_state_transfer(&self, have_seqno: Seqno)
    -> Result<StateTransferReply, GcsError>;
}
