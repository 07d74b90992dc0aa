// src/core/engine/mod.rs

//! The replication engine handle.
//!
//! One [`ReplicationEngine`] is built per node and threaded through every
//! host call; it owns the two ordering monitors, the applier pool, and the
//! commit mutex that serializes local-transaction state transitions. The
//! host-facing surface is split by concern: the local replication path in
//! [`commit`], remote write-set processing in [`apply`], the receive loop
//! in [`recv`], and membership handling in [`membership`].

mod apply;
mod commit;
mod membership;
mod recv;

pub use membership::ConfigurationOutcome;

use crate::config::EngineConfig;
use crate::core::applier::ApplierPool;
use crate::core::errors::SyncraError;
use crate::core::gcs::GroupComm;
use crate::core::handler::ApplyHandler;
use crate::core::ordering::{OrderingError, TotalOrder};
use crate::core::seqno::{SEQNO_FIRST, SEQNO_NIL, Seqno};
use crate::core::writeset::{RowAction, RowKey};
use crate::core::wsdb::{ConnId, StoreConflictCheck, StoreError, TrxId, WriteSetStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Engine lifecycle. A freshly built handle is `Initialized`; only an
/// `Enabled` engine replicates — every host call on a non-enabled engine
/// is a benign no-op, so a host can keep a single code path while
/// replication is switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ReplState {
    Uninitialized,
    Initialized,
    Enabled,
    Disabled,
}

pub struct ReplicationEngine {
    pub(crate) config: EngineConfig,
    pub(crate) gcs: Arc<dyn GroupComm>,
    pub(crate) store: Arc<dyn WriteSetStore>,
    pub(crate) handler: Arc<dyn ApplyHandler>,

    pub(crate) to_queue: TotalOrder,
    pub(crate) commit_queue: TotalOrder,
    pub(crate) appliers: ApplierPool,

    /// Serializes local-transaction state transitions. Held briefly and
    /// never across a group-communication call or an ordering-monitor
    /// grab.
    pub(crate) commit_mtx: tokio::sync::Mutex<()>,

    repl_state: Mutex<ReplState>,

    /// Highest global seqno observed in the total-order path. Advanced
    /// only while the total-order queue is held for the corresponding
    /// local seqno.
    my_seqno: AtomicI64,
    my_uuid: Mutex<Uuid>,
    my_idx: AtomicI64,

    /// Commits since the last last-applied report.
    report_counter: AtomicU64,
    /// Seqno of the last certification-history purge.
    last_purged: Mutex<Seqno>,

    /// Signalled whenever a local transaction leaves `Replicating`, so
    /// `cancel_commit` can wait for a valid seqno without busy-spinning.
    pub(crate) trx_replicated: Notify,
}

impl ReplicationEngine {
    /// Builds an engine over the given transport, store, and host
    /// handlers.
    pub fn new(
        config: EngineConfig,
        gcs: Arc<dyn GroupComm>,
        store: Arc<dyn WriteSetStore>,
        handler: Arc<dyn ApplyHandler>,
    ) -> Result<Arc<Self>, SyncraError> {
        config.validate()?;

        let appliers = ApplierPool::new(
            config.applier_pool_size,
            Arc::new(StoreConflictCheck(Arc::clone(&store))),
        );
        let to_queue = TotalOrder::new("to_queue", config.ordering_window, SEQNO_FIRST);
        let commit_queue = TotalOrder::new("commit_queue", config.ordering_window, SEQNO_FIRST);

        Ok(Arc::new(Self {
            config,
            gcs,
            store,
            handler,
            to_queue,
            commit_queue,
            appliers,
            commit_mtx: tokio::sync::Mutex::new(()),
            repl_state: Mutex::new(ReplState::Initialized),
            my_seqno: AtomicI64::new(SEQNO_NIL),
            my_uuid: Mutex::new(Uuid::nil()),
            my_idx: AtomicI64::new(0),
            report_counter: AtomicU64::new(0),
            last_purged: Mutex::new(SEQNO_NIL),
            trx_replicated: Notify::new(),
        }))
    }

    /// Opens the group connection and starts replicating.
    pub async fn enable(&self) -> Result<(), SyncraError> {
        if *self.repl_state.lock() == ReplState::Enabled {
            return Err(SyncraError::NodeFailed(
                "engine is already enabled".into(),
            ));
        }
        self.gcs
            .open(&self.config.group)
            .await
            .map_err(|e| SyncraError::NodeFailed(format!("failed to open group connection: {e}")))?;
        info!(
            "successfully opened group connection to {}",
            self.config.group
        );
        *self.repl_state.lock() = ReplState::Enabled;
        Ok(())
    }

    /// Closes the group connection and stops replicating.
    pub async fn disable(&self) -> Result<(), SyncraError> {
        if *self.repl_state.lock() != ReplState::Enabled {
            return Err(SyncraError::NodeFailed("engine is not enabled".into()));
        }
        self.gcs
            .close()
            .await
            .map_err(|e| SyncraError::NodeFailed(format!("failed to close group connection: {e}")))?;
        info!("closed group connection");
        *self.repl_state.lock() = ReplState::Disabled;
        Ok(())
    }

    /// Shuts the engine down, closing the group connection if it is still
    /// open. The handle is unusable afterwards.
    pub async fn tear_down(&self) {
        if self.enabled() {
            let _ = self.gcs.close().await;
        }
        *self.repl_state.lock() = ReplState::Uninitialized;
    }

    pub fn repl_state(&self) -> ReplState {
        *self.repl_state.lock()
    }

    pub(crate) fn enabled(&self) -> bool {
        self.repl_state() == ReplState::Enabled
    }

    /// Highest global seqno this node has seen in total order.
    pub fn global_seqno(&self) -> Seqno {
        self.my_seqno.load(Ordering::SeqCst)
    }

    /// This node's index in the current membership view.
    pub fn node_index(&self) -> i64 {
        self.my_idx.load(Ordering::SeqCst)
    }

    /// Identity of the group this node last joined.
    pub fn group_uuid(&self) -> Uuid {
        *self.my_uuid.lock()
    }

    /// Current admission positions of the total-order and commit monitors,
    /// for monitoring and tests.
    pub fn pipeline_positions(&self) -> (Seqno, Seqno) {
        (self.to_queue.current(), self.commit_queue.current())
    }

    // --- Write-set builder surface (delegated to the store) ---

    pub fn append_query(
        &self,
        trx: TrxId,
        sql: &str,
        timestamp: i64,
        randseed: u32,
    ) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }
        self.store
            .append_query(trx, sql, timestamp, randseed)
            .map_err(Self::map_store_error)
    }

    pub fn append_row(&self, trx: TrxId, data: &[u8]) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }
        self.store.append_row(trx, data).map_err(Self::map_store_error)
    }

    pub fn append_row_key(
        &self,
        trx: TrxId,
        dbtable: &str,
        key: &[u8],
        action: RowAction,
    ) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }
        self.store
            .append_row_key(
                trx,
                RowKey {
                    dbtable: dbtable.to_string(),
                    key: key.to_vec(),
                    action,
                },
            )
            .map_err(Self::map_store_error)
    }

    pub fn set_variable(&self, conn: ConnId, key: &str, query: &str) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }
        self.store
            .set_variable(conn, key, query)
            .map_err(Self::map_store_error)
    }

    pub fn set_database(&self, conn: ConnId, query: &str) -> Result<(), SyncraError> {
        if !self.enabled() {
            return Ok(());
        }
        self.store
            .set_database(conn, query)
            .map_err(Self::map_store_error)
    }

    fn map_store_error(e: StoreError) -> SyncraError {
        match e {
            StoreError::UnknownTransaction(_) => SyncraError::TransactionFailed,
            StoreError::UnknownConnection(_) => SyncraError::ConnectionFailed(e.to_string()),
        }
    }

    // --- Shared pipeline machinery ---

    /// Records the action's global seqno if it advances the node. Returns
    /// `true` if the write set is to be applied, `false` if it is outdated
    /// and must be skipped. Call only while the total-order queue is held
    /// for the corresponding local seqno.
    pub(crate) fn update_global_seqno(&self, seqno_g: Seqno) -> bool {
        // Cancelled write sets leave holes in the global seqno stream, so
        // no density check is possible here.
        let current = self.my_seqno.load(Ordering::SeqCst);
        if current < seqno_g {
            self.my_seqno.store(seqno_g, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Forces the node's global seqno after a completed state transfer:
    /// everything at or below it must be skipped from now on.
    pub(crate) fn set_global_seqno(&self, seqno: Seqno) {
        self.my_seqno.store(seqno, Ordering::SeqCst);
    }

    pub(crate) fn set_node_index(&self, idx: i64) {
        self.my_idx.store(idx, Ordering::SeqCst);
    }

    pub(crate) fn adopt_group_uuid(&self, uuid: Uuid) {
        *self.my_uuid.lock() = uuid;
    }

    /// Grabs an ordering-monitor position where failure of any kind means
    /// the pipeline is broken beyond repair.
    pub(crate) async fn grab_or_abort(&self, queue: &TotalOrder, seqno: Seqno) {
        if let Err(e) = queue.grab(seqno).await {
            self.ordering_abort(queue, "grab", seqno, e);
        }
    }

    pub(crate) fn release_or_abort(&self, queue: &TotalOrder, seqno: Seqno) {
        if let Err(e) = queue.release(seqno) {
            self.ordering_abort(queue, "release", seqno, e);
        }
    }

    pub(crate) async fn self_cancel_or_abort(&self, queue: &TotalOrder, seqno: Seqno) {
        if let Err(e) = queue.self_cancel(seqno).await {
            self.ordering_abort(queue, "self-cancel", seqno, e);
        }
    }

    /// The ordering invariants cannot be repaired by logic: terminate.
    fn ordering_abort(
        &self,
        queue: &TotalOrder,
        op: &str,
        seqno: Seqno,
        err: OrderingError,
    ) -> ! {
        error!("failed to {op} {} at {seqno}: {err}", queue.name());
        std::process::abort();
    }

    // --- Last-applied reporting and history truncation ---

    /// Fast counter check run inside commit-queue critical sections.
    pub(crate) fn report_check_counter(&self) -> bool {
        let count = self.report_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.config.report_interval {
            self.report_counter.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Publishes the store's safe-to-discard seqno to the group. Run after
    /// the commit queue has been released.
    pub(crate) async fn report_last_committed(&self) {
        let seqno = self.store.safe_to_discard_seqno();
        info!("reporting last committed: {seqno}");
        if let Err(e) = self.gcs.set_last_applied(seqno).await {
            warn!("failed to report last committed {seqno}: {e}");
            // Re-prime the counter so the next commit retries the report.
            self.report_counter
                .store(self.config.report_interval, Ordering::Relaxed);
        }
    }

    /// Purges certification history up to `seqno`, rate-limited so a busy
    /// cluster does not hammer the store on every commit cut.
    pub(crate) fn truncate_trx_history(&self, seqno: Seqno) {
        let mut last = self.last_purged.lock();
        if *last + (self.config.purge_interval as Seqno) < seqno {
            tracing::debug!("purging history up to {seqno}");
            self.store.purge_upto(seqno);
            *last = seqno;
        }
    }
}
