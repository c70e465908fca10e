//! Sync engine.
//!
//! Drains the mutation queue against the remote order API. A pass recovers
//! rows stranded by an interrupted run, requeues retryable failures, orders
//! the work by mutation priority, and replays each item once its
//! dependencies have server ids. One item's failure never aborts the pass;
//! only rejected terminal credentials do.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::OrderApi;
use crate::config::SyncConfig;
use crate::db::{self, DbState};
use crate::error::{ApiError, StoreError, SyncError};
use crate::models::{now_timestamp, PaymentMethod, SyncStatus as EntitySyncStatus};
use crate::queue::{
    self, AddItemPayload, CreateOrderPayload, FailureKind, MutationPayload, MutationType,
    PaymentPayload, QueueItem, UpdateItemPayload, UpdateOrderStatusPayload,
};
use crate::store;

/// Capacity of the event channel. Slower subscribers lag and skip events.
const EVENT_CAPACITY: usize = 256;

/// Backoff doubles per retry up to this exponent.
const MAX_BACKOFF_EXPONENT: i64 = 4;

// ---------------------------------------------------------------------------
// Reports, status and events
// ---------------------------------------------------------------------------

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Rows found in `syncing` and put back to `pending`.
    pub recovered: usize,
    /// Transient failures put back to `pending`.
    pub requeued: usize,
    /// Undecodable rows failed as `contract`.
    pub quarantined: usize,
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Left pending because a dependency has no server id yet.
    pub skipped: usize,
    /// Failed because a dependency can no longer be created.
    pub blocked: usize,
}

/// Snapshot for status indicators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_running: bool,
    pub last_sync_at: Option<String>,
    pub pending_count: i64,
    pub failed_count: i64,
    pub conflict_count: i64,
    pub blocked_count: i64,
}

/// A payment whose remote write has been acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedPayment {
    pub payment_local_id: String,
    pub payment_server_id: Option<String>,
    pub order_local_id: String,
    pub method: PaymentMethod,
    pub terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    PassStarted {
        queued: usize,
    },
    ItemSynced {
        queue_id: i64,
        mutation_type: MutationType,
        entity_local_id: String,
        server_id: Option<String>,
    },
    ItemFailed {
        queue_id: i64,
        mutation_type: MutationType,
        entity_local_id: String,
        kind: FailureKind,
        retry_count: i64,
        terminal: bool,
        message: String,
    },
    /// A `409` the operator has to resolve.
    Conflict {
        queue_id: i64,
        order_local_id: String,
        code: String,
        message: String,
    },
    PaymentSynced(SyncedPayment),
    PassFinished(SyncReport),
}

// ---------------------------------------------------------------------------
// Dependency gate
// ---------------------------------------------------------------------------

/// A fully resolved remote call for one queue item.
enum RemoteCall<'a> {
    CreateOrder(&'a CreateOrderPayload),
    AddItem {
        order: String,
        payload: &'a AddItemPayload,
    },
    UpdateItem {
        order: String,
        item: String,
        payload: &'a UpdateItemPayload,
    },
    UpdateOrderStatus {
        order: String,
        payload: &'a UpdateOrderStatusPayload,
    },
    PayCash {
        order: String,
        payload: &'a PaymentPayload,
    },
    PayMomo {
        order: String,
        payload: &'a PaymentPayload,
    },
    PayAirtel {
        order: String,
        payload: &'a PaymentPayload,
    },
}

enum Gate<'a> {
    Ready(RemoteCall<'a>),
    /// This local id has no server id yet, but may get one.
    Waiting(String),
    /// The creator of a dependency is terminally failed.
    Blocked(QueueItem),
    /// An earlier status change for the same order has to land first.
    Behind(i64),
}

/// Local ids that need a server id before `item` can replay: its declared
/// dependencies plus whatever the remote call addresses.
fn required_ids(item: &QueueItem) -> Vec<&str> {
    let mut ids: Vec<&str> = item.dependencies.iter().map(String::as_str).collect();
    let addressed: Vec<&str> = match &item.payload {
        MutationPayload::CreateOrder(_) => Vec::new(),
        MutationPayload::UpdateItem(p) => vec![&p.order_local_id, &p.item_local_id],
        other => vec![other.order_local_id()],
    };
    for id in addressed {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Server id for `local_id`: ids learned earlier in this pass first, then
/// whatever the store has persisted.
pub fn resolve_server_id(
    pass_ids: &HashMap<String, String>,
    conn: &rusqlite::Connection,
    local_id: &str,
) -> Result<Option<String>, StoreError> {
    if let Some(server_id) = pass_ids.get(local_id) {
        return Ok(Some(server_id.clone()));
    }
    store::persisted_server_id(conn, local_id)
}

/// Delay after a failed attempt: `base * 2^min(retry_count, 4)`.
pub fn backoff_delay(base: Duration, retry_count: i64) -> Duration {
    let exponent = retry_count.clamp(0, MAX_BACKOFF_EXPONENT) as u32;
    base.saturating_mul(2u32.pow(exponent))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Clears the run flag when a pass ends, including when its future is
/// dropped mid-flight.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    db: Arc<DbState>,
    api: Arc<dyn OrderApi>,
    config: SyncConfig,
    running: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    online: Notify,
}

impl SyncEngine {
    pub fn new(db: Arc<DbState>, api: Arc<dyn OrderApi>, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            api,
            config,
            running: AtomicBool::new(false),
            events,
            online: Notify::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Wake the background loop now instead of at the next tick.
    pub fn notify_online(&self) {
        self.online.notify_one();
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run one pass. Returns `Ok(None)` when another pass is already active.
    pub async fn run_pass(&self) -> Result<Option<SyncReport>, SyncError> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("Sync pass already running; trigger ignored");
            return Ok(None);
        };

        let max_retries = self.config.max_retries;
        let mut report = SyncReport::default();
        let mut items = self.db.transaction(|tx| -> Result<Vec<QueueItem>, StoreError> {
            report.recovered = queue::reset_stranded_syncing(tx)?;
            report.requeued = queue::requeue_retryable_failed(tx, max_retries)?;
            report.quarantined = queue::quarantine_malformed(tx)?;
            queue::list_pending(tx)
        })?;
        items.sort_by(|a, b| {
            (a.mutation_type.priority(), &a.created_at, a.id).cmp(&(
                b.mutation_type.priority(),
                &b.created_at,
                b.id,
            ))
        });

        if report.recovered > 0 {
            warn!(recovered = report.recovered, "Recovered mutations stranded in syncing");
        }
        info!(
            queued = items.len(),
            requeued = report.requeued,
            "Sync pass started"
        );
        self.emit(SyncEvent::PassStarted {
            queued: items.len(),
        });

        let mut pass_ids: HashMap<String, String> = HashMap::new();
        for item in &items {
            let gate = {
                let conn = self.db.lock()?;
                self.gate(&conn, &pass_ids, item)?
            };
            let call = match gate {
                Gate::Ready(call) => call,
                Gate::Waiting(local_id) => {
                    debug!(queue_id = item.id, waiting_on = %local_id, "Dependency unresolved; skipping");
                    report.skipped += 1;
                    continue;
                }
                Gate::Blocked(blocker) => {
                    self.record_blocked(item, &blocker)?;
                    report.blocked += 1;
                    continue;
                }
                Gate::Behind(earlier) => {
                    debug!(queue_id = item.id, behind = earlier, "Earlier status change unsynced; skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            let now = now_timestamp();
            let claimed = self.db.transaction(|tx| -> Result<bool, StoreError> {
                if !queue::mark_syncing(tx, item.id)? {
                    return Ok(false);
                }
                store::set_entity_sync_status(
                    tx,
                    item.entity_local_id(),
                    EntitySyncStatus::Syncing,
                    &now,
                )?;
                Ok(true)
            })?;
            if !claimed {
                debug!(queue_id = item.id, "Mutation left pending before replay; skipping");
                report.skipped += 1;
                continue;
            }
            report.attempted += 1;

            match self.replay(item, call).await {
                Ok(server_id) => {
                    self.record_success(item, server_id.as_deref())?;
                    if let Some(server_id) =
                        server_id.filter(|_| item.mutation_type.creates_entity())
                    {
                        pass_ids.insert(item.entity_local_id().to_string(), server_id);
                    }
                    report.synced += 1;
                }
                Err(ApiError::Unauthorized { status }) => {
                    let now = now_timestamp();
                    self.db.transaction(|tx| -> Result<(), StoreError> {
                        queue::reset_to_pending(tx, item.id)?;
                        store::set_entity_sync_status(
                            tx,
                            item.entity_local_id(),
                            EntitySyncStatus::Pending,
                            &now,
                        )?;
                        db::refresh_sync_metadata(tx, report.synced > 0)?;
                        Ok(())
                    })?;
                    error!(status, queue_id = item.id, "Terminal credentials rejected; aborting sync pass");
                    return Err(SyncError::Unauthorized(status));
                }
                Err(err) => {
                    let retry_count = self.record_failure(item, &err)?;
                    report.failed += 1;
                    let delay = backoff_delay(self.config.backoff_base, retry_count);
                    if !delay.is_zero() {
                        debug!(queue_id = item.id, delay_ms = delay.as_millis() as u64, "Backing off");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let metadata = {
            let conn = self.db.lock()?;
            db::refresh_sync_metadata(&conn, report.synced > 0)?
        };
        info!(
            synced = report.synced,
            failed = report.failed,
            skipped = report.skipped,
            blocked = report.blocked,
            pending = metadata.pending_count,
            "Sync pass finished"
        );
        self.emit(SyncEvent::PassFinished(report.clone()));
        Ok(Some(report))
    }

    fn gate<'a>(
        &self,
        conn: &rusqlite::Connection,
        pass_ids: &HashMap<String, String>,
        item: &'a QueueItem,
    ) -> Result<Gate<'a>, StoreError> {
        let mut resolved: HashMap<&str, String> = HashMap::new();
        for local_id in required_ids(item) {
            match resolve_server_id(pass_ids, conn, local_id)? {
                Some(server_id) => {
                    resolved.insert(local_id, server_id);
                }
                None => {
                    return Ok(
                        match queue::terminal_creator(conn, local_id, self.config.max_retries)? {
                            Some(blocker) => Gate::Blocked(blocker),
                            None => Gate::Waiting(local_id.to_string()),
                        },
                    );
                }
            }
        }

        if let MutationPayload::UpdateOrderStatus(p) = &item.payload {
            if let Some(earlier) = queue::earlier_status_change(
                conn,
                &p.order_local_id,
                item.id,
                self.config.max_retries,
            )? {
                return Ok(Gate::Behind(earlier.id));
            }
        }

        let mut take = |local_id: &str| resolved.remove(local_id);
        let order = take(item.payload.order_local_id());
        let call = match (&item.payload, order) {
            (MutationPayload::CreateOrder(p), _) => RemoteCall::CreateOrder(p),
            (MutationPayload::AddItem(p), Some(order)) => RemoteCall::AddItem { order, payload: p },
            (MutationPayload::UpdateItem(p), Some(order)) => match take(&p.item_local_id) {
                Some(line) => RemoteCall::UpdateItem {
                    order,
                    item: line,
                    payload: p,
                },
                None => return Ok(Gate::Waiting(p.item_local_id.clone())),
            },
            (MutationPayload::UpdateOrderStatus(p), Some(order)) => {
                RemoteCall::UpdateOrderStatus { order, payload: p }
            }
            (MutationPayload::PayCash(p), Some(order)) => RemoteCall::PayCash { order, payload: p },
            (MutationPayload::PayMomo(p), Some(order)) => RemoteCall::PayMomo { order, payload: p },
            (MutationPayload::PayAirtel(p), Some(order)) => {
                RemoteCall::PayAirtel { order, payload: p }
            }
            (other, None) => return Ok(Gate::Waiting(other.order_local_id().to_string())),
        };
        Ok(Gate::Ready(call))
    }

    /// Perform the remote call. Creation calls return the new server id.
    async fn replay(
        &self,
        item: &QueueItem,
        call: RemoteCall<'_>,
    ) -> Result<Option<String>, ApiError> {
        let request_id = item.client_request_id.as_str();
        debug!(queue_id = item.id, mutation_type = %item.mutation_type, "Replaying mutation");
        match call {
            RemoteCall::CreateOrder(p) => self.api.create_order(request_id, p).await.map(Some),
            RemoteCall::AddItem { order, payload } => self
                .api
                .add_item(&order, request_id, payload)
                .await
                .map(Some),
            RemoteCall::UpdateItem {
                order,
                item: line,
                payload,
            } => self
                .api
                .update_item(&order, &line, request_id, payload)
                .await
                .map(|_| None),
            RemoteCall::UpdateOrderStatus { order, payload } => self
                .api
                .update_order_status(&order, request_id, payload)
                .await
                .map(|_| None),
            RemoteCall::PayCash { order, payload } => self
                .api
                .pay_cash(&order, request_id, payload)
                .await
                .map(Some),
            RemoteCall::PayMomo { order, payload } => self
                .api
                .pay_momo(&order, request_id, payload)
                .await
                .map(Some),
            RemoteCall::PayAirtel { order, payload } => self
                .api
                .pay_airtel(&order, request_id, payload)
                .await
                .map(Some),
        }
    }

    fn record_success(&self, item: &QueueItem, server_id: Option<&str>) -> Result<(), StoreError> {
        let now = now_timestamp();
        self.db.transaction(|tx| -> Result<(), StoreError> {
            match &item.payload {
                MutationPayload::CreateOrder(p) => {
                    if let Some(server_id) = server_id {
                        store::attach_order_server_id(tx, &p.order_local_id, server_id, &now)?;
                    }
                }
                MutationPayload::AddItem(p) => {
                    store::mark_item_synced(tx, &p.item_local_id, server_id, &now)?
                }
                MutationPayload::UpdateItem(p) => {
                    store::mark_item_synced(tx, &p.item_local_id, None, &now)?
                }
                MutationPayload::UpdateOrderStatus(_) => {}
                MutationPayload::PayCash(p)
                | MutationPayload::PayMomo(p)
                | MutationPayload::PayAirtel(p) => {
                    store::mark_payment_synced(tx, &p.payment_local_id, server_id, &now)?
                }
            }
            queue::mark_synced(tx, item.id)
        })?;

        info!(
            queue_id = item.id,
            mutation_type = %item.mutation_type,
            entity_id = %item.entity_local_id(),
            server_id = server_id.unwrap_or("-"),
            "Mutation synced"
        );
        self.emit(SyncEvent::ItemSynced {
            queue_id: item.id,
            mutation_type: item.mutation_type,
            entity_local_id: item.entity_local_id().to_string(),
            server_id: server_id.map(String::from),
        });

        if let MutationPayload::PayCash(p)
        | MutationPayload::PayMomo(p)
        | MutationPayload::PayAirtel(p) = &item.payload
        {
            self.emit(SyncEvent::PaymentSynced(SyncedPayment {
                payment_local_id: p.payment_local_id.clone(),
                payment_server_id: server_id.map(String::from),
                order_local_id: p.order_local_id.clone(),
                method: p.method,
                terminal_id: p.terminal_id.clone(),
            }));
        }
        Ok(())
    }

    /// Record a failed attempt; returns the item's retry count afterwards.
    fn record_failure(&self, item: &QueueItem, err: &ApiError) -> Result<i64, StoreError> {
        let kind = err.kind();
        let message = err.to_string();
        let max_retries = self.config.max_retries;
        let now = now_timestamp();

        let (retry_count, terminal) = self.db.transaction(|tx| -> Result<_, StoreError> {
            let retry_count =
                queue::mark_failed(tx, item.id, kind, err.conflict_code(), &message)?;
            let terminal = kind != FailureKind::Transient || retry_count >= max_retries;
            let status = if terminal {
                EntitySyncStatus::Failed
            } else {
                EntitySyncStatus::Pending
            };
            store::set_entity_sync_status(tx, item.entity_local_id(), status, &now)?;
            Ok((retry_count, terminal))
        })?;

        match (kind, terminal) {
            (FailureKind::Conflict, _) => {
                warn!(
                    queue_id = item.id,
                    order_id = %item.payload.order_local_id(),
                    code = err.conflict_code().unwrap_or("-"),
                    error = %message,
                    "Mutation conflicted; operator action required"
                );
                self.emit(SyncEvent::Conflict {
                    queue_id: item.id,
                    order_local_id: item.payload.order_local_id().to_string(),
                    code: err.conflict_code().unwrap_or_default().to_string(),
                    message: message.clone(),
                });
            }
            (_, true) => error!(
                queue_id = item.id,
                kind = %kind,
                attempt = retry_count,
                error = %message,
                "Mutation failed permanently"
            ),
            (_, false) => warn!(
                queue_id = item.id,
                attempt = retry_count,
                max_retries,
                error = %message,
                "Mutation failed; will retry"
            ),
        }

        self.emit(SyncEvent::ItemFailed {
            queue_id: item.id,
            mutation_type: item.mutation_type,
            entity_local_id: item.entity_local_id().to_string(),
            kind,
            retry_count,
            terminal,
            message,
        });
        Ok(retry_count)
    }

    fn record_blocked(&self, item: &QueueItem, blocker: &QueueItem) -> Result<(), StoreError> {
        let reason = blocker.error_message.as_deref().unwrap_or("failed");
        let message = format!("blocked by {}: {}", blocker.id, reason);
        let now = now_timestamp();

        let retry_count = self.db.transaction(|tx| -> Result<i64, StoreError> {
            let retry_count = queue::mark_failed(tx, item.id, FailureKind::Blocked, None, &message)?;
            if item.mutation_type.creates_entity() {
                store::set_entity_sync_status(
                    tx,
                    item.entity_local_id(),
                    EntitySyncStatus::Failed,
                    &now,
                )?;
            }
            Ok(retry_count)
        })?;

        warn!(queue_id = item.id, blocker_id = blocker.id, "Mutation blocked by failed dependency");
        self.emit(SyncEvent::ItemFailed {
            queue_id: item.id,
            mutation_type: item.mutation_type,
            entity_local_id: item.entity_local_id().to_string(),
            kind: FailureKind::Blocked,
            retry_count,
            terminal: true,
            message,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operator actions and queries
    // -----------------------------------------------------------------------

    /// Counters for status indicators, recomputed from the queue.
    pub fn status(&self) -> Result<SyncStatus, StoreError> {
        let conn = self.db.lock()?;
        let metadata = db::refresh_sync_metadata(&conn, false)?;
        Ok(SyncStatus {
            is_running: self.is_running(),
            last_sync_at: metadata.last_sync_at,
            pending_count: metadata.pending_count,
            failed_count: metadata.failed_count,
            conflict_count: queue::count_failed_kind(&conn, FailureKind::Conflict)?,
            blocked_count: queue::count_failed_kind(&conn, FailureKind::Blocked)?,
        })
    }

    /// Every queue row in creation order.
    pub fn list_queue(&self) -> Result<Vec<QueueItem>, StoreError> {
        let conn = self.db.lock()?;
        queue::list_all(&conn)
    }

    /// Give a failed item a fresh retry budget, reviving the items blocked
    /// on it. Abandoned items stay failed. Returns the revived ids.
    pub fn retry_item(&self, queue_id: i64) -> Result<Vec<i64>, StoreError> {
        let revived = self.db.transaction(|tx| -> Result<Vec<i64>, StoreError> {
            let Some(item) = queue::get(tx, queue_id)? else {
                return Ok(Vec::new());
            };
            if item.failure_kind == Some(FailureKind::Abandoned) {
                return Ok(Vec::new());
            }
            let revived = queue::revive(tx, queue_id)?;
            reset_revived_entities(tx, &revived)?;
            db::refresh_sync_metadata(tx, false)?;
            Ok(revived)
        })?;
        info!(queue_id, revived = revived.len(), "Manual retry requested");
        Ok(revived)
    }

    /// Revive every terminally failed item except abandoned ones.
    pub fn retry_all_failed(&self) -> Result<Vec<i64>, StoreError> {
        let max_retries = self.config.max_retries;
        let revived = self.db.transaction(|tx| -> Result<Vec<i64>, StoreError> {
            let mut revived = Vec::new();
            for item in queue::list_failed(tx)? {
                if revived.contains(&item.id)
                    || item.failure_kind == Some(FailureKind::Abandoned)
                    || !item.is_terminal(max_retries)
                {
                    continue;
                }
                revived.extend(queue::revive(tx, item.id)?);
            }
            reset_revived_entities(tx, &revived)?;
            db::refresh_sync_metadata(tx, false)?;
            Ok(revived)
        })?;
        info!(revived = revived.len(), "Retrying all failed mutations");
        Ok(revived)
    }
}

fn reset_revived_entities(conn: &rusqlite::Connection, ids: &[i64]) -> Result<(), StoreError> {
    let now = now_timestamp();
    for id in ids {
        if let Some(item) = queue::get(conn, *id)? {
            store::set_entity_sync_status(
                conn,
                item.entity_local_id(),
                EntitySyncStatus::Pending,
                &now,
            )?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Start the background sync loop. Runs a pass on every interval tick and
/// on every [`SyncEngine::notify_online`], skipping ticks while the health
/// probe fails. Stops when `cancel` fires or the terminal's credentials are
/// rejected.
pub fn start_sync_loop(engine: Arc<SyncEngine>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = engine.config.sync_interval.max(Duration::from_secs(1));
        info!(interval_secs = period.as_secs(), "Sync loop started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous_online: Option<bool> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = engine.online.notified() => debug!("Online notification received"),
            }

            let online = tokio::select! {
                _ = cancel.cancelled() => break,
                online = engine.api.health() => online,
            };
            if !online {
                if previous_online != Some(false) {
                    info!("Order API unreachable; deferring sync and keeping queue pending");
                }
                previous_online = Some(false);
                continue;
            }
            if previous_online == Some(false) {
                info!("Order API reachable again; resuming queued sync");
            }
            previous_online = Some(true);

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = engine.run_pass() => match result {
                    Ok(Some(report)) if report.synced > 0 => {
                        info!(synced = report.synced, "Sync cycle complete");
                    }
                    Ok(_) => {}
                    Err(SyncError::Unauthorized(status)) => {
                        error!(status, "Sync loop stopped; terminal is no longer authorized");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Sync cycle failed"),
                },
            }
        }
        info!("Sync loop stopped");
    })
}
