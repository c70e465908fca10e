//! Durable mutation queue.
//!
//! Each row is one intended remote write. Rows are appended by the order
//! service in the same transaction as the local write they describe, and
//! drained by the sync engine. Rows are never deleted; a retry replays the
//! same row with the same `client_request_id`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::{now_timestamp, text_enum, OrderStatus, OrderType, PaymentMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationType {
    CreateOrder,
    AddItem,
    UpdateItem,
    UpdateOrderStatus,
    PayCash,
    PayMomo,
    PayAirtel,
}

text_enum!(MutationType {
    CreateOrder => "createOrder",
    AddItem => "addItem",
    UpdateItem => "updateItem",
    UpdateOrderStatus => "updateOrderStatus",
    PayCash => "payCash",
    PayMomo => "payMomo",
    PayAirtel => "payAirtel",
});

impl MutationType {
    /// Replay rank within a pass: order creation, then lines, then status
    /// changes, then payments.
    pub fn priority(&self) -> u8 {
        match self {
            MutationType::CreateOrder => 0,
            MutationType::AddItem | MutationType::UpdateItem => 1,
            MutationType::UpdateOrderStatus => 2,
            MutationType::PayCash | MutationType::PayMomo | MutationType::PayAirtel => 3,
        }
    }

    /// Whether a successful replay yields a server id for `entity_local_id`.
    pub fn creates_entity(&self) -> bool {
        matches!(
            self,
            MutationType::CreateOrder
                | MutationType::AddItem
                | MutationType::PayCash
                | MutationType::PayMomo
                | MutationType::PayAirtel
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Failed,
    Synced,
}

text_enum!(QueueStatus {
    Pending => "pending",
    Syncing => "syncing",
    Failed => "failed",
    Synced => "synced",
});

/// Why a queue item is in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network or 5xx; retried with backoff until `max_retries`.
    Transient,
    /// 409 with a semantic code; needs operator action.
    Conflict,
    /// Any other 4xx; the server will never accept this payload.
    Rejected,
    /// Malformed row or response; fails fast.
    Contract,
    /// A dependency can no longer be created.
    Blocked,
    /// The operator gave up on the order.
    Abandoned,
}

text_enum!(FailureKind {
    Transient => "transient",
    Conflict => "conflict",
    Rejected => "rejected",
    Contract => "contract",
    Blocked => "blocked",
    Abandoned => "abandoned",
});

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderPayload {
    pub order_local_id: String,
    pub order_number: String,
    pub order_type: OrderType,
    pub table_id: Option<String>,
    pub shift_id: String,
    pub terminal_id: String,
    pub created_by_staff_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddItemPayload {
    pub item_local_id: String,
    pub order_local_id: String,
    pub product_id: String,
    pub product_name: String,
    pub unit_price_ugx: i64,
    pub quantity: i64,
    pub line_total_ugx: i64,
    pub size: Option<String>,
    pub modifier: Option<String>,
    pub notes: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItemPayload {
    pub item_local_id: String,
    pub order_local_id: String,
    pub quantity: i64,
    pub line_total_ugx: i64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderStatusPayload {
    pub order_local_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub payment_local_id: String,
    pub order_local_id: String,
    pub amount_ugx: i64,
    pub change_ugx: Option<i64>,
    pub method: PaymentMethod,
    pub created_by_staff_id: String,
    pub terminal_id: String,
}

/// One variant per mutation kind; the variant is the queue row's type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum MutationPayload {
    CreateOrder(CreateOrderPayload),
    AddItem(AddItemPayload),
    UpdateItem(UpdateItemPayload),
    UpdateOrderStatus(UpdateOrderStatusPayload),
    PayCash(PaymentPayload),
    PayMomo(PaymentPayload),
    PayAirtel(PaymentPayload),
}

impl MutationPayload {
    pub fn mutation_type(&self) -> MutationType {
        match self {
            MutationPayload::CreateOrder(_) => MutationType::CreateOrder,
            MutationPayload::AddItem(_) => MutationType::AddItem,
            MutationPayload::UpdateItem(_) => MutationType::UpdateItem,
            MutationPayload::UpdateOrderStatus(_) => MutationType::UpdateOrderStatus,
            MutationPayload::PayCash(_) => MutationType::PayCash,
            MutationPayload::PayMomo(_) => MutationType::PayMomo,
            MutationPayload::PayAirtel(_) => MutationType::PayAirtel,
        }
    }

    /// The local entity this mutation writes.
    pub fn entity_local_id(&self) -> &str {
        match self {
            MutationPayload::CreateOrder(p) => &p.order_local_id,
            MutationPayload::AddItem(p) => &p.item_local_id,
            MutationPayload::UpdateItem(p) => &p.item_local_id,
            MutationPayload::UpdateOrderStatus(p) => &p.order_local_id,
            MutationPayload::PayCash(p)
            | MutationPayload::PayMomo(p)
            | MutationPayload::PayAirtel(p) => &p.payment_local_id,
        }
    }

    pub fn order_local_id(&self) -> &str {
        match self {
            MutationPayload::CreateOrder(p) => &p.order_local_id,
            MutationPayload::AddItem(p) => &p.order_local_id,
            MutationPayload::UpdateItem(p) => &p.order_local_id,
            MutationPayload::UpdateOrderStatus(p) => &p.order_local_id,
            MutationPayload::PayCash(p)
            | MutationPayload::PayMomo(p)
            | MutationPayload::PayAirtel(p) => &p.order_local_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: i64,
    pub mutation_type: MutationType,
    pub payload: MutationPayload,
    pub client_request_id: String,
    pub dependencies: Vec<String>,
    pub retry_count: i64,
    pub status: QueueStatus,
    pub failure_kind: Option<FailureKind>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub synced_at: Option<String>,
}

impl QueueItem {
    pub fn entity_local_id(&self) -> &str {
        self.payload.entity_local_id()
    }

    /// Failed and not eligible for automatic reselection.
    pub fn is_terminal(&self, max_retries: i64) -> bool {
        if self.status != QueueStatus::Failed {
            return false;
        }
        match self.failure_kind {
            Some(FailureKind::Transient) | None => self.retry_count >= max_retries,
            Some(_) => true,
        }
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {}", self.id, self.mutation_type, self.entity_local_id())
    }
}

const QUEUE_COLUMNS: &str = "id, mutation_type, payload, client_request_id, dependencies,
     retry_count, status, failure_kind, error_code, error_message, created_at, updated_at,
     synced_at";

fn decode_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let raw_type: String = row.get(1)?;
    let mutation_type = MutationType::from_str(&raw_type).map_err(|e| decode_err(1, e))?;
    let raw_payload: String = row.get(2)?;
    let payload: MutationPayload =
        serde_json::from_str(&raw_payload).map_err(|e| decode_err(2, e))?;
    if payload.mutation_type() != mutation_type {
        return Err(decode_err(
            2,
            StoreError::Corrupt(format!(
                "payload is {} but row type is {}",
                payload.mutation_type(),
                mutation_type
            )),
        ));
    }
    let raw_deps: String = row.get(4)?;
    let dependencies: Vec<String> =
        serde_json::from_str(&raw_deps).map_err(|e| decode_err(4, e))?;
    let status: String = row.get(6)?;
    let failure_kind: Option<String> = row.get(7)?;

    Ok(QueueItem {
        id: row.get(0)?,
        mutation_type,
        payload,
        client_request_id: row.get(3)?,
        dependencies,
        retry_count: row.get(5)?,
        status: QueueStatus::from_str(&status).map_err(|e| decode_err(6, e))?,
        failure_kind: failure_kind
            .as_deref()
            .map(FailureKind::from_str)
            .transpose()
            .map_err(|e| decode_err(7, e))?,
        error_code: row.get(8)?,
        error_message: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        synced_at: row.get(12)?,
    })
}

fn query_items(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<QueueItem>, StoreError> {
    let sql = format!(
        "SELECT {QUEUE_COLUMNS} FROM mutation_queue WHERE {where_clause} ORDER BY created_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, item_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Append a mutation. Must run in the same transaction as the local write.
pub fn enqueue(
    conn: &Connection,
    payload: &MutationPayload,
    dependencies: &[&str],
    client_request_id: &str,
) -> Result<i64, StoreError> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO mutation_queue (
            mutation_type, entity_local_id, order_local_id, payload, client_request_id,
            dependencies, status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
        params![
            payload.mutation_type().as_str(),
            payload.entity_local_id(),
            payload.order_local_id(),
            serde_json::to_string(payload)?,
            client_request_id,
            serde_json::to_string(dependencies)?,
            now,
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(
        queue_id = id,
        mutation_type = %payload.mutation_type(),
        entity_id = %payload.entity_local_id(),
        "Mutation enqueued"
    );
    Ok(id)
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<QueueItem>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {QUEUE_COLUMNS} FROM mutation_queue WHERE id = ?1"),
            params![id],
            item_from_row,
        )
        .optional()?)
}

/// Pending items in stable creation order.
pub fn list_pending(conn: &Connection) -> Result<Vec<QueueItem>, StoreError> {
    query_items(conn, "status = 'pending'", [])
}

pub fn list_syncing_or_pending(conn: &Connection) -> Result<Vec<QueueItem>, StoreError> {
    query_items(conn, "status IN ('pending', 'syncing')", [])
}

pub fn list_failed(conn: &Connection) -> Result<Vec<QueueItem>, StoreError> {
    query_items(conn, "status = 'failed'", [])
}

pub fn list_all(conn: &Connection) -> Result<Vec<QueueItem>, StoreError> {
    query_items(conn, "1 = 1", [])
}

pub fn list_for_order(conn: &Connection, order_local_id: &str) -> Result<Vec<QueueItem>, StoreError> {
    query_items(conn, "order_local_id = ?1", params![order_local_id])
}

/// Claim a pending item for replay. Returns `false` if the row left
/// `pending` in the meantime (abandoned, for instance).
pub fn mark_syncing(conn: &Connection, id: i64) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE mutation_queue SET status = 'syncing', updated_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![now_timestamp(), id],
    )?;
    Ok(changed == 1)
}

pub fn mark_synced(conn: &Connection, id: i64) -> Result<(), StoreError> {
    let now = now_timestamp();
    conn.execute(
        "UPDATE mutation_queue
         SET status = 'synced', failure_kind = NULL, error_code = NULL, error_message = NULL,
             synced_at = ?1, updated_at = ?1
         WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}

/// Record a failed attempt. Only transient failures consume a retry; the
/// new retry count is returned.
pub fn mark_failed(
    conn: &Connection,
    id: i64,
    kind: FailureKind,
    error_code: Option<&str>,
    error_message: &str,
) -> Result<i64, StoreError> {
    let increment = i64::from(kind == FailureKind::Transient);
    conn.execute(
        "UPDATE mutation_queue
         SET status = 'failed', retry_count = retry_count + ?1, failure_kind = ?2,
             error_code = ?3, error_message = ?4, updated_at = ?5
         WHERE id = ?6",
        params![increment, kind.as_str(), error_code, error_message, now_timestamp(), id],
    )?;
    Ok(conn.query_row(
        "SELECT retry_count FROM mutation_queue WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?)
}

pub fn reset_to_pending(conn: &Connection, id: i64) -> Result<(), StoreError> {
    set_status(conn, id, QueueStatus::Pending)
}

fn set_status(conn: &Connection, id: i64, status: QueueStatus) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE mutation_queue SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now_timestamp(), id],
    )?;
    Ok(())
}

/// Crash recovery: items stranded in `syncing` by an interrupted pass go
/// back to `pending`, and so do the entity rows they had marked.
pub fn reset_stranded_syncing(conn: &Connection) -> Result<usize, StoreError> {
    let now = now_timestamp();
    for table in ["orders", "order_items", "payments"] {
        conn.execute(
            &format!(
                "UPDATE {table} SET sync_status = 'pending', updated_at = ?1
                 WHERE sync_status = 'syncing'"
            ),
            params![now],
        )?;
    }
    Ok(conn.execute(
        "UPDATE mutation_queue SET status = 'pending', updated_at = ?1 WHERE status = 'syncing'",
        params![now],
    )?)
}

/// Move transient failures that still have retries left back to `pending`.
pub fn requeue_retryable_failed(conn: &Connection, max_retries: i64) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "UPDATE mutation_queue SET status = 'pending', updated_at = ?1
         WHERE status = 'failed'
           AND COALESCE(failure_kind, 'transient') = 'transient'
           AND retry_count < ?2",
        params![now_timestamp(), max_retries],
    )?)
}

/// Fail pending rows whose type or payload cannot be decoded. They would
/// never replay, so they are marked `contract` instead of blocking the pass.
pub fn quarantine_malformed(conn: &Connection) -> Result<usize, StoreError> {
    let mut malformed: Vec<(i64, String)> = Vec::new();
    {
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM mutation_queue WHERE status IN ('pending', 'syncing')"
        ))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            if let Err(e) = item_from_row(row) {
                malformed.push((row.get(0)?, e.to_string()));
            }
        }
    }

    for (id, error) in &malformed {
        warn!(queue_id = id, error = %error, "Malformed mutation quarantined");
        conn.execute(
            "UPDATE mutation_queue
             SET status = 'failed', failure_kind = 'contract', error_message = ?1, updated_at = ?2
             WHERE id = ?3",
            params![format!("malformed mutation: {error}"), now_timestamp(), id],
        )?;
    }
    Ok(malformed.len())
}

/// The mutation that creates `entity_local_id`, if it is terminally failed.
pub fn terminal_creator(
    conn: &Connection,
    entity_local_id: &str,
    max_retries: i64,
) -> Result<Option<QueueItem>, StoreError> {
    let creators = query_items(
        conn,
        "entity_local_id = ?1 AND mutation_type IN
             ('createOrder', 'addItem', 'payCash', 'payMomo', 'payAirtel')",
        params![entity_local_id],
    )?;
    Ok(creators
        .into_iter()
        .find(|item| item.mutation_type.creates_entity() && item.is_terminal(max_retries)))
}

/// The oldest status change for `order_local_id` queued before `before_id`
/// that has not synced and may still replay.
pub fn earlier_status_change(
    conn: &Connection,
    order_local_id: &str,
    before_id: i64,
    max_retries: i64,
) -> Result<Option<QueueItem>, StoreError> {
    let earlier = query_items(
        conn,
        "order_local_id = ?1 AND mutation_type = 'updateOrderStatus'
           AND id < ?2 AND status != 'synced'",
        params![order_local_id, before_id],
    )?;
    Ok(earlier
        .into_iter()
        .find(|item| !item.is_terminal(max_retries)))
}

/// Put a failed item back to `pending` with a fresh retry budget, along with
/// every item transitively blocked on it. Returns the revived ids.
pub fn revive(conn: &Connection, id: i64) -> Result<Vec<i64>, StoreError> {
    let mut revived = Vec::new();
    let mut seen = HashSet::new();
    let mut work = vec![id];

    while let Some(current) = work.pop() {
        if !seen.insert(current) {
            continue;
        }
        let Some(item) = get(conn, current)? else {
            continue;
        };
        if item.status != QueueStatus::Failed {
            continue;
        }
        conn.execute(
            "UPDATE mutation_queue
             SET status = 'pending', retry_count = 0, failure_kind = NULL, error_code = NULL,
                 error_message = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now_timestamp(), current],
        )?;
        revived.push(current);

        if item.mutation_type.creates_entity() {
            let blocked = query_items(conn, "status = 'failed' AND failure_kind = 'blocked'", [])?;
            work.extend(
                blocked
                    .into_iter()
                    .filter(|b| b.dependencies.iter().any(|d| d == item.entity_local_id()))
                    .map(|b| b.id),
            );
        }
    }
    Ok(revived)
}

/// Replace a not-yet-synced item's payload and idempotency key.
pub fn replace_payload(
    conn: &Connection,
    id: i64,
    payload: &MutationPayload,
    client_request_id: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE mutation_queue SET payload = ?1, client_request_id = ?2, updated_at = ?3
         WHERE id = ?4 AND status != 'synced'",
        params![
            serde_json::to_string(payload)?,
            client_request_id,
            now_timestamp(),
            id
        ],
    )?;
    Ok(())
}

/// Number of failed items of the given kind.
pub fn count_failed_kind(conn: &Connection, kind: FailureKind) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM mutation_queue WHERE status = 'failed' AND failure_kind = ?1",
        params![kind.as_str()],
        |row| row.get(0),
    )?)
}
