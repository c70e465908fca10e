//! Entity access for orders, order lines and payments.
//!
//! Every function takes a plain `&Connection` so callers can compose several
//! of them inside one `DbState::transaction`. Nothing here enforces domain
//! rules; that is the order service's job.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::models::{Order, OrderItem, Payment, SyncStatus};

const ORDER_COLUMNS: &str = "local_id, server_id, order_number, order_type, table_id, shift_id,
     terminal_id, created_by_staff_id, status, subtotal_ugx, tax_ugx, total_ugx,
     sync_status, is_offline_served, created_at, updated_at";

const ITEM_COLUMNS: &str = "local_id, server_id, order_local_id, order_server_id, product_id,
     product_name, unit_price_ugx, quantity, line_total_ugx, size, modifier, notes,
     sort_order, sync_status, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "local_id, server_id, order_local_id, order_server_id, amount_ugx,
     change_ugx, method, created_by_staff_id, terminal_id, client_request_id, sync_status,
     created_at, updated_at";

/// Parse a TEXT enum column, surfacing bad values as a conversion error.
fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = StoreError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: StoreError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        local_id: row.get(0)?,
        server_id: row.get(1)?,
        order_number: row.get(2)?,
        order_type: enum_col(row, 3)?,
        table_id: row.get(4)?,
        shift_id: row.get(5)?,
        terminal_id: row.get(6)?,
        created_by_staff_id: row.get(7)?,
        status: enum_col(row, 8)?,
        subtotal_ugx: row.get(9)?,
        tax_ugx: row.get(10)?,
        total_ugx: row.get(11)?,
        sync_status: enum_col(row, 12)?,
        is_offline_served: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<OrderItem> {
    Ok(OrderItem {
        local_id: row.get(0)?,
        server_id: row.get(1)?,
        order_local_id: row.get(2)?,
        order_server_id: row.get(3)?,
        product_id: row.get(4)?,
        product_name: row.get(5)?,
        unit_price_ugx: row.get(6)?,
        quantity: row.get(7)?,
        line_total_ugx: row.get(8)?,
        size: row.get(9)?,
        modifier: row.get(10)?,
        notes: row.get(11)?,
        sort_order: row.get(12)?,
        sync_status: enum_col(row, 13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        local_id: row.get(0)?,
        server_id: row.get(1)?,
        order_local_id: row.get(2)?,
        order_server_id: row.get(3)?,
        amount_ugx: row.get(4)?,
        change_ugx: row.get(5)?,
        method: enum_col(row, 6)?,
        created_by_staff_id: row.get(7)?,
        terminal_id: row.get(8)?,
        client_request_id: row.get(9)?,
        sync_status: enum_col(row, 10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn collect<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Insert or fully replace an order row.
pub fn put_order(conn: &Connection, order: &Order) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO orders (
            local_id, server_id, order_number, order_type, table_id, shift_id,
            terminal_id, created_by_staff_id, status, subtotal_ugx, tax_ugx, total_ugx,
            sync_status, is_offline_served, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        ON CONFLICT(local_id) DO UPDATE SET
            server_id = COALESCE(orders.server_id, excluded.server_id),
            order_number = excluded.order_number,
            order_type = excluded.order_type,
            table_id = excluded.table_id,
            status = excluded.status,
            subtotal_ugx = excluded.subtotal_ugx,
            tax_ugx = excluded.tax_ugx,
            total_ugx = excluded.total_ugx,
            sync_status = excluded.sync_status,
            is_offline_served = excluded.is_offline_served,
            updated_at = excluded.updated_at",
        params![
            order.local_id,
            order.server_id,
            order.order_number,
            order.order_type.as_str(),
            order.table_id,
            order.shift_id,
            order.terminal_id,
            order.created_by_staff_id,
            order.status.as_str(),
            order.subtotal_ugx,
            order.tax_ugx,
            order.total_ugx,
            order.sync_status.as_str(),
            order.is_offline_served,
            order.created_at,
            order.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_order(conn: &Connection, local_id: &str) -> Result<Option<Order>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE local_id = ?1"),
            params![local_id],
            order_from_row,
        )
        .optional()?)
}

/// All orders, most recent first.
pub fn list_orders(conn: &Connection) -> Result<Vec<Order>, StoreError> {
    collect(
        conn,
        &format!("SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, rowid DESC"),
        [],
        order_from_row,
    )
}

pub fn find_order_by_server_id(
    conn: &Connection,
    server_id: &str,
) -> Result<Option<Order>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE server_id = ?1"),
            params![server_id],
            order_from_row,
        )
        .optional()?)
}

pub fn orders_by_sync_status(
    conn: &Connection,
    status: SyncStatus,
) -> Result<Vec<Order>, StoreError> {
    collect(
        conn,
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE sync_status = ?1 ORDER BY created_at"),
        params![status.as_str()],
        order_from_row,
    )
}

/// Recompute subtotal/total from the order's lines. Tax stays 0 offline.
pub fn recompute_order_totals(
    conn: &Connection,
    order_local_id: &str,
    now: &str,
) -> Result<i64, StoreError> {
    let subtotal: i64 = conn.query_row(
        "SELECT COALESCE(SUM(line_total_ugx), 0) FROM order_items WHERE order_local_id = ?1",
        params![order_local_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE orders SET subtotal_ugx = ?1, tax_ugx = 0, total_ugx = ?1, updated_at = ?2
         WHERE local_id = ?3",
        params![subtotal, now, order_local_id],
    )?;
    Ok(subtotal)
}

// ---------------------------------------------------------------------------
// Order items
// ---------------------------------------------------------------------------

pub fn put_item(conn: &Connection, item: &OrderItem) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO order_items (
            local_id, server_id, order_local_id, order_server_id, product_id, product_name,
            unit_price_ugx, quantity, line_total_ugx, size, modifier, notes, sort_order,
            sync_status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        ON CONFLICT(local_id) DO UPDATE SET
            server_id = COALESCE(order_items.server_id, excluded.server_id),
            order_server_id = COALESCE(order_items.order_server_id, excluded.order_server_id),
            quantity = excluded.quantity,
            line_total_ugx = excluded.line_total_ugx,
            size = excluded.size,
            modifier = excluded.modifier,
            notes = excluded.notes,
            sort_order = excluded.sort_order,
            sync_status = excluded.sync_status,
            updated_at = excluded.updated_at",
        params![
            item.local_id,
            item.server_id,
            item.order_local_id,
            item.order_server_id,
            item.product_id,
            item.product_name,
            item.unit_price_ugx,
            item.quantity,
            item.line_total_ugx,
            item.size,
            item.modifier,
            item.notes,
            item.sort_order,
            item.sync_status.as_str(),
            item.created_at,
            item.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_item(conn: &Connection, local_id: &str) -> Result<Option<OrderItem>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE local_id = ?1"),
            params![local_id],
            item_from_row,
        )
        .optional()?)
}

/// Lines of one order in display order.
pub fn items_for_order(
    conn: &Connection,
    order_local_id: &str,
) -> Result<Vec<OrderItem>, StoreError> {
    collect(
        conn,
        &format!(
            "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_local_id = ?1
             ORDER BY sort_order, created_at"
        ),
        params![order_local_id],
        item_from_row,
    )
}

pub fn items_by_sync_status(
    conn: &Connection,
    status: SyncStatus,
) -> Result<Vec<OrderItem>, StoreError> {
    collect(
        conn,
        &format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE sync_status = ?1 ORDER BY created_at"),
        params![status.as_str()],
        item_from_row,
    )
}

pub fn next_sort_order(conn: &Connection, order_local_id: &str) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM order_items WHERE order_local_id = ?1",
        params![order_local_id],
        |row| row.get(0),
    )?)
}

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

pub fn put_payment(conn: &Connection, payment: &Payment) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO payments (
            local_id, server_id, order_local_id, order_server_id, amount_ugx, change_ugx,
            method, created_by_staff_id, terminal_id, client_request_id, sync_status,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(local_id) DO UPDATE SET
            server_id = COALESCE(payments.server_id, excluded.server_id),
            order_server_id = COALESCE(payments.order_server_id, excluded.order_server_id),
            sync_status = excluded.sync_status,
            updated_at = excluded.updated_at",
        params![
            payment.local_id,
            payment.server_id,
            payment.order_local_id,
            payment.order_server_id,
            payment.amount_ugx,
            payment.change_ugx,
            payment.method.as_str(),
            payment.created_by_staff_id,
            payment.terminal_id,
            payment.client_request_id,
            payment.sync_status.as_str(),
            payment.created_at,
            payment.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_payment(conn: &Connection, local_id: &str) -> Result<Option<Payment>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE local_id = ?1"),
            params![local_id],
            payment_from_row,
        )
        .optional()?)
}

pub fn payments_for_order(
    conn: &Connection,
    order_local_id: &str,
) -> Result<Vec<Payment>, StoreError> {
    collect(
        conn,
        &format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_local_id = ?1 ORDER BY created_at"
        ),
        params![order_local_id],
        payment_from_row,
    )
}

pub fn payments_by_sync_status(
    conn: &Connection,
    status: SyncStatus,
) -> Result<Vec<Payment>, StoreError> {
    collect(
        conn,
        &format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE sync_status = ?1 ORDER BY created_at"
        ),
        params![status.as_str()],
        payment_from_row,
    )
}

// ---------------------------------------------------------------------------
// Server id bookkeeping (used by the sync engine)
// ---------------------------------------------------------------------------

/// Persisted server id for any local entity, looked up across orders, lines
/// and payments in that order.
pub fn persisted_server_id(conn: &Connection, local_id: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT server_id FROM orders WHERE local_id = ?1 AND server_id IS NOT NULL
             UNION ALL
             SELECT server_id FROM order_items WHERE local_id = ?1 AND server_id IS NOT NULL
             UNION ALL
             SELECT server_id FROM payments WHERE local_id = ?1 AND server_id IS NOT NULL
             LIMIT 1",
            params![local_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Attach the server id to an order and propagate it to the order's lines
/// and payments. A server id that is already set is never overwritten.
pub fn attach_order_server_id(
    conn: &Connection,
    order_local_id: &str,
    server_id: &str,
    now: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE orders SET server_id = COALESCE(server_id, ?1), sync_status = 'synced',
                           updated_at = ?2
         WHERE local_id = ?3",
        params![server_id, now, order_local_id],
    )?;
    conn.execute(
        "UPDATE order_items SET order_server_id = COALESCE(order_server_id, ?1)
         WHERE order_local_id = ?2",
        params![server_id, order_local_id],
    )?;
    conn.execute(
        "UPDATE payments SET order_server_id = COALESCE(order_server_id, ?1)
         WHERE order_local_id = ?2",
        params![server_id, order_local_id],
    )?;
    Ok(())
}

/// Record a successful line sync, attaching its server id when one was
/// returned.
pub fn mark_item_synced(
    conn: &Connection,
    item_local_id: &str,
    server_id: Option<&str>,
    now: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE order_items SET server_id = COALESCE(server_id, ?1), sync_status = 'synced',
                                updated_at = ?2
         WHERE local_id = ?3",
        params![server_id, now, item_local_id],
    )?;
    Ok(())
}

pub fn mark_payment_synced(
    conn: &Connection,
    payment_local_id: &str,
    server_id: Option<&str>,
    now: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE payments SET server_id = COALESCE(server_id, ?1), sync_status = 'synced',
                             updated_at = ?2
         WHERE local_id = ?3",
        params![server_id, now, payment_local_id],
    )?;
    Ok(())
}

/// Flip the entity's `sync_status` without touching its server id.
pub fn set_entity_sync_status(
    conn: &Connection,
    local_id: &str,
    status: SyncStatus,
    now: &str,
) -> Result<(), StoreError> {
    for table in ["orders", "order_items", "payments"] {
        conn.execute(
            &format!(
                "UPDATE {table} SET sync_status = ?1, updated_at = ?2
                 WHERE local_id = ?3 AND sync_status != 'synced'"
            ),
            params![status.as_str(), now, local_id],
        )?;
    }
    Ok(())
}
