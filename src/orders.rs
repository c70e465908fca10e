//! Order service: the façade the UI calls.
//!
//! Every operation performs the optimistic local write and appends the
//! matching mutation inside one transaction, then returns. Nothing here
//! touches the network.

use rusqlite::Connection;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::OrderError;
use crate::identity::IdentityProvider;
use crate::models::{
    now_timestamp, ItemOptions, Order, OrderItem, OrderStatus, OrderType, Payment, PaymentMethod,
    ProductSnapshot, SyncStatus,
};
use crate::queue::{
    self, AddItemPayload, CreateOrderPayload, FailureKind, MutationPayload, MutationType,
    PaymentPayload, QueueStatus, UpdateItemPayload, UpdateOrderStatusPayload,
};
use crate::store;

pub struct OrderService {
    db: Arc<DbState>,
    identity: Arc<dyn IdentityProvider>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Next human-facing order number, `ORD-<ddmmyyyy>-<nnnnn>`.
fn next_order_number(conn: &Connection) -> Result<String, OrderError> {
    let date_display = chrono::Local::now().format("%d%m%Y").to_string();
    let current = db::get_setting(conn, "orders", "order_counter")?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let next = current + 1;
    db::set_setting(conn, "orders", "order_counter", &next.to_string())?;
    Ok(format!("ORD-{}-{:05}", date_display, next))
}

fn load_order(conn: &Connection, order_local_id: &str) -> Result<Order, OrderError> {
    store::get_order(conn, order_local_id)?
        .ok_or_else(|| OrderError::OrderNotFound(order_local_id.to_string()))
}

fn line_total(unit_price_ugx: i64, quantity: i64) -> Result<i64, OrderError> {
    unit_price_ugx.checked_mul(quantity).ok_or_else(|| {
        OrderError::InvalidAmount(format!(
            "line total overflows: {unit_price_ugx} x {quantity}"
        ))
    })
}

/// Orders that can still take new or changed lines.
fn ensure_items_editable(order: &Order) -> Result<(), OrderError> {
    if order.is_offline_served {
        return Err(OrderError::OfflineServed(order.local_id.clone()));
    }
    match order.status {
        OrderStatus::Served => Err(OrderError::OrderServed(order.local_id.clone())),
        OrderStatus::Cancelled => Err(OrderError::OrderCancelled(order.local_id.clone())),
        _ => Ok(()),
    }
}

impl OrderService {
    pub fn new(db: Arc<DbState>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { db, identity }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Create an order locally and enqueue its `createOrder` mutation.
    pub fn create_order(
        &self,
        order_type: OrderType,
        table_id: Option<&str>,
    ) -> Result<Order, OrderError> {
        let ctx = self.identity.require()?;
        let table_id = table_id.map(str::trim).filter(|t| !t.is_empty());
        match (order_type, table_id) {
            (OrderType::DineIn, None) => {
                return Err(OrderError::InvalidTable(
                    "dine-in orders need a table".into(),
                ))
            }
            (OrderType::Takeaway, Some(_)) => {
                return Err(OrderError::InvalidTable(
                    "takeaway orders cannot have a table".into(),
                ))
            }
            _ => {}
        }

        let order = self.db.transaction(|tx| {
            let now = now_timestamp();
            let order = Order {
                local_id: new_id(),
                server_id: None,
                order_number: next_order_number(tx)?,
                order_type,
                table_id: table_id.map(String::from),
                shift_id: ctx.shift_id.clone(),
                terminal_id: ctx.terminal_id.clone(),
                created_by_staff_id: ctx.staff_id.clone(),
                status: OrderStatus::Pending,
                subtotal_ugx: 0,
                tax_ugx: 0,
                total_ugx: 0,
                sync_status: SyncStatus::Pending,
                is_offline_served: false,
                created_at: now.clone(),
                updated_at: now,
            };
            store::put_order(tx, &order)?;

            let payload = MutationPayload::CreateOrder(CreateOrderPayload {
                order_local_id: order.local_id.clone(),
                order_number: order.order_number.clone(),
                order_type,
                table_id: order.table_id.clone(),
                shift_id: order.shift_id.clone(),
                terminal_id: order.terminal_id.clone(),
                created_by_staff_id: order.created_by_staff_id.clone(),
            });
            queue::enqueue(tx, &payload, &[], &new_id())?;
            Ok::<_, OrderError>(order)
        })?;

        info!(
            order_id = %order.local_id,
            order_number = %order.order_number,
            order_type = %order.order_type,
            "Order created and queued for sync"
        );
        Ok(order)
    }

    /// Add a line to an order and recompute its totals.
    pub fn add_item(
        &self,
        order_local_id: &str,
        product: &ProductSnapshot,
        quantity: i64,
        options: ItemOptions,
    ) -> Result<OrderItem, OrderError> {
        self.identity.require()?;
        if quantity < 1 {
            return Err(OrderError::InvalidQuantity(quantity));
        }
        if product.unit_price_ugx < 0 {
            return Err(OrderError::InvalidAmount(format!(
                "unit price {} is negative",
                product.unit_price_ugx
            )));
        }

        let line_total_ugx = line_total(product.unit_price_ugx, quantity)?;

        let item = self.db.transaction(|tx| {
            let order = load_order(tx, order_local_id)?;
            ensure_items_editable(&order)?;

            let now = now_timestamp();
            let item = OrderItem {
                local_id: new_id(),
                server_id: None,
                order_local_id: order.local_id.clone(),
                order_server_id: order.server_id.clone(),
                product_id: product.product_id.clone(),
                product_name: product.product_name.clone(),
                unit_price_ugx: product.unit_price_ugx,
                quantity,
                line_total_ugx,
                size: options.size,
                modifier: options.modifier,
                notes: options.notes,
                sort_order: store::next_sort_order(tx, &order.local_id)?,
                sync_status: SyncStatus::Pending,
                created_at: now.clone(),
                updated_at: now.clone(),
            };
            store::put_item(tx, &item)?;
            store::recompute_order_totals(tx, &order.local_id, &now)?;

            let payload = MutationPayload::AddItem(AddItemPayload {
                item_local_id: item.local_id.clone(),
                order_local_id: item.order_local_id.clone(),
                product_id: item.product_id.clone(),
                product_name: item.product_name.clone(),
                unit_price_ugx: item.unit_price_ugx,
                quantity: item.quantity,
                line_total_ugx: item.line_total_ugx,
                size: item.size.clone(),
                modifier: item.modifier.clone(),
                notes: item.notes.clone(),
                sort_order: item.sort_order,
            });
            queue::enqueue(tx, &payload, &[order.local_id.as_str()], &new_id())?;
            Ok::<_, OrderError>(item)
        })?;

        info!(
            order_id = %item.order_local_id,
            item_id = %item.local_id,
            product = %item.product_name,
            quantity = item.quantity,
            "Item added to order"
        );
        Ok(item)
    }

    /// Change the quantity (and optionally notes) of an existing line.
    pub fn update_item_quantity(
        &self,
        item_local_id: &str,
        quantity: i64,
        notes: Option<&str>,
    ) -> Result<OrderItem, OrderError> {
        self.identity.require()?;
        if quantity < 1 {
            return Err(OrderError::InvalidQuantity(quantity));
        }

        self.db.transaction(|tx| {
            let mut item = store::get_item(tx, item_local_id)?
                .ok_or_else(|| OrderError::ItemNotFound(item_local_id.to_string()))?;
            let order = load_order(tx, &item.order_local_id)?;
            ensure_items_editable(&order)?;

            let now = now_timestamp();
            item.quantity = quantity;
            item.line_total_ugx = line_total(item.unit_price_ugx, quantity)?;
            if let Some(notes) = notes {
                item.notes = Some(notes.to_string());
            }
            if item.sync_status == SyncStatus::Synced {
                item.sync_status = SyncStatus::Pending;
            }
            item.updated_at = now.clone();
            store::put_item(tx, &item)?;
            store::recompute_order_totals(tx, &order.local_id, &now)?;

            let payload = MutationPayload::UpdateItem(UpdateItemPayload {
                item_local_id: item.local_id.clone(),
                order_local_id: order.local_id.clone(),
                quantity,
                line_total_ugx: item.line_total_ugx,
                notes: item.notes.clone(),
            });
            let dependencies = [order.local_id.as_str(), item.local_id.as_str()];
            queue::enqueue(tx, &payload, &dependencies, &new_id())?;
            Ok::<_, OrderError>(item)
        })
    }

    /// Persist a kitchen/lifecycle status change.
    pub fn update_status(
        &self,
        order_local_id: &str,
        status: OrderStatus,
    ) -> Result<Order, OrderError> {
        self.identity.require()?;

        let order = self.db.transaction(|tx| {
            let mut order = load_order(tx, order_local_id)?;
            if order.status == OrderStatus::Cancelled {
                return Err(OrderError::OrderCancelled(order.local_id.clone()));
            }
            if order.is_offline_served && status != OrderStatus::Served {
                return Err(OrderError::OfflineServed(order.local_id.clone()));
            }
            order.status = status;
            order.updated_at = now_timestamp();
            store::put_order(tx, &order)?;

            let payload = MutationPayload::UpdateOrderStatus(UpdateOrderStatusPayload {
                order_local_id: order.local_id.clone(),
                status,
            });
            queue::enqueue(tx, &payload, &[order.local_id.as_str()], &new_id())?;
            Ok::<_, OrderError>(order)
        })?;

        info!(order_id = %order.local_id, status = %status, "Order status updated");
        Ok(order)
    }

    /// Same as [`update_status`](Self::update_status) for a UI label such as
    /// `"ready"`.
    pub fn update_status_label(
        &self,
        order_local_id: &str,
        label: &str,
    ) -> Result<Order, OrderError> {
        let status = OrderStatus::from_ui(label)
            .ok_or_else(|| OrderError::Precondition(format!("unknown order status: {label}")))?;
        self.update_status(order_local_id, status)
    }

    pub fn pay_cash(
        &self,
        order_local_id: &str,
        amount_ugx: i64,
        change_ugx: i64,
    ) -> Result<Payment, OrderError> {
        if change_ugx < 0 {
            return Err(OrderError::InvalidAmount(format!(
                "change {change_ugx} is negative"
            )));
        }
        self.record_payment(order_local_id, PaymentMethod::Cash, amount_ugx, Some(change_ugx))
    }

    pub fn pay_momo(&self, order_local_id: &str, amount_ugx: i64) -> Result<Payment, OrderError> {
        self.record_payment(order_local_id, PaymentMethod::MtnMomo, amount_ugx, None)
    }

    pub fn pay_airtel(&self, order_local_id: &str, amount_ugx: i64) -> Result<Payment, OrderError> {
        self.record_payment(order_local_id, PaymentMethod::AirtelMoney, amount_ugx, None)
    }

    /// Record a tender, mark the order served offline, and enqueue the
    /// method's pay mutation. The payment's `client_request_id` doubles as
    /// the queue item's idempotency key.
    fn record_payment(
        &self,
        order_local_id: &str,
        method: PaymentMethod,
        amount_ugx: i64,
        change_ugx: Option<i64>,
    ) -> Result<Payment, OrderError> {
        let ctx = self.identity.require()?;
        if amount_ugx <= 0 {
            return Err(OrderError::InvalidAmount(format!(
                "payment amount must be positive, got {amount_ugx}"
            )));
        }

        let payment = self.db.transaction(|tx| {
            let mut order = load_order(tx, order_local_id)?;
            ensure_items_editable(&order)?;

            let now = now_timestamp();
            let payment = Payment {
                local_id: new_id(),
                server_id: None,
                order_local_id: order.local_id.clone(),
                order_server_id: order.server_id.clone(),
                amount_ugx,
                change_ugx,
                method,
                created_by_staff_id: ctx.staff_id.clone(),
                terminal_id: ctx.terminal_id.clone(),
                client_request_id: new_id(),
                sync_status: SyncStatus::Pending,
                created_at: now.clone(),
                updated_at: now.clone(),
            };
            store::put_payment(tx, &payment)?;

            order.status = OrderStatus::Served;
            order.is_offline_served = true;
            order.updated_at = now;
            store::put_order(tx, &order)?;

            let data = PaymentPayload {
                payment_local_id: payment.local_id.clone(),
                order_local_id: order.local_id.clone(),
                amount_ugx,
                change_ugx,
                method,
                created_by_staff_id: payment.created_by_staff_id.clone(),
                terminal_id: payment.terminal_id.clone(),
            };
            let payload = match method {
                PaymentMethod::Cash => MutationPayload::PayCash(data),
                PaymentMethod::MtnMomo => MutationPayload::PayMomo(data),
                PaymentMethod::AirtelMoney => MutationPayload::PayAirtel(data),
            };
            queue::enqueue(
                tx,
                &payload,
                &[order.local_id.as_str()],
                &payment.client_request_id,
            )?;
            Ok::<_, OrderError>(payment)
        })?;

        info!(
            payment_id = %payment.local_id,
            order_id = %payment.order_local_id,
            method = %method,
            amount = payment.amount_ugx,
            "Payment recorded"
        );
        Ok(payment)
    }

    // -----------------------------------------------------------------------
    // Conflict resolution
    // -----------------------------------------------------------------------

    /// Move a dine-in order whose creation conflicted (e.g. table occupied)
    /// to another table and queue the creation again.
    ///
    /// The rewritten creation is a new intent, so it gets a new
    /// `client_request_id`; its blocked dependents are revived with it.
    pub fn retarget_table(&self, order_local_id: &str, table_id: &str) -> Result<Order, OrderError> {
        self.identity.require()?;
        let table_id = table_id.trim();
        if table_id.is_empty() {
            return Err(OrderError::InvalidTable("table id is empty".into()));
        }

        self.db.transaction(|tx| {
            let mut order = load_order(tx, order_local_id)?;
            if order.order_type != OrderType::DineIn {
                return Err(OrderError::InvalidTable(
                    "only dine-in orders have a table".into(),
                ));
            }
            let create = queue::list_for_order(tx, order_local_id)?
                .into_iter()
                .find(|item| {
                    item.mutation_type == MutationType::CreateOrder
                        && item.status == QueueStatus::Failed
                        && item.failure_kind == Some(FailureKind::Conflict)
                })
                .ok_or_else(|| OrderError::NotConflicted(order_local_id.to_string()))?;

            let MutationPayload::CreateOrder(mut payload) = create.payload else {
                return Err(OrderError::NotConflicted(order_local_id.to_string()));
            };
            payload.table_id = Some(table_id.to_string());

            order.table_id = Some(table_id.to_string());
            order.sync_status = SyncStatus::Pending;
            order.updated_at = now_timestamp();
            store::put_order(tx, &order)?;

            queue::replace_payload(tx, create.id, &MutationPayload::CreateOrder(payload), &new_id())?;
            let revived = queue::revive(tx, create.id)?;
            info!(
                order_id = %order_local_id,
                table_id = %table_id,
                revived = revived.len(),
                "Conflicted order retargeted"
            );
            Ok(order)
        })
    }

    /// Give up on an order that never reached the server. The order is
    /// cancelled locally and none of its mutations will be replayed.
    pub fn abandon_order(&self, order_local_id: &str) -> Result<Order, OrderError> {
        self.identity.require()?;

        self.db.transaction(|tx| {
            let mut order = load_order(tx, order_local_id)?;
            if order.server_id.is_some() {
                return Err(OrderError::Precondition(format!(
                    "order {order_local_id} already exists remotely; cancel it instead"
                )));
            }
            let mutations = queue::list_for_order(tx, order_local_id)?;
            if mutations.iter().any(|item| item.status == QueueStatus::Syncing) {
                return Err(OrderError::Precondition(format!(
                    "order {order_local_id} is being synced; try again after the pass"
                )));
            }

            let now = now_timestamp();
            order.status = OrderStatus::Cancelled;
            order.sync_status = SyncStatus::Failed;
            order.updated_at = now.clone();
            store::put_order(tx, &order)?;

            let mut abandoned = 0;
            for item in mutations {
                if item.status == QueueStatus::Synced {
                    continue;
                }
                queue::mark_failed(
                    tx,
                    item.id,
                    FailureKind::Abandoned,
                    None,
                    "order abandoned by operator",
                )?;
                store::set_entity_sync_status(tx, item.entity_local_id(), SyncStatus::Failed, &now)?;
                abandoned += 1;
            }
            warn!(order_id = %order_local_id, abandoned, "Order abandoned");
            Ok(order)
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_order(&self, order_local_id: &str) -> Result<Order, OrderError> {
        let conn = self.db.lock()?;
        load_order(&conn, order_local_id)
    }

    pub fn find_order_by_server_id(&self, server_id: &str) -> Result<Option<Order>, OrderError> {
        let conn = self.db.lock()?;
        Ok(store::find_order_by_server_id(&conn, server_id)?)
    }

    pub fn list_orders(&self) -> Result<Vec<Order>, OrderError> {
        let conn = self.db.lock()?;
        Ok(store::list_orders(&conn)?)
    }

    pub fn items_for_order(&self, order_local_id: &str) -> Result<Vec<OrderItem>, OrderError> {
        let conn = self.db.lock()?;
        Ok(store::items_for_order(&conn, order_local_id)?)
    }

    pub fn payments_for_order(&self, order_local_id: &str) -> Result<Vec<Payment>, OrderError> {
        let conn = self.db.lock()?;
        Ok(store::payments_for_order(&conn, order_local_id)?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TerminalSession;

    fn service() -> (OrderService, Arc<DbState>, Arc<TerminalSession>) {
        let db = Arc::new(DbState::open_in_memory().expect("open db"));
        let session = Arc::new(TerminalSession::new("term-1"));
        session.sign_in("staff-1");
        session.open_shift("shift-1");
        (OrderService::new(db.clone(), session.clone()), db, session)
    }

    fn product(id: &str, price: i64) -> ProductSnapshot {
        ProductSnapshot {
            product_id: id.to_string(),
            product_name: format!("Product {id}"),
            unit_price_ugx: price,
        }
    }

    #[test]
    fn test_create_order_writes_row_and_mutation() {
        let (svc, db, _) = service();
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.sync_status, SyncStatus::Pending);
        assert!(order.order_number.starts_with("ORD-"));
        assert!(order.order_number.ends_with("-00001"));

        let conn = db.lock().unwrap();
        let queued = queue::list_pending(&conn).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].mutation_type, MutationType::CreateOrder);
        assert!(queued[0].dependencies.is_empty());
        assert_eq!(queued[0].entity_local_id(), order.local_id);
    }

    #[test]
    fn test_create_order_requires_shift_and_staff() {
        let (svc, db, session) = service();
        session.close_shift();
        assert!(matches!(
            svc.create_order(OrderType::Takeaway, None),
            Err(OrderError::Precondition(_))
        ));
        session.sign_out();
        assert!(matches!(
            svc.create_order(OrderType::Takeaway, None),
            Err(OrderError::Precondition(_))
        ));
        let conn = db.lock().unwrap();
        assert!(queue::list_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_table_rules() {
        let (svc, _, _) = service();
        assert!(matches!(
            svc.create_order(OrderType::DineIn, None),
            Err(OrderError::InvalidTable(_))
        ));
        assert!(matches!(
            svc.create_order(OrderType::Takeaway, Some("T1")),
            Err(OrderError::InvalidTable(_))
        ));
        let order = svc.create_order(OrderType::DineIn, Some("T1")).unwrap();
        assert_eq!(order.table_id.as_deref(), Some("T1"));
    }

    #[test]
    fn test_add_item_updates_total_immediately() {
        let (svc, db, _) = service();
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        svc.add_item(&order.local_id, &product("A", 5000), 2, ItemOptions::default())
            .unwrap();
        svc.add_item(
            &order.local_id,
            &product("B", 3000),
            1,
            ItemOptions {
                notes: Some("no onions".into()),
                ..ItemOptions::default()
            },
        )
        .unwrap();

        let order = svc.get_order(&order.local_id).unwrap();
        assert_eq!(order.subtotal_ugx, 13000);
        assert_eq!(order.total_ugx, 13000);
        assert_eq!(order.tax_ugx, 0);

        let items = svc.items_for_order(&order.local_id).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].line_total_ugx, 10000);
        assert_eq!(items[1].sort_order, 1);

        let conn = db.lock().unwrap();
        let queued = queue::list_pending(&conn).unwrap();
        assert_eq!(queued.len(), 3);
        assert_eq!(queued[1].dependencies, vec![order.local_id.clone()]);
    }

    #[test]
    fn test_add_item_rejects_unknown_or_bad_input() {
        let (svc, _, _) = service();
        assert!(matches!(
            svc.add_item("missing", &product("A", 5000), 1, ItemOptions::default()),
            Err(OrderError::OrderNotFound(_))
        ));
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        assert!(matches!(
            svc.add_item(&order.local_id, &product("A", 5000), 0, ItemOptions::default()),
            Err(OrderError::InvalidQuantity(0))
        ));
    }

    #[test]
    fn test_offline_served_blocks_items_and_second_payment() {
        let (svc, db, _) = service();
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        svc.add_item(&order.local_id, &product("A", 5000), 1, ItemOptions::default())
            .unwrap();
        let payment = svc.pay_cash(&order.local_id, 10000, 5000).unwrap();
        assert_eq!(payment.change_ugx, Some(5000));

        let order = svc.get_order(&order.local_id).unwrap();
        assert_eq!(order.status, OrderStatus::Served);
        assert!(order.is_offline_served);

        assert!(matches!(
            svc.add_item(&order.local_id, &product("B", 1000), 1, ItemOptions::default()),
            Err(OrderError::OfflineServed(_))
        ));
        assert!(matches!(
            svc.pay_momo(&order.local_id, 5000),
            Err(OrderError::OfflineServed(_))
        ));

        let conn = db.lock().unwrap();
        let pay = queue::list_pending(&conn)
            .unwrap()
            .into_iter()
            .find(|i| i.mutation_type == MutationType::PayCash)
            .unwrap();
        assert_eq!(pay.client_request_id, payment.client_request_id);
        assert_eq!(pay.dependencies, vec![order.local_id.clone()]);
    }

    #[test]
    fn test_mobile_money_has_no_change() {
        let (svc, _, _) = service();
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        let payment = svc.pay_airtel(&order.local_id, 7000).unwrap();
        assert_eq!(payment.method, PaymentMethod::AirtelMoney);
        assert_eq!(payment.change_ugx, None);
        assert_eq!(svc.payments_for_order(&order.local_id).unwrap().len(), 1);

        let other = svc.create_order(OrderType::Takeaway, None).unwrap();
        assert!(matches!(
            svc.pay_momo(&other.local_id, 0),
            Err(OrderError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_served_status_blocks_items() {
        let (svc, _, _) = service();
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        svc.update_status(&order.local_id, OrderStatus::Served).unwrap();
        assert!(matches!(
            svc.add_item(&order.local_id, &product("A", 1000), 1, ItemOptions::default()),
            Err(OrderError::OrderServed(_))
        ));
    }

    #[test]
    fn test_ready_label_persists_awaiting_payment() {
        let (svc, db, _) = service();
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        let order = svc.update_status_label(&order.local_id, "ready").unwrap();
        assert_eq!(order.status, OrderStatus::AwaitingPayment);

        let conn = db.lock().unwrap();
        let status_item = queue::list_pending(&conn).unwrap().pop().unwrap();
        match status_item.payload {
            MutationPayload::UpdateOrderStatus(p) => {
                assert_eq!(p.status, OrderStatus::AwaitingPayment)
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_update_item_quantity_recomputes_total() {
        let (svc, db, _) = service();
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        let item = svc
            .add_item(&order.local_id, &product("A", 5000), 2, ItemOptions::default())
            .unwrap();
        let item = svc.update_item_quantity(&item.local_id, 3, Some("extra hot")).unwrap();
        assert_eq!(item.line_total_ugx, 15000);
        assert_eq!(item.notes.as_deref(), Some("extra hot"));
        assert_eq!(svc.get_order(&order.local_id).unwrap().total_ugx, 15000);

        let conn = db.lock().unwrap();
        let update = queue::list_pending(&conn).unwrap().pop().unwrap();
        assert_eq!(update.mutation_type, MutationType::UpdateItem);
        assert_eq!(
            update.dependencies,
            vec![order.local_id.clone(), item.local_id.clone()]
        );
    }

    #[test]
    fn test_retarget_requires_conflict() {
        let (svc, db, _) = service();
        let order = svc.create_order(OrderType::DineIn, Some("T4")).unwrap();
        assert!(matches!(
            svc.retarget_table(&order.local_id, "T5"),
            Err(OrderError::NotConflicted(_))
        ));

        let original = {
            let conn = db.lock().unwrap();
            let create = queue::list_pending(&conn).unwrap().remove(0);
            queue::mark_failed(
                &conn,
                create.id,
                FailureKind::Conflict,
                Some("TABLE_OCCUPIED"),
                "table taken",
            )
            .unwrap();
            create
        };

        let order = svc.retarget_table(&order.local_id, "T5").unwrap();
        assert_eq!(order.table_id.as_deref(), Some("T5"));

        let conn = db.lock().unwrap();
        let create = queue::get(&conn, original.id).unwrap().unwrap();
        assert_eq!(create.status, QueueStatus::Pending);
        assert_ne!(create.client_request_id, original.client_request_id);
        match create.payload {
            MutationPayload::CreateOrder(p) => assert_eq!(p.table_id.as_deref(), Some("T5")),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_abandon_order_fails_all_mutations() {
        let (svc, db, _) = service();
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        svc.add_item(&order.local_id, &product("A", 1000), 1, ItemOptions::default())
            .unwrap();
        let order = svc.abandon_order(&order.local_id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);

        let conn = db.lock().unwrap();
        assert!(queue::list_pending(&conn).unwrap().is_empty());
        assert_eq!(
            queue::count_failed_kind(&conn, FailureKind::Abandoned).unwrap(),
            2
        );
    }

    #[test]
    fn test_line_total_overflow_is_rejected() {
        let (svc, db, _) = service();
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        assert!(matches!(
            svc.add_item(
                &order.local_id,
                &product("A", i64::MAX / 2),
                3,
                ItemOptions::default()
            ),
            Err(OrderError::InvalidAmount(_))
        ));

        let item = svc
            .add_item(&order.local_id, &product("B", i64::MAX / 4), 1, ItemOptions::default())
            .unwrap();
        assert!(matches!(
            svc.update_item_quantity(&item.local_id, 8, None),
            Err(OrderError::InvalidAmount(_))
        ));
        assert_eq!(svc.items_for_order(&order.local_id).unwrap()[0].quantity, 1);

        let conn = db.lock().unwrap();
        assert_eq!(queue::list_pending(&conn).unwrap().len(), 2);
    }

    #[test]
    fn test_status_changes_refused_on_closed_orders() {
        let (svc, db, _) = service();
        let paid = svc.create_order(OrderType::Takeaway, None).unwrap();
        svc.pay_momo(&paid.local_id, 5000).unwrap();
        assert!(matches!(
            svc.update_status(&paid.local_id, OrderStatus::Pending),
            Err(OrderError::OfflineServed(_))
        ));
        svc.update_status(&paid.local_id, OrderStatus::Served).unwrap();

        let abandoned = svc.create_order(OrderType::Takeaway, None).unwrap();
        svc.abandon_order(&abandoned.local_id).unwrap();
        assert!(matches!(
            svc.update_status(&abandoned.local_id, OrderStatus::Preparing),
            Err(OrderError::OrderCancelled(_))
        ));

        let conn = db.lock().unwrap();
        let statuses = queue::list_all(&conn)
            .unwrap()
            .into_iter()
            .filter(|i| i.mutation_type == MutationType::UpdateOrderStatus)
            .count();
        assert_eq!(statuses, 1);
    }

    #[test]
    fn test_abandon_refused_while_creation_in_flight() {
        let (svc, db, _) = service();
        let order = svc.create_order(OrderType::Takeaway, None).unwrap();
        {
            let conn = db.lock().unwrap();
            assert!(queue::mark_syncing(&conn, 1).unwrap());
        }
        assert!(matches!(
            svc.abandon_order(&order.local_id),
            Err(OrderError::Precondition(_))
        ));
        assert_eq!(svc.get_order(&order.local_id).unwrap().status, OrderStatus::Pending);

        {
            let conn = db.lock().unwrap();
            queue::reset_to_pending(&conn, 1).unwrap();
        }
        svc.abandon_order(&order.local_id).unwrap();
    }
}
