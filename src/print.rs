//! Receipt and cash-drawer job spool.
//!
//! Once a payment's remote write is acknowledged the host prints one receipt
//! for it and, for cash taken on this terminal, opens the drawer once. Jobs
//! are rows in `print_jobs`, unique per `(kind, payment_local_id)`, so a
//! replayed event or a restart never prints twice. The printer driver itself
//! lives in the host and drains the spool through [`list_print_jobs`] and
//! [`mark_print_job_done`].

use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::StoreError;
use crate::models::{now_timestamp, text_enum, PaymentMethod, SyncStatus};
use crate::store;
use crate::sync::{SyncEngine, SyncEvent, SyncedPayment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintJobKind {
    Receipt,
    DrawerOpen,
}

text_enum!(PrintJobKind {
    Receipt => "receipt",
    DrawerOpen => "drawer_open",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintJobStatus {
    Pending,
    Done,
}

text_enum!(PrintJobStatus {
    Pending => "pending",
    Done => "done",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintJob {
    pub id: String,
    pub kind: PrintJobKind,
    pub payment_local_id: String,
    pub payment_server_id: Option<String>,
    pub order_local_id: String,
    pub terminal_id: String,
    pub status: PrintJobStatus,
    pub created_at: String,
    pub updated_at: String,
}

const JOB_COLUMNS: &str = "id, kind, payment_local_id, payment_server_id, order_local_id,
     terminal_id, status, created_at, updated_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<PrintJob> {
    let kind: String = row.get(1)?;
    let status: String = row.get(6)?;
    let conversion = |idx: usize, e: StoreError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    Ok(PrintJob {
        id: row.get(0)?,
        kind: PrintJobKind::from_str(&kind).map_err(|e| conversion(1, e))?,
        payment_local_id: row.get(2)?,
        payment_server_id: row.get(3)?,
        order_local_id: row.get(4)?,
        terminal_id: row.get(5)?,
        status: PrintJobStatus::from_str(&status).map_err(|e| conversion(6, e))?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Insert a job unless one of the same kind already exists for the payment.
/// Returns the new job, or `None` for a duplicate.
fn insert_job(
    conn: &Connection,
    kind: PrintJobKind,
    payment: &SyncedPayment,
) -> Result<Option<PrintJob>, StoreError> {
    let now = now_timestamp();
    let job = PrintJob {
        id: Uuid::new_v4().to_string(),
        kind,
        payment_local_id: payment.payment_local_id.clone(),
        payment_server_id: payment.payment_server_id.clone(),
        order_local_id: payment.order_local_id.clone(),
        terminal_id: payment.terminal_id.clone(),
        status: PrintJobStatus::Pending,
        created_at: now.clone(),
        updated_at: now,
    };
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO print_jobs ({JOB_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            job.id,
            job.kind.as_str(),
            job.payment_local_id,
            job.payment_server_id,
            job.order_local_id,
            job.terminal_id,
            job.status.as_str(),
            job.created_at,
            job.updated_at,
        ],
    )?;
    Ok((inserted > 0).then_some(job))
}

/// Spool the receipt (and, for cash taken on `local_terminal_id`, the drawer
/// kick) for a synced payment. Returns only the jobs created by this call.
pub fn enqueue_payment_jobs(
    db: &DbState,
    payment: &SyncedPayment,
    local_terminal_id: &str,
) -> Result<Vec<PrintJob>, StoreError> {
    let jobs = db.transaction(|tx| -> Result<Vec<PrintJob>, StoreError> {
        let mut jobs = Vec::new();
        jobs.extend(insert_job(tx, PrintJobKind::Receipt, payment)?);
        if payment.method == PaymentMethod::Cash && payment.terminal_id == local_terminal_id {
            jobs.extend(insert_job(tx, PrintJobKind::DrawerOpen, payment)?);
        }
        Ok(jobs)
    })?;

    for job in &jobs {
        info!(
            job_id = %job.id,
            kind = %job.kind,
            payment_id = %job.payment_local_id,
            "Print job enqueued"
        );
    }
    if jobs.is_empty() {
        debug!(payment_id = %payment.payment_local_id, "Print jobs already spooled");
    }
    Ok(jobs)
}

/// Spool jobs for every synced payment. Used when the listener starts and
/// after it lagged, to catch payments whose events it never saw.
pub fn backfill_payment_jobs(db: &DbState, local_terminal_id: &str) -> Result<usize, StoreError> {
    let payments = {
        let conn = db.lock()?;
        store::payments_by_sync_status(&conn, SyncStatus::Synced)?
    };
    let mut created = 0;
    for payment in payments {
        let synced = SyncedPayment {
            payment_local_id: payment.local_id,
            payment_server_id: payment.server_id,
            order_local_id: payment.order_local_id,
            method: payment.method,
            terminal_id: payment.terminal_id,
        };
        created += enqueue_payment_jobs(db, &synced, local_terminal_id)?.len();
    }
    Ok(created)
}

/// Listen for `PaymentSynced` events and spool their jobs until `cancel`
/// fires or the engine goes away. Subscribes before the startup backfill so
/// a payment synced in between is caught by one or the other.
pub fn spawn_listener(
    engine: &SyncEngine,
    db: Arc<DbState>,
    local_terminal_id: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        match backfill_payment_jobs(&db, &local_terminal_id) {
            Ok(0) => {}
            Ok(created) => info!(created, "Spooled print jobs for payments synced earlier"),
            Err(e) => warn!(error = %e, "Print job backfill failed"),
        }
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(SyncEvent::PaymentSynced(payment)) => {
                    if let Err(e) = enqueue_payment_jobs(&db, &payment, &local_terminal_id) {
                        warn!(payment_id = %payment.payment_local_id, error = %e, "Failed to spool print jobs");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Print listener lagged; backfilling from synced payments");
                    if let Err(e) = backfill_payment_jobs(&db, &local_terminal_id) {
                        warn!(error = %e, "Print job backfill failed");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Print listener stopped");
    })
}

pub fn list_print_jobs(
    db: &DbState,
    status: Option<PrintJobStatus>,
) -> Result<Vec<PrintJob>, StoreError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM print_jobs
         WHERE ?1 IS NULL OR status = ?1
         ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map(params![status.map(|s| s.as_str())], job_from_row)?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row?);
    }
    Ok(jobs)
}

/// Mark a job as handled by the printer driver. Returns `false` if the job
/// does not exist or was already done.
pub fn mark_print_job_done(db: &DbState, job_id: &str) -> Result<bool, StoreError> {
    let conn = db.lock()?;
    let affected = conn.execute(
        "UPDATE print_jobs SET status = 'done', updated_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![now_timestamp(), job_id],
    )?;
    Ok(affected > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::identity::TerminalSession;
    use crate::models::{ItemOptions, OrderType, ProductSnapshot};
    use crate::orders::OrderService;
    use crate::testing::MockOrderApi;
    use std::time::Duration;

    fn cash_payment(id: &str, terminal: &str) -> SyncedPayment {
        SyncedPayment {
            payment_local_id: id.to_string(),
            payment_server_id: Some("S9".to_string()),
            order_local_id: "L1".to_string(),
            method: PaymentMethod::Cash,
            terminal_id: terminal.to_string(),
        }
    }

    #[test]
    fn test_cash_payment_spools_receipt_and_drawer_once() {
        let db = DbState::open_in_memory().unwrap();
        let payment = cash_payment("P1", "term-1");

        let jobs = enqueue_payment_jobs(&db, &payment, "term-1").unwrap();
        let kinds: Vec<PrintJobKind> = jobs.iter().map(|j| j.kind).collect();
        assert_eq!(kinds, vec![PrintJobKind::Receipt, PrintJobKind::DrawerOpen]);

        assert!(enqueue_payment_jobs(&db, &payment, "term-1")
            .unwrap()
            .is_empty());
        assert_eq!(list_print_jobs(&db, None).unwrap().len(), 2);
    }

    #[test]
    fn test_drawer_only_opens_on_originating_terminal() {
        let db = DbState::open_in_memory().unwrap();
        let jobs = enqueue_payment_jobs(&db, &cash_payment("P1", "term-2"), "term-1").unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, PrintJobKind::Receipt);

        let momo = SyncedPayment {
            method: PaymentMethod::MtnMomo,
            ..cash_payment("P2", "term-1")
        };
        let jobs = enqueue_payment_jobs(&db, &momo, "term-1").unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, PrintJobKind::Receipt);
    }

    #[test]
    fn test_mark_done_filters_listing() {
        let db = DbState::open_in_memory().unwrap();
        let jobs = enqueue_payment_jobs(&db, &cash_payment("P1", "term-1"), "term-1").unwrap();

        assert!(mark_print_job_done(&db, &jobs[0].id).unwrap());
        assert!(!mark_print_job_done(&db, &jobs[0].id).unwrap());
        assert!(!mark_print_job_done(&db, "missing").unwrap());

        let pending = list_print_jobs(&db, Some(PrintJobStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, PrintJobKind::DrawerOpen);
        let done = list_print_jobs(&db, Some(PrintJobStatus::Done)).unwrap();
        assert_eq!(done[0].id, jobs[0].id);
    }

    #[tokio::test]
    async fn test_listener_spools_jobs_for_synced_payment() {
        let db = Arc::new(DbState::open_in_memory().unwrap());
        let session = Arc::new(TerminalSession::new("term-1"));
        session.sign_in("staff-1");
        session.open_shift("shift-1");
        let orders = OrderService::new(db.clone(), session);
        let engine = SyncEngine::new(
            db.clone(),
            Arc::new(MockOrderApi::new()),
            SyncConfig {
                backoff_base: Duration::ZERO,
                ..SyncConfig::default()
            },
        );

        let cancel = CancellationToken::new();
        let listener = spawn_listener(&engine, db.clone(), "term-1".into(), cancel.clone());

        let order = orders.create_order(OrderType::Takeaway, None).unwrap();
        let product = ProductSnapshot {
            product_id: "A".into(),
            product_name: "Rolex".into(),
            unit_price_ugx: 5000,
        };
        orders
            .add_item(&order.local_id, &product, 1, ItemOptions::default())
            .unwrap();
        let payment = orders.pay_cash(&order.local_id, 5000, 0).unwrap();
        engine.run_pass().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while list_print_jobs(&db, None).unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("jobs spooled");

        let jobs = list_print_jobs(&db, None).unwrap();
        assert!(jobs.iter().all(|j| j.payment_local_id == payment.local_id));

        // Already spooled; backfill adds nothing.
        assert_eq!(backfill_payment_jobs(&db, "term-1").unwrap(), 0);

        cancel.cancel();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_spools_payment_synced_before_start() {
        let db = Arc::new(DbState::open_in_memory().unwrap());
        let session = Arc::new(TerminalSession::new("term-1"));
        session.sign_in("staff-1");
        session.open_shift("shift-1");
        let config = SyncConfig {
            backoff_base: Duration::ZERO,
            sync_interval: Duration::from_secs(3600),
            ..SyncConfig::default()
        };
        let mut pipeline = crate::Pipeline::assemble(
            db.clone(),
            Arc::new(MockOrderApi::new()),
            config,
            session,
        );

        let order = pipeline.orders.create_order(OrderType::Takeaway, None).unwrap();
        pipeline.orders.pay_airtel(&order.local_id, 4000).unwrap();
        pipeline.engine.run_pass().await.unwrap();
        assert!(list_print_jobs(&db, None).unwrap().is_empty());

        pipeline.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while list_print_jobs(&db, None).unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("receipt spooled on start");

        let jobs = list_print_jobs(&db, None).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, PrintJobKind::Receipt);

        tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
            .await
            .expect("shutdown completes");
    }
}
