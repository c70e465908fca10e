//! Offline-first order mutation pipeline for POS terminals.
//!
//! Order writes land in the local SQLite store together with a durable
//! mutation record, and return immediately. A background sync engine later
//! replays the mutations against the remote order API in dependency order,
//! idempotently, with bounded retries.
//!
//! [`Pipeline`] wires the pieces together the way the terminal app does at
//! startup: database, order service, sync engine, background sync loop and
//! the receipt/drawer spool listener.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod logging;
pub mod models;
pub mod orders;
pub mod print;
pub mod queue;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use api::{HttpOrderApi, OrderApi};
pub use config::{ConfigError, SyncConfig};
pub use db::DbState;
pub use error::{ApiError, OrderError, StoreError, SyncError};
pub use identity::{IdentityProvider, SessionContext, TerminalSession};
pub use orders::OrderService;
pub use queue::{FailureKind, MutationPayload, MutationType, QueueItem, QueueStatus};
pub use sync::{start_sync_loop, SyncEngine, SyncEvent, SyncReport};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The assembled pipeline for one terminal.
pub struct Pipeline {
    pub db: Arc<DbState>,
    pub orders: OrderService,
    pub engine: Arc<SyncEngine>,
    identity: Arc<dyn IdentityProvider>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Open `{data_dir}/orders.db` and talk to the configured HTTP API.
    pub fn open(
        config: SyncConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, StartupError> {
        let db = Arc::new(DbState::open(&config.data_dir)?);
        let api: Arc<dyn OrderApi> = Arc::new(HttpOrderApi::from_config(&config)?);
        Ok(Self::assemble(db, api, config, identity))
    }

    /// Build from an already-open database and any [`OrderApi`].
    pub fn assemble(
        db: Arc<DbState>,
        api: Arc<dyn OrderApi>,
        config: SyncConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let orders = OrderService::new(db.clone(), identity.clone());
        let engine = Arc::new(SyncEngine::new(db.clone(), api, config));
        Self {
            db,
            orders,
            engine,
            identity,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Spawn the background sync loop and the print listener. Must be called
    /// from within a tokio runtime. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        let terminal_id = self.identity.terminal_id().unwrap_or_default();
        self.tasks.push(print::spawn_listener(
            &self.engine,
            self.db.clone(),
            terminal_id,
            self.cancel.child_token(),
        ));
        self.tasks
            .push(start_sync_loop(self.engine.clone(), self.cancel.child_token()));
        info!(
            "Order pipeline started (v{})",
            env!("CARGO_PKG_VERSION")
        );
    }

    /// Stop background tasks and wait for them to exit. An interrupted pass
    /// leaves its in-flight item in `syncing`; the next pass recovers it.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Order pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemOptions, OrderType, ProductSnapshot};
    use crate::testing::MockOrderApi;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pipeline_syncs_and_spools_receipt() {
        let session = Arc::new(TerminalSession::new("term-1"));
        session.sign_in("staff-1");
        session.open_shift("shift-1");
        let db = Arc::new(DbState::open_in_memory().unwrap());
        let config = SyncConfig {
            backoff_base: Duration::ZERO,
            sync_interval: Duration::from_secs(3600),
            ..SyncConfig::default()
        };
        let mut pipeline =
            Pipeline::assemble(db, Arc::new(MockOrderApi::new()), config, session);
        pipeline.start();

        let order = pipeline
            .orders
            .create_order(OrderType::Takeaway, None)
            .unwrap();
        let product = ProductSnapshot {
            product_id: "A".into(),
            product_name: "Chapati".into(),
            unit_price_ugx: 1500,
        };
        pipeline
            .orders
            .add_item(&order.local_id, &product, 2, ItemOptions::default())
            .unwrap();
        pipeline.orders.pay_momo(&order.local_id, 3000).unwrap();
        pipeline.engine.notify_online();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let drained = pipeline.engine.status().unwrap().pending_count == 0;
                let printed = !print::list_print_jobs(&pipeline.db, None).unwrap().is_empty();
                if drained && printed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pipeline drains queue and spools receipt");

        let jobs = print::list_print_jobs(&pipeline.db, None).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, print::PrintJobKind::Receipt);

        tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
            .await
            .expect("shutdown completes");
    }
}
