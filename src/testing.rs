//! In-process stand-in for the remote order API.
//!
//! Deduplicates writes by `clientRequestId` the way the real server does,
//! records every call, and replays scripted failures per operation.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::api::OrderApi;
use crate::error::ApiError;
use crate::queue::{
    AddItemPayload, CreateOrderPayload, PaymentPayload, UpdateItemPayload,
    UpdateOrderStatusPayload,
};

#[derive(Debug, Clone)]
pub enum Script {
    /// Answer with this error; nothing is written.
    Fail(ApiError),
    /// Perform the write, then lose the response.
    DropAfterWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: &'static str,
    pub client_request_id: String,
    /// Server id of the parent order (and line, for `update_item`).
    pub parents: Vec<String>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    by_request: HashMap<String, String>,
    created: Vec<(&'static str, String)>,
    calls: Vec<MockCall>,
    scripts: HashMap<&'static str, VecDeque<Script>>,
    offline: bool,
    health_checks: usize,
}

#[derive(Default)]
pub struct MockOrderApi {
    state: Mutex<MockState>,
}

impl MockOrderApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `times` copies of `script` for the next calls to `op`.
    pub fn script(&self, op: &'static str, script: Script, times: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.scripts.entry(op).or_default();
        queue.extend(std::iter::repeat(script).take(times));
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, op: &str) -> Vec<MockCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    /// Resources the server actually created, in creation order.
    pub fn created(&self, op: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .created
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn health_checks(&self) -> usize {
        self.state.lock().unwrap().health_checks
    }

    /// Apply one write. Only creation calls allocate a server id; updates
    /// answer with an empty id.
    fn handle(
        &self,
        op: &'static str,
        client_request_id: &str,
        parents: &[&str],
        creates: bool,
    ) -> Result<String, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall {
            op,
            client_request_id: client_request_id.to_string(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
        });
        if state.offline {
            return Err(ApiError::Network("offline".into()));
        }

        let drop_response = match state.scripts.get_mut(op).and_then(VecDeque::pop_front) {
            Some(Script::Fail(err)) => return Err(err),
            Some(Script::DropAfterWrite) => true,
            None => false,
        };

        let id = match state.by_request.get(client_request_id) {
            Some(existing) => existing.clone(),
            None if !creates => {
                state
                    .by_request
                    .insert(client_request_id.to_string(), String::new());
                String::new()
            }
            None => {
                state.next_id += 1;
                let id = format!("S{}", state.next_id);
                state
                    .by_request
                    .insert(client_request_id.to_string(), id.clone());
                state.created.push((op, id.clone()));
                id
            }
        };

        if drop_response {
            return Err(ApiError::Timeout);
        }
        Ok(id)
    }
}

pub fn server_error() -> ApiError {
    ApiError::Server {
        status: 500,
        message: "Internal Server Error".into(),
    }
}

pub fn table_occupied() -> ApiError {
    ApiError::Conflict {
        code: "TABLE_OCCUPIED".into(),
        message: "Table already has an open order".into(),
    }
}

#[async_trait]
impl OrderApi for MockOrderApi {
    async fn health(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.health_checks += 1;
        !state.offline
    }

    async fn create_order(
        &self,
        client_request_id: &str,
        _payload: &CreateOrderPayload,
    ) -> Result<String, ApiError> {
        self.handle("create_order", client_request_id, &[], true)
    }

    async fn add_item(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        _payload: &AddItemPayload,
    ) -> Result<String, ApiError> {
        self.handle("add_item", client_request_id, &[order_server_id], true)
    }

    async fn update_item(
        &self,
        order_server_id: &str,
        item_server_id: &str,
        client_request_id: &str,
        _payload: &UpdateItemPayload,
    ) -> Result<(), ApiError> {
        self.handle(
            "update_item",
            client_request_id,
            &[order_server_id, item_server_id],
            false,
        )
        .map(|_| ())
    }

    async fn update_order_status(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        _payload: &UpdateOrderStatusPayload,
    ) -> Result<(), ApiError> {
        self.handle("update_order_status", client_request_id, &[order_server_id], false)
            .map(|_| ())
    }

    async fn pay_cash(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        _payload: &PaymentPayload,
    ) -> Result<String, ApiError> {
        self.handle("pay_cash", client_request_id, &[order_server_id], true)
    }

    async fn pay_momo(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        _payload: &PaymentPayload,
    ) -> Result<String, ApiError> {
        self.handle("pay_momo", client_request_id, &[order_server_id], true)
    }

    async fn pay_airtel(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        _payload: &PaymentPayload,
    ) -> Result<String, ApiError> {
        self.handle("pay_airtel", client_request_id, &[order_server_id], true)
    }
}
