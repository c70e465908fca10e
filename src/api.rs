//! Remote order API client.
//!
//! [`OrderApi`] is the seam the sync engine replays mutations through.
//! [`HttpOrderApi`] talks to the admin dashboard over HTTPS, authenticated
//! with the terminal's API key. Every write carries the mutation's
//! `clientRequestId` as `Idempotency-Key` so a replay after a lost response
//! resolves to the resource the first attempt created.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{normalize_api_url, SyncConfig};
use crate::error::ApiError;
use crate::queue::{AddItemPayload, CreateOrderPayload, PaymentPayload, UpdateItemPayload, UpdateOrderStatusPayload};

/// Timeout used specifically for the lightweight health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait OrderApi: Send + Sync {
    /// Cheap reachability probe. `false` means the terminal is offline.
    async fn health(&self) -> bool;

    /// Create an order; returns its server id.
    async fn create_order(
        &self,
        client_request_id: &str,
        payload: &CreateOrderPayload,
    ) -> Result<String, ApiError>;

    /// Add a line to an existing server order; returns the item's server id.
    async fn add_item(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        payload: &AddItemPayload,
    ) -> Result<String, ApiError>;

    async fn update_item(
        &self,
        order_server_id: &str,
        item_server_id: &str,
        client_request_id: &str,
        payload: &UpdateItemPayload,
    ) -> Result<(), ApiError>;

    async fn update_order_status(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        payload: &UpdateOrderStatusPayload,
    ) -> Result<(), ApiError>;

    /// Record a cash payment; returns the payment's server id.
    async fn pay_cash(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        payload: &PaymentPayload,
    ) -> Result<String, ApiError>;

    async fn pay_momo(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        payload: &PaymentPayload,
    ) -> Result<String, ApiError>;

    async fn pay_airtel(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        payload: &PaymentPayload,
    ) -> Result<String, ApiError>;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a transport-level `reqwest::Error`.
fn transport_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout;
    }
    if err.is_connect() {
        return ApiError::Network(format!("Cannot reach order API at {url}"));
    }
    if err.is_builder() {
        return ApiError::Network(format!("Invalid order API URL: {url}"));
    }
    ApiError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Fallback message for a status code whose body carried none.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Order API endpoint not found".to_string(),
        409 => "Conflicting order state".to_string(),
        s if s >= 500 => format!("Order API server error (HTTP {s})"),
        s => format!("Unexpected response from order API (HTTP {s})"),
    }
}

/// Map a non-success response onto the failure taxonomy.
///
/// The body is read for `code` (or `errorCode`) and `error` / `message`.
pub fn classify_status(status: StatusCode, body: &str) -> ApiError {
    let json = serde_json::from_str::<Value>(body).ok();
    let field = |names: &[&str]| -> Option<String> {
        let json = json.as_ref()?;
        names
            .iter()
            .find_map(|name| json.get(*name).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let message = field(&["error", "message"])
        .or_else(|| {
            let trimmed = body.trim();
            (json.is_none() && !trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| status_message(status));
    let code = status.as_u16();

    match code {
        409 => ApiError::Conflict {
            code: field(&["code", "errorCode"]).unwrap_or_else(|| "CONFLICT".to_string()),
            message,
        },
        401 | 403 => ApiError::Unauthorized { status: code },
        408 | 429 => ApiError::Server {
            status: code,
            message,
        },
        s if s >= 500 => ApiError::Server { status: s, message },
        s => ApiError::Rejected { status: s, message },
    }
}

/// Pull a server id out of `{ "id": .. }` or `{ "data": { "id": .. } }`.
/// Numeric ids are accepted and stringified.
pub fn extract_server_id(body: &Value) -> Option<String> {
    let candidate = body
        .get("id")
        .or_else(|| body.get("data").and_then(|d| d.get("id")))?;
    match candidate {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpOrderApi {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpOrderApi {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_api_url(base_url),
            api_key: api_key.trim().to_string(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, ApiError> {
        Self::new(&config.api_base_url, &config.api_key, config.http_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Authenticated JSON request. Returns the parsed body, or `Null` for an
    /// empty success response.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        idempotency_key: &str,
        body: &B,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, request_id = idempotency_key, "Order API request");

        let resp = self
            .client
            .request(method, &url)
            .header("X-POS-API-Key", &self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        if !status.is_success() {
            let err = classify_status(status, &body_text);
            warn!(url = %url, status = status.as_u16(), error = %err, "Order API request failed");
            return Err(err);
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| ApiError::Decode(format!("Invalid JSON from order API: {e}")))
    }

    async fn send_for_id<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        idempotency_key: &str,
        body: &B,
    ) -> Result<String, ApiError> {
        let value = self.send(method, path, idempotency_key, body).await?;
        extract_server_id(&value)
            .ok_or_else(|| ApiError::Decode(format!("response to {path} carried no id")))
    }
}

/// Request body: the payload plus its idempotency token.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WithRequestId<'a, P: Serialize> {
    client_request_id: &'a str,
    #[serde(flatten)]
    payload: &'a P,
}

#[async_trait]
impl OrderApi for HttpOrderApi {
    async fn health(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        let start = Instant::now();
        let resp = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => {
                info!(latency_ms = start.elapsed().as_millis() as u64, "Order API reachable");
                true
            }
            Ok(r) => {
                warn!(status = r.status().as_u16(), "Order API health check failed");
                false
            }
            Err(e) => {
                debug!(error = %transport_error(&self.base_url, &e), "Order API unreachable");
                false
            }
        }
    }

    async fn create_order(
        &self,
        client_request_id: &str,
        payload: &CreateOrderPayload,
    ) -> Result<String, ApiError> {
        let body = WithRequestId {
            client_request_id,
            payload,
        };
        self.send_for_id(Method::POST, "/api/pos/orders", client_request_id, &body)
            .await
    }

    async fn add_item(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        payload: &AddItemPayload,
    ) -> Result<String, ApiError> {
        let body = WithRequestId {
            client_request_id,
            payload,
        };
        let path = format!("/api/pos/orders/{order_server_id}/items");
        self.send_for_id(Method::POST, &path, client_request_id, &body)
            .await
    }

    async fn update_item(
        &self,
        order_server_id: &str,
        item_server_id: &str,
        client_request_id: &str,
        payload: &UpdateItemPayload,
    ) -> Result<(), ApiError> {
        let body = WithRequestId {
            client_request_id,
            payload,
        };
        let path = format!("/api/pos/orders/{order_server_id}/items/{item_server_id}");
        self.send(Method::PATCH, &path, client_request_id, &body)
            .await
            .map(|_| ())
    }

    async fn update_order_status(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        payload: &UpdateOrderStatusPayload,
    ) -> Result<(), ApiError> {
        let body = WithRequestId {
            client_request_id,
            payload,
        };
        let path = format!("/api/pos/orders/{order_server_id}/status");
        self.send(Method::PATCH, &path, client_request_id, &body)
            .await
            .map(|_| ())
    }

    async fn pay_cash(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        payload: &PaymentPayload,
    ) -> Result<String, ApiError> {
        let body = WithRequestId {
            client_request_id,
            payload,
        };
        let path = format!("/api/pos/orders/{order_server_id}/payments/cash");
        self.send_for_id(Method::POST, &path, client_request_id, &body)
            .await
    }

    async fn pay_momo(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        payload: &PaymentPayload,
    ) -> Result<String, ApiError> {
        let body = WithRequestId {
            client_request_id,
            payload,
        };
        let path = format!("/api/pos/orders/{order_server_id}/payments/momo");
        self.send_for_id(Method::POST, &path, client_request_id, &body)
            .await
    }

    async fn pay_airtel(
        &self,
        order_server_id: &str,
        client_request_id: &str,
        payload: &PaymentPayload,
    ) -> Result<String, ApiError> {
        let body = WithRequestId {
            client_request_id,
            payload,
        };
        let path = format!("/api/pos/orders/{order_server_id}/payments/airtel");
        self.send_for_id(Method::POST, &path, client_request_id, &body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, PaymentMethod};
    use serde_json::json;

    #[test]
    fn test_classify_conflict_reads_code() {
        let err = classify_status(
            StatusCode::CONFLICT,
            r#"{"code":"TABLE_OCCUPIED","error":"Table 4 already has an open order"}"#,
        );
        assert_eq!(
            err,
            ApiError::Conflict {
                code: "TABLE_OCCUPIED".into(),
                message: "Table 4 already has an open order".into(),
            }
        );

        let bare = classify_status(StatusCode::CONFLICT, "");
        assert_eq!(bare.conflict_code(), Some("CONFLICT"));
    }

    #[test]
    fn test_classify_status_families() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, "{}"),
            ApiError::Unauthorized { status: 401 }
        );
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::Server { status: 429, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "upstream down"),
            ApiError::Server { status: 502, ref message } if message == "upstream down"
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, r#"{"message":"quantity < 1"}"#),
            ApiError::Rejected { status: 422, ref message } if message == "quantity < 1"
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            ApiError::Rejected { status: 404, ref message } if message == "Order API endpoint not found"
        ));
    }

    #[test]
    fn test_extract_server_id() {
        assert_eq!(extract_server_id(&json!({"id": "S1"})), Some("S1".into()));
        assert_eq!(
            extract_server_id(&json!({"data": {"id": 42}})),
            Some("42".into())
        );
        assert_eq!(extract_server_id(&json!({"id": ""})), None);
        assert_eq!(extract_server_id(&Value::Null), None);
    }

    #[test]
    fn test_request_body_carries_request_id() {
        let payload = UpdateOrderStatusPayload {
            order_local_id: "L1".into(),
            status: OrderStatus::AwaitingPayment,
        };
        let body = serde_json::to_value(WithRequestId {
            client_request_id: "req-1",
            payload: &payload,
        })
        .unwrap();
        assert_eq!(body["clientRequestId"], "req-1");
        assert_eq!(body["orderLocalId"], "L1");
        assert_eq!(body["status"], "awaiting_payment");

        let pay = PaymentPayload {
            payment_local_id: "P1".into(),
            order_local_id: "L1".into(),
            amount_ugx: 13_000,
            change_ugx: Some(2_000),
            method: PaymentMethod::Cash,
            created_by_staff_id: "staff-1".into(),
            terminal_id: "term-1".into(),
        };
        let body = serde_json::to_value(WithRequestId {
            client_request_id: "req-2",
            payload: &pay,
        })
        .unwrap();
        assert_eq!(body["amountUgx"], 13_000);
        assert_eq!(body["changeUgx"], 2_000);
        assert_eq!(body["method"], "cash");
    }

    #[test]
    fn test_new_normalizes_base_url() {
        let api = HttpOrderApi::new("pos.example.com/api/", " key ", Duration::from_secs(5)).unwrap();
        assert_eq!(api.base_url(), "https://pos.example.com");
        assert_eq!(api.api_key, "key");
    }
}
