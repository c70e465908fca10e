//! Record types held by the local store.
//!
//! Amounts are whole Ugandan shillings (`i64`). Identifiers are strings:
//! `local_id` is a client-generated UUID, `server_id` is whatever the
//! remote API assigned and is write-once.

use serde::{Deserialize, Serialize};

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored
/// as TEXT.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::error::StoreError::Corrupt(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    DineIn,
    Takeaway,
}

text_enum!(OrderType {
    DineIn => "dine_in",
    Takeaway => "takeaway",
});

/// Persisted kitchen/lifecycle status. The UI's "ready" is stored as
/// `AwaitingPayment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Preparing,
    AwaitingPayment,
    Served,
    Cancelled,
}

text_enum!(OrderStatus {
    Pending => "pending",
    Preparing => "preparing",
    AwaitingPayment => "awaiting_payment",
    Served => "served",
    Cancelled => "cancelled",
});

impl OrderStatus {
    /// Map a UI-level status label onto the persisted value.
    pub fn from_ui(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "preparing" => Some(OrderStatus::Preparing),
            "ready" | "awaiting_payment" => Some(OrderStatus::AwaitingPayment),
            "served" => Some(OrderStatus::Served),
            "cancelled" | "canceled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

text_enum!(SyncStatus {
    Pending => "pending",
    Syncing => "syncing",
    Synced => "synced",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    MtnMomo,
    AirtelMoney,
}

text_enum!(PaymentMethod {
    Cash => "cash",
    MtnMomo => "mtn_momo",
    AirtelMoney => "airtel_money",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub local_id: String,
    pub server_id: Option<String>,
    pub order_number: String,
    pub order_type: OrderType,
    pub table_id: Option<String>,
    pub shift_id: String,
    pub terminal_id: String,
    pub created_by_staff_id: String,
    pub status: OrderStatus,
    pub subtotal_ugx: i64,
    pub tax_ugx: i64,
    pub total_ugx: i64,
    pub sync_status: SyncStatus,
    pub is_offline_served: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Catalog snapshot copied onto an order line at the time it is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub product_id: String,
    pub product_name: String,
    pub unit_price_ugx: i64,
}

/// Optional line details captured alongside the product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOptions {
    pub size: Option<String>,
    pub modifier: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub local_id: String,
    pub server_id: Option<String>,
    pub order_local_id: String,
    pub order_server_id: Option<String>,
    pub product_id: String,
    pub product_name: String,
    pub unit_price_ugx: i64,
    pub quantity: i64,
    pub line_total_ugx: i64,
    pub size: Option<String>,
    pub modifier: Option<String>,
    pub notes: Option<String>,
    pub sort_order: i64,
    pub sync_status: SyncStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub local_id: String,
    pub server_id: Option<String>,
    pub order_local_id: String,
    pub order_server_id: Option<String>,
    pub amount_ugx: i64,
    pub change_ugx: Option<i64>,
    pub method: PaymentMethod,
    pub created_by_staff_id: String,
    pub terminal_id: String,
    pub client_request_id: String,
    pub sync_status: SyncStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub last_sync_at: Option<String>,
    pub pending_count: i64,
    pub failed_count: i64,
    pub updated_at: Option<String>,
}

/// Current RFC 3339 timestamp with millisecond precision, so TEXT ordering
/// matches chronological ordering.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
