use std::{env, fmt};

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Identifier for an exchange order.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub i64);

impl OrderId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> i64 {
        self.0
    }
}

impl From<i64> for OrderId {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl From<OrderId> for i64 {
    fn from(value: OrderId) -> Self {
        value.into_inner()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session token that keys the user data stream.
///
/// Owned by the session lifecycle and never persisted. `Debug` is redacted so the
/// token does not leak into logs.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ListenKey {
    #[serde(rename = "listenKey")]
    key: String,
}

impl ListenKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for ListenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible: String = self.key.chars().take(6).collect();
        write!(f, "ListenKey({visible}…)")
    }
}

/// API key pair used for REST calls.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Reads `APX_API_KEY` / `APX_API_SECRET`.
    pub fn from_env() -> Option<Self> {
        let key = env::var("APX_API_KEY").ok()?.trim().to_string();
        let secret = env::var("APX_API_SECRET").ok()?.trim().to_string();
        if key.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self::new(key, secret))
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Full point-in-time account state as returned by `GET fapi/v2/account`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountSnapshot {
    pub fee_tier: i32,
    pub can_trade: bool,
    pub can_deposit: bool,
    pub can_withdraw: bool,
    pub update_time: i64,
    pub total_initial_margin: Decimal,
    pub total_maint_margin: Decimal,
    pub total_wallet_balance: Decimal,
    pub total_unrealized_profit: Decimal,
    pub total_margin_balance: Decimal,
    pub total_position_initial_margin: Decimal,
    pub total_open_order_initial_margin: Decimal,
    pub total_cross_wallet_balance: Decimal,
    pub total_cross_un_pnl: Decimal,
    pub available_balance: Decimal,
    pub max_withdraw_amount: Decimal,
    pub assets: Vec<BalanceRecord>,
    pub positions: Vec<PositionRecord>,
}

impl AccountSnapshot {
    pub fn balance(&self, asset: &str) -> Option<&BalanceRecord> {
        self.assets.iter().find(|record| record.asset == asset)
    }

    pub fn position(&self, symbol: &str) -> Option<&PositionRecord> {
        self.positions.iter().find(|record| record.symbol == symbol)
    }

    pub(crate) fn balance_mut(&mut self, asset: &str) -> Option<&mut BalanceRecord> {
        self.assets.iter_mut().find(|record| record.asset == asset)
    }

    pub(crate) fn position_mut(&mut self, symbol: &str) -> Option<&mut PositionRecord> {
        self.positions
            .iter_mut()
            .find(|record| record.symbol == symbol)
    }
}

/// Per-asset balance. Only `wallet_balance` and `cross_wallet_balance` are touched by
/// stream updates, everything else is refreshed with the next snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BalanceRecord {
    pub asset: String,
    pub wallet_balance: Decimal,
    pub unrealized_profit: Decimal,
    pub margin_balance: Decimal,
    pub maint_margin: Decimal,
    pub initial_margin: Decimal,
    pub position_initial_margin: Decimal,
    pub open_order_initial_margin: Decimal,
    pub cross_wallet_balance: Decimal,
    pub cross_un_pnl: Decimal,
    pub available_balance: Decimal,
    pub max_withdraw_amount: Decimal,
}

/// Per-symbol position. Leverage and margin figures keep their REST value until the
/// next snapshot.
///
/// The mirror assumes one record per symbol (one-way position mode). In hedge mode the
/// account holds a `LONG` and a `SHORT` record for the same symbol, and stream updates
/// for either side land on the first of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PositionRecord {
    pub symbol: String,
    pub initial_margin: Decimal,
    pub maint_margin: Decimal,
    pub unrealized_profit: Decimal,
    pub position_initial_margin: Decimal,
    pub open_order_initial_margin: Decimal,
    pub leverage: Decimal,
    pub isolated: bool,
    pub entry_price: Decimal,
    pub max_notional: Decimal,
    pub position_side: String,
    #[serde(rename = "positionAmt")]
    pub position_amount: Decimal,
}

/// An executed fill taken from the order update stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeFill {
    pub symbol: String,
    /// Lowercase, e.g. `"buy"`.
    pub side: String,
    pub order_id: OrderId,
    pub is_maker: bool,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_asset: Option<String>,
    pub trade_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

pub(crate) fn timestamp_from_ms(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
