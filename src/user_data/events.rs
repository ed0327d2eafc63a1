//! Records decoded from the user data stream.
//!
//! The reader only understands the generic envelope ([`RawEvent`]): an object with an
//! event kind `e` and an event time `E`. The dispatcher converts that envelope once into
//! a [`UserDataEvent`], after which no further field checks are needed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    errors::{StreamError, StreamResult},
    types::{timestamp_from_ms, OrderId, TradeFill},
};

pub const ACCOUNT_UPDATE: &str = "ACCOUNT_UPDATE";
pub const ORDER_TRADE_UPDATE: &str = "ORDER_TRADE_UPDATE";
pub const LISTEN_KEY_EXPIRED: &str = "listenKeyExpired";

const EXECUTION_TRADE: &str = "TRADE";
const MARGIN_TYPE_ISOLATED: &str = "isolated";

/// Only the exact lower-case `"isolated"` counts as isolated margin, anything else is cross.
pub fn is_isolated_margin(margin_type: &str) -> bool {
    margin_type == MARGIN_TYPE_ISOLATED
}

/// Generic keyed record as it came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent(Map<String, Value>);

impl RawEvent {
    pub fn decode(frame: &str) -> StreamResult<Self> {
        let value: Value =
            serde_json::from_str(frame).map_err(|err| StreamError::Decode(err.to_string()))?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StreamError::Decode(format!(
                "expected a JSON object, got {}",
                kind_of(&other)
            ))),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("e").and_then(Value::as_str)
    }

    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        self.0
            .get("E")
            .and_then(Value::as_i64)
            .and_then(timestamp_from_ms)
    }

    /// A record is stale when its event time is more than `max_age` before `now`.
    /// Records without an event time cannot be judged and are never stale.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let Some(event_time) = self.event_time() else {
            return false;
        };
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now.signed_duration_since(event_time) > max_age,
            Err(_) => false,
        }
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// One validated stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum UserDataEvent {
    Account(AccountUpdate),
    Trade(TradeFill),
    /// Order lifecycle update that is not an execution (new, canceled, expired, ...).
    OrderLifecycle { execution_type: String },
    ListenKeyExpired,
    Ignored { kind: Option<String> },
}

impl UserDataEvent {
    /// Classifies `raw` by its event kind. Never fails: anything unrecognised or
    /// malformed ends up as [`UserDataEvent::Ignored`].
    pub fn classify(raw: RawEvent) -> Self {
        let event_time = raw.event_time();
        let kind = raw.kind().map(str::to_owned);
        let mut map = raw.into_inner();
        match kind.as_deref() {
            Some(ACCOUNT_UPDATE) => match map.remove("a") {
                Some(payload) => UserDataEvent::Account(AccountUpdate::from_payload(payload)),
                None => UserDataEvent::Ignored { kind },
            },
            Some(ORDER_TRADE_UPDATE) => match map.remove("o") {
                Some(order) => classify_order_update(order, event_time),
                None => UserDataEvent::Ignored { kind },
            },
            Some(LISTEN_KEY_EXPIRED) => UserDataEvent::ListenKeyExpired,
            _ => UserDataEvent::Ignored { kind },
        }
    }
}

fn classify_order_update(order: Value, event_time: Option<DateTime<Utc>>) -> UserDataEvent {
    let execution_type = order
        .get("x")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    if execution_type != EXECUTION_TRADE {
        return UserDataEvent::OrderLifecycle { execution_type };
    }
    let Some(timestamp) = event_time else {
        tracing::debug!("dropping trade execution without event time");
        return UserDataEvent::Ignored {
            kind: Some(ORDER_TRADE_UPDATE.to_owned()),
        };
    };
    match serde_json::from_value::<TradeExecution>(order) {
        Ok(execution) => UserDataEvent::Trade(execution.into_fill(timestamp)),
        Err(err) => {
            tracing::debug!(error = %err, "dropping malformed trade execution");
            UserDataEvent::Ignored {
                kind: Some(ORDER_TRADE_UPDATE.to_owned()),
            }
        }
    }
}

/// Balance and position changes carried by an `ACCOUNT_UPDATE`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountUpdate {
    pub reason: Option<String>,
    pub balances: Vec<BalanceUpdate>,
    pub positions: Vec<PositionUpdate>,
}

impl AccountUpdate {
    /// Items are validated one by one; a malformed item is skipped without affecting
    /// its siblings.
    fn from_payload(payload: Value) -> Self {
        let reason = payload
            .get("m")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Self {
            reason,
            balances: parse_items(payload.get("B")),
            positions: parse_items(payload.get("P")),
        }
    }
}

fn parse_items<T>(items: Option<&Value>) -> Vec<T>
where
    T: for<'de> Deserialize<'de>,
{
    let Some(Value::Array(items)) = items else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match T::deserialize(item) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed account update item");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BalanceUpdate {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "wb")]
    pub wallet_balance: Decimal,
    #[serde(rename = "cw")]
    pub cross_wallet_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PositionUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "pa")]
    pub amount: Decimal,
    #[serde(rename = "ep")]
    pub entry_price: Decimal,
    #[serde(rename = "up")]
    pub unrealized_pnl: Decimal,
    #[serde(rename = "mt")]
    pub margin_type: String,
    #[serde(rename = "ps")]
    pub position_side: String,
}

impl PositionUpdate {
    /// Only the exact string `"isolated"` counts as isolated margin.
    pub fn is_isolated(&self) -> bool {
        is_isolated_margin(&self.margin_type)
    }
}

#[derive(Debug, Deserialize)]
struct TradeExecution {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "m")]
    is_maker: bool,
    #[serde(rename = "L")]
    price: Decimal,
    #[serde(rename = "l")]
    quantity: Decimal,
    #[serde(rename = "n")]
    fee: Decimal,
    #[serde(rename = "N", default)]
    fee_asset: Option<String>,
    #[serde(rename = "t", default)]
    trade_id: Option<i64>,
}

impl TradeExecution {
    fn into_fill(self, timestamp: DateTime<Utc>) -> TradeFill {
        TradeFill {
            symbol: self.symbol,
            side: self.side.to_lowercase(),
            order_id: OrderId::new(self.order_id),
            is_maker: self.is_maker,
            price: self.price,
            quantity: self.quantity,
            fee: self.fee,
            fee_asset: self.fee_asset,
            trade_id: self.trade_id,
            timestamp,
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
