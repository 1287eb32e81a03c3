// =============================================================================
// Broker gateway — the executor's only door to the real brokerage account
// (SPEC_FULL.md §4.3, §6 "Broker").
// =============================================================================
//
// [`BrokerGateway`] is deliberately thin: preview, place, poll-status, cancel,
// plus the authentication lifecycle the executor must drive before a
// preview+place sequence (SPEC_FULL.md §7 "Token expiry mid-sequence"). Two
// implementations exist: [`live::LiveBroker`] talks to the real brokerage
// over HTTP, [`paper::PaperBroker`] simulates fills against an in-memory
// ledger. The executor is written against the trait alone so the same code
// path drives both trading modes.
//
// =============================================================================

pub mod live;
pub mod paper;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{OrderStatus, OrderType, Side};

/// The brokerage account the executor trades against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id_key: String,
    pub cash_available: f64,
    pub portfolio_value: f64,
}

/// Result of `preview_order` — must be passed back into `place_order` so the
/// broker can bind the placed order to the previewed terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewResult {
    pub preview_id: String,
    pub estimated_commission: f64,
    pub estimated_total: f64,
}

/// Result of `place_order` — the broker-assigned order id the caller then
/// polls with `get_order_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceResult {
    pub order_id: String,
    pub status: OrderStatus,
}

/// A single poll of an order's lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderStatusResult {
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
}

/// One held position as reported by the broker itself — the ground truth the
/// executor's close-position subroutine consults in `TradingMode::Live`
/// rather than trusting its own local cache (SPEC_FULL.md §4.3
/// "Close-position subroutine (live)", §6 `get_account_positions`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRow {
    pub symbol: String,
    pub quantity: f64,
}

/// What the executor depends on, regardless of trading mode.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Cheap liveness check: does the broker currently hold a token that
    /// would be accepted (grounded on `etrade_client.py::is_authenticated`,
    /// which actively probes with a real read call rather than just checking
    /// a local expiry timestamp).
    async fn is_authenticated(&self) -> bool;

    /// Proactively renew the token before starting a preview+place sequence
    /// (`etrade_client.py::ensure_authenticated`). A renewal failure is not
    /// itself fatal as long as the existing token still authenticates.
    async fn ensure_authenticated(&self) -> Result<bool>;

    async fn get_account(&self) -> Result<Account>;

    /// The broker's own view of every held position, keyed by ticker symbol.
    /// The executor's close subroutine uses this (not its local position map)
    /// as the quantity to sell in `TradingMode::Live`.
    async fn get_account_positions(&self) -> Result<Vec<PositionRow>>;

    async fn preview_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        order_type: OrderType,
    ) -> Result<PreviewResult>;

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        order_type: OrderType,
        preview: Option<&PreviewResult>,
    ) -> Result<PlaceResult>;

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusResult>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    async fn get_quote(&self, symbol: &str) -> Result<f64>;
}
