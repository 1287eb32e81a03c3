// =============================================================================
// Paper broker — simulated fills against an in-memory ledger.
// =============================================================================
//
// Grounded on `original_source/src/trading_bot/execution_mixin.py`'s
// `_execute_paper_trade` / `positions_mixin.py`'s `_close_paper_position`
// (cash ledger, instant fill) and `smart_strategy.py`'s slippage model
// (buys fill above quote, sells fill below quote, by `slippage_pct`).
//
// Paper orders fill synchronously inside `place_order` — there is no broker
// round-trip to poll, so `get_order_status` just returns the outcome
// recorded at placement time.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, instrument};

use crate::market_data::MarketDataGateway;
use crate::types::{OrderStatus, OrderType, Side};

use super::{Account, BrokerGateway, OrderStatusResult, PlaceResult, PositionRow, PreviewResult};

#[derive(Debug, Clone)]
struct PaperOrderRecord {
    status: OrderStatus,
    filled_qty: f64,
    avg_fill_price: f64,
}

struct PaperLedger {
    cash: f64,
    orders: HashMap<String, PaperOrderRecord>,
    /// Simulated holdings by symbol, so `get_account_positions` can answer the
    /// same way the live broker does (SPEC_FULL.md §6).
    positions: HashMap<String, f64>,
}

/// Simulated broker used in `TradingMode::Paper`. Fills are instant and
/// priced off the real-time market-data gateway with a configurable
/// slippage haircut (BUYs fill above the quote, SELLs below it).
pub struct PaperBroker {
    market_data: Arc<dyn MarketDataGateway>,
    slippage_pct: f64,
    next_order_id: AtomicU64,
    ledger: RwLock<PaperLedger>,
}

impl PaperBroker {
    pub fn new(market_data: Arc<dyn MarketDataGateway>, starting_capital: f64, slippage_pct: f64) -> Self {
        Self {
            market_data,
            slippage_pct,
            next_order_id: AtomicU64::new(1),
            ledger: RwLock::new(PaperLedger {
                cash: starting_capital,
                orders: HashMap::new(),
                positions: HashMap::new(),
            }),
        }
    }

    pub fn cash_balance(&self) -> f64 {
        self.ledger.read().cash
    }

    fn slipped_price(&self, quote: f64, side: Side) -> f64 {
        let factor = self.slippage_pct / 100.0;
        match side {
            Side::Buy => quote * (1.0 + factor),
            Side::Sell => quote * (1.0 - factor),
        }
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    /// The paper broker never needs a real session; it is always
    /// "authenticated".
    async fn is_authenticated(&self) -> bool {
        true
    }

    async fn ensure_authenticated(&self) -> Result<bool> {
        Ok(true)
    }

    async fn get_account(&self) -> Result<Account> {
        let cash = self.ledger.read().cash;
        Ok(Account {
            account_id_key: "paper".to_string(),
            cash_available: cash,
            portfolio_value: cash,
        })
    }

    #[instrument(skip(self), name = "paper_broker::preview_order")]
    async fn preview_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        _order_type: OrderType,
    ) -> Result<PreviewResult> {
        let quote = self.market_data.get_quote(symbol).await?;
        let price = self.slipped_price(quote.current, side);
        Ok(PreviewResult {
            preview_id: "paper".to_string(),
            estimated_commission: 0.0,
            estimated_total: price * quantity,
        })
    }

    #[instrument(skip(self), name = "paper_broker::get_account_positions")]
    async fn get_account_positions(&self) -> Result<Vec<PositionRow>> {
        Ok(self
            .ledger
            .read()
            .positions
            .iter()
            .map(|(symbol, quantity)| PositionRow { symbol: symbol.clone(), quantity: *quantity })
            .collect())
    }

    #[instrument(skip(self, _preview), name = "paper_broker::place_order")]
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        _order_type: OrderType,
        _preview: Option<&PreviewResult>,
    ) -> Result<PlaceResult> {
        let quote = self
            .market_data
            .get_quote(symbol)
            .await
            .context("paper fill requires a live quote")?;
        let fill_price = self.slipped_price(quote.current, side);
        let total_value = fill_price * quantity;

        {
            let mut ledger = self.ledger.write();
            match side {
                Side::Buy => {
                    ledger.cash -= total_value;
                    *ledger.positions.entry(symbol.to_string()).or_insert(0.0) += quantity;
                }
                Side::Sell => {
                    ledger.cash += total_value;
                    let remaining = ledger.positions.entry(symbol.to_string()).or_insert(0.0);
                    *remaining -= quantity;
                    if *remaining <= 0.0 {
                        ledger.positions.remove(symbol);
                    }
                }
            }
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed).to_string();
        let record = PaperOrderRecord {
            status: OrderStatus::Filled,
            filled_qty: quantity,
            avg_fill_price: fill_price,
        };
        self.ledger.write().orders.insert(order_id.clone(), record);

        info!(%symbol, %side, quantity, fill_price, "paper order filled");
        Ok(PlaceResult { order_id, status: OrderStatus::Filled })
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusResult> {
        let ledger = self.ledger.read();
        let record = ledger
            .orders
            .get(order_id)
            .with_context(|| format!("unknown paper order {order_id}"))?;
        Ok(OrderStatusResult {
            status: record.status,
            filled_qty: record.filled_qty,
            avg_fill_price: record.avg_fill_price,
        })
    }

    /// Paper fills happen synchronously at placement; there is nothing
    /// in-flight to cancel.
    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let exists = self.ledger.read().orders.contains_key(order_id);
        if !exists {
            bail!("unknown paper order {order_id}");
        }
        Ok(())
    }

    async fn get_quote(&self, symbol: &str) -> Result<f64> {
        Ok(self.market_data.get_quote(symbol).await?.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{DailyBar, DataSource, Quote};

    struct FixedGateway {
        price: f64,
    }

    #[async_trait]
    impl MarketDataGateway for FixedGateway {
        async fn get_quote(&self, _symbol: &str) -> Result<Quote> {
            Ok(Quote {
                current: self.price,
                today_open: self.price,
                prev_close: self.price,
                is_realtime: true,
                source: DataSource::Yahoo,
            })
        }

        async fn get_historical_bars(&self, _symbol: &str, _days: u32) -> Result<Vec<DailyBar>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn buy_applies_unfavorable_slippage_and_debits_cash() {
        let gw = Arc::new(FixedGateway { price: 100.0 });
        let broker = PaperBroker::new(gw, 10_000.0, 2.0); // 2% slippage

        let result = broker
            .place_order("BITU", Side::Buy, 10.0, OrderType::Market, None)
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);

        let status = broker.get_order_status(&result.order_id).await.unwrap();
        assert!((status.avg_fill_price - 102.0).abs() < 1e-9); // 100 * 1.02
        assert!((broker.cash_balance() - (10_000.0 - 1020.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_applies_unfavorable_slippage_and_credits_cash() {
        let gw = Arc::new(FixedGateway { price: 100.0 });
        let broker = PaperBroker::new(gw, 10_000.0, 2.0);

        let result = broker
            .place_order("SBIT", Side::Sell, 10.0, OrderType::Market, None)
            .await
            .unwrap();
        let status = broker.get_order_status(&result.order_id).await.unwrap();
        assert!((status.avg_fill_price - 98.0).abs() < 1e-9); // 100 * 0.98
        assert!((broker.cash_balance() - (10_000.0 + 980.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn get_account_positions_tracks_buys_and_clears_on_full_sell() {
        let gw = Arc::new(FixedGateway { price: 100.0 });
        let broker = PaperBroker::new(gw, 10_000.0, 0.0);

        broker.place_order("BITU", Side::Buy, 10.0, OrderType::Market, None).await.unwrap();
        let rows = broker.get_account_positions().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BITU");
        assert!((rows[0].quantity - 10.0).abs() < 1e-9);

        broker.place_order("BITU", Side::Sell, 10.0, OrderType::Market, None).await.unwrap();
        let rows = broker.get_account_positions().await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn unknown_order_id_status_lookup_errors() {
        let gw = Arc::new(FixedGateway { price: 100.0 });
        let broker = PaperBroker::new(gw, 10_000.0, 0.0);
        assert!(broker.get_order_status("nonexistent").await.is_err());
    }
}
