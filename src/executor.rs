// =============================================================================
// Order executor — the concurrency- and failure-critical path that reconciles
// intended positions with actual broker state (SPEC_FULL.md §4.3).
// =============================================================================
//
// This is the hard core. Every operation that mutates the position map, the
// daily trade log, or the hedge controller's tracked position acquires
// `ExecutorCore::state`, a single `tokio::sync::Mutex<ExecutorState>`. The
// lock is held across the broker round-trips each compound operation needs
// (close-then-open for reversal, close-all-then-clear for the EOD sweep,
// tier-triggered hedge adds) but released across the human-approval wait,
// which can run for minutes — holding a process-wide mutex across that would
// serialize every other scheduled job behind one Telegram response.
//
// The state mutex is a `tokio::sync::Mutex`, not a `parking_lot::Mutex`:
// every compound operation below awaits broker calls while its guard is
// still live, and a `parking_lot::MutexGuard` held across an `.await` point
// makes the enclosing future `!Send` (this crate's `parking_lot` dependency
// does not enable the `send_guard` feature), which the scheduler's job
// futures and the `tokio::spawn` in `main.rs` both require. `tokio::sync::Mutex`'s
// guard is `Send` as long as the guarded type is, so the same lock-held-
// across-await shape that `parking_lot` forbids is exactly what this type is
// for.
//
// `tokio::sync::Mutex` is not reentrant either, so `check_and_execute_reversal`
// and `close_all_positions`, which both need to close a position, cannot
// simply call the public `close_position` (it would deadlock re-acquiring
// the same lock). Instead a private `close_position_locked` takes the
// already-held guard's data directly; the public `close_position` acquires
// the lock once and calls it, and the compound callers acquire their own
// guard once and call it per instrument. This is the guard-passing pattern
// SPEC_FULL.md §4.3 resolves the spec's "reentrant position mutex"
// requirement into, without a hand-rolled reentrant lock type.
//
// Both trading modes drive the exact same code below: `BrokerGateway` is a
// trait object, and `broker/paper.rs`'s simulated fills are synchronous and
// always `Filled`, so the fill-polling loop here degenerates to a single
// iteration in paper mode rather than needing a separate code path.
//
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::approval::ApprovalChannel;
use crate::broker::BrokerGateway;
use crate::config::RuntimeConfig;
use crate::hedge::TrailingHedgeManager;
use crate::market_data::MarketDataGateway;
use crate::persistence::{LogLevel, Persistence};
use crate::signal_engine::{Bar, Quote as SignalQuote, Signal, SignalEngine};
use crate::types::{ApprovalMode, ApprovalResult, Instrument, OrderStatus, OrderType, Side, SignalKind, TradingMode};

/// Exchange-local calendar the scheduler and executor both reason in
/// (SPEC_FULL.md §4.2 "backed by a real-time clock in the exchange time
/// zone").
pub const EXCHANGE_TZ: Tz = chrono_tz::America::New_York;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("signal already traded today")]
    Duplicate,
    #[error("insufficient capital to size a position")]
    InsufficientCapital,
    #[error("approval rejected")]
    Rejected,
    #[error("approval timed out")]
    ApprovalTimeout,
    #[error("broker authentication failed")]
    AuthFailure,
    #[error("order rejected by broker")]
    OrderRejected,
    #[error("order cancelled")]
    OrderCancelled,
    #[error("order expired")]
    OrderExpired,
    #[error("no open position in {0}")]
    NoPosition(Instrument),
    #[error("broker reported zero quantity to close")]
    ZeroQuantity,
    #[error("broker error: {0}")]
    Broker(String),
}

/// What the executor actually did. Distinct from `Side` because a no-op and a
/// degraded hold are first-class outcomes, not errors (SPEC_FULL.md §4.3
/// `execute_signal` contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecAction {
    Buy,
    Sell,
    None,
    Hold,
}

/// Result of any executor operation that places or closes an order.
#[derive(Debug, Clone, Serialize)]
pub struct TradeResult {
    pub success: bool,
    pub signal: SignalKind,
    pub instrument: Option<Instrument>,
    pub action: ExecAction,
    pub shares: f64,
    pub fill_price: f64,
    pub total_value: f64,
    pub order_id: Option<String>,
    pub error: Option<String>,
    pub is_paper: bool,
}

impl TradeResult {
    fn no_action(signal: SignalKind) -> Self {
        Self {
            success: true,
            signal,
            instrument: None,
            action: ExecAction::None,
            shares: 0.0,
            fill_price: 0.0,
            total_value: 0.0,
            order_id: None,
            error: None,
            is_paper: false,
        }
    }

    fn hold(signal: SignalKind, instrument: Option<Instrument>) -> Self {
        Self {
            success: true,
            signal,
            instrument,
            action: ExecAction::Hold,
            shares: 0.0,
            fill_price: 0.0,
            total_value: 0.0,
            order_id: None,
            error: None,
            is_paper: false,
        }
    }

    fn failure(signal: SignalKind, instrument: Option<Instrument>, err: ExecutionError) -> Self {
        Self {
            success: false,
            signal,
            instrument,
            action: ExecAction::None,
            shares: 0.0,
            fill_price: 0.0,
            total_value: 0.0,
            order_id: None,
            error: Some(err.to_string()),
            is_paper: false,
        }
    }
}

/// The executor's own record of a held instrument — the "local position map"
/// of SPEC_FULL.md §3/§4.3. Distinct from whatever the broker itself reports;
/// reconciled against it only in the live close subroutine.
#[derive(Debug, Clone)]
struct Position {
    instrument: Instrument,
    shares: f64,
    entry_price: f64,
    entry_time: DateTime<Utc>,
    source_signal: SignalKind,
}

/// Per-local-day bookkeeping the executor owns (SPEC_FULL.md §5 "Daily-state
/// maps: mutated only under the position mutex").
struct DailyState {
    date: Option<NaiveDate>,
    trades_today: HashMap<SignalKind, DateTime<Utc>>,
    reversal_triggered_today: bool,
}

impl DailyState {
    fn new() -> Self {
        Self {
            date: None,
            trades_today: HashMap::new(),
            reversal_triggered_today: false,
        }
    }

    fn roll_if_new_day(&mut self, today: NaiveDate) {
        if self.date != Some(today) {
            self.trades_today.clear();
            self.reversal_triggered_today = false;
            self.date = Some(today);
        }
    }
}

/// Everything mutated under the single position mutex: the local position
/// map, the daily trade/reversal bookkeeping, and the hedge controller (which
/// has no lock of its own — see `hedge.rs`'s module doc).
struct ExecutorState {
    positions: HashMap<Instrument, Position>,
    daily: DailyState,
    hedge: TrailingHedgeManager,
}

struct FillOutcome {
    order_id: String,
    filled_qty: f64,
    avg_price: f64,
    partial: bool,
    unconfirmed: bool,
}

const FILL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const FILL_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrates the broker, market data, approval channel, hedge controller,
/// and signal engine under the position mutex (SPEC_FULL.md §4.3, component
/// C8).
pub struct Executor {
    state: Mutex<ExecutorState>,
    config: Arc<RwLock<RuntimeConfig>>,
    broker: Arc<dyn BrokerGateway>,
    market_data: Arc<dyn MarketDataGateway>,
    approval: Arc<dyn ApprovalChannel>,
    persistence: Arc<Persistence>,
    signal_engine: Arc<SignalEngine>,
}

impl Executor {
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        broker: Arc<dyn BrokerGateway>,
        market_data: Arc<dyn MarketDataGateway>,
        approval: Arc<dyn ApprovalChannel>,
        persistence: Arc<Persistence>,
        signal_engine: Arc<SignalEngine>,
    ) -> Self {
        let hedge = TrailingHedgeManager::new(config.read().hedge.clone());
        Self {
            state: Mutex::new(ExecutorState {
                positions: HashMap::new(),
                daily: DailyState::new(),
                hedge,
            }),
            config,
            broker,
            market_data,
            approval,
            persistence,
            signal_engine,
        }
    }

    fn now_local(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&EXCHANGE_TZ)
    }

    fn mode(&self) -> TradingMode {
        self.config.read().bot.mode
    }

    fn symbol_of(&self, instrument: Instrument) -> String {
        self.config.read().symbol_for(instrument).to_string()
    }

    pub async fn current_holdings(&self) -> Vec<Instrument> {
        self.state.lock().await.positions.keys().copied().collect()
    }

    pub async fn hedge_status(&self) -> crate::hedge::HedgeStatus {
        self.state.lock().await.hedge.get_status()
    }

    // -------------------------------------------------------------------
    // Signal computation
    // -------------------------------------------------------------------

    /// Fetches the inputs `SignalEngine::today_signal` needs and asks it for
    /// today's signal. Never raises: a market-data failure flows straight
    /// through to the engine's own "data unavailable" CASH fallback.
    #[instrument(skip(self), name = "executor::compute_signal")]
    pub async fn compute_signal(&self) -> Signal {
        let now = self.now_local();
        let holdings = self.current_holdings().await;
        let strategy = self.config.read().strategy.clone();

        let l1_symbol = self.symbol_of(Instrument::L1);
        let l1_quote = self
            .market_data
            .get_quote(&l1_symbol)
            .await
            .ok()
            .map(|q| SignalQuote { current: q.current, today_open: q.today_open, is_realtime: q.is_realtime });

        let prev_bar = if strategy.mean_reversion_enabled {
            let underlying = self.config.read().reference_underlying.clone();
            match self.market_data.get_historical_bars(&underlying, 2).await {
                Ok(bars) => bars.last().map(|b| Bar { open: b.open, close: b.close }),
                Err(e) => {
                    warn!(error = %e, "failed to fetch previous-day bar for mean reversion");
                    None
                }
            }
        } else {
            None
        };

        self.signal_engine.today_signal(now, &holdings, &strategy, l1_quote, move || prev_bar)
    }

    /// Closes every currently held instrument directly (SPEC_FULL.md §4.1
    /// "CLOSE_LONG / CLOSE_SHORT"). This cannot route through
    /// `execute_signal`: that entry point's already-held-instrument check
    /// (step 3) degrades to `Hold` the moment the target is a position we
    /// already hold, which is true by construction for every close signal
    /// the sweep generates. `close_position` is the actual close primitive;
    /// `signal_engine.close_signal_for` still labels the `TradeResult` with
    /// the right `SignalKind` for the event log.
    pub async fn run_eod_sweep(&self) -> Vec<TradeResult> {
        let held = self.current_holdings().await;
        let mut results = Vec::with_capacity(held.len());
        for instrument in held {
            let signal_kind = self.signal_engine.close_signal_for(instrument).kind;
            let mut result = self.close_position(instrument).await;
            result.signal = signal_kind;
            results.push(result);
        }
        results
    }

    // -------------------------------------------------------------------
    // execute_signal
    // -------------------------------------------------------------------

    /// SPEC_FULL.md §4.3 "Execution algorithm for `execute_signal`".
    #[instrument(skip(self, signal), name = "executor::execute_signal")]
    pub async fn execute_signal(&self, signal: Option<Signal>, skip_approval: bool) -> TradeResult {
        let signal = match signal {
            Some(s) => s,
            None => self.compute_signal().await,
        };

        if signal.kind == SignalKind::Cash {
            return TradeResult::no_action(signal.kind);
        }
        if signal.kind == SignalKind::Hold {
            return TradeResult::hold(signal.kind, signal.target);
        }

        let now = Utc::now();
        let today = now.with_timezone(&EXCHANGE_TZ).date_naive();

        // Step 2: duplicate check.
        {
            let mut state = self.state.lock().await;
            state.daily.roll_if_new_day(today);
            if state.daily.trades_today.contains_key(&signal.kind) {
                self.persistence.log_event(
                    LogLevel::Warning,
                    "DUPLICATE_BLOCKED",
                    json!({ "signal": signal.kind.as_str() }),
                );
                return TradeResult::failure(signal.kind, signal.target, ExecutionError::Duplicate);
            }
        }

        let Some(target) = signal.target else {
            return TradeResult::no_action(signal.kind);
        };

        // Step 3: inspect holdings under the lock.
        let needs_reversal = {
            let state = self.state.lock().await;
            if state.positions.contains_key(&target) {
                return TradeResult::hold(signal.kind, Some(target));
            }
            !state.positions.is_empty()
        };

        // Step 4: price and size the target.
        let symbol = self.symbol_of(target);
        let price = match self.broker.get_quote(&symbol).await {
            Ok(p) => p,
            Err(e) => return TradeResult::failure(signal.kind, Some(target), ExecutionError::Broker(e.to_string())),
        };

        let account = match self.broker.get_account().await {
            Ok(a) => a,
            Err(e) => return TradeResult::failure(signal.kind, Some(target), ExecutionError::Broker(e.to_string())),
        };
        let (max_pct, max_usd, approval_mode) = {
            let cfg = self.config.read();
            (cfg.bot.max_position_pct, cfg.bot.max_position_usd, cfg.bot.approval_mode)
        };
        let budget = (account.cash_available * max_pct / 100.0).min(max_usd.unwrap_or(f64::MAX));
        let shares = (budget / price).floor();
        if shares <= 0.0 {
            return TradeResult::failure(signal.kind, Some(target), ExecutionError::InsufficientCapital);
        }
        let position_value = shares * price;

        // Step 5/6: approval.
        if approval_mode == ApprovalMode::Required && !skip_approval {
            let result = self
                .approval
                .request_approval(signal.kind, target, &signal.reason, shares, price, position_value)
                .await;

            match result {
                ApprovalResult::Approved => {}
                ApprovalResult::Rejected => {
                    return TradeResult::failure(signal.kind, Some(target), ExecutionError::Rejected);
                }
                ApprovalResult::Timeout => {
                    return TradeResult::failure(signal.kind, Some(target), ExecutionError::ApprovalTimeout);
                }
                ApprovalResult::Error => {
                    // Fail-secure in LIVE, fail-open in PAPER.
                    if self.mode() == TradingMode::Live {
                        return TradeResult::failure(signal.kind, Some(target), ExecutionError::AuthFailure);
                    }
                }
            }

            if needs_reversal {
                self.close_all_positions("switch").await;
            }
        } else {
            if approval_mode == ApprovalMode::NotifyOnly {
                self.approval
                    .send_message(&format!(
                        "{} signal: buying {shares:.2} {target} @ ~${price:.2} ({})",
                        signal.kind, signal.reason
                    ))
                    .await;
            }
            if needs_reversal {
                self.close_all_positions("switch").await;
            }
        }

        // Step 7: place the buy order.
        let outcome = match self.place_and_confirm(&symbol, Side::Buy, shares).await {
            Ok(o) => o,
            Err(e) => return TradeResult::failure(signal.kind, Some(target), e),
        };

        let fill_price = if outcome.unconfirmed {
            self.approval
                .notify_error(&format!(
                    "Fill unconfirmed for {target} order {}; tracking at the requested price. Verify at the broker.",
                    outcome.order_id
                ))
                .await;
            self.persistence.log_event(
                LogLevel::Warning,
                "FILL_UNCONFIRMED",
                json!({ "instrument": target.to_string(), "order_id": outcome.order_id }),
            );
            price
        } else {
            outcome.avg_price
        };
        let filled_qty = if outcome.unconfirmed { shares } else { outcome.filled_qty };

        if outcome.partial {
            self.persistence.log_event(
                LogLevel::Warning,
                "PARTIAL_FILL",
                json!({ "instrument": target.to_string(), "requested": shares, "filled": filled_qty }),
            );
            self.approval
                .notify_error(&format!(
                    "Partial fill on {target}: requested {shares:.2}, filled {filled_qty:.2}"
                ))
                .await;
        }

        // Step 8: record the fill.
        {
            let mut state = self.state.lock().await;
            state.positions.insert(
                target,
                Position { instrument: target, shares: filled_qty, entry_price: fill_price, entry_time: now, source_signal: signal.kind },
            );
            state.daily.trades_today.insert(signal.kind, now);
            state.hedge.register_position(target, filled_qty, fill_price);
        }

        if signal.kind == SignalKind::CrashDay {
            self.signal_engine.mark_crash_day_traded(today);
        }
        if signal.kind == SignalKind::PumpDay {
            self.signal_engine.mark_pump_day_traded(today);
        }

        self.persistence.log_event(
            LogLevel::Info,
            "TRADE_EXECUTED",
            json!({
                "signal": signal.kind.as_str(),
                "instrument": target.to_string(),
                "shares": filled_qty,
                "fill_price": fill_price,
                "reason": signal.reason,
            }),
        );
        self.approval
            .notify_trade_executed(&format!(
                "{}: bought {filled_qty:.2} {target} @ ${fill_price:.2} ({})",
                signal.kind, signal.reason
            ))
            .await;

        TradeResult {
            success: true,
            signal: signal.kind,
            instrument: Some(target),
            action: ExecAction::Buy,
            shares: filled_qty,
            fill_price,
            total_value: fill_price * filled_qty,
            order_id: Some(outcome.order_id),
            error: None,
            is_paper: self.mode() == TradingMode::Paper,
        }
    }

    // -------------------------------------------------------------------
    // close_position / close_all_positions
    // -------------------------------------------------------------------

    pub async fn close_position(&self, instrument: Instrument) -> TradeResult {
        let mut state = self.state.lock().await;
        self.close_position_locked(&mut state, instrument, "manual close").await
    }

    pub async fn close_all_positions(&self, reason: &str) -> Vec<TradeResult> {
        let mut state = self.state.lock().await;
        let instruments: Vec<Instrument> = state.positions.keys().copied().collect();
        let mut results = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            results.push(self.close_position_locked(&mut state, instrument, reason).await);
        }
        results
    }

    /// Takes the already-held guard's data directly rather than re-acquiring
    /// the lock, so `close_all_positions`/`check_and_execute_reversal` can
    /// close one or more instruments within a single lock acquisition
    /// (SPEC_FULL.md §4.3 "Reentrant mutex, resolved").
    async fn close_position_locked(&self, state: &mut ExecutorState, instrument: Instrument, reason: &str) -> TradeResult {
        let Some(position) = state.positions.get(&instrument).cloned() else {
            return TradeResult::failure(SignalKind::Cash, Some(instrument), ExecutionError::NoPosition(instrument));
        };

        let symbol = self.symbol_of(instrument);
        let mode = self.mode();

        let quantity = match mode {
            TradingMode::Live => match self.broker.get_account_positions().await {
                Ok(rows) => rows.into_iter().find(|r| r.symbol == symbol).map(|r| r.quantity).unwrap_or(0.0),
                Err(e) => return TradeResult::failure(SignalKind::Cash, Some(instrument), ExecutionError::Broker(e.to_string())),
            },
            TradingMode::Paper => position.shares,
        };

        if quantity <= 0.0 {
            return TradeResult::failure(SignalKind::Cash, Some(instrument), ExecutionError::ZeroQuantity);
        }

        let outcome = match self.place_and_confirm(&symbol, Side::Sell, quantity).await {
            Ok(o) => o,
            Err(e) => return TradeResult::failure(SignalKind::Cash, Some(instrument), e),
        };

        let fill_price = if outcome.unconfirmed {
            self.broker.get_quote(&symbol).await.unwrap_or(position.entry_price)
        } else {
            outcome.avg_price
        };
        let filled_qty = if outcome.unconfirmed { quantity } else { outcome.filled_qty };
        let realized_pnl = (fill_price - position.entry_price) * filled_qty;

        state.positions.remove(&instrument);

        // Both legs of a hedged position exit together (SPEC_FULL.md §4.4
        // "EOD behavior"): if this instrument is the hedge controller's
        // tracked primary leg and a hedge leg has accumulated shares, close
        // that leg too before resetting the ladder. This is a side effect
        // only — it is logged and notified but does not produce a second
        // top-level `TradeResult`, matching `close_position`'s single-result
        // public contract (see DESIGN.md).
        if let Some(tracked) = state.hedge.get_status().tracked {
            if tracked.instrument == instrument && tracked.hedge_shares > 0.0 {
                self.close_hedge_leg(tracked.hedge_instrument, tracked.hedge_shares).await;
            }
        }
        state.hedge.clear_position();

        self.persistence.log_event(
            LogLevel::Info,
            "POSITION_CLOSED",
            json!({
                "instrument": instrument.to_string(),
                "shares": filled_qty,
                "fill_price": fill_price,
                "realized_pnl": realized_pnl,
                "reason": reason,
            }),
        );
        self.approval
            .notify_position_closed(&format!(
                "Closed {filled_qty:.2} {instrument} @ ${fill_price:.2} (P&L ${realized_pnl:+.2}, {reason})"
            ))
            .await;

        TradeResult {
            success: true,
            signal: SignalKind::Cash,
            instrument: Some(instrument),
            action: ExecAction::Sell,
            shares: filled_qty,
            fill_price,
            total_value: fill_price * filled_qty,
            order_id: Some(outcome.order_id),
            error: None,
            is_paper: mode == TradingMode::Paper,
        }
    }

    /// Sells off the hedge leg's broker-reported quantity as a side effect of
    /// closing the primary leg it protects. Best-effort: failure here is
    /// logged but does not fail the primary close.
    async fn close_hedge_leg(&self, hedge_instrument: Instrument, hedge_shares: f64) {
        let symbol = self.symbol_of(hedge_instrument);
        let mode = self.mode();
        let quantity = match mode {
            TradingMode::Live => match self.broker.get_account_positions().await {
                Ok(rows) => rows.into_iter().find(|r| r.symbol == symbol).map(|r| r.quantity).unwrap_or(0.0),
                Err(_) => hedge_shares,
            },
            TradingMode::Paper => hedge_shares,
        };
        if quantity <= 0.0 {
            return;
        }

        match self.place_and_confirm(&symbol, Side::Sell, quantity).await {
            Ok(outcome) => {
                self.persistence.log_event(
                    LogLevel::Info,
                    "HEDGE_LEG_CLOSED",
                    json!({ "instrument": hedge_instrument.to_string(), "shares": outcome.filled_qty }),
                );
                self.approval
                    .notify_position_closed(&format!("Closed hedge leg {hedge_instrument} x{:.2}", outcome.filled_qty))
                    .await;
            }
            Err(e) => {
                warn!(%hedge_instrument, error = %e, "failed to close hedge leg alongside primary position");
                self.persistence.log_event(
                    LogLevel::Warning,
                    "HEDGE_LEG_CLOSE_FAILED",
                    json!({ "instrument": hedge_instrument.to_string(), "error": e.to_string() }),
                );
            }
        }
    }

    // -------------------------------------------------------------------
    // check_and_execute_hedge
    // -------------------------------------------------------------------

    #[instrument(skip(self), name = "executor::check_and_execute_hedge")]
    pub async fn check_and_execute_hedge(&self) -> Option<TradeResult> {
        let instrument = { self.state.lock().await.hedge.tracked_instrument()? };
        let symbol = self.symbol_of(instrument);
        let current_price = self.broker.get_quote(&symbol).await.ok()?;

        let hedge_order = {
            let mut state = self.state.lock().await;
            state.hedge.check_and_hedge(current_price)?
        };

        let hedge_symbol = self.symbol_of(hedge_order.instrument);
        let outcome = self.place_and_confirm(&hedge_symbol, Side::Buy, hedge_order.shares as f64).await.ok()?;

        {
            let mut state = self.state.lock().await;
            state.hedge.update_hedge_shares(hedge_order.tier_index, outcome.filled_qty.round() as u64);
        }

        self.persistence.log_event(
            LogLevel::Info,
            "HEDGE_TIER_TRIGGERED",
            json!({
                "tier_index": hedge_order.tier_index,
                "instrument": hedge_order.instrument.to_string(),
                "shares": outcome.filled_qty,
                "hedge_value": hedge_order.hedge_value,
            }),
        );
        self.approval
            .notify_trade_executed(&format!(
                "Hedge tier {} fired: bought {:.2} {}", hedge_order.tier_index, outcome.filled_qty, hedge_order.instrument
            ))
            .await;

        Some(TradeResult {
            success: true,
            signal: SignalKind::Cash,
            instrument: Some(hedge_order.instrument),
            action: ExecAction::Buy,
            shares: outcome.filled_qty,
            fill_price: outcome.avg_price,
            total_value: outcome.avg_price * outcome.filled_qty,
            order_id: Some(outcome.order_id),
            error: None,
            is_paper: self.mode() == TradingMode::Paper,
        })
    }

    // -------------------------------------------------------------------
    // check_and_execute_reversal
    // -------------------------------------------------------------------

    #[instrument(skip(self), name = "executor::check_and_execute_reversal")]
    pub async fn check_and_execute_reversal(&self) -> Option<TradeResult> {
        let now = Utc::now();
        let today = now.with_timezone(&EXCHANGE_TZ).date_naive();

        let mut state = self.state.lock().await;
        state.daily.roll_if_new_day(today);

        let (reversal_enabled, threshold) = {
            let cfg = self.config.read();
            (cfg.strategy.reversal_enabled, cfg.strategy.reversal_threshold)
        };
        if !reversal_enabled || state.daily.reversal_triggered_today {
            return None;
        }

        let long_position = state.positions.values().find(|p| p.instrument.is_long()).cloned()?;
        let instrument = long_position.instrument;

        let symbol = self.symbol_of(instrument);
        let current_price = self.broker.get_quote(&symbol).await.ok()?;
        let pnl_pct = (current_price - long_position.entry_price) / long_position.entry_price * 100.0;
        if pnl_pct > threshold {
            return None;
        }

        state.daily.reversal_triggered_today = true;

        let close_result = self.close_position_locked(&mut state, instrument, "reversal").await;
        if !close_result.success {
            state.daily.reversal_triggered_today = false;
            return Some(close_result);
        }

        let inverse = instrument.hedge_instrument();
        let inverse_symbol = self.symbol_of(inverse);
        let shares = long_position.shares;

        let outcome = match self.place_and_confirm(&inverse_symbol, Side::Buy, shares).await {
            Ok(o) => o,
            Err(e) => {
                self.persistence.log_event(
                    LogLevel::Critical,
                    "REVERSAL_PARTIAL_FAILURE",
                    json!({ "closed": instrument.to_string(), "error": e.to_string() }),
                );
                self.approval
                    .notify_error(&format!(
                        "REVERSAL PARTIAL FAILURE: closed {instrument} but failed to open {inverse}: {e}. Inspect the account manually."
                    ))
                    .await;
                return Some(close_result);
            }
        };

        state.positions.insert(
            inverse,
            Position { instrument: inverse, shares: outcome.filled_qty, entry_price: outcome.avg_price, entry_time: now, source_signal: SignalKind::Cash },
        );
        state.hedge.register_position(inverse, outcome.filled_qty, outcome.avg_price);

        self.persistence.log_event(
            LogLevel::Info,
            "REVERSAL_EXECUTED",
            json!({ "closed": instrument.to_string(), "opened": inverse.to_string(), "shares": outcome.filled_qty }),
        );
        self.approval
            .notify_trade_executed(&format!("Reversal: closed {instrument}, opened {inverse} x{:.2}", outcome.filled_qty))
            .await;

        Some(TradeResult {
            success: true,
            signal: SignalKind::Cash,
            instrument: Some(inverse),
            action: ExecAction::Buy,
            shares: outcome.filled_qty,
            fill_price: outcome.avg_price,
            total_value: outcome.avg_price * outcome.filled_qty,
            order_id: Some(outcome.order_id),
            error: None,
            is_paper: self.mode() == TradingMode::Paper,
        })
    }

    /// Proactively renews the broker's session token. Backs the scheduler's
    /// daily `broker_token_renewal` job (SPEC_FULL.md §4.2); a no-op success
    /// for `PaperBroker`, which is always authenticated.
    #[instrument(skip(self), name = "executor::ensure_broker_authenticated")]
    pub async fn ensure_broker_authenticated(&self) -> anyhow::Result<bool> {
        self.broker.ensure_authenticated().await
    }

    // -------------------------------------------------------------------
    // get_portfolio_value
    // -------------------------------------------------------------------

    pub async fn get_portfolio_value(&self) -> anyhow::Result<PortfolioSnapshot> {
        let account = self.broker.get_account().await?;
        let held: Vec<Position> = self.state.lock().await.positions.values().cloned().collect();

        let mut positions = Vec::with_capacity(held.len());
        for pos in held {
            let symbol = self.symbol_of(pos.instrument);
            let current_price = self.broker.get_quote(&symbol).await.unwrap_or(pos.entry_price);
            positions.push(PortfolioPositionValue {
                instrument: pos.instrument,
                shares: pos.shares,
                entry_price: pos.entry_price,
                current_price,
                market_value: current_price * pos.shares,
                unrealized_pnl: (current_price - pos.entry_price) * pos.shares,
            });
        }

        Ok(PortfolioSnapshot { cash: account.cash_available, positions })
    }

    // -------------------------------------------------------------------
    // Shared order-placement helper
    // -------------------------------------------------------------------

    /// `ensure_authenticated` → `preview_order` → `place_order` → fill
    /// polling (SPEC_FULL.md §4.3 "Live-order subroutine"). Identical for
    /// both trading modes: the paper broker answers every step synchronously
    /// with an already-`Filled` status, so the poll loop below exits on its
    /// first iteration in paper mode.
    async fn place_and_confirm(&self, symbol: &str, side: Side, quantity: f64) -> Result<FillOutcome, ExecutionError> {
        match self.broker.ensure_authenticated().await {
            Ok(true) => {}
            Ok(false) => return Err(ExecutionError::AuthFailure),
            Err(_) => return Err(ExecutionError::AuthFailure),
        }

        let preview = self
            .broker
            .preview_order(symbol, side, quantity, OrderType::Market)
            .await
            .map_err(|e| ExecutionError::Broker(e.to_string()))?;

        let placed = self
            .broker
            .place_order(symbol, side, quantity, OrderType::Market, Some(&preview))
            .await
            .map_err(|e| ExecutionError::Broker(e.to_string()))?;

        self.poll_fill(&placed.order_id, quantity).await
    }

    async fn poll_fill(&self, order_id: &str, requested: f64) -> Result<FillOutcome, ExecutionError> {
        let deadline = Instant::now() + FILL_POLL_TIMEOUT;

        loop {
            let status = self
                .broker
                .get_order_status(order_id)
                .await
                .map_err(|e| ExecutionError::Broker(e.to_string()))?;

            match status.status {
                OrderStatus::Filled | OrderStatus::Executed => {
                    return Ok(FillOutcome {
                        order_id: order_id.to_string(),
                        filled_qty: status.filled_qty,
                        avg_price: status.avg_fill_price,
                        partial: status.filled_qty < requested,
                        unconfirmed: false,
                    });
                }
                OrderStatus::Cancelled => return Err(ExecutionError::OrderCancelled),
                OrderStatus::Rejected => return Err(ExecutionError::OrderRejected),
                OrderStatus::Expired => return Err(ExecutionError::OrderExpired),
                OrderStatus::Pending => {
                    if Instant::now() >= deadline {
                        warn!(order_id, "fill poll timed out, falling back to estimate");
                        return Ok(FillOutcome {
                            order_id: order_id.to_string(),
                            filled_qty: requested,
                            avg_price: 0.0,
                            partial: false,
                            unconfirmed: true,
                        });
                    }
                    tokio::time::sleep(FILL_POLL_INTERVAL).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioPositionValue {
    pub instrument: Instrument,
    pub shares: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub cash: f64,
    pub positions: Vec<PortfolioPositionValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::CommandSurface;
    use crate::broker::{Account, OrderStatusResult, PlaceResult, PositionRow, PreviewResult};
    use crate::config::RuntimeConfig;
    use crate::market_data::{DailyBar, DataSource, Quote};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Minimal in-memory broker double: fills instantly at a fixed quote,
    /// tracks positions the way `broker::paper::PaperBroker` does, so the
    /// executor can be exercised without any of its crates. Uses
    /// `parking_lot::Mutex` rather than the executor's `tokio::sync::Mutex`:
    /// every access here is synchronous and local to the fake, with no
    /// `.await` held across a lock.
    struct FakeBroker {
        quote: SyncMutex<f64>,
        cash: SyncMutex<f64>,
        positions: SyncMutex<HashMap<String, f64>>,
        next_id: AtomicU64,
        fail_get_positions: std::sync::atomic::AtomicBool,
    }

    impl FakeBroker {
        fn new(quote: f64, cash: f64) -> Self {
            Self {
                quote: SyncMutex::new(quote),
                cash: SyncMutex::new(cash),
                positions: SyncMutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                fail_get_positions: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn set_quote(&self, q: f64) {
            *self.quote.lock() = q;
        }
    }

    #[async_trait]
    impl BrokerGateway for FakeBroker {
        async fn is_authenticated(&self) -> bool {
            true
        }
        async fn ensure_authenticated(&self) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn get_account(&self) -> anyhow::Result<Account> {
            let cash = *self.cash.lock();
            Ok(Account { account_id_key: "fake".into(), cash_available: cash, portfolio_value: cash })
        }
        async fn get_account_positions(&self) -> anyhow::Result<Vec<PositionRow>> {
            if self.fail_get_positions.load(Ordering::Relaxed) {
                anyhow::bail!("positions unavailable");
            }
            Ok(self.positions.lock().iter().map(|(s, q)| PositionRow { symbol: s.clone(), quantity: *q }).collect())
        }
        async fn preview_order(&self, _symbol: &str, _side: Side, quantity: f64, _t: OrderType) -> anyhow::Result<PreviewResult> {
            let price = *self.quote.lock();
            Ok(PreviewResult { preview_id: "p".into(), estimated_commission: 0.0, estimated_total: price * quantity })
        }
        async fn place_order(
            &self,
            symbol: &str,
            side: Side,
            quantity: f64,
            _t: OrderType,
            _preview: Option<&PreviewResult>,
        ) -> anyhow::Result<PlaceResult> {
            let price = *self.quote.lock();
            match side {
                Side::Buy => {
                    *self.cash.lock() -= price * quantity;
                    *self.positions.lock().entry(symbol.to_string()).or_insert(0.0) += quantity;
                }
                Side::Sell => {
                    *self.cash.lock() += price * quantity;
                    let mut positions = self.positions.lock();
                    if let Some(remaining) = positions.get_mut(symbol) {
                        *remaining -= quantity;
                        if *remaining <= 0.0 {
                            positions.remove(symbol);
                        }
                    }
                }
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
            Ok(PlaceResult { order_id: id, status: OrderStatus::Filled })
        }
        async fn get_order_status(&self, _order_id: &str) -> anyhow::Result<OrderStatusResult> {
            Ok(OrderStatusResult { status: OrderStatus::Filled, filled_qty: 0.0, avg_fill_price: *self.quote.lock() })
        }
        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_quote(&self, _symbol: &str) -> anyhow::Result<f64> {
            Ok(*self.quote.lock())
        }
    }

    /// `get_order_status` above ignores `order_id` and always answers the
    /// full requested quantity via `preview_order`'s caller — tests that need
    /// partial fills override this behavior with a dedicated broker.
    struct PartialFillBroker {
        inner: FakeBroker,
        requested: SyncMutex<f64>,
    }

    #[async_trait]
    impl BrokerGateway for PartialFillBroker {
        async fn is_authenticated(&self) -> bool {
            true
        }
        async fn ensure_authenticated(&self) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn get_account(&self) -> anyhow::Result<Account> {
            self.inner.get_account().await
        }
        async fn get_account_positions(&self) -> anyhow::Result<Vec<PositionRow>> {
            self.inner.get_account_positions().await
        }
        async fn preview_order(&self, symbol: &str, side: Side, quantity: f64, t: OrderType) -> anyhow::Result<PreviewResult> {
            *self.requested.lock() = quantity;
            self.inner.preview_order(symbol, side, quantity, t).await
        }
        async fn place_order(
            &self,
            symbol: &str,
            side: Side,
            quantity: f64,
            t: OrderType,
            preview: Option<&PreviewResult>,
        ) -> anyhow::Result<PlaceResult> {
            self.inner.place_order(symbol, side, quantity, t, preview).await
        }
        async fn get_order_status(&self, _order_id: &str) -> anyhow::Result<OrderStatusResult> {
            let requested = *self.requested.lock();
            Ok(OrderStatusResult {
                status: OrderStatus::Filled,
                filled_qty: requested * 0.5,
                avg_fill_price: *self.inner.quote.lock(),
            })
        }
        async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()> {
            self.inner.cancel_order(order_id).await
        }
        async fn get_quote(&self, symbol: &str) -> anyhow::Result<f64> {
            self.inner.get_quote(symbol).await
        }
    }

    struct FixedMarketData {
        price: f64,
    }

    #[async_trait]
    impl MarketDataGateway for FixedMarketData {
        async fn get_quote(&self, _symbol: &str) -> anyhow::Result<Quote> {
            Ok(Quote { current: self.price, today_open: self.price, prev_close: self.price, is_realtime: true, source: DataSource::Yahoo })
        }
        async fn get_historical_bars(&self, _symbol: &str, _days: u32) -> anyhow::Result<Vec<DailyBar>> {
            Ok(Vec::new())
        }
    }

    /// Approval channel that always approves instantly.
    struct AutoApprove;

    #[async_trait]
    impl ApprovalChannel for AutoApprove {
        async fn request_approval(
            &self,
            _signal_kind: SignalKind,
            _instrument: Instrument,
            _reason: &str,
            _shares: f64,
            _price: f64,
            _position_value: f64,
        ) -> ApprovalResult {
            ApprovalResult::Approved
        }
        async fn send_message(&self, _text: &str) {}
        async fn notify_trade_executed(&self, _text: &str) {}
        async fn notify_position_closed(&self, _text: &str) {}
        async fn notify_error(&self, _text: &str) {}
    }

    #[async_trait]
    impl CommandSurface for AutoApprove {
        async fn pause(&self) -> String {
            String::new()
        }
        async fn resume(&self) -> String {
            String::new()
        }
        async fn set_mode(&self, _mode: &str) -> String {
            String::new()
        }
        async fn balance(&self) -> String {
            String::new()
        }
        async fn positions(&self) -> String {
            String::new()
        }
        async fn signal(&self) -> String {
            String::new()
        }
        async fn logs(&self, _limit: usize) -> String {
            String::new()
        }
    }

    fn temp_persistence(name: &str) -> Arc<Persistence> {
        let dir = std::env::temp_dir().join(format!("etf-signal-agent-executor-test-{name}-{}", uuid::Uuid::new_v4()));
        Arc::new(Persistence::open(dir).unwrap())
    }

    fn test_executor(broker: Arc<dyn BrokerGateway>, quote_price: f64, auto_execute: bool) -> Executor {
        let mut cfg = RuntimeConfig::default();
        cfg.bot.mode = TradingMode::Paper;
        cfg.bot.approval_mode = if auto_execute { ApprovalMode::AutoExecute } else { ApprovalMode::Required };
        cfg.bot.max_position_pct = 100.0;
        Executor::new(
            Arc::new(RwLock::new(cfg)),
            broker,
            Arc::new(FixedMarketData { price: quote_price }),
            Arc::new(AutoApprove),
            temp_persistence("exec"),
            Arc::new(SignalEngine::new()),
        )
    }

    fn cash_signal(kind: SignalKind, target: Instrument) -> Signal {
        Signal {
            kind,
            target: Some(target),
            reason: "test".to_string(),
            prev_day_return_pct: None,
            intraday_status: None,
            position_action: crate::types::PositionAction::None,
        }
    }

    #[tokio::test]
    async fn execute_signal_cash_is_noop() {
        let broker = Arc::new(FakeBroker::new(100.0, 10_000.0));
        let executor = test_executor(broker, 100.0, true);
        let signal = Signal {
            kind: SignalKind::Cash,
            target: None,
            reason: "no rule matched".into(),
            prev_day_return_pct: None,
            intraday_status: None,
            position_action: crate::types::PositionAction::None,
        };
        let result = executor.execute_signal(Some(signal), true).await;
        assert!(result.success);
        assert_eq!(result.action, ExecAction::None);
        assert!(executor.current_holdings().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_signal_same_day_is_blocked() {
        // Boundary scenario 2.
        let broker = Arc::new(FakeBroker::new(100.0, 10_000.0));
        let executor = test_executor(broker, 100.0, true);
        let signal = cash_signal(SignalKind::MeanReversion, Instrument::L2);

        let first = executor.execute_signal(Some(signal.clone()), true).await;
        assert!(first.success);

        let second = executor.execute_signal(Some(signal), true).await;
        assert!(!second.success);
        assert_eq!(second.error.as_deref(), Some("signal already traded today"));
    }

    #[tokio::test]
    async fn insufficient_capital_fails_cleanly() {
        let broker = Arc::new(FakeBroker::new(1_000_000.0, 1.0));
        let executor = test_executor(broker, 1_000_000.0, true);
        let signal = cash_signal(SignalKind::MeanReversion, Instrument::L2);

        let result = executor.execute_signal(Some(signal), true).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("insufficient capital to size a position"));
    }

    #[tokio::test]
    async fn successful_buy_registers_position_and_hedge_tracking() {
        let broker = Arc::new(FakeBroker::new(100.0, 10_000.0));
        let executor = test_executor(broker, 100.0, true);
        let signal = cash_signal(SignalKind::MeanReversion, Instrument::L2);

        let result = executor.execute_signal(Some(signal), true).await;
        assert!(result.success);
        assert_eq!(result.action, ExecAction::Buy);
        assert_eq!(executor.current_holdings().await, vec![Instrument::L2]);
        assert_eq!(executor.hedge_status().await.tracked.unwrap().instrument, Instrument::L2);
    }

    #[tokio::test]
    async fn partial_fill_is_tracked_at_actual_filled_quantity() {
        // Boundary-adjacent: SPEC_FULL.md §4.3 "Fill polling" partial-fill case.
        let inner = FakeBroker::new(100.0, 10_000.0);
        let broker = Arc::new(PartialFillBroker { inner, requested: SyncMutex::new(0.0) });
        let executor = test_executor(broker, 100.0, true);
        let signal = cash_signal(SignalKind::MeanReversion, Instrument::L2);

        let result = executor.execute_signal(Some(signal), true).await;
        assert!(result.success);
        // max_position_pct=100% of $10,000 at $100/share -> requested 100 shares.
        assert!((result.shares - 50.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn close_position_realizes_pnl_and_clears_hedge() {
        let broker = Arc::new(FakeBroker::new(100.0, 10_000.0));
        let executor = test_executor(broker.clone(), 100.0, true);
        let signal = cash_signal(SignalKind::MeanReversion, Instrument::L2);
        executor.execute_signal(Some(signal), true).await;

        broker.set_quote(110.0);
        let result = executor.close_position(Instrument::L2).await;
        assert!(result.success);
        assert_eq!(result.action, ExecAction::Sell);
        assert!(executor.current_holdings().await.is_empty());
        assert!(executor.hedge_status().await.tracked.is_none());
    }

    #[tokio::test]
    async fn reversal_triggers_on_losing_long_and_opens_inverse() {
        // Boundary scenario 3.
        let broker = Arc::new(FakeBroker::new(10.0, 10_000.0));
        let executor = test_executor(broker.clone(), 10.0, true);
        let signal = cash_signal(SignalKind::MeanReversion, Instrument::L2);
        let opened = executor.execute_signal(Some(signal), true).await;
        assert!(opened.success);

        broker.set_quote(9.80); // -2.0% pnl, at the default reversal threshold
        let reversal = executor.check_and_execute_reversal().await.expect("reversal should fire");
        assert!(reversal.success);
        assert_eq!(reversal.instrument, Some(Instrument::S2));
        assert_eq!(executor.current_holdings().await, vec![Instrument::S2]);
    }

    #[tokio::test]
    async fn reversal_does_not_fire_twice_same_day() {
        let broker = Arc::new(FakeBroker::new(10.0, 10_000.0));
        let executor = test_executor(broker.clone(), 10.0, true);
        executor.execute_signal(Some(cash_signal(SignalKind::MeanReversion, Instrument::L2)), true).await;

        broker.set_quote(9.80);
        let first = executor.check_and_execute_reversal().await;
        assert!(first.is_some());

        // Re-open a long (simulating the executor later re-entering) and try again same day.
        executor.execute_signal(Some(cash_signal(SignalKind::ShortThursday, Instrument::S2)), true).await;
        let second = executor.check_and_execute_reversal().await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn pre_close_sweep_closes_every_held_instrument() {
        // Boundary scenario 6 (simplified to a single instrument; hedge-leg
        // closing inside `close_position_locked` is covered by
        // `close_position_realizes_pnl_and_clears_hedge`).
        let broker = Arc::new(FakeBroker::new(100.0, 10_000.0));
        let executor = test_executor(broker, 100.0, true);
        executor.execute_signal(Some(cash_signal(SignalKind::MeanReversion, Instrument::L2)), true).await;
        assert!(!executor.current_holdings().await.is_empty());

        let results = executor.run_eod_sweep().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(executor.current_holdings().await.is_empty());
        assert!(executor.hedge_status().await.tracked.is_none());
    }

    #[tokio::test]
    async fn already_held_target_degrades_to_hold() {
        let broker = Arc::new(FakeBroker::new(100.0, 10_000.0));
        let executor = test_executor(broker, 100.0, true);
        executor.execute_signal(Some(cash_signal(SignalKind::MeanReversion, Instrument::L2)), true).await;

        let second = executor.execute_signal(Some(cash_signal(SignalKind::ShortThursday, Instrument::L2)), true).await;
        assert_eq!(second.action, ExecAction::Hold);
    }

    #[tokio::test]
    async fn ensure_broker_authenticated_delegates_to_broker_gateway() {
        let broker = Arc::new(FakeBroker::new(100.0, 10_000.0));
        let executor = test_executor(broker, 100.0, true);
        assert!(executor.ensure_broker_authenticated().await.unwrap());
    }
}
