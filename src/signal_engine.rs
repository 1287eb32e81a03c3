// =============================================================================
// Signal engine — deterministic, position-aware classification of "what to
// do today" (SPEC_FULL.md §4.1).
// =============================================================================
//
// `today_signal` is a pure function of its inputs plus two pieces of
// engine-local state: the once-fire flags (crash/pump) and a short-TTL quote
// cache for yesterday's OHLCV. Everything else — current positions, time of
// day, market data — is passed in by the caller (the executor / scheduler).
//
// =============================================================================

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::config::StrategyConfig;
use crate::types::{AlertLevel, Instrument, PositionAction, SignalKind};

/// A single OHLC bar, as returned by the market-data gateway's
/// `get_historical_bars`.
#[derive(Debug, Clone, Copy)]
pub struct Bar {
    pub open: f64,
    pub close: f64,
}

/// Real-time quote fields the engine needs.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub current: f64,
    pub today_open: f64,
    pub is_realtime: bool,
}

/// Intraday crash/pump status, carried on the emitted signal for display and
/// logging (SPEC_FULL.md §3).
#[derive(Debug, Clone, Copy)]
pub struct IntradayMoveStatus {
    pub current_drop_pct: f64,
}

/// A fully-formed signal as returned by `today_signal`.
#[derive(Debug, Clone)]
pub struct Signal {
    pub kind: SignalKind,
    pub target: Option<Instrument>,
    pub reason: String,
    pub prev_day_return_pct: Option<f64>,
    pub intraday_status: Option<IntradayMoveStatus>,
    pub position_action: PositionAction,
}

impl Signal {
    fn cash(reason: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Cash,
            target: None,
            reason: reason.into(),
            prev_day_return_pct: None,
            intraday_status: None,
            position_action: PositionAction::None,
        }
    }
}

/// Cached previous-day OHLCV, at most 5 minutes old (SPEC_FULL.md §4.1
/// "Quote cache").
struct CachedPrevBar {
    bar: Bar,
    fetched_at: DateTime<Tz>,
}

/// Once-fire state the engine owns (SPEC_FULL.md §4.1 "Once-fire flags").
struct OnceFireState {
    crash_day_traded: bool,
    pump_day_traded: bool,
    stored_date: Option<chrono::NaiveDate>,
}

impl OnceFireState {
    fn new() -> Self {
        Self {
            crash_day_traded: false,
            pump_day_traded: false,
            stored_date: None,
        }
    }

    /// Reset at the first engine call whose local date differs from the
    /// stored date.
    fn roll_if_new_day(&mut self, today: chrono::NaiveDate) {
        if self.stored_date != Some(today) {
            self.crash_day_traded = false;
            self.pump_day_traded = false;
            self.stored_date = Some(today);
        }
    }
}

const QUOTE_CACHE_TTL_MINUTES: i64 = 5;

/// Pure decision procedure plus the small amount of engine-local state
/// (once-fire flags, quote cache) the spec requires it to own.
pub struct SignalEngine {
    once_fire: Mutex<OnceFireState>,
    prev_bar_cache: Mutex<Option<CachedPrevBar>>,
}

impl SignalEngine {
    pub fn new() -> Self {
        Self {
            once_fire: Mutex::new(OnceFireState::new()),
            prev_bar_cache: Mutex::new(None),
        }
    }

    /// Called by the executor once an order driven by a CRASH_DAY signal has
    /// filled successfully.
    pub fn mark_crash_day_traded(&self, today: chrono::NaiveDate) {
        let mut state = self.once_fire.lock();
        state.roll_if_new_day(today);
        state.crash_day_traded = true;
    }

    /// Symmetric to [`Self::mark_crash_day_traded`].
    pub fn mark_pump_day_traded(&self, today: chrono::NaiveDate) {
        let mut state = self.once_fire.lock();
        state.roll_if_new_day(today);
        state.pump_day_traded = true;
    }

    /// Cache (or reuse a fresh cache of) yesterday's bar for `prev_ret`.
    fn cached_prev_bar(&self, now: DateTime<Tz>, fetch: impl FnOnce() -> Option<Bar>) -> Option<Bar> {
        {
            let cache = self.prev_bar_cache.lock();
            if let Some(entry) = cache.as_ref() {
                let age = now.signed_duration_since(entry.fetched_at);
                if age.num_minutes() < QUOTE_CACHE_TTL_MINUTES {
                    return Some(entry.bar);
                }
            }
        }

        let bar = fetch()?;
        *self.prev_bar_cache.lock() = Some(CachedPrevBar { bar, fetched_at: now });
        Some(bar)
    }

    /// Compute today's signal. `now` must already be in exchange-local time.
    /// `holdings` is the current set of held instruments (from the
    /// executor's position map). `prev_bar_fetch` lazily fetches yesterday's
    /// OHLCV (consulted through the 5-minute cache); `l1_quote` is today's
    /// real-time quote for the 1x long reference, used for crash/pump
    /// `intraday_move`.
    ///
    /// Never raises: on missing market data, returns `CASH` with reason
    /// "data unavailable" (SPEC_FULL.md §4.1 "Failure semantics").
    #[instrument(skip(self, prev_bar_fetch), name = "signal_engine::today_signal")]
    pub fn today_signal(
        &self,
        now: DateTime<Tz>,
        holdings: &[Instrument],
        config: &StrategyConfig,
        l1_quote: Option<Quote>,
        prev_bar_fetch: impl FnOnce() -> Option<Bar>,
    ) -> Signal {
        let today = now.date_naive();
        {
            let mut state = self.once_fire.lock();
            state.roll_if_new_day(today);
        }

        let cutoff_ok = |cutoff: &str| -> bool {
            match parse_cutoff(cutoff) {
                Some(cutoff_time) => now.time() <= cutoff_time,
                None => false,
            }
        };

        // --- Rule 1: crash day ------------------------------------------------
        if config.crash_day_enabled && !self.once_fire.lock().crash_day_traded {
            if let Some(quote) = l1_quote {
                let intraday_move = intraday_move_pct(quote);
                if intraday_move <= config.crash_day_threshold && cutoff_ok(&config.crash_day_cutoff_time) {
                    debug!(intraday_move, threshold = config.crash_day_threshold, "crash day triggered");
                    let target = Instrument::S2;
                    return self.finish_signal(
                        SignalKind::CrashDay,
                        target,
                        format!("intraday move {intraday_move:.2}% <= crash threshold {:.2}%", config.crash_day_threshold),
                        None,
                        Some(IntradayMoveStatus { current_drop_pct: intraday_move }),
                        holdings,
                    );
                }
            }
        }

        // --- Rule 2: pump day (symmetric) -------------------------------------
        if config.pump_day_enabled && !self.once_fire.lock().pump_day_traded {
            if let Some(quote) = l1_quote {
                let intraday_move = intraday_move_pct(quote);
                if intraday_move >= config.pump_day_threshold && cutoff_ok(&config.pump_day_cutoff_time) {
                    debug!(intraday_move, threshold = config.pump_day_threshold, "pump day triggered");
                    let target = Instrument::L2;
                    return self.finish_signal(
                        SignalKind::PumpDay,
                        target,
                        format!("intraday move {intraday_move:.2}% >= pump threshold {:.2}%", config.pump_day_threshold),
                        None,
                        Some(IntradayMoveStatus { current_drop_pct: intraday_move }),
                        holdings,
                    );
                }
            }
        }

        // --- Rule 3: mean reversion --------------------------------------------
        if config.mean_reversion_enabled {
            match self.cached_prev_bar(now, prev_bar_fetch) {
                Some(bar) if bar.open > 0.0 => {
                    let prev_ret = (bar.close - bar.open) / bar.open * 100.0;
                    if prev_ret < config.mean_reversion_threshold {
                        return self.finish_signal(
                            SignalKind::MeanReversion,
                            Instrument::L2,
                            format!("prev-day return {prev_ret:.2}% < threshold {:.2}%", config.mean_reversion_threshold),
                            Some(prev_ret),
                            None,
                            holdings,
                        );
                    }
                }
                Some(_) => {}
                None => return Signal::cash("data unavailable"),
            }
        }

        // --- Rule 4: short Thursday ---------------------------------------------
        if config.short_thursday_enabled && now.weekday() == Weekday::Thu {
            return self.finish_signal(
                SignalKind::ShortThursday,
                Instrument::S2,
                "Thursday short".to_string(),
                None,
                None,
                holdings,
            );
        }

        // --- Rule 5: ten-AM dump --------------------------------------------
        if config.ten_am_dump_enabled {
            let t = now.time();
            let window_start = NaiveTime::from_hms_opt(9, 35, 0).unwrap();
            let window_end = NaiveTime::from_hms_opt(10, 30, 0).unwrap();
            if t >= window_start && t < window_end {
                return self.finish_signal(
                    SignalKind::TenAmDump,
                    Instrument::S2,
                    "ten-AM dump window".to_string(),
                    None,
                    None,
                    holdings,
                );
            }
        }

        Signal::cash("no rule matched")
    }

    /// Classify the EOD sweep signal for a held instrument
    /// (SPEC_FULL.md §4.1 "CLOSE_LONG / CLOSE_SHORT").
    pub fn close_signal_for(&self, instrument: Instrument) -> Signal {
        let kind = if instrument.is_long() {
            SignalKind::CloseLong
        } else {
            SignalKind::CloseShort
        };
        Signal {
            kind,
            target: Some(instrument),
            reason: "end-of-day sweep".to_string(),
            prev_day_return_pct: None,
            intraday_status: None,
            position_action: PositionAction::Close,
        }
    }

    /// Apply the position-aware action rules (SPEC_FULL.md §4.1.1) and build
    /// the final `Signal`.
    fn finish_signal(
        &self,
        kind: SignalKind,
        target: Instrument,
        reason: String,
        prev_day_return_pct: Option<f64>,
        intraday_status: Option<IntradayMoveStatus>,
        holdings: &[Instrument],
    ) -> Signal {
        let action = position_action(holdings, target);
        let (final_kind, final_target) = if action == PositionAction::Hold {
            (SignalKind::Hold, Some(target))
        } else {
            (kind, Some(target))
        };

        Signal {
            kind: final_kind,
            target: final_target,
            reason,
            prev_day_return_pct,
            intraday_status,
            position_action: action,
        }
    }

    /// Weekend-gap classification for the reference underlying. Diagnostic
    /// only; never consulted by `today_signal`.
    pub fn classify_weekend_gap(gap_pct: f64, config: &StrategyConfig) -> AlertLevel {
        if gap_pct <= config.weekend_gap_critical_pct {
            AlertLevel::Critical
        } else if gap_pct <= config.weekend_gap_high_alert_pct {
            AlertLevel::HighAlert
        } else if gap_pct <= config.weekend_gap_watch_pct {
            AlertLevel::Watch
        } else {
            AlertLevel::None
        }
    }
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn intraday_move_pct(quote: Quote) -> f64 {
    if quote.today_open <= 0.0 {
        return 0.0;
    }
    (quote.current - quote.today_open) / quote.today_open * 100.0
}

fn parse_cutoff(s: &str) -> Option<NaiveTime> {
    let mut parts = s.splitn(2, ':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next()?.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// SPEC_FULL.md §4.1.1.
fn position_action(holdings: &[Instrument], target: Instrument) -> PositionAction {
    if holdings.is_empty() {
        return PositionAction::None;
    }
    if holdings.contains(&target) {
        return PositionAction::Hold;
    }
    if holdings.iter().any(|h| h.opposite_polarity(target)) {
        return PositionAction::Switch;
    }
    PositionAction::Close
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn et() -> Tz {
        chrono_tz::America::New_York
    }

    fn at(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        et().with_ymd_and_hms(y, m, d, h, mi, 0).unwrap()
    }

    #[test]
    fn crash_during_held_long_switches() {
        // Boundary scenario 1.
        let engine = SignalEngine::new();
        let cfg = StrategyConfig::default();
        let now = at(2026, 3, 3, 11, 15); // a Tuesday
        let quote = Quote { current: 98.0, today_open: 100.0, is_realtime: true };

        let sig = engine.today_signal(now, &[Instrument::L2], &cfg, Some(quote), || None);

        assert_eq!(sig.kind, SignalKind::CrashDay);
        assert_eq!(sig.target, Some(Instrument::S2));
        assert_eq!(sig.position_action, PositionAction::Switch);
    }

    #[test]
    fn crash_day_does_not_fire_twice_same_day() {
        let engine = SignalEngine::new();
        let cfg = StrategyConfig::default();
        let now = at(2026, 3, 3, 11, 15);
        engine.mark_crash_day_traded(now.date_naive());

        let quote = Quote { current: 98.0, today_open: 100.0, is_realtime: true };
        let sig = engine.today_signal(now, &[], &cfg, Some(quote), || None);
        assert_ne!(sig.kind, SignalKind::CrashDay);
    }

    #[test]
    fn crash_and_pump_flags_are_independent() {
        // P5: firing crash does not set the pump flag.
        let engine = SignalEngine::new();
        let today = at(2026, 3, 3, 11, 15).date_naive();
        engine.mark_crash_day_traded(today);

        let state = engine.once_fire.lock();
        assert!(state.crash_day_traded);
        assert!(!state.pump_day_traded);
    }

    #[test]
    fn short_thursday_emits_when_no_earlier_rule_matches() {
        let engine = SignalEngine::new();
        let mut cfg = StrategyConfig::default();
        cfg.crash_day_enabled = false;
        cfg.pump_day_enabled = false;
        cfg.mean_reversion_enabled = false;
        // 2026-03-05 is a Thursday.
        let now = at(2026, 3, 5, 11, 0);

        let sig = engine.today_signal(now, &[], &cfg, None, || None);
        assert_eq!(sig.kind, SignalKind::ShortThursday);
        assert_eq!(sig.target, Some(Instrument::S2));
    }

    #[test]
    fn ten_am_dump_window_is_exclusive_at_upper_bound() {
        let engine = SignalEngine::new();
        let mut cfg = StrategyConfig::default();
        cfg.crash_day_enabled = false;
        cfg.pump_day_enabled = false;
        cfg.mean_reversion_enabled = false;
        cfg.short_thursday_enabled = false;

        let inside = at(2026, 3, 3, 10, 0);
        let sig = engine.today_signal(inside, &[], &cfg, None, || None);
        assert_eq!(sig.kind, SignalKind::TenAmDump);

        let outside = at(2026, 3, 3, 10, 30);
        let sig2 = engine.today_signal(outside, &[], &cfg, None, || None);
        assert_eq!(sig2.kind, SignalKind::Cash);
    }

    #[test]
    fn no_rule_matches_returns_cash() {
        let engine = SignalEngine::new();
        let mut cfg = StrategyConfig::default();
        cfg.crash_day_enabled = false;
        cfg.pump_day_enabled = false;
        cfg.mean_reversion_enabled = false;
        cfg.short_thursday_enabled = false;
        cfg.ten_am_dump_enabled = false;

        let now = at(2026, 3, 3, 13, 0);
        let sig = engine.today_signal(now, &[], &cfg, None, || None);
        assert_eq!(sig.kind, SignalKind::Cash);
    }

    #[test]
    fn missing_market_data_for_mean_reversion_returns_cash_not_panic() {
        let engine = SignalEngine::new();
        let mut cfg = StrategyConfig::default();
        cfg.crash_day_enabled = false;
        cfg.pump_day_enabled = false;
        cfg.short_thursday_enabled = false;
        cfg.ten_am_dump_enabled = false;

        let now = at(2026, 3, 3, 13, 0);
        let sig = engine.today_signal(now, &[], &cfg, None, || None);
        assert_eq!(sig.kind, SignalKind::Cash);
        assert_eq!(sig.reason, "data unavailable");
    }

    #[test]
    fn execute_signal_cash_is_noop_shaped() {
        // R2 is enforced by the executor, but the engine must at least be
        // capable of emitting a plain CASH with should_trade() == false.
        let sig = Signal::cash("no rule matched");
        assert!(!sig.kind.should_trade());
    }

    #[test]
    fn weekend_gap_classification_thresholds() {
        let cfg = StrategyConfig::default();
        assert_eq!(SignalEngine::classify_weekend_gap(-0.5, &cfg), AlertLevel::None);
        assert_eq!(SignalEngine::classify_weekend_gap(-1.5, &cfg), AlertLevel::Watch);
        assert_eq!(SignalEngine::classify_weekend_gap(-2.5, &cfg), AlertLevel::HighAlert);
        assert_eq!(SignalEngine::classify_weekend_gap(-4.0, &cfg), AlertLevel::Critical);
    }
}
