// =============================================================================
// Trailing hedge controller — tier ladder that progressively opens an inverse
// position to lock in unrealized gains (SPEC_FULL.md §4.4).
// =============================================================================
//
// The controller itself holds no internal lock (SPEC_FULL.md §5): it is a
// plain field of `Executor`'s `ExecutorState`, mutated through `&mut self`
// only while the executor already holds its own `tokio::sync::Mutex`, so
// these mutations are serialized by that outer lock, not by anything in
// here.
//
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::HedgeConfig;
use crate::types::Instrument;

/// One rung of the ladder, with its live trigger state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeTier {
    pub gain_threshold_pct: f64,
    pub hedge_size_pct: f64,
    pub triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
}

impl From<crate::config::HedgeTierConfig> for HedgeTier {
    fn from(c: crate::config::HedgeTierConfig) -> Self {
        Self {
            gain_threshold_pct: c.gain_threshold_pct,
            hedge_size_pct: c.hedge_size_pct,
            triggered: false,
            triggered_at: None,
        }
    }
}

/// The hedge controller's view of the position it is tracking
/// (SPEC_FULL.md §3 "Tracked position").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub instrument: Instrument,
    pub shares: f64,
    pub entry_price: f64,
    pub original_value: f64,
    pub hedge_instrument: Instrument,
    pub hedge_shares: f64,
    pub hedge_entries: Vec<HedgeFill>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeFill {
    pub tier_index: usize,
    pub shares: u64,
    pub at: DateTime<Utc>,
}

/// A hedge order the executor must place. Mirrors the broker's buy-side
/// order parameters; the executor fills in account/order-type specifics.
#[derive(Debug, Clone)]
pub struct HedgeOrder {
    pub instrument: Instrument,
    pub shares: u64,
    pub tier_index: usize,
    pub hedge_value: f64,
}

/// Diagnostic snapshot for the approval channel's command surface / logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeStatus {
    pub tracked: Option<TrackedPosition>,
    pub tiers: Vec<HedgeTier>,
    pub total_triggered_pct: f64,
}

/// Stateful tier ladder. Not internally synchronized — see module doc.
pub struct TrailingHedgeManager {
    config: HedgeConfig,
    tracked: Option<TrackedPosition>,
    tiers: Vec<HedgeTier>,
}

impl TrailingHedgeManager {
    pub fn new(config: HedgeConfig) -> Self {
        let tiers = config.tiers.iter().copied().map(HedgeTier::from).collect();
        Self {
            config,
            tracked: None,
            tiers,
        }
    }

    /// Replace any prior tracked position and reset all tier triggers.
    #[instrument(skip(self), name = "hedge::register_position")]
    pub fn register_position(&mut self, instrument: Instrument, shares: f64, entry_price: f64) {
        self.tiers = self
            .config
            .tiers
            .iter()
            .copied()
            .map(HedgeTier::from)
            .collect();

        self.tracked = Some(TrackedPosition {
            instrument,
            shares,
            entry_price,
            original_value: shares * entry_price,
            hedge_instrument: instrument.hedge_instrument(),
            hedge_shares: 0.0,
            hedge_entries: Vec::new(),
        });

        info!(%instrument, shares, entry_price, "hedge controller tracking new position");
    }

    /// Invoked after an EOD close or any full exit.
    pub fn clear_position(&mut self) {
        self.tracked = None;
        self.tiers = self
            .config
            .tiers
            .iter()
            .copied()
            .map(HedgeTier::from)
            .collect();
    }

    /// At most one hedge order per call (SPEC_FULL.md §4.4 algorithm).
    #[instrument(skip(self), name = "hedge::check_and_hedge")]
    pub fn check_and_hedge(&mut self, current_price: f64) -> Option<HedgeOrder> {
        if !self.config.enabled {
            return None;
        }
        let tracked = self.tracked.as_ref()?;

        let gain_dollars = tracked.shares * (current_price - tracked.entry_price);
        if gain_dollars < self.config.min_gain_dollars {
            return None;
        }
        let gain_pct = if tracked.original_value > 0.0 {
            gain_dollars / tracked.original_value * 100.0
        } else {
            0.0
        };

        let current_total_hedge_pct: f64 = self
            .tiers
            .iter()
            .filter(|t| t.triggered)
            .map(|t| t.hedge_size_pct)
            .sum();

        for (idx, tier) in self.tiers.iter_mut().enumerate() {
            if tier.triggered || tier.gain_threshold_pct > gain_pct {
                continue;
            }

            if current_total_hedge_pct + tier.hedge_size_pct > self.config.max_hedge_pct {
                continue;
            }

            tier.triggered = true;
            tier.triggered_at = Some(Utc::now());

            let hedge_value = tracked.original_value * tier.hedge_size_pct / 100.0;
            let shares = ((hedge_value / current_price).floor() as u64).max(1);

            info!(
                tier_index = idx,
                gain_pct,
                hedge_value,
                shares,
                hedge_instrument = %tracked.hedge_instrument,
                "hedge tier triggered"
            );

            return Some(HedgeOrder {
                instrument: tracked.hedge_instrument,
                shares,
                tier_index: idx,
                hedge_value,
            });
        }

        None
    }

    /// Called by the executor after the hedge fill confirms.
    pub fn update_hedge_shares(&mut self, tier_index: usize, filled_shares: u64) {
        let Some(tracked) = self.tracked.as_mut() else {
            return;
        };
        tracked.hedge_shares += filled_shares as f64;
        tracked.hedge_entries.push(HedgeFill {
            tier_index,
            shares: filled_shares,
            at: Utc::now(),
        });
    }

    pub fn get_status(&self) -> HedgeStatus {
        let total_triggered_pct = self
            .tiers
            .iter()
            .filter(|t| t.triggered)
            .map(|t| t.hedge_size_pct)
            .sum();
        HedgeStatus {
            tracked: self.tracked.clone(),
            tiers: self.tiers.clone(),
            total_triggered_pct,
        }
    }

    pub fn has_tracked_position(&self) -> bool {
        self.tracked.is_some()
    }

    pub fn tracked_instrument(&self) -> Option<Instrument> {
        self.tracked.as_ref().map(|t| t.instrument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TrailingHedgeManager {
        TrailingHedgeManager::new(HedgeConfig::default())
    }

    #[test]
    fn tier_one_fires_at_2_5_percent_gain() {
        let mut m = manager();
        m.register_position(Instrument::L2, 100.0, 10.0);

        // gain% = +3.0%, gain$ = $30 >= min_gain_dollars
        let order = m.check_and_hedge(10.30).expect("tier 1 should fire");
        assert_eq!(order.instrument, Instrument::S2);
        assert_eq!(order.tier_index, 0);
        assert!((order.hedge_value - 150.0).abs() < 1e-9); // 1000 * 0.15

        // Immediate re-check at same price: tier 1 already triggered, tier 2
        // (+4.0%) not yet crossed.
        let again = m.check_and_hedge(10.35);
        assert!(again.is_none());
    }

    #[test]
    fn max_hedge_pct_skips_overflowing_tier() {
        let mut cfg = HedgeConfig::default();
        cfg.max_hedge_pct = 20.0; // tier1(15) + tier2(15) would exceed 20
        let mut m = TrailingHedgeManager::new(cfg);
        m.register_position(Instrument::L2, 100.0, 10.0);

        let first = m.check_and_hedge(10.30).expect("tier 1 fires");
        assert_eq!(first.tier_index, 0);

        // Now at +4.0% tier 2 would add another 15%, total 30% > 20% cap.
        let second = m.check_and_hedge(10.40);
        assert!(second.is_none());
    }

    #[test]
    fn register_after_clear_resets_all_tiers() {
        let mut m = manager();
        m.register_position(Instrument::L2, 100.0, 10.0);
        m.check_and_hedge(10.30);
        assert!(m.get_status().total_triggered_pct > 0.0);

        m.clear_position();
        m.register_position(Instrument::L2, 50.0, 20.0);

        let status = m.get_status();
        assert!(status.tiers.iter().all(|t| !t.triggered));
        assert_eq!(status.total_triggered_pct, 0.0);
    }

    #[test]
    fn below_min_gain_dollars_does_not_fire() {
        let mut m = manager();
        // 10 shares at entry 10 -> original_value = $100; min_gain_dollars
        // default is $20, so a 3% gain ($3) must not fire despite crossing
        // the percentage threshold.
        m.register_position(Instrument::L2, 10.0, 10.0);
        let order = m.check_and_hedge(10.30);
        assert!(order.is_none());
    }
}
