// =============================================================================
// Shared types used across the signal engine, executor, hedge controller and
// gateways.
// =============================================================================

use serde::{Deserialize, Serialize};

/// The fixed three-instrument universe this agent trades.
///
/// `L1` is the 1x long reference, `L2` the 2x long, `S2` the 2x inverse. The
/// concrete ticker each maps to is configuration (see
/// [`crate::config::RuntimeConfig::instruments`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instrument {
    L1,
    L2,
    S2,
}

impl Instrument {
    /// Long-polarity instruments are `L1`/`L2`; `S2` is inverse-polarity.
    pub fn is_long(self) -> bool {
        matches!(self, Self::L1 | Self::L2)
    }

    /// The instrument that hedges this one: longs hedge with `S2`, `S2` hedges
    /// with `L2`.
    pub fn hedge_instrument(self) -> Self {
        match self {
            Self::L1 | Self::L2 => Self::S2,
            Self::S2 => Self::L2,
        }
    }

    /// Two instruments are opposite-polarity if exactly one is long.
    pub fn opposite_polarity(self, other: Self) -> bool {
        self.is_long() != other.is_long()
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::L1 => write!(f, "L1"),
            Self::L2 => write!(f, "L2"),
            Self::S2 => write!(f, "S2"),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type understood by the broker gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// Terminal (and non-terminal) states an order can be in at the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Executed,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Executed | Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }
}

/// What the executor must do to the current holdings map before/while acting
/// on a signal. See SPEC_FULL.md §4.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionAction {
    /// No existing holdings conflict with the target; open straight away.
    None,
    /// Target already held; the signal degrades to a no-op hold.
    Hold,
    /// A same-polarity, different-leverage instrument is held; close it, then
    /// open the target.
    Close,
    /// An opposite-polarity instrument is held; close it, then open the
    /// target (functionally identical to `Close` but kept distinct so callers
    /// can log/alert on a true directional flip).
    Switch,
}

/// The closed set of signals the engine can emit. See SPEC_FULL.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Cash,
    MeanReversion,
    ShortThursday,
    CrashDay,
    PumpDay,
    TenAmDump,
    Hold,
    CloseLong,
    CloseShort,
}

impl SignalKind {
    /// `signal.should_trade() ⇔ signal ∉ {CASH, HOLD}` (SPEC_FULL.md §3).
    pub fn should_trade(self) -> bool {
        !matches!(self, Self::Cash | Self::Hold)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::MeanReversion => "mean_reversion",
            Self::ShortThursday => "short_thursday",
            Self::CrashDay => "crash_day",
            Self::PumpDay => "pump_day",
            Self::TenAmDump => "ten_am_dump",
            Self::Hold => "hold",
            Self::CloseLong => "close_long",
            Self::CloseShort => "close_short",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bot trading mode: whether orders are simulated in-process or sent to the
/// real broker. Distinct from the scheduler's pause flag (SPEC_FULL.md §4.2),
/// which suspends job firing without changing this mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paper,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Paper => write!(f, "paper"),
        }
    }
}

/// How much human confirmation an order requires before it is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalMode {
    /// Must approve each trade via the approval channel.
    Required,
    /// Send a notification but auto-execute.
    NotifyOnly,
    /// No notification, just execute.
    AutoExecute,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        Self::Required
    }
}

/// Outcome of an approval-channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalResult {
    Approved,
    Rejected,
    Timeout,
    Error,
}

/// Weekend-gap severity classification (diagnostic only, SPEC_FULL.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    None,
    Watch,
    HighAlert,
    Critical,
}

impl Default for AlertLevel {
    fn default() -> Self {
        Self::None
    }
}
