// errors.rs — crate-wide error taxonomy.
//
// Two error kinds escape a guarded task and force a shutdown: `BudgetExceeded`
// and `RiskLimit`. Everything else (preflight rejects, exchange rejects,
// no-trade/entry guards, timeouts) is either a normal control-flow value or a
// logged-and-dropped local error.

use std::fmt;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QuotaSnapshot {
    pub remaining: u64,
    pub cap: u64,
    pub remaining_ratio: f64,
    pub source: String,
}

#[derive(Debug, Clone)]
pub enum BudgetExceeded {
    HourlyHttp { count: u64, limit: u64 },
    DailyHttp { count: u64, limit: u64 },
    DailyOrders { count: u64, limit: u64 },
    DailyCancels { count: u64, limit: u64 },
    WsReconnects { count: u64, limit: u64 },
    GptTokens { count: u64, limit: u64 },
    GptCost { cost_usd: f64, limit_usd: f64 },
    Quota(QuotaSnapshot),
}

impl fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetExceeded::HourlyHttp { count, limit } => {
                write!(f, "hourly HTTP budget exceeded: {count}/{limit}")
            }
            BudgetExceeded::DailyHttp { count, limit } => {
                write!(f, "daily HTTP budget exceeded: {count}/{limit}")
            }
            BudgetExceeded::DailyOrders { count, limit } => {
                write!(f, "daily order budget exceeded: {count}/{limit}")
            }
            BudgetExceeded::DailyCancels { count, limit } => {
                write!(f, "daily cancel budget exceeded: {count}/{limit}")
            }
            BudgetExceeded::WsReconnects { count, limit } => {
                write!(f, "ws reconnect budget exceeded: {count}/{limit}")
            }
            BudgetExceeded::GptTokens { count, limit } => {
                write!(f, "LLM token budget exceeded: {count}/{limit}")
            }
            BudgetExceeded::GptCost { cost_usd, limit_usd } => {
                write!(f, "LLM cost budget exceeded: ${cost_usd:.2}/${limit_usd:.2}")
            }
            BudgetExceeded::Quota(q) => write!(
                f,
                "quota shutdown threshold crossed: remaining_ratio={:.4} source={}",
                q.remaining_ratio, q.source
            ),
        }
    }
}

impl std::error::Error for BudgetExceeded {}

#[derive(Debug, Clone)]
pub enum RiskLimit {
    DailyLoss { daily_pnl: f64, limit: f64 },
    Drawdown { drawdown_bps: f64, limit_bps: f64 },
    PositionNotional { notional: f64, limit: f64 },
    OpenOrders { count: usize, limit: usize },
    OpenPositions { count: usize, limit: usize },
    ReconcileFailures { consecutive: u32 },
    KillSwitchPresent,
}

impl fmt::Display for RiskLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLimit::DailyLoss { daily_pnl, limit } => {
                write!(f, "daily_loss_limit: pnl={daily_pnl:.2} limit={limit:.2}")
            }
            RiskLimit::Drawdown { drawdown_bps, limit_bps } => {
                write!(f, "drawdown_limit: {drawdown_bps:.1}bps limit={limit_bps:.1}bps")
            }
            RiskLimit::PositionNotional { notional, limit } => {
                write!(f, "position_notional_limit: {notional:.2} limit={limit:.2}")
            }
            RiskLimit::OpenOrders { count, limit } => {
                write!(f, "open_orders_limit: {count} limit={limit}")
            }
            RiskLimit::OpenPositions { count, limit } => {
                write!(f, "open_positions_limit: {count} limit={limit}")
            }
            RiskLimit::ReconcileFailures { consecutive } => {
                write!(f, "open-order reconcile failed {consecutive} times consecutively")
            }
            RiskLimit::KillSwitchPresent => write!(f, "runtime kill-switch file present"),
        }
    }
}

impl std::error::Error for RiskLimit {}

/// The reason codes shared by no-trade guards,
/// entry guards, preflight rejects, and exchange rejects. These are control
/// flow values, not `std::error::Error` — most are returned inside a
/// `Decision`/`GuardOutcome`, never propagated as a Rust `Err` up to the
/// engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ReasonCode {
    NoTradeSpread,
    NoTradeSlippage,
    NoTradeStaleData,
    NoTradeBookMissing,
    NoTradeRegime,
    NoTradeTurbulence,
    NoTradeUnsupportedSymbol,
    NoTradeQualityGate,
    CoinBlocked,
    FlipWaitFlat,
    PyramidingBlocked,
    DailyTradeLimit,
    TakerLimit,
    TakerStreakLimit,
    MakerOnlySignal,
    NoProtection,
    PreflightPriceTooManyDecimals,
    PreflightPriceTooManySigfigs,
    PreflightSizeTooManyDecimals,
    PreflightSizeNonPositive,
    PreflightTriggerInvalid,
    ExchangeVaultNotRegistered,
    ExchangeBadAloPx,
    ExchangeMinNotional,
    ExchangeInvalidPrice,
    ExchangeInvalidSize,
    ExchangeTickOrLotSize,
    ExchangeInsufficientMargin,
    ExchangeNotApproved,
    ExchangeOther,
    TpslRefBadFallback,
    TpslTpNotBeyondEntry,
    TpslSlNotBeyondEntry,
    TpslTpNotAboveSl,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        use ReasonCode::*;
        match self {
            NoTradeSpread => "NO_TRADE_SPREAD",
            NoTradeSlippage => "NO_TRADE_SLIPPAGE",
            NoTradeStaleData => "NO_TRADE_STALE_DATA",
            NoTradeBookMissing => "NO_TRADE_BOOK_MISSING",
            NoTradeRegime => "NO_TRADE_REGIME",
            NoTradeTurbulence => "NO_TRADE_TURBULENCE",
            NoTradeUnsupportedSymbol => "NO_TRADE_UNSUPPORTED_SYMBOL",
            NoTradeQualityGate => "NO_TRADE_QUALITY_GATE",
            CoinBlocked => "COIN_BLOCKED",
            FlipWaitFlat => "FLIP_WAIT_FLAT",
            PyramidingBlocked => "PYRAMIDING_BLOCKED",
            DailyTradeLimit => "DAILY_TRADE_LIMIT",
            TakerLimit => "TAKER_LIMIT",
            TakerStreakLimit => "TAKER_STREAK_LIMIT",
            MakerOnlySignal => "MAKER_ONLY_SIGNAL",
            NoProtection => "NO_PROTECTION",
            PreflightPriceTooManyDecimals => "preflight_price_too_many_decimals",
            PreflightPriceTooManySigfigs => "preflight_price_too_many_sigfigs",
            PreflightSizeTooManyDecimals => "preflight_size_too_many_decimals",
            PreflightSizeNonPositive => "preflight_size_non_positive",
            PreflightTriggerInvalid => "preflight_trigger_invalid",
            ExchangeVaultNotRegistered => "vault_not_registered",
            ExchangeBadAloPx => "bad_alo_px",
            ExchangeMinNotional => "min_notional",
            ExchangeInvalidPrice => "invalid_price",
            ExchangeInvalidSize => "invalid_size",
            ExchangeTickOrLotSize => "tick_or_lot_size",
            ExchangeInsufficientMargin => "insufficient_margin",
            ExchangeNotApproved => "not_approved",
            ExchangeOther => "other",
            TpslRefBadFallback => "tpsl_bad_reference_fallback",
            TpslTpNotBeyondEntry => "tpsl_tp_not_beyond_entry",
            TpslSlNotBeyondEntry => "tpsl_sl_not_beyond_entry",
            TpslTpNotAboveSl => "tpsl_tp_not_above_sl",
        }
    }

    /// Only these exchange rejects earn one retry; everything else is terminal.
    pub fn is_retryable_exchange_reject(&self) -> bool {
        matches!(
            self,
            ReasonCode::ExchangeBadAloPx
                | ReasonCode::ExchangeInvalidPrice
                | ReasonCode::ExchangeTickOrLotSize
                | ReasonCode::ExchangeInvalidSize
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Local, non-shutdown-worthy failure. Logged to the error stream by
/// `guarded()` and otherwise swallowed.
#[derive(Debug, Clone)]
pub enum LocalError {
    Network(String),
    Timeout(String),
    Serde(String),
    Other(String),
}

impl fmt::Display for LocalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalError::Network(s) => write!(f, "network error: {s}"),
            LocalError::Timeout(s) => write!(f, "timeout: {s}"),
            LocalError::Serde(s) => write!(f, "serde error: {s}"),
            LocalError::Other(s) => write!(f, "{s}"),
        }
    }
}

impl std::error::Error for LocalError {}

/// The union of what can escape a guarded task.
#[derive(Debug, Clone)]
pub enum EngineError {
    Budget(BudgetExceeded),
    Risk(RiskLimit),
    KillSwitch,
    Local(LocalError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Budget(e) => write!(f, "{e}"),
            EngineError::Risk(e) => write!(f, "{e}"),
            EngineError::KillSwitch => write!(f, "runtime kill-switch active"),
            EngineError::Local(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<BudgetExceeded> for EngineError {
    fn from(e: BudgetExceeded) -> Self {
        EngineError::Budget(e)
    }
}

impl From<RiskLimit> for EngineError {
    fn from(e: RiskLimit) -> Self {
        EngineError::Risk(e)
    }
}

impl From<LocalError> for EngineError {
    fn from(e: LocalError) -> Self {
        EngineError::Local(e)
    }
}

impl EngineError {
    /// Only these two kinds (plus the kill-switch) force a shutdown request;
    /// everything else is caught and logged by `guarded()`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Budget(_) | EngineError::Risk(_) | EngineError::KillSwitch)
    }
}
