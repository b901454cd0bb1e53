//! Core enums and wire-adjacent value types shared across the bot.

// ─────────────────────────────────────────────────────────
// Instruments / sides / order attributes
// ─────────────────────────────────────────────────────────

/// The two legs this bot trades: the spot instrument and the USDT-margined
/// perpetual on the same symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    Spot,
    PerpUsdt,
}

impl InstrumentKind {
    /// Bitget V2 `instType` string.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Spot => "SPOT",
            InstrumentKind::PerpUsdt => "USDT-FUTURES",
        }
    }

    pub fn from_inst_type(value: &str) -> Option<Self> {
        match value {
            "SPOT" => Some(InstrumentKind::Spot),
            "USDT-FUTURES" => Some(InstrumentKind::PerpUsdt),
            _ => None,
        }
    }

    /// Short tag used in the `leg` log field.
    pub fn leg(&self) -> &'static str {
        match self {
            InstrumentKind::Spot => "spot",
            InstrumentKind::PerpUsdt => "perp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn parse(value: &str) -> Option<Side> {
        match value.to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }

    /// Signed multiplier a fill on this side applies to a position.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    Gtc,
    PostOnly,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "gtc",
            TimeInForce::PostOnly => "post_only",
            TimeInForce::Ioc => "ioc",
            TimeInForce::Fok => "fok",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Order intent
// ─────────────────────────────────────────────────────────

/// Why an order exists. The intent is embedded as the client-order-id
/// prefix and recovered from it during fill ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    QuoteBid,
    QuoteAsk,
    Hedge,
    Flatten,
    Unwind,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::QuoteBid,
        Intent::QuoteAsk,
        Intent::Hedge,
        Intent::Flatten,
        Intent::Unwind,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::QuoteBid => "QUOTE_BID",
            Intent::QuoteAsk => "QUOTE_ASK",
            Intent::Hedge => "HEDGE",
            Intent::Flatten => "FLATTEN",
            Intent::Unwind => "UNWIND",
        }
    }

    /// Recover the intent from a client-order-id prefix.
    ///
    /// QUOTE_BID/QUOTE_ASK are checked before the bare prefix match so the
    /// shared "QUOTE_" stem cannot mis-resolve.
    pub fn from_client_oid(client_oid: &str) -> Option<Intent> {
        if client_oid.is_empty() {
            return None;
        }
        Intent::ALL
            .iter()
            .copied()
            .find(|intent| client_oid.starts_with(&format!("{}-", intent.as_str())))
    }

    pub fn is_quote(&self) -> bool {
        matches!(self, Intent::QuoteBid | Intent::QuoteAsk)
    }
}

// ─────────────────────────────────────────────────────────
// Market data values
// ─────────────────────────────────────────────────────────

/// Best bid/ask with top-of-book sizes.
#[derive(Debug, Clone, Copy)]
pub struct Bbo {
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    /// Seconds since epoch, inherited from the snapshot.
    pub ts: f64,
}

/// Depth-limited book snapshot: bids descending, asks ascending.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub ts: f64,
    /// False when the channel-filtered store query came back empty and the
    /// unfiltered retry was used instead.
    pub used_channel_filter: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FundingInfo {
    pub funding_rate: f64,
    pub next_update_time: Option<f64>,
    pub interval_sec: Option<f64>,
    pub ts: f64,
}

// ─────────────────────────────────────────────────────────
// Order flow
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub kind: InstrumentKind,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size: f64,
    pub force: TimeInForce,
    pub client_oid: String,
    pub intent: Intent,
    pub cycle_id: u64,
    pub price: Option<f64>,
    pub reduce_only: Option<bool>,
}

/// A fill row from the private stream, normalized.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub kind: InstrumentKind,
    pub symbol: String,
    pub order_id: String,
    pub client_oid: String,
    pub fill_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub ts: f64,
    pub simulated: bool,
}

impl ExecutionEvent {
    /// Dedup key: at most one position/ticket mutation per (inst, fill_id).
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.fill_id)
    }
}
