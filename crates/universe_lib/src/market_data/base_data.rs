use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use strum_macros::Display;
use crate::securities::symbols::{Symbol, SymbolId};

/// Bar resolution of a [`Candle`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Display, Copy)]
pub enum Resolution {
    Seconds(u8),
    Minutes(u8),
    Hours(u8),
    Daily,
}

/// Trade direction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Display, Copy)]
pub enum Side {
    /// Buyer-initiated trade.
    Buy,
    /// Seller-initiated trade.
    Sell,
    /// Unknown direction.
    None
}

/// A single executed trade (tick).
#[derive(Clone, Debug, PartialEq)]
pub struct Tick {
    /// Trade price.
    pub price: Decimal,
    /// Trade size (quantity).
    pub size: Decimal,
    /// UTC timestamp of the trade.
    pub time: DateTime<Utc>,
    pub side: Side,
}

/// Best bid and offer.
#[derive(Clone, Debug, PartialEq)]
pub struct Bbo {
    pub bid: Decimal,
    pub bid_size: Decimal,
    pub ask: Decimal,
    pub ask_size: Decimal,
    pub time: DateTime<Utc>,
}

impl Bbo {
    pub fn mid(&self) -> Decimal { (self.bid + self.ask) / Decimal::TWO }
}

/// A candlestick / bar of aggregated trades.
#[derive(Clone, Debug, PartialEq)]
pub struct Candle {
    /// Start time of the candle (inclusive).
    pub time_start: DateTime<Utc>,
    /// End time of the candle (exclusive).
    pub time_end: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub resolution: Resolution,
}

impl Candle {
    /// The range of the bar
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }
}

/// One piece of market data for one symbol.
#[derive(Clone, Debug, PartialEq)]
pub enum MarketPayload {
    Tick(Tick),
    Quote(Bbo),
    Candle(Candle),
}

impl MarketPayload {
    /// Last traded price carried by this payload: the trade price or bar
    /// close. Quotes carry no trade.
    pub fn last_price(&self) -> Option<Decimal> {
        match self {
            MarketPayload::Tick(t) => Some(t.price),
            MarketPayload::Candle(c) => Some(c.close),
            MarketPayload::Quote(_) => None,
        }
    }
}

/// Market snapshot at one instant. Read-only once built.
#[derive(Clone, Debug, Default)]
pub struct DataBatch {
    pub time: DateTime<Utc>,
    entries: BTreeMap<Symbol, MarketPayload>,
}

impl DataBatch {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self { time, entries: BTreeMap::new() }
    }

    /// Builder-style insert; a later payload for the same symbol replaces the earlier one.
    pub fn with(mut self, symbol: Symbol, payload: MarketPayload) -> Self {
        self.entries.insert(symbol, payload);
        self
    }

    pub fn insert(&mut self, symbol: Symbol, payload: MarketPayload) {
        self.entries.insert(symbol, payload);
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&MarketPayload> { self.entries.get(symbol) }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> { self.entries.keys() }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &MarketPayload)> { self.entries.iter() }

    /// True if some symbol in the batch is a derivative of `root`.
    pub fn has_derivative_of(&self, root: &SymbolId) -> bool {
        self.entries.keys().any(|s| s.is_linked_to(root))
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}
