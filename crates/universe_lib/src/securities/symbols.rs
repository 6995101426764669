use std::fmt;
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use crate::engine_core::errors::{EngineError, EngineResult};
use crate::securities::option_helpers::OptionContractCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
pub enum SecurityType { Equity, Option, Future, Index }

impl SecurityType {
    /// Derivatives are anchored to an underlying root.
    #[inline]
    pub fn is_derivative(self) -> bool {
        matches!(self, SecurityType::Option | SecurityType::Future)
    }
}

/// Option right. `None` for anything that is not an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
pub enum OptionRight { Call, Put, None }

impl OptionRight {
    pub fn code(self) -> Option<char> {
        match self {
            OptionRight::Call => Some('C'),
            OptionRight::Put => Some('P'),
            OptionRight::None => None,
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'C' => Some(OptionRight::Call),
            'P' => Some(OptionRight::Put),
            _ => None,
        }
    }
}

/// Canonical identifier, human-readable.
/// Examples: "AAPL" or "AAPL  140621P00500000"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SymbolId(pub String);

impl SymbolId {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
    #[inline]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SymbolId {
    fn from(s: &str) -> Self { SymbolId(s.to_string()) }
}

/// Static instrument facts.
///
/// Fields are private so the derivative/underlying invariant holds for every
/// value in the engine: derivatives always carry an underlying, equities and
/// indices never do. Build through [`Symbol::equity`] or [`Symbol::option`].
///
/// Ordering and equality are by `id` first, which is also the deterministic
/// iteration order used by change sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawSymbol", into = "RawSymbol")]
pub struct Symbol {
    id: SymbolId,
    security_type: SecurityType,
    underlying: Option<SymbolId>,
    expiry: Option<NaiveDate>,
    strike: Option<Decimal>,
    right: OptionRight,
}

impl Symbol {
    /// A plain equity (no underlying, no expiry).
    pub fn equity(ticker: impl Into<String>) -> Self {
        Self {
            id: SymbolId(ticker.into().trim().to_ascii_uppercase()),
            security_type: SecurityType::Equity,
            underlying: None,
            expiry: None,
            strike: None,
            right: OptionRight::None,
        }
    }

    /// An equity option on `underlying`; the id is the OCC-style contract code.
    pub fn option(underlying: &SymbolId, right: OptionRight, strike: Decimal, expiry: NaiveDate) -> EngineResult<Self> {
        if right == OptionRight::None {
            return Err(EngineError::InvalidSymbol(format!("option on {underlying} needs a Call/Put right")));
        }
        if strike <= Decimal::ZERO {
            return Err(EngineError::InvalidSymbol(format!("option on {underlying} has non-positive strike {strike}")));
        }
        let code = OptionContractCode {
            root: underlying.0.clone(),
            expiry,
            right,
            strike,
        };
        let id = code.to_canonical().ok_or_else(|| {
            EngineError::InvalidSymbol(format!(
                "option on {underlying}: strike {strike} needs at most 3 decimals and must be below 100000"
            ))
        })?;
        Ok(Self {
            id,
            security_type: SecurityType::Option,
            underlying: Some(underlying.clone()),
            expiry: Some(expiry),
            strike: Some(strike),
            right,
        })
    }

    /// Parse an OCC-style option code back into a symbol.
    pub fn parse_option(code: &str) -> EngineResult<Self> {
        let parsed = OptionContractCode::parse(code)
            .ok_or_else(|| EngineError::InvalidSymbol(format!("not an option code: {code:?}")))?;
        Symbol::option(&SymbolId(parsed.root), parsed.right, parsed.strike, parsed.expiry)
    }

    #[inline] pub fn id(&self) -> &SymbolId { &self.id }
    #[inline] pub fn security_type(&self) -> SecurityType { self.security_type }
    #[inline] pub fn underlying(&self) -> Option<&SymbolId> { self.underlying.as_ref() }
    #[inline] pub fn has_underlying(&self) -> bool { self.underlying.is_some() }
    #[inline] pub fn expiry(&self) -> Option<NaiveDate> { self.expiry }
    #[inline] pub fn strike(&self) -> Option<Decimal> { self.strike }
    #[inline] pub fn right(&self) -> OptionRight { self.right }

    /// True when this symbol belongs to the derivative group rooted at `root`.
    #[inline]
    pub fn is_linked_to(&self, root: &SymbolId) -> bool {
        self.underlying.as_ref() == Some(root)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id.0)
    }
}

/// Wire shape; validated on the way in.
#[derive(Serialize, Deserialize)]
struct RawSymbol {
    id: SymbolId,
    security_type: SecurityType,
    #[serde(default)]
    underlying: Option<SymbolId>,
    #[serde(default)]
    expiry: Option<NaiveDate>,
    #[serde(default)]
    strike: Option<Decimal>,
    #[serde(default = "no_right")]
    right: OptionRight,
}

fn no_right() -> OptionRight { OptionRight::None }

impl TryFrom<RawSymbol> for Symbol {
    type Error = EngineError;

    fn try_from(raw: RawSymbol) -> Result<Self, Self::Error> {
        match (raw.security_type.is_derivative(), raw.underlying.is_some()) {
            (true, false) => Err(EngineError::InvalidSymbol(format!("derivative {} without underlying", raw.id))),
            (false, true) => Err(EngineError::InvalidSymbol(format!("{} {} cannot have an underlying", raw.security_type, raw.id))),
            _ => Ok(Symbol {
                id: raw.id,
                security_type: raw.security_type,
                underlying: raw.underlying,
                expiry: raw.expiry,
                strike: raw.strike,
                right: raw.right,
            }),
        }
    }
}

impl From<Symbol> for RawSymbol {
    fn from(s: Symbol) -> Self {
        RawSymbol {
            id: s.id,
            security_type: s.security_type,
            underlying: s.underlying,
            expiry: s.expiry,
            strike: s.strike,
            right: s.right,
        }
    }
}

/// Third Friday of a month (standard monthly equity option expiry)
pub fn third_friday(year: i32, month: u32) -> Option<NaiveDate> {
    let mut d = NaiveDate::from_ymd_opt(year, month, 1)?;
    let mut fridays = 0;
    loop {
        if d.weekday().number_from_monday() == 5 { fridays += 1; }
        if fridays == 3 { return Some(d); }
        d = d.succ_opt()?;
    }
}
