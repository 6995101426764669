use std::borrow::Cow;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use crate::securities::symbols::{OptionRight, SymbolId};

/// OCC contract code components: root padded to 6, `YYMMDD`, right, strike x1000 in 8 digits.
///
/// `"TWX   140719P00070000"` is the TWX Jul-19-2014 70 put.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OptionContractCode {
    pub root: String,
    pub expiry: NaiveDate,
    pub right: OptionRight,
    pub strike: Decimal,
}

const ROOT_WIDTH: usize = 6;
const STRIKE_SCALE: i64 = 1000;
const MAX_STRIKE_MILLIS: i64 = 99_999_999;

/// Strike in thousandths when it fits the 8-digit code field exactly.
pub fn strike_millis(strike: Decimal) -> Option<i64> {
    let scaled = strike.checked_mul(Decimal::from(STRIKE_SCALE))?;
    if !scaled.fract().is_zero() { return None; }
    scaled.to_i64().filter(|m| (1..=MAX_STRIKE_MILLIS).contains(m))
}

impl OptionContractCode {
    /// `None` when the right is not Call/Put or the strike has no exact code.
    pub fn to_canonical(&self) -> Option<SymbolId> {
        let right = self.right.code()?;
        let milli = strike_millis(self.strike)?;
        Some(SymbolId(format!(
            "{:<width$}{}{}{:08}",
            self.root.to_ascii_uppercase(),
            self.expiry.format("%y%m%d"),
            right,
            milli,
            width = ROOT_WIDTH,
        )))
    }

    /// Parse a canonical or compact (`"TWX140719P00070000"`) code.
    pub fn parse(code: &str) -> Option<Self> {
        let s = sanitize_code(code).to_ascii_uppercase();
        // tail is always 15 chars: YYMMDD + right + 8 strike digits
        if s.len() <= 15 { return None; }
        let (root, tail) = s.split_at(s.len() - 15);
        if !root.chars().all(|c| c.is_ascii_alphabetic()) { return None; }

        let expiry = NaiveDate::parse_from_str(&tail[0..6], "%y%m%d").ok()?;
        let right = OptionRight::from_code(tail[6..7].chars().next()?)?;
        let digits = &tail[7..];
        if !digits.chars().all(|c| c.is_ascii_digit()) { return None; }
        let milli: i64 = digits.parse().ok()?;
        let strike = Decimal::new(milli, 3).normalize();

        Some(Self { root: root.to_string(), expiry, right, strike })
    }
}

#[inline]
fn sanitize_code(s: &str) -> Cow<'_, str> {
    if s.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Cow::Borrowed(s)
    }
    Cow::Owned(s.chars().filter(|c| c.is_ascii_alphanumeric()).collect())
}
