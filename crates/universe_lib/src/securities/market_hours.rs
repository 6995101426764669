use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use crate::engine_core::errors::{EngineError, EngineResult};

/// One daily session window, in seconds-since-midnight of the venue's local time.
/// `days` is indexed Monday = 0 .. Sunday = 6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRule { pub days: [bool; 7], pub open_ssm: u32, pub close_ssm: u32 }

/// Trading calendar for a venue: time zone, regular sessions, holidays.
///
/// Equity option venues trade a single non-wrapping session per day, so the
/// session helpers here never look across midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHours {
    pub venue: String,
    pub tz: Tz,
    pub regular: Vec<SessionRule>,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

const WEEKDAYS: [bool; 7] = [true, true, true, true, true, false, false];

impl MarketHours {
    /// US listed equities and equity options: 09:30–16:00 America/New_York, Mon–Fri.
    pub fn us_equity() -> Self {
        Self {
            venue: "US-EQUITY".to_string(),
            tz: chrono_tz::America::New_York,
            regular: vec![SessionRule { days: WEEKDAYS, open_ssm: 9 * 3600 + 30 * 60, close_ssm: 16 * 3600 }],
            holidays: vec![],
        }
    }

    /// Round-the-clock calendar in `tz` (no holidays); used when only the
    /// time zone matters.
    pub fn always_open(tz: Tz) -> Self {
        Self {
            venue: format!("24x7-{tz}"),
            tz,
            regular: vec![SessionRule { days: [true; 7], open_ssm: 0, close_ssm: 24 * 3600 }],
            holidays: vec![],
        }
    }

    pub fn with_holidays<I: IntoIterator<Item = NaiveDate>>(mut self, days: I) -> Self {
        self.holidays.extend(days);
        self
    }

    #[inline]
    pub fn is_holiday(&self, d: NaiveDate) -> bool {
        self.holidays.iter().any(|h| *h == d)
    }

    fn rule_for_date(&self, d: NaiveDate) -> Option<&SessionRule> {
        if self.is_holiday(d) { return None; }
        let w = d.weekday().num_days_from_monday() as usize;
        self.regular.iter().find(|r| r.days[w])
    }

    /// True if the regular session is open at `t`.
    pub fn is_open(&self, t: DateTime<Utc>) -> bool {
        let local = t.with_timezone(&self.tz);
        let ssm = local.num_seconds_from_midnight();
        match self.rule_for_date(local.date_naive()) {
            Some(r) => ssm >= r.open_ssm && ssm < r.close_ssm,
            None => false,
        }
    }

    /// Session `[open, close)` on local date `d`, in UTC. `None` on weekends/holidays.
    pub fn session_bounds(&self, d: NaiveDate) -> EngineResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let Some(r) = self.rule_for_date(d) else { return Ok(None) };
        let open = self.local_to_utc(d, ssm_to_time(r.open_ssm))?;
        let close = self.local_to_utc(d, ssm_to_time(r.close_ssm))?;
        Ok(Some((open, close)))
    }

    /// Resolve a venue-local wall time on `d` into UTC.
    ///
    /// Ambiguous (fall-back) times take the earlier instant; times inside a
    /// spring-forward gap do not exist and are rejected.
    pub fn local_to_utc(&self, d: NaiveDate, time: NaiveTime) -> EngineResult<DateTime<Utc>> {
        match self.tz.from_local_datetime(&d.and_time(time)) {
            LocalResult::Single(t) => Ok(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(a, b) => Ok(a.min(b).with_timezone(&Utc)),
            LocalResult::None => Err(EngineError::InvalidRule(format!(
                "{d} {time} does not exist in {}", self.tz
            ))),
        }
    }

    /// Next trading date strictly after `d` (bounded two-week search).
    pub fn next_trading_day(&self, d: NaiveDate) -> Option<NaiveDate> {
        (1..=14)
            .map(|n| d + Duration::days(n))
            .find(|day| self.rule_for_date(*day).is_some())
    }
}

fn ssm_to_time(ssm: u32) -> NaiveTime {
    // 24:00 close is represented as the last representable instant of the day
    NaiveTime::from_num_seconds_from_midnight_opt(ssm.min(24 * 3600 - 1), 0).unwrap_or(NaiveTime::MIN)
}
