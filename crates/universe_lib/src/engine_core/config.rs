//! Engine configuration.
//!
//! Loaded from TOML, with environment overrides (a `.env` file is honoured):
//!
//! - `UNIVERSE_CONFIG`: path of the TOML file
//! - `UNIVERSE_PROVIDER_TIMEOUT_MS`: provider query timeout
//! - `UNIVERSE_TIME_ZONE`: exchange time zone (IANA name)
//!
//! ```toml
//! provider_timeout_ms = 2000
//! time_zone = "America/New_York"
//!
//! [[universes]]
//! root = "TWX"
//! expiration_window = { min_days = 0, max_days = 180 }
//! selector = "latest_expiry_nearest_put"
//!
//! [[schedule]]
//! root = "TWX"
//! action = "add"
//! date = { on = "2014-06-05" }
//! time = "midnight"
//!
//! [[schedule]]
//! root = "TWX"
//! action = "remove"
//! date = { on = "2014-06-06" }
//! time = { at = { hour = 0, minute = 0, second = 0 } }
//! ```
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use crate::engine_core::errors::{EngineError, EngineResult};
use crate::engine_core::scheduler::{ActionKind, DateRule, ScheduleKey, Scheduler, TimeRule, UniverseAction};
use crate::securities::market_hours::MarketHours;
use crate::securities::symbols::SymbolId;
use crate::universes::catalog::SelectorCatalog;
use crate::universes::filters::{FilterPipeline, FilterSpec, StageSpec};

pub const ENV_CONFIG_PATH: &str = "UNIVERSE_CONFIG";
pub const ENV_PROVIDER_TIMEOUT_MS: &str = "UNIVERSE_PROVIDER_TIMEOUT_MS";
pub const ENV_TIME_ZONE: &str = "UNIVERSE_TIME_ZONE";

fn default_timeout_ms() -> u64 { 2_000 }
fn default_time_zone() -> String { "America/New_York".to_string() }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub min_days: i64,
    pub max_days: i64,
}

/// Filter configuration of one root.
///
/// Stages run as: expiration window, then `stages`, then the named selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseConfig {
    pub root: SymbolId,
    #[serde(default)]
    pub expiration_window: Option<WindowConfig>,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub selector: Option<String>,
}

impl UniverseConfig {
    pub fn filter_spec(&self) -> FilterSpec {
        let mut stages = Vec::new();
        if let Some(w) = self.expiration_window {
            stages.push(StageSpec::ExpirationWindow { min_days: w.min_days, max_days: w.max_days });
        }
        stages.extend(self.stages.iter().cloned());
        if let Some(name) = &self.selector {
            stages.push(StageSpec::Select { selector: name.clone() });
        }
        FilterSpec { stages }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRuleConfig {
    pub root: SymbolId,
    pub action: ActionKind,
    pub date: DateRule,
    pub time: TimeRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_timeout_ms")]
    pub provider_timeout_ms: u64,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    /// Exchange holidays (no session on these local dates).
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
    #[serde(default)]
    pub universes: Vec<UniverseConfig>,
    #[serde(default)]
    pub schedule: Vec<ScheduleRuleConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: default_timeout_ms(),
            time_zone: default_time_zone(),
            holidays: Vec::new(),
            universes: Vec::new(),
            schedule: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> EngineResult<Self> {
        toml::from_str(s).map_err(|e| EngineError::Config(format!("parse error: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Load from `$UNIVERSE_CONFIG` (defaults when unset) and apply the
    /// environment overrides. Reads `.env` first if present.
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();
        let mut cfg = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_overrides(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> EngineResult<()> {
        if let Some(ms) = lookup(ENV_PROVIDER_TIMEOUT_MS) {
            self.provider_timeout_ms = ms
                .trim()
                .parse()
                .map_err(|e| EngineError::Config(format!("{ENV_PROVIDER_TIMEOUT_MS}={ms:?}: {e}")))?;
        }
        if let Some(tz) = lookup(ENV_TIME_ZONE) {
            self.time_zone = tz.trim().to_string();
        }
        Ok(())
    }

    #[inline]
    pub fn provider_timeout(&self) -> Duration { Duration::from_millis(self.provider_timeout_ms) }

    pub fn tz(&self) -> EngineResult<Tz> {
        self.time_zone
            .parse::<Tz>()
            .map_err(|e| EngineError::Config(format!("time zone {:?}: {e}", self.time_zone)))
    }

    /// Regular 09:30–16:00 weekday sessions in the configured zone.
    pub fn market_hours(&self) -> EngineResult<MarketHours> {
        let mut hours = MarketHours::us_equity().with_holidays(self.holidays.iter().copied());
        hours.tz = self.tz()?;
        Ok(hours)
    }

    /// Build every universe's pipeline through `catalog`.
    pub fn pipelines(&self, catalog: &SelectorCatalog) -> EngineResult<BTreeMap<SymbolId, FilterPipeline>> {
        let mut out = BTreeMap::new();
        for u in &self.universes {
            let pipeline = u.filter_spec()
                .build(catalog)
                .map_err(|e| EngineError::Config(format!("universe {}: {e}", u.root)))?;
            if out.insert(u.root.clone(), pipeline).is_some() {
                return Err(EngineError::Config(format!("universe {} configured twice", u.root)));
            }
        }
        Ok(out)
    }

    /// Register the configured schedule rules on `scheduler`.
    pub fn install_schedule(&self, scheduler: &mut Scheduler, catalog: &SelectorCatalog) -> EngineResult<Vec<ScheduleKey>> {
        let pipelines = self.pipelines(catalog)?;
        let mut keys = Vec::new();
        for rule in &self.schedule {
            let action = match rule.action {
                ActionKind::Add => {
                    let pipeline = pipelines.get(&rule.root).cloned().ok_or_else(|| {
                        EngineError::Config(format!("schedule adds {} but no universe is configured for it", rule.root))
                    })?;
                    UniverseAction::AddUniverse { root: rule.root.clone(), pipeline }
                }
                ActionKind::Remove => UniverseAction::RemoveUniverse { root: rule.root.clone() },
            };
            keys.extend(scheduler.schedule(&rule.date, rule.time, action)?);
        }
        Ok(keys)
    }

    /// Check everything that can be checked without running: time zone,
    /// selectors, windows, and schedule conflicts.
    pub fn validate(&self, catalog: &SelectorCatalog) -> EngineResult<()> {
        let mut scratch = Scheduler::new(self.market_hours()?);
        self.install_schedule(&mut scratch, catalog)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
provider_timeout_ms = 500
time_zone = "America/New_York"

[[universes]]
root = "TWX"
expiration_window = { min_days = 0, max_days = 180 }
selector = "latest_expiry_nearest_put"

[[schedule]]
root = "TWX"
action = "add"
date = { on = "2014-06-05" }
time = "midnight"

[[schedule]]
root = "TWX"
action = "remove"
date = { dates = ["2014-06-06", "2014-06-09"] }
time = { after_market_open = 5 }
"#;

    #[test]
    fn parses_and_installs_sample() {
        let cfg = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.provider_timeout(), Duration::from_millis(500));
        let catalog = SelectorCatalog::with_defaults();
        cfg.validate(&catalog).unwrap();

        let mut scheduler = Scheduler::new(cfg.market_hours().unwrap());
        let keys = cfg.install_schedule(&mut scheduler, &catalog).unwrap();
        assert_eq!(keys.len(), 3);
        let pipeline = &cfg.pipelines(&catalog).unwrap()[&SymbolId::from("TWX")];
        assert_eq!(pipeline.stages().len(), 2);
    }

    #[test]
    fn rejects_unknown_selector_and_inverted_window() {
        let catalog = SelectorCatalog::with_defaults();
        let unknown = SAMPLE.replace("latest_expiry_nearest_put", "no_such_selector");
        let err = EngineConfig::from_toml_str(&unknown).unwrap().validate(&catalog).unwrap_err();
        assert!(matches!(err, EngineError::Config(ref m) if m.contains("no_such_selector")));

        let inverted = SAMPLE.replace("min_days = 0, max_days = 180", "min_days = 30, max_days = 10");
        assert!(EngineConfig::from_toml_str(&inverted).unwrap().validate(&catalog).is_err());
    }

    #[test]
    fn out_of_range_window_is_a_config_error() {
        let catalog = SelectorCatalog::with_defaults();
        let huge = SAMPLE.replace("max_days = 180", "max_days = 9223372036854775807");
        let cfg = EngineConfig::from_toml_str(&huge).unwrap();
        let err = cfg.validate(&catalog).unwrap_err();
        assert!(matches!(err, EngineError::Config(ref m) if m.contains("out of range")));
        assert!(cfg.pipelines(&catalog).is_err());
    }

    #[test]
    fn rejects_conflicting_schedule() {
        let conflict = SAMPLE.replace(r#"date = { dates = ["2014-06-06", "2014-06-09"] }
time = { after_market_open = 5 }"#, r#"date = { on = "2014-06-05" }
time = "midnight""#);
        let err = EngineConfig::from_toml_str(&conflict).unwrap()
            .validate(&SelectorCatalog::with_defaults())
            .unwrap_err();
        assert!(matches!(err, EngineError::SchedulingConflict { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = EngineConfig::default();
        cfg.apply_overrides(|k| match k {
            ENV_PROVIDER_TIMEOUT_MS => Some("750".into()),
            ENV_TIME_ZONE => Some("Europe/London".into()),
            _ => None,
        }).unwrap();
        assert_eq!(cfg.provider_timeout_ms, 750);
        assert_eq!(cfg.tz().unwrap(), chrono_tz::Europe::London);

        let bad = cfg.apply_overrides(|k| (k == ENV_PROVIDER_TIMEOUT_MS).then(|| "soon".to_string()));
        assert!(matches!(bad, Err(EngineError::Config(_))));

        cfg.time_zone = "Mars/Olympus".into();
        assert!(cfg.market_hours().is_err());
    }
}
