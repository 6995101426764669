use std::time::Duration;
use chrono::{DateTime, Utc};
use thiserror::Error;
use crate::engine_core::scheduler::ScheduleKey;
use crate::securities::symbols::SymbolId;

/// Everything the lifecycle core can surface.
///
/// Per-action and per-root failures are collected into a tick report
/// instead of aborting the tick; see [`crate::engine_core::lifecycle`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// A custom selector returned a symbol it was never given.
    #[error("contract error: fabricated symbol {symbol} returned by selector {selector:?} for root {root}")]
    FabricatedSymbol { root: SymbolId, selector: String, symbol: SymbolId },

    /// The root's pipeline was marked faulted by an earlier contract error.
    #[error("contract error: pipeline for root {root} is faulted ({reason}); remove and re-add the universe")]
    FaultedPipeline { root: SymbolId, reason: String },

    #[error("duplicate subscription: universe for {root} is already active")]
    DuplicateSubscription { root: SymbolId },

    #[error("not found: no active universe for {root}")]
    NotFound { root: SymbolId },

    #[error("timeout: universe provider did not answer for {root} within {after:?}")]
    Timeout { root: SymbolId, after: Duration },

    #[error("scheduling conflict: add and remove for {root} both at {at}")]
    SchedulingConflict { root: SymbolId, at: DateTime<Utc> },

    /// A second add for the same root and instant with a different pipeline.
    #[error("duplicate schedule: add of {root} at {at} is already registered as {existing} with another pipeline")]
    DuplicateSchedule { root: SymbolId, at: DateTime<Utc>, existing: ScheduleKey },

    #[error("no reference price for {root}")]
    MissingReferencePrice { root: SymbolId },

    #[error("universe provider failed for {root}: {message}")]
    Provider { root: SymbolId, message: String },

    /// A refresh finished after its root was removed or refreshed again; the
    /// result was discarded.
    #[error("stale refresh for {root} discarded")]
    StaleRefresh { root: SymbolId },

    #[error("clock regression: {now} is before current time {current}")]
    ClockRegression { now: DateTime<Utc>, current: DateTime<Utc> },

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl EngineError {
    /// Root the error concerns, when there is one.
    pub fn root(&self) -> Option<&SymbolId> {
        match self {
            EngineError::FabricatedSymbol { root, .. }
            | EngineError::FaultedPipeline { root, .. }
            | EngineError::DuplicateSubscription { root }
            | EngineError::NotFound { root }
            | EngineError::Timeout { root, .. }
            | EngineError::SchedulingConflict { root, .. }
            | EngineError::DuplicateSchedule { root, .. }
            | EngineError::MissingReferencePrice { root }
            | EngineError::Provider { root, .. }
            | EngineError::StaleRefresh { root } => Some(root),
            _ => None,
        }
    }

    /// Contract errors are programming defects in a selector, never transient.
    #[inline]
    pub fn is_contract_error(&self) -> bool {
        matches!(self, EngineError::FabricatedSymbol { .. } | EngineError::FaultedPipeline { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
