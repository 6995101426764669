//! Option-universe lifecycle engine.
//!
//! Keeps, per root symbol, a filtered set of option contracts that is added,
//! refreshed and removed on a logical clock, and publishes one consolidated
//! change set per tick. See [`engine_core::engine::UniverseEngine`] for the
//! entry point.
pub mod engine_core;
pub mod market_data;
pub mod securities;
pub mod universes;
