pub mod clock;
pub mod config;
pub mod correlator;
pub mod engine;
pub mod errors;
pub mod event_hub;
pub mod lifecycle;
pub mod scheduler;
pub mod snapshot;
