pub mod market_hours;
pub mod option_helpers;
pub mod registry;
pub mod symbols;
