pub mod put_selection;
pub mod synthetic_feed;
