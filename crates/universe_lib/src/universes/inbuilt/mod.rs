pub mod latest_expiry;
pub mod r#static;
