pub mod catalog;
pub mod filters;
pub mod inbuilt;
pub mod models;
