pub mod base_data;
pub mod price_book;
