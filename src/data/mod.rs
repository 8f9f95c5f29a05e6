pub mod cache;
pub mod stream;
pub mod types;
