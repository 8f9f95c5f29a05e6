pub mod backoff;
pub mod driver;
pub mod normalizer;
