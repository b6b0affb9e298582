//! Report module - result tables and JSON export

pub mod export;
pub mod summary;

pub use export::*;
pub use summary::*;
