//! CLI module - argument parsing

pub mod args;

pub use args::*;
