//! Shared types and error plumbing used across all courier crates.

pub mod error;
pub mod types;

pub use error::FromMessage;
