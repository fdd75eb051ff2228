//! Crucible Core
//!
//! Core domain types, traits, and error handling for the Crucible build
//! queue and scheduling engine. This crate has minimal dependencies and
//! defines the shared vocabulary used across all other crates.

pub mod actions;
pub mod axes;
pub mod error;
pub mod events;
pub mod ids;
pub mod interrupt;
pub mod label;
pub mod ports;
pub mod result;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
