//! Integration test infrastructure for Crucible.

pub mod fixtures;
