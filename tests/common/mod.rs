//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - In-memory ChangeLog that records calls and can be made to fail
//! - Store seeding and NRTM3 client helpers

pub mod fixtures;
pub mod memory_log;

pub use fixtures::*;
pub use memory_log::*;
