//! # Bookmill Common Library
//!
//! Shared code for the Bookmill document pipeline:
//! - Error taxonomy
//! - Configuration loading and root folder resolution
//! - Per-book database registry and schema guard
//! - Job event types and the event bus
//! - Identifier validation

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod ids;

pub use error::{Error, Result};
