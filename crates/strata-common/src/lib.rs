//! Strata Common - Shared types and utilities
//!
//! This crate provides the primitive identifiers, error definitions,
//! wire codec helpers, configuration types and the delayed-work
//! scheduler used across all Strata components.

pub mod codec;
pub mod config;
pub mod error;
pub mod timer;
pub mod types;

pub use codec::{Decoder, Encoder};
pub use error::{Error, Result};
pub use timer::{Scheduler, TimerHandle};
pub use types::*;
