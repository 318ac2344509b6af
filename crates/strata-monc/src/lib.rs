//! Strata Monc - monitor map client
//!
//! A small cluster of monitors owns the authoritative cluster maps.
//! This client keeps the local copies fresh: it tracks the highest
//! epoch wanted and received per map type, re-requests with exponential
//! backoff until satisfied, and wakes waiters when new epochs land.
//! Communication is lossy-tolerant: as long as replies arrive we stay
//! with the same monitor, otherwise we re-pick at random.

pub mod client;

pub use client::{
    MapKind, MonClient, MonRequest, MonTransport, MountState, Statfs, BASE_DELAY, MAX_DELAY,
};
