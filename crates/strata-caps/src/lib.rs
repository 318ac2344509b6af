//! Strata Caps - capability-based client cache coherence
//!
//! A metadata authority grants per-inode capabilities that tell a
//! client what it may do locally: read, cache reads, write, buffer
//! writes. The authority can narrow a grant at any time; the client
//! drains local use of the revoked bits and acknowledges. Authorities
//! can migrate an inode between each other, and snapshots capture
//! point-in-time metadata that flushes back asynchronously once dirty
//! data drains.
//!
//! For any inode the client may hold one capability per authority; its
//! effective rights are the union of the non-stale grants.

pub mod arena;
pub mod bits;
pub mod client;
pub mod inode;
pub mod message;
pub mod session;
pub mod snap;

pub use arena::{Cap, CapSlot, CapTable};
pub use bits::*;
pub use client::{CapClient, CapTransport};
pub use inode::{ExportingCaps, Inode, InodeState};
pub use message::{CapMessage, CapOp};
pub use session::Session;
pub use snap::{CapSnap, RealmArena, SnapContext, SnapRealm};
