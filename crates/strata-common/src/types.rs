//! Core type definitions for Strata
//!
//! This module defines the primitive identifiers shared by the cluster
//! map, placement and capability subsystems.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cluster map version. Zero means "unknown".
pub type Epoch = u32;

/// Identifier of a storage target (leaf device). Always non-negative.
pub type TargetId = u32;

/// Index of an interior placement bucket from its (negative) item id.
///
/// Bucket ids are negative by convention; `(-1 - id)` is the index into
/// the bucket array.
#[must_use]
pub const fn bucket_index(id: i32) -> usize {
    (-1 - id) as usize
}

/// Item id of the bucket at a given array index.
#[must_use]
pub const fn bucket_id(index: usize) -> i32 {
    -1 - (index as i32)
}

/// 128-bit cluster identifier. Fixed at cluster creation, never changes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fsid {
    pub major: u64,
    pub minor: u64,
}

impl Fsid {
    /// Create from two halves
    #[must_use]
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// Generate a random fsid (used at cluster mkfs time)
    #[must_use]
    pub fn generate() -> Self {
        Self {
            major: rand::random(),
            minor: rand::random(),
        }
    }

    /// Zero fsid, used before the first monitor map arrives
    #[must_use]
    pub const fn zero() -> Self {
        Self { major: 0, minor: 0 }
    }
}

impl fmt::Display for Fsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.major, self.minor)
    }
}

impl fmt::Debug for Fsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fsid({self})")
    }
}

impl FromStr for Fsid {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('-')
            .ok_or_else(|| crate::Error::bad_encoding(format!("fsid {s:?}: missing '-'")))?;
        let parse = |h: &str| {
            u64::from_str_radix(h, 16)
                .map_err(|e| crate::Error::bad_encoding(format!("fsid {s:?}: {e}")))
        };
        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
        })
    }
}

/// Snap id meaning "the live (non-snapshot) version"
pub const NOSNAP: u64 = u64::MAX;

/// Snap id of the virtual snapshot directory
pub const SNAPDIR: u64 = u64::MAX - 1;

/// Versioned inode number: an inode plus the snapshot it is viewed at.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vino {
    pub ino: u64,
    pub snap: u64,
}

impl Vino {
    /// The live (non-snapshot) view of an inode
    #[must_use]
    pub const fn head(ino: u64) -> Self {
        Self { ino, snap: NOSNAP }
    }

    /// A specific snapshot view of an inode
    #[must_use]
    pub const fn at(ino: u64, snap: u64) -> Self {
        Self { ino, snap }
    }

    /// True for the live view
    #[must_use]
    pub const fn is_head(&self) -> bool {
        self.snap == NOSNAP
    }
}

impl fmt::Debug for Vino {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_head() {
            write!(f, "{:x}.head", self.ino)
        } else {
            write!(f, "{:x}.{:x}", self.ino, self.snap)
        }
    }
}

/// Placement group identifier, packed into 64 bits.
///
/// Layout, low to high: ps seed `u32` | preferred target `i16` |
/// replica count `u8` | pg type `u8`. The packed form is what goes on
/// the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PgId(u64);

/// Replicated placement group type
pub const PG_TYPE_REP: u8 = 1;

impl PgId {
    /// Assemble a pg id from its fields
    #[must_use]
    pub fn new(ps: u32, preferred: i16, size: u8, pg_type: u8) -> Self {
        let raw = u64::from(ps)
            | (u64::from(preferred as u16) << 32)
            | (u64::from(size) << 48)
            | (u64::from(pg_type) << 56);
        Self(raw)
    }

    /// Rebuild from the packed wire form
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Packed wire form
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Pseudo-random placement seed
    #[must_use]
    pub const fn ps(&self) -> u32 {
        self.0 as u32
    }

    /// Preferred primary target, or negative for none
    #[must_use]
    pub const fn preferred(&self) -> i16 {
        (self.0 >> 32) as u16 as i16
    }

    /// Replica count
    #[must_use]
    pub const fn size(&self) -> u8 {
        (self.0 >> 48) as u8
    }

    /// Placement group type
    #[must_use]
    pub const fn pg_type(&self) -> u8 {
        (self.0 >> 56) as u8
    }

    /// New pg id with the ps seed replaced (used when masking)
    #[must_use]
    pub fn with_ps(&self, ps: u32) -> Self {
        Self((self.0 & !0xffff_ffff) | u64::from(ps))
    }
}

impl fmt::Debug for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pg({}.{:x} size {} pref {})",
            self.pg_type(),
            self.ps(),
            self.size(),
            self.preferred()
        )
    }
}

/// Network address of a cluster entity, in fixed wire form.
///
/// The nonce distinguishes successive incarnations of a daemon bound to
/// the same ip:port.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetAddr {
    pub nonce: u32,
    pub ip: [u8; 4],
    pub port: u16,
}

/// Encoded size of a [`TargetAddr`]
pub const ADDR_WIRE_LEN: usize = 10;

impl TargetAddr {
    /// Build from a socket address (IPv4 only on the wire)
    pub fn from_socket(addr: SocketAddr, nonce: u32) -> crate::Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self {
                nonce,
                ip: v4.ip().octets(),
                port: v4.port(),
            }),
            SocketAddr::V6(_) => Err(crate::Error::bad_encoding(
                "ipv6 addresses are not representable on the wire",
            )),
        }
    }

    /// Convert to a socket address
    #[must_use]
    pub fn to_socket(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip.into(), self.port))
    }

    /// True for the all-zero "unset" address
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.ip == [0; 4] && self.port == 0
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}:{}/{}",
            self.ip[0], self.ip[1], self.ip[2], self.ip[3], self.port, self.nonce
        )
    }
}

impl fmt::Debug for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetAddr({self})")
    }
}

impl FromStr for TargetAddr {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sa: SocketAddr = s
            .parse()
            .map_err(|e| crate::Error::bad_encoding(format!("address {s:?}: {e}")))?;
        Self::from_socket(sa, 0)
    }
}

/// Timestamp carried in maps and capability messages.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

impl Timespec {
    #[must_use]
    pub const fn new(sec: u64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// Current wall-clock time
    #[must_use]
    pub fn now() -> Self {
        let d = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: d.as_secs(),
            nsec: d.subsec_nanos(),
        }
    }
}

/// Allocator for 64-bit cookies: watch registrations, transaction ids.
///
/// Values are monotonically increasing and never zero.
#[derive(Debug, Default)]
pub struct CookieAllocator {
    next: AtomicU64,
}

impl CookieAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Allocate the next cookie
    pub fn alloc(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}
