//! Capability bits and open-file modes

/// Hold the inode in cache
pub const CAP_PIN: u32 = 1;
/// Synchronous reads
pub const CAP_RD: u32 = 2;
/// Cache read data locally
pub const CAP_RDCACHE: u32 = 4;
/// Synchronous writes
pub const CAP_WR: u32 = 8;
/// Buffer writes locally
pub const CAP_WRBUFFER: u32 = 16;
/// Exclusive metadata (sizes, timestamps) ownership
pub const CAP_EXCL: u32 = 32;

/// Open-file modes, indexing the per-inode open counts
pub const FILE_MODE_RDONLY: usize = 0;
pub const FILE_MODE_RDWR: usize = 1;
pub const FILE_MODE_WRONLY: usize = 2;
pub const FILE_MODE_LAZY: usize = 3;
pub const FILE_MODE_NUM: usize = 4;

/// The capability bits an open mode asks for
#[must_use]
pub fn caps_for_mode(mode: usize) -> u32 {
    match mode {
        FILE_MODE_RDONLY => CAP_PIN | CAP_RD | CAP_RDCACHE,
        FILE_MODE_RDWR => CAP_PIN | CAP_RD | CAP_RDCACHE | CAP_WR | CAP_WRBUFFER,
        FILE_MODE_WRONLY => CAP_PIN | CAP_WR | CAP_WRBUFFER,
        FILE_MODE_LAZY => CAP_PIN | CAP_RD | CAP_WR,
        _ => 0,
    }
}

/// Compact debug form, e.g. `pin,rd,rdcache`
#[must_use]
pub fn cap_string(caps: u32) -> String {
    let names = [
        (CAP_PIN, "pin"),
        (CAP_RD, "rd"),
        (CAP_RDCACHE, "rdcache"),
        (CAP_WR, "wr"),
        (CAP_WRBUFFER, "wrbuffer"),
        (CAP_EXCL, "excl"),
    ];
    let s: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| caps & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if s.is_empty() {
        "-".to_string()
    } else {
        s.join(",")
    }
}
