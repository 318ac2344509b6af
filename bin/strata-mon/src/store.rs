//! Monitor store
//!
//! A small key/value store backing the monitor's critical state: short
//! ASCII keys map to opaque byte values, one file per key. Values are
//! framed so torn writes are detectable:
//!
//! ```text
//! +--------+--------+------+--------+
//! | Magic  | Length | Data | CRC32C |
//! | 4B     | 4B     | var  | 4B     |
//! +--------+--------+------+--------+
//! ```
//!
//! Required keys at startup: `whoami` (4-byte rank) and `monmap`
//! (encoded monitor map); their absence is fatal.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use strata_common::{Error, Result};

const STORE_MAGIC: u32 = 0x4d_53_54_52; // "MSTR"

/// Directory-backed monitor key/value store
pub struct MonitorStore {
    dir: PathBuf,
}

impl MonitorStore {
    /// Open (creating if needed) the store directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// True if `key` exists
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }

    /// Read and verify a value
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("store key {key:?}")));
            }
            Err(e) => return Err(e.into()),
        };
        if raw.len() < 12 {
            return Err(Error::bad_encoding(format!("store key {key:?} too short")));
        }
        let magic = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        if magic != STORE_MAGIC {
            return Err(Error::bad_encoding(format!("store key {key:?} bad magic")));
        }
        let len = u32::from_le_bytes(raw[4..8].try_into().unwrap()) as usize;
        if raw.len() != 12 + len {
            return Err(Error::bad_encoding(format!(
                "store key {key:?} length mismatch"
            )));
        }
        let data = &raw[8..8 + len];
        let stored_crc = u32::from_le_bytes(raw[8 + len..].try_into().unwrap());
        if crc32c::crc32c(&raw[..8 + len]) != stored_crc {
            return Err(Error::bad_encoding(format!("store key {key:?} crc mismatch")));
        }
        Ok(data.to_vec())
    }

    /// Write a value durably: frame, write to a temp file, fsync, rename
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(12 + value.len());
        framed.extend_from_slice(&STORE_MAGIC.to_le_bytes());
        framed.extend_from_slice(&(value.len() as u32).to_le_bytes());
        framed.extend_from_slice(value);
        let crc = crc32c::crc32c(&framed);
        framed.extend_from_slice(&crc.to_le_bytes());

        let tmp = self.path_for(&format!("{key}.new"));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&framed)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, self.path_for(key))?;
        Ok(())
    }

    /// Read a little-endian u32 value
    pub fn get_u32(&self, key: &str) -> Result<u32> {
        let data = self.get(key)?;
        let bytes: [u8; 4] = data
            .as_slice()
            .try_into()
            .map_err(|_| Error::bad_encoding(format!("store key {key:?} is not a u32")))?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian u32 value
    pub fn put_u32(&self, key: &str, value: u32) -> Result<()> {
        self.put(key, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MonitorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MonitorStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = store();
        store.put("monmap", b"hello map").unwrap();
        assert_eq!(store.get("monmap").unwrap(), b"hello map");
        assert!(store.exists("monmap"));
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let (_dir, store) = store();
        assert!(store.get("whoami").unwrap_err().is_not_found());
        assert!(!store.exists("whoami"));
    }

    #[test]
    fn test_u32_helpers() {
        let (_dir, store) = store();
        store.put_u32("whoami", 3).unwrap();
        assert_eq!(store.get_u32("whoami").unwrap(), 3);
        store.put("whoami", b"xyz").unwrap();
        assert!(store.get_u32("whoami").is_err());
    }

    #[test]
    fn test_corruption_detected() {
        let (dir, store) = store();
        store.put("monmap", b"payload bytes").unwrap();
        let path = dir.path().join("monmap");
        let mut raw = std::fs::read(&path).unwrap();
        raw[10] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();
        assert!(matches!(
            store.get("monmap"),
            Err(Error::BadEncoding(_))
        ));
    }

    #[test]
    fn test_overwrite_replaces() {
        let (_dir, store) = store();
        store.put("k", b"one").unwrap();
        store.put("k", b"two").unwrap();
        assert_eq!(store.get("k").unwrap(), b"two");
    }
}
