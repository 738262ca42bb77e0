//! Memory cache snapshots.
//!
//! Layout (little endian):
//!
//! ```text
//! magic u32 | version u32
//! (key_len u32 | key | age u32 | data_len u64 | data)*
//! length u64 | sha256 [32]
//! ```
//!
//! `length` counts every byte before the footer and the digest covers the
//! same bytes.

use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ddc_core::{DdcResult, PutStatus, SnapshotError};
use sha2::{Digest, Sha256};

use super::MemoryCacheBackend;

pub const SNAPSHOT_MAGIC: u32 = 0x4444_434D;
pub const SNAPSHOT_VERSION: u32 = 1;

const FOOTER_LEN: usize = 8 + 32;

fn io_error(path: &Path, e: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> SnapshotError {
    SnapshotError::Corrupt {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

impl MemoryCacheBackend {
    /// Write every entry to `path`. Returns the number of entries written.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> DdcResult<usize> {
        let path = path.as_ref();
        let entries = self.entries();

        let mut buf = BytesMut::with_capacity(self.current_size() as usize);
        buf.put_u32_le(SNAPSHOT_MAGIC);
        buf.put_u32_le(SNAPSHOT_VERSION);
        for (key, age, data) in &entries {
            buf.put_u32_le(key.len() as u32);
            buf.put_slice(key.as_bytes());
            buf.put_u32_le(*age);
            buf.put_u64_le(data.len() as u64);
            buf.put_slice(data);
        }
        let digest = Sha256::digest(&buf);
        buf.put_u64_le(buf.len() as u64);
        buf.put_slice(&digest);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &buf).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| io_error(path, e))?;

        tracing::info!(
            cache = %self.name,
            path = %path.display(),
            entries = entries.len(),
            bytes = buf.len(),
            "Memory cache snapshot saved"
        );
        Ok(entries.len())
    }

    /// Load entries from `path`. Returns the number of entries inserted.
    ///
    /// Each entry's age is incremented; entries older than `max_entry_age`
    /// are dropped. Loading stops once the budget is exhausted.
    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> DdcResult<usize> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|e| io_error(path, e))?;
        if raw.len() < 8 + FOOTER_LEN {
            return Err(corrupt(path, format!("file too short ({} bytes)", raw.len())).into());
        }

        let body_len = raw.len() - FOOTER_LEN;
        let (body, mut footer) = raw.split_at(body_len);

        let mut header = body;
        let magic = header.get_u32_le();
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic {
                path: path.display().to_string(),
                found: magic,
            }
            .into());
        }
        let version = header.get_u32_le();
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                path: path.display().to_string(),
                version,
            }
            .into());
        }

        let recorded_len = footer.get_u64_le();
        if recorded_len != body_len as u64 {
            return Err(corrupt(
                path,
                format!("length {} does not match {} bytes", recorded_len, body_len),
            )
            .into());
        }
        if Sha256::digest(body).as_slice() != footer {
            return Err(SnapshotError::ChecksumMismatch {
                path: path.display().to_string(),
            }
            .into());
        }

        let mut records = Bytes::copy_from_slice(header);
        let mut loaded = 0usize;
        let mut expired = 0usize;
        while records.has_remaining() {
            if records.remaining() < 4 {
                return Err(corrupt(path, "truncated key length").into());
            }
            let key_len = records.get_u32_le() as usize;
            if records.remaining() < key_len + 4 + 8 {
                return Err(corrupt(path, "truncated entry header").into());
            }
            let key = String::from_utf8(records.split_to(key_len).to_vec())
                .map_err(|_| corrupt(path, "key is not utf-8"))?;
            let age = records.get_u32_le().saturating_add(1);
            let data_len = records.get_u64_le() as usize;
            if records.remaining() < data_len {
                return Err(corrupt(path, "truncated entry data").into());
            }
            let data = records.split_to(data_len);

            if age > self.config.max_entry_age {
                expired += 1;
                continue;
            }
            match self.insert(&key, data, false, age) {
                PutStatus::NotCached => break,
                _ => loaded += 1,
            }
        }

        tracing::info!(
            cache = %self.name,
            path = %path.display(),
            loaded,
            expired,
            "Memory cache snapshot loaded"
        );
        Ok(loaded)
    }
}
