//! Structured cache records and their package encoding.
//!
//! A record is stored through the legacy byte interface as a single
//! "package" blob under [`CacheKey::legacy_key`]. Layout (little endian):
//!
//! ```text
//! magic "DDCR" | version u8
//! bucket_len u16 | bucket | hash [32]
//! meta_len u32 | meta JSON
//! has_value u8 | [value_len u64 | value]
//! attachment_count u32 | (id [12] | len u64 | data)*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};

use crate::error::RecordError;
use crate::key::{CacheBucket, CacheKey, ContentHash, ValueId};

const PACKAGE_MAGIC: u32 = u32::from_le_bytes(*b"DDCR");
const PACKAGE_VERSION: u8 = 1;

/// Immutable structured cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    key: CacheKey,
    meta: Map<String, Value>,
    value: Option<Bytes>,
    attachments: Vec<(ValueId, Bytes)>,
}

impl CacheRecord {
    pub fn builder(key: CacheKey) -> CacheRecordBuilder {
        CacheRecordBuilder {
            key,
            meta: Map::new(),
            value: None,
            attachments: Vec::new(),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn attachments(&self) -> &[(ValueId, Bytes)] {
        &self.attachments
    }

    /// Look up a value by id; `ValueId::NULL` is the inline value.
    pub fn value_by_id(&self, id: ValueId) -> Option<&Bytes> {
        if id.is_null() {
            return self.value.as_ref();
        }
        self.attachments
            .iter()
            .find(|(aid, _)| *aid == id)
            .map(|(_, data)| data)
    }

    /// Sum of the inline value and attachment sizes.
    pub fn payload_size(&self) -> u64 {
        let inline = self.value.as_ref().map_or(0, |v| v.len() as u64);
        inline
            + self
                .attachments
                .iter()
                .map(|(_, d)| d.len() as u64)
                .sum::<u64>()
    }

    /// Encode into a package blob.
    pub fn to_package(&self) -> Result<Bytes, RecordError> {
        let meta = serde_json::to_vec(&self.meta).map_err(|e| RecordError::InvalidMeta {
            reason: e.to_string(),
        })?;
        let bucket = self.key.bucket.as_str().as_bytes();

        let mut buf = BytesMut::with_capacity(64 + bucket.len() + meta.len() + self.payload_size() as usize);
        buf.put_u32_le(PACKAGE_MAGIC);
        buf.put_u8(PACKAGE_VERSION);
        buf.put_u16_le(bucket.len() as u16);
        buf.put_slice(bucket);
        buf.put_slice(self.key.hash.as_bytes());
        buf.put_u32_le(meta.len() as u32);
        buf.put_slice(&meta);
        match &self.value {
            Some(value) => {
                buf.put_u8(1);
                buf.put_u64_le(value.len() as u64);
                buf.put_slice(value);
            }
            None => buf.put_u8(0),
        }
        buf.put_u32_le(self.attachments.len() as u32);
        for (id, data) in &self.attachments {
            buf.put_slice(id.as_bytes());
            buf.put_u64_le(data.len() as u64);
            buf.put_slice(data);
        }
        Ok(buf.freeze())
    }

    /// Decode a package blob. Values are zero-copy slices of `package`.
    pub fn from_package(package: &Bytes) -> Result<Self, RecordError> {
        let mut reader = PackageReader::new(package.clone());

        let magic = reader.u32()?;
        if magic != PACKAGE_MAGIC {
            return Err(RecordError::BadMagic { found: magic });
        }
        let version = reader.u8()?;
        if version != PACKAGE_VERSION {
            return Err(RecordError::UnsupportedVersion { version });
        }

        let bucket_len = reader.u16()? as usize;
        let bucket_bytes = reader.take(bucket_len)?;
        let bucket_name = String::from_utf8(bucket_bytes.to_vec()).map_err(|e| {
            RecordError::InvalidMeta {
                reason: format!("bucket is not utf-8: {}", e),
            }
        })?;
        let bucket = CacheBucket::new(bucket_name)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&reader.take(32)?);
        let key = CacheKey::new(bucket, ContentHash::from_bytes(hash));

        let meta_len = reader.u32()? as usize;
        let meta_bytes = reader.take(meta_len)?;
        let meta: Map<String, Value> =
            serde_json::from_slice(&meta_bytes).map_err(|e| RecordError::InvalidMeta {
                reason: e.to_string(),
            })?;

        let value = if reader.u8()? != 0 {
            let len = reader.len_u64()?;
            Some(reader.take(len)?)
        } else {
            None
        };

        let count = reader.u32()? as usize;
        let mut builder = CacheRecord::builder(key).meta(meta);
        if let Some(value) = value {
            builder = builder.value(value);
        }
        for _ in 0..count {
            let mut id = [0u8; 12];
            id.copy_from_slice(&reader.take(12)?);
            let len = reader.len_u64()?;
            let data = reader.take(len)?;
            builder = builder.attachment(ValueId::from_bytes(id), data);
        }
        builder.build()
    }
}

/// Builder for [`CacheRecord`].
#[derive(Debug, Clone)]
pub struct CacheRecordBuilder {
    key: CacheKey,
    meta: Map<String, Value>,
    value: Option<Bytes>,
    attachments: Vec<(ValueId, Bytes)>,
}

impl CacheRecordBuilder {
    pub fn meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    pub fn meta_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(name.into(), value.into());
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn attachment(mut self, id: ValueId, data: impl Into<Bytes>) -> Self {
        self.attachments.push((id, data.into()));
        self
    }

    /// Rejects duplicate or null attachment ids.
    pub fn build(mut self) -> Result<CacheRecord, RecordError> {
        self.attachments.sort_by(|a, b| a.0.cmp(&b.0));
        for pair in self.attachments.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(RecordError::DuplicateAttachment {
                    id: pair[0].0.to_string(),
                });
            }
        }
        if let Some((id, _)) = self.attachments.iter().find(|(id, _)| id.is_null()) {
            return Err(RecordError::DuplicateAttachment { id: id.to_string() });
        }
        Ok(CacheRecord {
            key: self.key,
            meta: self.meta,
            value: self.value,
            attachments: self.attachments,
        })
    }
}

struct PackageReader {
    data: Bytes,
    offset: usize,
}

impl PackageReader {
    fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }

    fn ensure(&self, needed: usize) -> Result<(), RecordError> {
        if self.data.remaining() < needed {
            return Err(RecordError::Truncated {
                offset: self.offset,
                needed,
            });
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<Bytes, RecordError> {
        self.ensure(len)?;
        self.offset += len;
        Ok(self.data.split_to(len))
    }

    fn u8(&mut self) -> Result<u8, RecordError> {
        self.ensure(1)?;
        self.offset += 1;
        Ok(self.data.get_u8())
    }

    fn u16(&mut self) -> Result<u16, RecordError> {
        self.ensure(2)?;
        self.offset += 2;
        Ok(self.data.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, RecordError> {
        self.ensure(4)?;
        self.offset += 4;
        Ok(self.data.get_u32_le())
    }

    fn len_u64(&mut self) -> Result<usize, RecordError> {
        self.ensure(8)?;
        self.offset += 8;
        let len = self.data.get_u64_le();
        usize::try_from(len).map_err(|_| RecordError::Truncated {
            offset: self.offset,
            needed: usize::MAX,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> CacheKey {
        CacheKey::for_content(CacheBucket::new("Meshes").expect("valid bucket"), b"mesh")
    }

    fn sample_record() -> CacheRecord {
        CacheRecord::builder(test_key())
            .meta_field("compressor", "oodle")
            .meta_field("version", 3)
            .value(Bytes::from_static(b"inline payload"))
            .attachment(ValueId::from_name("Lod0"), Bytes::from_static(b"lod zero"))
            .attachment(ValueId::from_name("Lod1"), Bytes::from_static(b"lod one"))
            .build()
            .expect("valid record")
    }

    #[test]
    fn test_package_preserves_record() {
        let record = sample_record();
        let package = record.to_package().expect("encode");
        let decoded = CacheRecord::from_package(&package).expect("decode");
        assert_eq!(record, decoded);
        assert_eq!(decoded.meta()["compressor"], "oodle");
    }

    #[test]
    fn test_value_by_id() {
        let record = sample_record();
        assert_eq!(
            record.value_by_id(ValueId::NULL).map(|b| &b[..]),
            Some(&b"inline payload"[..])
        );
        assert_eq!(
            record.value_by_id(ValueId::from_name("Lod1")).map(|b| &b[..]),
            Some(&b"lod one"[..])
        );
        assert!(record.value_by_id(ValueId::from_name("Lod9")).is_none());
        assert_eq!(record.payload_size(), 14 + 8 + 7);
    }

    #[test]
    fn test_duplicate_attachment_rejected() {
        let result = CacheRecord::builder(test_key())
            .attachment(ValueId::from_name("A"), Bytes::from_static(b"1"))
            .attachment(ValueId::from_name("A"), Bytes::from_static(b"2"))
            .build();
        assert!(matches!(result, Err(RecordError::DuplicateAttachment { .. })));
    }

    #[test]
    fn test_truncated_package_rejected() {
        let package = sample_record().to_package().expect("encode");
        for cut in [0, 3, 5, 20, package.len() - 1] {
            let truncated = package.slice(..cut);
            assert!(
                matches!(
                    CacheRecord::from_package(&truncated),
                    Err(RecordError::Truncated { .. })
                ),
                "cut at {} should be truncated",
                cut
            );
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let raw = Bytes::from_static(b"NOPE\x01rest");
        assert!(matches!(
            CacheRecord::from_package(&raw),
            Err(RecordError::BadMagic { .. })
        ));
    }
}
