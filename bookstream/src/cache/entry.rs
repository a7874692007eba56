//! Cache entry model.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::backend::CacheError;

/// Closed set of entry categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Metadata,
    Cover,
    Content,
    Toc,
}

impl EntryType {
    pub const ALL: [EntryType; 4] = [
        EntryType::Metadata,
        EntryType::Cover,
        EntryType::Content,
        EntryType::Toc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Metadata => "metadata",
            EntryType::Cover => "cover",
            EntryType::Content => "content",
            EntryType::Toc => "toc",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a payload was serialized on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Raw,
    Json,
}

/// A cached value: opaque bytes or a structured document.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Bytes(Bytes),
    Structured(serde_json::Value),
}

impl CacheValue {
    /// Wrap any serializable value as a structured payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, CacheError> {
        Ok(CacheValue::Structured(serde_json::to_value(value)?))
    }

    /// Serialized form and its encoding. The length of the returned bytes is
    /// the entry's accounted size.
    pub fn encode(&self) -> Result<(PayloadEncoding, Bytes), CacheError> {
        match self {
            CacheValue::Bytes(bytes) => Ok((PayloadEncoding::Raw, bytes.clone())),
            CacheValue::Structured(value) => {
                Ok((PayloadEncoding::Json, Bytes::from(serde_json::to_vec(value)?)))
            }
        }
    }

    pub fn decode(encoding: PayloadEncoding, payload: Bytes) -> Result<Self, CacheError> {
        match encoding {
            PayloadEncoding::Raw => Ok(CacheValue::Bytes(payload)),
            PayloadEncoding::Json => Ok(CacheValue::Structured(serde_json::from_slice(&payload)?)),
        }
    }

    /// Byte payload, if this is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            CacheValue::Bytes(bytes) => Some(bytes),
            CacheValue::Structured(_) => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            CacheValue::Bytes(bytes) => Some(bytes),
            CacheValue::Structured(_) => None,
        }
    }

    /// Deserialize a structured payload into `T`.
    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T, CacheError> {
        match self {
            CacheValue::Structured(value) => Ok(T::deserialize(value)?),
            CacheValue::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl From<Bytes> for CacheValue {
    fn from(bytes: Bytes) -> Self {
        CacheValue::Bytes(bytes)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(bytes: Vec<u8>) -> Self {
        CacheValue::Bytes(Bytes::from(bytes))
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        CacheValue::Structured(value)
    }
}

/// Everything the store knows about an entry except its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub key: String,
    pub entry_type: EntryType,
    pub encoding: PayloadEncoding,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Aggregate view of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_bytes: u64,
    pub entry_count: u32,
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

/// Result of an eviction or maintenance pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcResult {
    /// Number of entries removed.
    pub entries_removed: usize,
    /// Total bytes freed.
    pub bytes_freed: u64,
    /// Duration of the pass in milliseconds.
    pub duration_ms: u64,
}

impl fmt::Display for GcResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GC: removed {} entries, freed {} bytes in {}ms",
            self.entries_removed, self.bytes_freed, self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_size_is_serialized_length() {
        let value = CacheValue::Structured(serde_json::json!({"title": "Dune"}));
        let (encoding, bytes) = value.encode().unwrap();
        assert_eq!(encoding, PayloadEncoding::Json);
        assert_eq!(bytes.len(), br#"{"title":"Dune"}"#.len());
    }

    #[test]
    fn test_decode_json_payload() {
        let value = CacheValue::json(&vec![1, 2, 3]).unwrap();
        let (encoding, bytes) = value.encode().unwrap();
        let decoded = CacheValue::decode(encoding, bytes).unwrap();
        assert_eq!(decoded.to_json::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_entry_type_wire_names() {
        let names: Vec<_> = EntryType::ALL.iter().map(|t| t.as_str()).collect();
        assert_eq!(names, ["metadata", "cover", "content", "toc"]);
        assert_eq!(serde_json::to_string(&EntryType::Toc).unwrap(), "\"toc\"");
    }

    #[test]
    fn test_gc_result_display() {
        let result = GcResult {
            entries_removed: 10,
            bytes_freed: 1024,
            duration_ms: 50,
        };
        assert_eq!(
            result.to_string(),
            "GC: removed 10 entries, freed 1024 bytes in 50ms"
        );
    }
}
