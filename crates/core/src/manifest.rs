//! Result manifests and object-key layout.
//!
//! The manifest is the completion signal for a materialization: readers treat
//! a result as published if and only if its manifest object exists. Chunk
//! objects are uploaded first; the manifest is written last.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One uploaded result chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    /// 1-based chunk ordinal.
    pub part: u32,
    /// Full object key of the chunk.
    pub key: String,
    /// Stored (possibly compressed) size in bytes.
    pub bytes: u64,
    /// Payload size before compression.
    pub uncompressed_bytes: u64,
    /// Backend etag, when the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Completion manifest for a materialized query result.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// The run id (hex cache key) this manifest describes.
    pub run_id: String,
    pub bucket: String,
    /// Prefix under which the run directory lives.
    pub prefix: String,
    /// Whether chunk payloads are gzip-compressed.
    pub compressed: bool,
    pub total_rows: u64,
    pub total_uncompressed_bytes: u64,
    /// Chunks in part order, 1-based and contiguous.
    pub chunks: Vec<ChunkDescriptor>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Manifest {
    /// Check internal consistency: parts must be 1-based and contiguous, and
    /// the totals must match the chunk list.
    pub fn validate(&self) -> Result<()> {
        for (i, chunk) in self.chunks.iter().enumerate() {
            let expected = (i + 1) as u32;
            if chunk.part != expected {
                return Err(Error::ManifestIntegrity(format!(
                    "run {}: chunk at index {i} has part {}, expected {expected}",
                    self.run_id, chunk.part
                )));
            }
        }
        let sum: u64 = self.chunks.iter().map(|c| c.uncompressed_bytes).sum();
        if sum != self.total_uncompressed_bytes {
            return Err(Error::ManifestIntegrity(format!(
                "run {}: chunk sizes sum to {sum}, manifest says {}",
                self.run_id, self.total_uncompressed_bytes
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Lightweight pointer to a published result, returned by the API.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRef {
    pub bucket: String,
    pub prefix: String,
    pub run_id: String,
    pub manifest_key: String,
    pub row_count: u64,
    pub chunk_count: u32,
}

/// Object-key layout for one materialization run.
///
/// All objects of a run live under `{prefix}/{run_id}/`.
#[derive(Clone, Debug)]
pub struct WritePlan {
    pub bucket: String,
    pub prefix: String,
    pub run_id: String,
}

impl WritePlan {
    pub fn new(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            run_id: run_id.into(),
        }
    }

    pub fn run_prefix(&self) -> String {
        format!("{}/{}", self.prefix, self.run_id)
    }

    pub fn manifest_key(&self) -> String {
        format!("{}/manifest.json", self.run_prefix())
    }

    pub fn lock_key(&self) -> String {
        format!("{}/.lock", self.run_prefix())
    }

    /// Key for chunk `part` (1-based). Zero-padding keeps lexicographic and
    /// numeric order in agreement for listings.
    pub fn chunk_key(&self, part: u32, extension: &str) -> String {
        format!("{}/part-{part:06}{extension}", self.run_prefix())
    }

    /// Prefix matching all chunk objects of the run, for fallback listings.
    pub fn chunk_prefix(&self) -> String {
        format!("{}/part-", self.run_prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            run_id: "ab".repeat(32),
            bucket: "results".to_string(),
            prefix: "quarry/results".to_string(),
            compressed: true,
            total_rows: 10,
            total_uncompressed_bytes: 300,
            chunks: vec![
                ChunkDescriptor {
                    part: 1,
                    key: "quarry/results/x/part-000001.ndjson.gz".to_string(),
                    bytes: 120,
                    uncompressed_bytes: 200,
                    etag: Some("e1".to_string()),
                },
                ChunkDescriptor {
                    part: 2,
                    key: "quarry/results/x/part-000002.ndjson.gz".to_string(),
                    bytes: 60,
                    uncompressed_bytes: 100,
                    etag: None,
                },
            ],
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_validate_accepts_contiguous_parts() {
        sample_manifest().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_gap() {
        let mut m = sample_manifest();
        m.chunks[1].part = 3;
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_size_mismatch() {
        let mut m = sample_manifest();
        m.total_uncompressed_bytes = 9999;
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_uses_camel_case() {
        let m = sample_manifest();
        let json = m.to_json().unwrap();
        let text = String::from_utf8(json.clone()).unwrap();
        assert!(text.contains("\"runId\""));
        assert!(text.contains("\"totalUncompressedBytes\""));
        let back = Manifest::from_json(&json).unwrap();
        assert_eq!(back.chunks, m.chunks);
        assert_eq!(back.total_rows, m.total_rows);
    }

    #[test]
    fn test_write_plan_layout() {
        let plan = WritePlan::new("b", "/quarry/results/", "deadbeef");
        assert_eq!(plan.manifest_key(), "quarry/results/deadbeef/manifest.json");
        assert_eq!(plan.lock_key(), "quarry/results/deadbeef/.lock");
        assert_eq!(
            plan.chunk_key(7, ".ndjson.gz"),
            "quarry/results/deadbeef/part-000007.ndjson.gz"
        );
        assert_eq!(plan.chunk_prefix(), "quarry/results/deadbeef/part-");
    }
}
