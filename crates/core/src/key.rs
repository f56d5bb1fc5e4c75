//! Cache-key derivation.
//!
//! A cache key is the SHA-256 of a canonical, line-oriented rendering of the
//! request fields that affect the result bytes. Two requests that differ only
//! in presentation (surrounding whitespace in the SQL, property ordering)
//! derive the same key.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::request::CacheRequest;
use std::fmt;

/// Identity of a cached query result.
///
/// The lowercase hex form doubles as the public `queryId` and as the run
/// directory name under the result prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(ContentHash);

impl CacheKey {
    /// Derive the key for a request.
    pub fn derive(request: &CacheRequest) -> Self {
        let mut canon = String::with_capacity(256);
        push_line(
            &mut canon,
            "datasourceId",
            request.datasource.datasource_id.as_deref().unwrap_or(""),
        );
        push_line(
            &mut canon,
            "url",
            request.datasource.url.as_deref().unwrap_or(""),
        );
        push_line(
            &mut canon,
            "user",
            request.datasource.username.as_deref().unwrap_or(""),
        );
        push_line(&mut canon, "props", &canonical_properties(request));
        push_line(&mut canon, "sql", &normalize_sql(&request.sql));
        push_line(&mut canon, "params", &request.params.join("\u{1f}"));
        push_line(&mut canon, "encoding", request.format.encoding.as_str());
        push_line(&mut canon, "gzip", if request.format.gzip { "true" } else { "false" });
        push_line(
            &mut canon,
            "chunkBytes",
            request.chunking.target_chunk_bytes.as_deref().unwrap_or(""),
        );
        push_line(
            &mut canon,
            "ttl",
            &request
                .cache
                .ttl_seconds
                .map(|t| t.to_string())
                .unwrap_or_default(),
        );
        push_line(
            &mut canon,
            "salt",
            request.key_override.as_deref().unwrap_or(""),
        );
        Self(ContentHash::compute(canon.as_bytes()))
    }

    /// Parse a key from its lowercase hex form.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(Error::InvalidKey(format!("key must be lowercase hex: {s}")));
        }
        Ok(Self(ContentHash::from_hex(s)?))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn hash(&self) -> &ContentHash {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn push_line(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push('=');
    out.push_str(value);
    out.push('\n');
}

/// Sorted `k=v` pairs joined with `&`. Keys and values are escaped so the
/// rendering is unambiguous.
fn canonical_properties(request: &CacheRequest) -> String {
    request
        .datasource
        .properties
        .iter()
        .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn escape(s: &str) -> String {
    s.replace('%', "%25").replace('&', "%26").replace('=', "%3d")
}

/// Trim and collapse every internal whitespace run to a single space.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_gap = false;
    for c in sql.trim().chars() {
        if c.is_whitespace() {
            in_gap = true;
        } else {
            if in_gap && !out.is_empty() {
                out.push(' ');
            }
            in_gap = false;
            out.push(c);
        }
    }
    out
}
