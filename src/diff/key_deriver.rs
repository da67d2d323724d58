//! Source key → destination key derivation
//!
//! Destination ("carpark") keys are `{cid}/{cid}.car`, where `cid` is the
//! CIDv1 of the CAR file under the CAR codec. Source keys in the `raw/`
//! namespace already carry the CAR's sha2-256 digest as their base32
//! filename, so derivation never reads object contents.
//!
//! ```text
//! raw/<root>/<user>/<base32(digest)>.car  →  <cid>/<cid>.car
//! ```

use crate::diff::cid::{base32_decode, base32_lower, ContentId, SHA2_256_CODE, SHA2_256_LEN};
use std::fmt;

const COMPLETE_MARKER: &str = "complete/";
const RAW_MARKER: &str = "raw/";
const CAR_SUFFIX: &str = ".car";

/// Key namespaces recognised in the source bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// `complete/` keys: recognised, derivation not supported
    Complete,
    /// `raw/` keys: filename is the digest
    Raw,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Complete => write!(f, "complete"),
            Namespace::Raw => write!(f, "raw"),
        }
    }
}

/// Classify a key. `complete/` is checked first.
pub fn namespace_of(key: &str) -> Option<Namespace> {
    if key.contains(COMPLETE_MARKER) {
        Some(Namespace::Complete)
    } else if key.contains(RAW_MARKER) {
        Some(Namespace::Raw)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeriveError {
    /// Expected: the key is outside every derivable namespace
    #[error("unsupported-namespace: {key}")]
    Rejected {
        key: String,
        namespace: Option<Namespace>,
    },
    /// The key is in a derivable namespace but does not encode a digest
    #[error("malformed source key {key}: {reason}")]
    Malformed { key: String, reason: String },
}

impl DeriveError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, DeriveError::Rejected { .. })
    }

    pub fn key(&self) -> &str {
        match self {
            DeriveError::Rejected { key, .. } | DeriveError::Malformed { key, .. } => key,
        }
    }
}

/// Derive the content identifier a source key maps to
pub fn derive_content_id(key: &str) -> Result<ContentId, DeriveError> {
    match namespace_of(key) {
        Some(Namespace::Raw) => raw_content_id(key),
        namespace => Err(DeriveError::Rejected {
            key: key.to_string(),
            namespace,
        }),
    }
}

/// Derive the destination key for a source key
pub fn derive_destination_key(key: &str) -> Result<String, DeriveError> {
    derive_content_id(key).map(|cid| destination_key(&cid))
}

/// Carpark key layout: `{cid}/{cid}.car`
pub fn destination_key(cid: &ContentId) -> String {
    let cid = cid.to_string();
    format!("{}/{}{}", cid, cid, CAR_SUFFIX)
}

/// Source key a CAR with `digest` is stored under in the `raw/` namespace
pub fn raw_source_key(dir: &str, digest: &[u8; SHA2_256_LEN]) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{}/{}{}", dir, base32_lower(digest), CAR_SUFFIX)
}

fn raw_content_id(key: &str) -> Result<ContentId, DeriveError> {
    let malformed = |reason: String| DeriveError::Malformed {
        key: key.to_string(),
        reason,
    };

    let filename = key.rsplit('/').next().unwrap_or(key);
    let encoded = filename.strip_suffix(CAR_SUFFIX).unwrap_or(filename);
    let bytes = base32_decode(encoded)
        .ok_or_else(|| malformed(format!("filename {:?} is not base32", encoded)))?;

    let digest = match bytes.len() {
        SHA2_256_LEN => &bytes[..],
        // Full sha2-256 multihash: 0x12 0x20 ‖ digest
        34 if bytes[0] as u64 == SHA2_256_CODE && bytes[1] as usize == SHA2_256_LEN => &bytes[2..],
        n => {
            return Err(malformed(format!(
                "decoded {} bytes, expected a {}-byte sha2-256 digest",
                n, SHA2_256_LEN
            )))
        }
    };

    let mut out = [0u8; SHA2_256_LEN];
    out.copy_from_slice(digest);
    Ok(ContentId::car(out))
}
