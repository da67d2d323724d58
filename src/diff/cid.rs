//! CIDv1 content identifiers over sha2-256 digests
//!
//! Binary layout:
//!
//! ```text
//! varint(1) ‖ varint(codec) ‖ varint(0x12) ‖ varint(32) ‖ digest[32]
//! ```
//!
//! The canonical string form is the multibase `b` prefix followed by the
//! lowercase, unpadded RFC 4648 base32 encoding of those bytes.

use base32::Alphabet;
use std::fmt;
use std::str::FromStr;

/// Multicodec for CAR files
pub const CAR_CODEC: u64 = 0x202;
/// Multicodec for raw bytes
pub const RAW_CODEC: u64 = 0x55;
/// Multihash code for sha2-256
pub const SHA2_256_CODE: u64 = 0x12;
/// Digest length for sha2-256
pub const SHA2_256_LEN: usize = 32;

const CID_VERSION: u64 = 1;
const MULTIBASE_BASE32: char = 'b';
const VARINT_LEN_MAX: usize = 10;

/// Encode `value` as an unsigned LEB128 varint
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode an unsigned LEB128 varint, returning the value and bytes read
pub fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().take(VARINT_LEN_MAX).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Lowercase base32 without padding
pub fn base32_lower(bytes: &[u8]) -> String {
    base32::encode(Alphabet::Rfc4648Lower { padding: false }, bytes)
}

/// Case-insensitive base32 decode without padding
pub fn base32_decode(text: &str) -> Option<Vec<u8>> {
    if text.is_empty() || !text.is_ascii() {
        return None;
    }
    base32::decode(
        Alphabet::Rfc4648 { padding: false },
        &text.to_ascii_uppercase(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentIdError {
    #[error("missing multibase prefix 'b'")]
    UnsupportedMultibase,
    #[error("invalid base32 payload")]
    InvalidBase32,
    #[error("truncated varint at byte {0}")]
    TruncatedVarint(usize),
    #[error("unsupported CID version {0}")]
    UnsupportedVersion(u64),
    #[error("unsupported multihash code {0:#x}")]
    UnsupportedHash(u64),
    #[error("digest length {0}, expected 32")]
    DigestLength(usize),
}

/// A version 1 content identifier with a sha2-256 multihash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId {
    codec: u64,
    digest: [u8; SHA2_256_LEN],
}

impl ContentId {
    pub fn new_v1(codec: u64, digest: [u8; SHA2_256_LEN]) -> Self {
        ContentId { codec, digest }
    }

    /// CID of a CAR file with the given sha2-256 digest
    pub fn car(digest: [u8; SHA2_256_LEN]) -> Self {
        Self::new_v1(CAR_CODEC, digest)
    }

    /// Raw-codec CID of arbitrary bytes
    pub fn raw_of(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        Self::new_v1(RAW_CODEC, Sha256::digest(data).into())
    }

    pub fn codec(&self) -> u64 {
        self.codec
    }

    pub fn digest(&self) -> &[u8; SHA2_256_LEN] {
        &self.digest
    }

    /// Multihash bytes: `varint(0x12) ‖ varint(32) ‖ digest`
    pub fn multihash_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + SHA2_256_LEN);
        encode_varint(SHA2_256_CODE, &mut out);
        encode_varint(SHA2_256_LEN as u64, &mut out);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 2 + SHA2_256_LEN);
        encode_varint(CID_VERSION, &mut out);
        encode_varint(self.codec, &mut out);
        out.extend_from_slice(&self.multihash_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContentIdError> {
        let mut pos = 0;
        let next = |pos: &mut usize| -> Result<u64, ContentIdError> {
            let (value, read) =
                decode_varint(&bytes[*pos..]).ok_or(ContentIdError::TruncatedVarint(*pos))?;
            *pos += read;
            Ok(value)
        };

        let version = next(&mut pos)?;
        if version != CID_VERSION {
            return Err(ContentIdError::UnsupportedVersion(version));
        }
        let codec = next(&mut pos)?;
        let hash_code = next(&mut pos)?;
        if hash_code != SHA2_256_CODE {
            return Err(ContentIdError::UnsupportedHash(hash_code));
        }
        let declared = next(&mut pos)? as usize;
        let digest = &bytes[pos..];
        if declared != SHA2_256_LEN || digest.len() != SHA2_256_LEN {
            return Err(ContentIdError::DigestLength(digest.len()));
        }

        let mut out = [0u8; SHA2_256_LEN];
        out.copy_from_slice(digest);
        Ok(ContentId::new_v1(codec, out))
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", MULTIBASE_BASE32, base32_lower(&self.to_bytes()))
    }
}

impl FromStr for ContentId {
    type Err = ContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let payload = s
            .strip_prefix(MULTIBASE_BASE32)
            .ok_or(ContentIdError::UnsupportedMultibase)?;
        let bytes = base32_decode(payload).ok_or(ContentIdError::InvalidBase32)?;
        ContentId::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn hello_digest() -> [u8; 32] {
        Sha256::digest(b"hello world").into()
    }

    #[test]
    fn test_varint_known_values() {
        let mut out = Vec::new();
        encode_varint(0x202, &mut out);
        assert_eq!(out, vec![0x82, 0x04]);

        out.clear();
        encode_varint(0x12, &mut out);
        assert_eq!(out, vec![0x12]);

        assert_eq!(decode_varint(&[0x82, 0x04, 0xff]), Some((0x202, 2)));
        assert_eq!(decode_varint(&[0x80]), None);
    }

    #[test]
    fn test_car_cid_string() {
        let cid = ContentId::car(hello_digest());
        assert_eq!(
            cid.to_string(),
            "bagbaieraxfgspomtju7arjjokll5u7nl7lcij37dpjjyb3uqrd32zyxpzxuq"
        );
    }

    #[test]
    fn test_parse_recovers_digest_and_codec() {
        let cid: ContentId = "bagbaieraxfgspomtju7arjjokll5u7nl7lcij37dpjjyb3uqrd32zyxpzxuq"
            .parse()
            .unwrap();
        assert_eq!(cid.codec(), CAR_CODEC);
        assert_eq!(cid.digest(), &hello_digest());
    }

    #[test]
    fn test_multihash_prefix() {
        let mh = ContentId::car(hello_digest()).multihash_bytes();
        assert_eq!(&mh[..2], &[0x12, 0x20]);
        assert_eq!(mh.len(), 34);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(
            "zQm".parse::<ContentId>(),
            Err(ContentIdError::UnsupportedMultibase)
        );
        assert_eq!("b!!!".parse::<ContentId>(), Err(ContentIdError::InvalidBase32));

        // Valid base32, but a CIDv0-style multihash without version/codec
        let mh = base32_lower(&ContentId::car(hello_digest()).multihash_bytes());
        assert!(format!("b{}", mh).parse::<ContentId>().is_err());
    }

    #[test]
    fn test_raw_cid_differs_from_car() {
        let raw = ContentId::raw_of(b"hello world");
        assert_eq!(raw.codec(), RAW_CODEC);
        assert_eq!(raw.digest(), &hello_digest());
        assert_ne!(raw.to_string(), ContentId::car(hello_digest()).to_string());
        assert!(raw.to_string().starts_with("bafkrei"));
    }
}
