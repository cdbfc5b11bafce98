//! Content digests for parts and whole uploads.
//!
//! Every part is hashed with SHA-256 as it streams in. The digest of a whole
//! upload is SHA-256 over the raw part digests concatenated in index order,
//! so parts can arrive in any order and still produce the same result.

use crate::services::error::{UploadError, UploadResult};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, fmt};

/// A SHA-256 digest, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartDigest([u8; 32]);

impl PartDigest {
    pub fn compute(bytes: &[u8]) -> Self {
        let mut hasher = PartHasher::new();
        hasher.update(bytes);
        hasher.finish()
    }

    /// Parse a client-declared digest. Case-insensitive.
    pub fn from_hex(raw: &str) -> UploadResult<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(raw.trim(), &mut out)
            .map_err(|_| UploadError::InvalidDigest(raw.to_string()))?;
        Ok(Self(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PartDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartDigest({})", self.to_hex())
    }
}

impl fmt::Display for PartDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PartDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Incremental hasher fed chunk by chunk while a part body streams in.
pub struct PartHasher(Sha256);

impl PartHasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    pub fn finish(self) -> PartDigest {
        PartDigest(self.0.finalize().into())
    }
}

impl Default for PartHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-upload digest state: one digest per received part index.
#[derive(Debug, Clone, Default)]
pub struct HashAccumulator {
    parts: BTreeMap<u32, PartDigest>,
}

impl HashAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `bytes` and record them as part `index`.
    #[cfg(test)]
    pub fn feed(&mut self, index: u32, bytes: &[u8]) -> UploadResult<PartDigest> {
        let digest = PartDigest::compute(bytes);
        self.feed_digest(index, digest)?;
        Ok(digest)
    }

    /// Record a precomputed part digest.
    ///
    /// Returns `Ok(false)` when the same digest was already recorded for
    /// `index`, and `DigestConflict` when a different one was.
    pub fn feed_digest(&mut self, index: u32, digest: PartDigest) -> UploadResult<bool> {
        match self.parts.get(&index) {
            Some(existing) if *existing == digest => Ok(false),
            Some(_) => Err(UploadError::DigestConflict { index }),
            None => {
                self.parts.insert(index, digest);
                Ok(true)
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Combine the part digests `0..expected_parts` into the upload digest.
    pub fn finalize(&self, expected_parts: u32) -> UploadResult<PartDigest> {
        let missing: Vec<u32> = (0..expected_parts)
            .filter(|i| !self.parts.contains_key(i))
            .collect();
        if !missing.is_empty() {
            return Err(UploadError::IncompleteParts { missing });
        }
        Ok(Self::combine((0..expected_parts).filter_map(|i| self.parts.get(&i))))
    }

    /// Digest of the concatenated, already ordered, part digests.
    pub fn combine<'a>(ordered: impl IntoIterator<Item = &'a PartDigest>) -> PartDigest {
        let mut hasher = Sha256::new();
        for digest in ordered {
            hasher.update(digest.as_bytes());
        }
        PartDigest(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parsing_accepts_either_case_and_rejects_garbage() {
        let digest = PartDigest::compute(b"hello");
        let upper = digest.to_hex().to_uppercase();
        assert_eq!(PartDigest::from_hex(&upper).unwrap(), digest);

        assert!(matches!(
            PartDigest::from_hex("abc"),
            Err(UploadError::InvalidDigest(_))
        ));
        let too_long = format!("{}00", digest);
        assert!(matches!(
            PartDigest::from_hex(&too_long),
            Err(UploadError::InvalidDigest(_))
        ));
        assert_eq!(PartDigest::from_hex(&format!("  {}\n", digest)).unwrap(), digest);
        let not_hex = "z".repeat(64);
        assert!(matches!(
            PartDigest::from_hex(&not_hex),
            Err(UploadError::InvalidDigest(_))
        ));
    }

    #[test]
    fn known_sha256_vector() {
        assert_eq!(
            PartDigest::compute(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn streaming_hash_matches_one_shot() {
        let mut hasher = PartHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finish(), PartDigest::compute(b"hello world"));
    }

    #[test]
    fn arrival_order_does_not_change_final_digest() {
        let parts: [&[u8]; 3] = [b"aaaa", b"bbbb", b"cc"];

        let mut in_order = HashAccumulator::new();
        for (i, p) in parts.iter().enumerate() {
            in_order.feed(i as u32, p).unwrap();
        }

        let mut shuffled = HashAccumulator::new();
        for i in [2usize, 0, 1] {
            shuffled.feed(i as u32, parts[i]).unwrap();
        }

        assert_eq!(in_order.finalize(3).unwrap(), shuffled.finalize(3).unwrap());
    }

    #[test]
    fn refeeding_same_bytes_is_idempotent() {
        let mut acc = HashAccumulator::new();
        acc.feed(0, b"same").unwrap();
        acc.feed(0, b"same").unwrap();
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn refeeding_different_bytes_conflicts() {
        let mut acc = HashAccumulator::new();
        acc.feed(1, b"first").unwrap();
        let err = acc.feed(1, b"second").unwrap_err();
        assert!(matches!(err, UploadError::DigestConflict { index: 1 }));
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.finalize(2).unwrap_err().to_string(), "upload is missing parts [0]");
    }

    #[test]
    fn finalize_reports_missing_indices() {
        let mut acc = HashAccumulator::new();
        acc.feed(0, b"x").unwrap();
        acc.feed(3, b"y").unwrap();
        match acc.finalize(4) {
            Err(UploadError::IncompleteParts { missing }) => assert_eq!(missing, vec![1, 2]),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
