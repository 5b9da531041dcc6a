use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Parameters passed to a task, injected into document sources before
/// execution.
pub type Params = BTreeMap<String, serde_json::Value>;

/// A 32-byte BLAKE3 hash used for change detection.
///
/// In `kumiki`, this serves two purposes:
/// 1. It fingerprints the normalized source of a task, so that edits to the
///    code can be detected (code staleness).
/// 2. It fingerprints persisted artifacts, so that a task can tell whether
///    anything upstream has changed since it was last built (data
///    staleness).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// The fingerprint of an artifact that does not exist.
    pub const MISSING: Hash32 = Hash32([0; 32]);

    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// Short prefix of the hex digest, handy in log lines.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental hasher producing a [`Hash32`], used when a fingerprint is
/// assembled from several parts (e.g. the members of a meta product).
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn update(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        // length prefix keeps ("ab", "c") and ("a", "bc") apart
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub(crate) fn finish(&self) -> Hash32 {
        let bytes: [u8; 32] = self.0.finalize().into();
        Hash32(bytes)
    }
}
