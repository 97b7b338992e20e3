// SPDX-License-Identifier: MIT

use core::fmt;

use rand::RngCore;

/// Length in bytes of every identifier in the EOSS ecosystem (256 bits).
pub const ID_LENGTH: usize = 32;

/// Opaque handle of one chunk in the backend.
///
/// Minted by the store from a cryptographically strong source; never derived
/// from content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId([u8; ID_LENGTH]);

impl ChunkId {
    #[inline]
    pub const fn new(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; ID_LENGTH];
        hex::decode_to_slice(s.trim(), &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl From<[u8; ID_LENGTH]> for ChunkId {
    fn from(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ChunkId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 8 bytes are plenty to tell chunks apart in logs
        write!(f, "ChunkId({}…)", hex::encode(&self.0[..8]))
    }
}
