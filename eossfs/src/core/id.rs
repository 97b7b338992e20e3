// SPDX-License-Identifier: MIT

//! File identifiers and the collision model behind them.
//!
//! Ids are 256-bit values drawn uniformly at random. Uniqueness is statistical:
//! nothing checks a new id against existing ones, and [`collision_probability`]
//! quantifies the accepted risk.

use core::fmt;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

use crate::core::errors::{FsError, FsResult};
pub use eossio::id::ID_LENGTH;

/// Width of a file id in bits.
pub const ID_BITS: u32 = (ID_LENGTH * 8) as u32;

/// Stable handle of one stored file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId([u8; ID_LENGTH]);

impl FileId {
    #[inline]
    pub const fn new(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> FsResult<Self> {
        let mut bytes = [0u8; ID_LENGTH];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|_| FsError::InvalidRequest("malformed file id"))?;
        Ok(Self(bytes))
    }

    /// The `n`-th id derived from this one: SHA-256 keyed by the id bytes over
    /// `n` in little endian. Same inputs, same output.
    pub fn derive(&self, n: u64) -> FileId {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(n.to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; ID_LENGTH];
        bytes.copy_from_slice(&digest);
        FileId(bytes)
    }
}

impl From<[u8; ID_LENGTH]> for FileId {
    fn from(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({}…)", hex::encode(&self.0[..8]))
    }
}

/// Source of fresh file ids.
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> FileId;
}

/// Thread-local CSPRNG. The production generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn new_id(&self) -> FileId {
        let mut bytes = [0u8; ID_LENGTH];
        rand::rng().fill_bytes(&mut bytes);
        FileId(bytes)
    }
}

/// Deterministic generator for tests and simulations.
#[derive(Debug)]
pub struct SeededIdGenerator {
    rng: Mutex<StdRng>,
}

impl SeededIdGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl IdGenerator for SeededIdGenerator {
    fn new_id(&self) -> FileId {
        let mut bytes = [0u8; ID_LENGTH];
        self.rng.lock().fill_bytes(&mut bytes);
        FileId(bytes)
    }
}

/// Hands out `root.derive(0)`, `root.derive(1)`, ... so a whole run of ids
/// can be rebuilt from its root.
#[derive(Debug)]
pub struct DerivedIdGenerator {
    root: FileId,
    next: AtomicU64,
}

impl DerivedIdGenerator {
    pub fn new(root: FileId) -> Self {
        Self {
            root,
            next: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> FileId {
        self.root
    }
}

impl IdGenerator for DerivedIdGenerator {
    fn new_id(&self) -> FileId {
        self.root.derive(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Birthday bound for `n` random 256-bit ids: `1 - e^(-n^2 / 2^257)`.
pub fn collision_probability(n: f64) -> f64 {
    collision_probability_bits(n, ID_BITS)
}

/// Same bound for `bits`-wide ids: `1 - e^(-n^2 / 2^(bits+1))`.
///
/// Uses `exp_m1` so that probabilities far below `f64::EPSILON` survive.
pub fn collision_probability_bits(n: f64, bits: u32) -> f64 {
    if n <= 1.0 {
        return 0.0;
    }
    let space = 2f64.powi(bits as i32 + 1);
    let x = (n / space.sqrt()).powi(2);
    -(-x).exp_m1()
}
