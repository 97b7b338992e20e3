// SPDX-License-Identifier: MIT

use core::fmt;

pub use eossio::errors::*;

/// Bitmap-level failures of one shared chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatBitMapError {
    /// Zero-length request or out-of-range span.
    InvalidRequest,
    /// More blocks than the shared data region holds; route to a raw chunk.
    RequestTooLarge,
    /// Some block of the span is already owned.
    RangeConflict,
    /// Tag holds no reservation (or not the expected one) in this chunk.
    UnknownTenant,
    DuplicateTenant,
    /// The chunk already hosts a file remainder.
    RemainderTaken,
    TagsExhausted,
    Corrupted(&'static str),
}

impl FatBitMapError {
    pub fn msg(&self) -> &'static str {
        match self {
            FatBitMapError::InvalidRequest => "Invalid block request",
            FatBitMapError::RequestTooLarge => "Request exceeds shared chunk capacity",
            FatBitMapError::RangeConflict => "Block range already in use",
            FatBitMapError::UnknownTenant => "Unknown tenant",
            FatBitMapError::DuplicateTenant => "Tenant already holds a reservation",
            FatBitMapError::RemainderTaken => "Chunk already hosts a file remainder",
            FatBitMapError::TagsExhausted => "No free tenant tag",
            FatBitMapError::Corrupted(msg) => msg,
        }
    }
}

impl fmt::Display for FatBitMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())
    }
}

/// Top-level error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Zero size, malformed id, plan/file mismatch, bad record name.
    InvalidRequest(&'static str),
    /// Exceeds the capacity of the unit it must be placed in.
    RequestTooLarge,
    Bitmap(FatBitMapError),
    /// Inconsistent geometry; fatal at startup.
    Config(&'static str),
    BackingStore(ChunkIOError),
    Meta(&'static str),
    /// Optimistic placement kept losing races.
    RetriesExhausted,
}

impl FsError {
    pub fn msg(&self) -> &'static str {
        match self {
            FsError::InvalidRequest(msg) => msg,
            FsError::RequestTooLarge => "Request too large",
            FsError::Bitmap(e) => e.msg(),
            FsError::Config(msg) => msg,
            FsError::BackingStore(e) => e.msg(),
            FsError::Meta(msg) => msg,
            FsError::RetriesExhausted => "Placement retries exhausted",
        }
    }

    /// Short category name, stable across messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FsError::InvalidRequest(_) => "InvalidRequest",
            FsError::RequestTooLarge => "RequestTooLarge",
            FsError::Bitmap(FatBitMapError::RangeConflict) => "RangeConflict",
            FsError::Bitmap(FatBitMapError::UnknownTenant) => "UnknownTenant",
            FsError::Bitmap(_) => "BitmapError",
            FsError::Config(_) => "ConfigError",
            FsError::BackingStore(_) => "BackingStoreError",
            FsError::Meta(_) => "MetaError",
            FsError::RetriesExhausted => "RetriesExhausted",
        }
    }

    /// Whether an identical call might succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            FsError::BackingStore(e) => e.is_transient(),
            FsError::RetriesExhausted => true,
            _ => false,
        }
    }
}

// === impl From ===

impl From<ChunkIOError> for FsError {
    fn from(e: ChunkIOError) -> Self {
        FsError::BackingStore(e)
    }
}

impl From<FatBitMapError> for FsError {
    fn from(e: FatBitMapError) -> Self {
        match e {
            FatBitMapError::RequestTooLarge => FsError::RequestTooLarge,
            FatBitMapError::InvalidRequest => FsError::InvalidRequest("invalid block request"),
            other => FsError::Bitmap(other),
        }
    }
}

// === type *Result ===

pub type FsResult<T = ()> = Result<T, FsError>;
pub type FatResult<T = ()> = Result<T, FatBitMapError>;

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.msg())?;
        if let FsError::BackingStore(e) = self {
            write!(f, "\n  caused by: {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FsError {}
