// SPDX-License-Identifier: MIT

// Core Modules
pub mod core;

// Reusable types
pub use self::core::allocator::{
    AllocatorOptions, AllocatorStats, ChunkAllocator, PayloadReader, PayloadWriter,
    PlacementEntry, PlacementPlan,
};
pub use self::core::errors::*;
pub use self::core::id::{
    DerivedIdGenerator, FileId, IdGenerator, RandomIdGenerator, SeededIdGenerator,
};
pub use self::core::layout::ChunkLayout;

/// Everything a front end usually needs, in one import.
pub mod prelude {
    pub use super::core::allocator::catalog::{ChunkCatalog, ChunkStats, SharedChunk};
    pub use super::core::allocator::*;
    pub use super::core::checker::{Finding, Severity, VerifyReport, verify_volume};
    pub use super::core::errors::*;
    pub use super::core::fat_bitmap::*;
    pub use super::core::id::*;
    pub use super::core::layout::*;
    pub use super::core::meta::{DirTarget, MetaChunkIndex};
    pub use eossio::prelude::{ChunkId, ChunkKind, ChunkStore, ChunkStoreExt};
}
