// SPDX-License-Identifier: MIT

// === Sub-modules ===
pub mod allocator;
pub mod checker;
pub mod errors;
pub mod fat_bitmap;
pub mod id;
pub mod layout;
pub mod meta;
pub mod utils;

// === Error types ===
pub use errors::*;
