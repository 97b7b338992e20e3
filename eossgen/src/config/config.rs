// SPDX-License-Identifier: MIT

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eossfs::{AllocatorOptions, ChunkLayout};
use eossfs::core::layout::{DEFAULT_BITMAP_BLOCKS, DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE};

use crate::config::{ByteSize, ConfigError};

pub const DEFAULT_VOLUME_DIR: &str = "volume";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EossConfig {
    /// Directory the config was read from; relative volume paths resolve here.
    #[serde(skip)]
    pub base_dir: PathBuf,
    pub layout: LayoutSection,
    pub allocator: AllocatorSection,
    pub volume: VolumeSection,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutSection {
    pub chunk_size: ByteSize,
    pub block_size: ByteSize,
    pub bitmap_blocks: u32,
}

impl Default for LayoutSection {
    fn default() -> Self {
        Self {
            chunk_size: ByteSize(DEFAULT_CHUNK_SIZE),
            block_size: ByteSize(DEFAULT_BLOCK_SIZE as u64),
            bitmap_blocks: DEFAULT_BITMAP_BLOCKS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorSection {
    pub max_candidate_retries: u32,
    pub store_timeout_ms: u64,
    pub create_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for AllocatorSection {
    fn default() -> Self {
        let d = AllocatorOptions::default();
        Self {
            max_candidate_retries: d.max_candidate_retries,
            store_timeout_ms: d.store_timeout.as_millis() as u64,
            create_attempts: d.create_attempts,
            backoff_base_ms: d.backoff_base.as_millis() as u64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VolumeSection {
    pub dir: PathBuf,
}

impl Default for VolumeSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_VOLUME_DIR),
        }
    }
}

impl EossConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        crate::log_verbose!("Config loaded from {}", path.display());
        Ok(config)
    }

    /// Parses and validates; every key is optional.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: EossConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, or `path` when it exists.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            crate::log_verbose!("No config at {}, using defaults", path.display());
            Ok(Self {
                base_dir: PathBuf::from("."),
                ..Self::default()
            })
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout()?;
        if self.allocator.store_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig("store_timeout_ms must be non-zero"));
        }
        if self.allocator.create_attempts == 0 {
            return Err(ConfigError::InvalidConfig("create_attempts must be non-zero"));
        }
        Ok(())
    }

    pub fn layout(&self) -> Result<ChunkLayout, ConfigError> {
        let block_size = u32::try_from(self.layout.block_size.bytes())
            .map_err(|_| ConfigError::InvalidConfig("block_size does not fit 32 bits"))?;
        Ok(ChunkLayout::new(
            self.layout.chunk_size.bytes(),
            block_size,
            self.layout.bitmap_blocks,
        )?)
    }

    pub fn options(&self) -> AllocatorOptions {
        AllocatorOptions {
            max_candidate_retries: self.allocator.max_candidate_retries,
            store_timeout: Duration::from_millis(self.allocator.store_timeout_ms),
            create_attempts: self.allocator.create_attempts,
            backoff_base: Duration::from_millis(self.allocator.backoff_base_ms),
        }
    }

    /// Volume directory, resolved against the config location.
    pub fn volume_dir(&self) -> PathBuf {
        if self.volume.dir.is_absolute() {
            self.volume.dir.clone()
        } else {
            self.base_dir.join(&self.volume.dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let c = EossConfig::from_toml("").unwrap();
        assert_eq!(c.layout().unwrap(), ChunkLayout::default());
        assert_eq!(c.options(), AllocatorOptions::default());
        assert_eq!(c.volume.dir, PathBuf::from(DEFAULT_VOLUME_DIR));
    }

    #[test]
    fn test_partial_sections() {
        let c = EossConfig::from_toml(
            r#"
            [layout]
            chunk_size = "64K"
            block_size = "4K"
            bitmap_blocks = 1

            [allocator]
            store_timeout_ms = 250
            "#,
        )
        .unwrap();
        let layout = c.layout().unwrap();
        assert_eq!(layout.chunk_size(), 64 * 1024);
        assert_eq!(layout.blocks_per_chunk(), 16);
        assert_eq!(c.options().store_timeout, Duration::from_millis(250));
        assert_eq!(c.options().create_attempts, AllocatorOptions::default().create_attempts);
    }

    #[test]
    fn test_bad_geometry_is_rejected() {
        let err = EossConfig::from_toml("[layout]\nchunk_size = \"4M\"\nblock_size = 3000\n")
            .unwrap_err();
        assert!(err.to_string().contains("Invalid geometry"));

        assert!(EossConfig::from_toml("[layout]\nbitmap_blocks = 0\n").is_err());
        assert!(EossConfig::from_toml("[allocator]\ncreate_attempts = 0\n").is_err());
        assert!(EossConfig::from_toml("[layout]\nchunk = 1\n").is_err());
    }

    #[test]
    fn test_volume_dir_resolution() {
        let mut c = EossConfig::from_toml("[volume]\ndir = \"data\"\n").unwrap();
        c.base_dir = PathBuf::from("/etc/eoss");
        assert_eq!(c.volume_dir(), PathBuf::from("/etc/eoss/data"));
    }
}
