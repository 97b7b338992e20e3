// SPDX-License-Identifier: MIT

use core::fmt;

use eossfs::FsError;

#[derive(Debug)]
pub enum ConfigError {
    InvalidSize(String),
    Geometry(FsError),
    InvalidConfig(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidSize(s) => {
                write!(f, "Invalid size '{s}'. Use a byte count or a K, M or G suffix.")
            }
            ConfigError::Geometry(e) => write!(f, "Invalid geometry: {e}"),
            ConfigError::InvalidConfig(msg) => write!(f, "Invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<FsError> for ConfigError {
    fn from(e: FsError) -> Self {
        ConfigError::Geometry(e)
    }
}
