// SPDX-License-Identifier: MIT

use core::fmt;

/// Result type for chunk store operations.
pub type ChunkIOResult<T = ()> = core::result::Result<T, ChunkIOError>;

/// Error type for chunk store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkIOError {
    /// Range falls outside the chunk.
    OutOfBounds,
    /// No chunk with that id exists in the store.
    NotFound,
    /// Backend refused or dropped the request; may succeed later.
    Unavailable,
    /// Backend did not answer within the caller's deadline.
    Timeout,
    Unsupported,
    Io(std::io::ErrorKind),
    Other(&'static str),
}

impl ChunkIOError {
    pub fn msg(&self) -> &'static str {
        match self {
            ChunkIOError::OutOfBounds => "Out of bounds",
            ChunkIOError::NotFound => "Chunk not found",
            ChunkIOError::Unavailable => "Backend unavailable",
            ChunkIOError::Timeout => "Backend timed out",
            ChunkIOError::Unsupported => "Unsupported operation",
            ChunkIOError::Io(_) => "IO error",
            ChunkIOError::Other(msg) => msg,
        }
    }

    /// Errors worth retrying for idempotent operations such as `create_chunk`.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, ChunkIOError::Unavailable | ChunkIOError::Timeout)
    }
}

impl From<&'static str> for ChunkIOError {
    #[inline]
    fn from(msg: &'static str) -> Self {
        ChunkIOError::Other(msg)
    }
}

impl From<std::io::Error> for ChunkIOError {
    #[cold]
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ChunkIOError::NotFound,
            std::io::ErrorKind::TimedOut => ChunkIOError::Timeout,
            std::io::ErrorKind::UnexpectedEof => ChunkIOError::OutOfBounds,
            kind => ChunkIOError::Io(kind),
        }
    }
}

impl fmt::Display for ChunkIOError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())?;
        if let ChunkIOError::Io(kind) = self {
            write!(f, " ({kind})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ChunkIOError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ChunkIOError::Unavailable.is_transient());
        assert!(ChunkIOError::Timeout.is_transient());
        assert!(!ChunkIOError::NotFound.is_transient());
        assert!(!ChunkIOError::OutOfBounds.is_transient());
    }

    #[test]
    fn test_from_io_error() {
        let e: ChunkIOError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e, ChunkIOError::NotFound);

        let e: ChunkIOError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(e, ChunkIOError::Io(std::io::ErrorKind::PermissionDenied));
        assert!(e.to_string().starts_with("IO error"));
    }
}
