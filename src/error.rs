//! Error types for this crate.

use std::path::PathBuf;

/// The error type returned by every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The input does not look like a VMDK or COWD file at all.
    #[error("unsupported format: {detail}")]
    UnsupportedFormat { detail: String },

    /// The textual descriptor could not be parsed.
    #[error("malformed descriptor at line {line}: {detail}")]
    MalformedDescriptor { line: usize, detail: String },

    /// A COWD or VMDK sparse extent-file header failed validation.
    #[error("malformed sparse header at offset {offset}: {detail}")]
    MalformedSparseHeader { offset: u64, detail: String },

    /// The primary and secondary grain directories disagree.
    #[error(
        "inconsistent grain index in extent {extent_index} (group {group_index}, slot {slot_index})"
    )]
    InconsistentGrainIndex {
        extent_index: usize,
        group_index: u32,
        slot_index: u32,
    },

    /// A compressed grain failed to decompress to its expected size.
    #[error("corrupt grain in extent {extent_index} at file offset {grain_offset}: {detail}")]
    CorruptGrain {
        extent_index: usize,
        grain_offset: u64,
        detail: String,
    },

    /// A stream marker was found where grain data was expected, or vice-versa.
    #[error("malformed grain stream at offset {offset}: {detail}")]
    MalformedGrainStream { offset: u64, detail: String },

    /// A read needs a parent handle that has not been attached with `set_parent`.
    #[error("missing parent handle (expected content identifier {content_identifier:08x})")]
    MissingParent { content_identifier: u32 },

    /// `set_parent` was called with a handle whose content identifier does not match.
    #[error("inconsistent parent: expected content identifier {expected:08x}, found {found:08x}")]
    InconsistentParent { expected: u32, found: u32 },

    /// A requested offset falls outside the virtual disk (or outside its extent table).
    #[error("offset {offset} out of bounds (media size {media_size})")]
    OutOfBounds { offset: u64, media_size: u64 },

    /// This crate is read-only.
    #[error("write support is not implemented")]
    WriteNotSupported,

    /// `signal_abort` was observed mid-read.
    #[error("operation aborted")]
    Aborted,
}

/// A specialized `Result` for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    pub fn unsupported_format(detail: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            detail: detail.into(),
        }
    }

    pub fn malformed_descriptor(line: usize, detail: impl Into<String>) -> Self {
        Self::MalformedDescriptor {
            line,
            detail: detail.into(),
        }
    }

    pub fn malformed_sparse_header(offset: u64, detail: impl Into<String>) -> Self {
        Self::MalformedSparseHeader {
            offset,
            detail: detail.into(),
        }
    }

    pub fn corrupt_grain(extent_index: usize, grain_offset: u64, detail: impl Into<String>) -> Self {
        Self::CorruptGrain {
            extent_index,
            grain_offset,
            detail: detail.into(),
        }
    }

    pub fn malformed_grain_stream(offset: u64, detail: impl Into<String>) -> Self {
        Self::MalformedGrainStream {
            offset,
            detail: detail.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io { source, .. } => source,
            Error::OutOfBounds { .. } => std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()),
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/tmp/disk.vmdk");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/tmp/disk.vmdk"));
    }

    #[test]
    fn test_malformed_sparse_header_context() {
        let err = Error::malformed_sparse_header(75, "newline sentinel mismatch");
        assert!(err.to_string().contains("offset 75"));
    }

    #[test]
    fn test_missing_parent_shows_cid() {
        let err = Error::MissingParent {
            content_identifier: 0x1234abcd,
        };
        assert!(err.to_string().contains("1234abcd"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }
}
