//! Conversion error taxonomy.
//!
//! Every failure is tagged with a kind and carries a context string that
//! names the component and, where it applies, the device offset.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    /// On-disk magic, checksum, or structural invariant violated.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// Valid but out-of-scope feature (multi-device, odd sector size,
    /// unknown checksum type).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Viability check or relocation free pool cannot satisfy the
    /// requirements.
    #[error("insufficient space: {0}")]
    InsufficientSpace(String),

    /// Underlying read/write/sync failed or came back short.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounds check caught a malformed item in otherwise well-formed
    /// data (oversized name, out-of-bounds extent).
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Memory allocation, mmap spill, or queue depth limits hit.
    #[error("resource limit: {0}")]
    ResourceLimit(String),
}

pub type Result<T> = std::result::Result<T, ConvertError>;

impl ConvertError {
    pub fn bad_format(msg: impl Into<String>) -> Self {
        ConvertError::BadFormat(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        ConvertError::Unsupported(msg.into())
    }

    pub fn insufficient_space(msg: impl Into<String>) -> Self {
        ConvertError::InsufficientSpace(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        ConvertError::Corrupt(msg.into())
    }

    pub fn resource_limit(msg: impl Into<String>) -> Self {
        ConvertError::ResourceLimit(msg.into())
    }
}
