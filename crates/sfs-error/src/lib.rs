#![forbid(unsafe_code)]
//! Error types for SnapFS.
//!
//! Defines `SfsError` and a `Result<T>` alias used throughout the
//! workspace, with errno mappings for the control-surface boundary.

use thiserror::Error;

/// Unified error type for all SnapFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("block needs copy-on-write before it can be modified")]
    NeedsCow,

    #[error("exclude bitmap inconsistent: block {bit} of group {group} belongs to an excluded inode")]
    ExcludeInconsistent { group: u32, bit: u32 },

    #[error("filesystem is mounted read-only")]
    ReadOnly,
}

impl SfsError {
    /// Convert this error into a POSIX errno for ioctl-style callers.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::NeedsCow | Self::ExcludeInconsistent { .. } => {
                libc::EIO
            }
            Self::Format(_) | Self::Invalid(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotPermitted(_) => libc::EPERM,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Whether this error indicates on-disk corruption that should mark
    /// the filesystem as needing fsck.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. } | Self::ExcludeInconsistent { .. }
        )
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(SfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(SfsError::NotPermitted("x").to_errno(), libc::EPERM);
        assert_eq!(SfsError::NeedsCow.to_errno(), libc::EIO);
        assert_eq!(
            SfsError::Invalid("bad flags".into()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(SfsError::ReadOnly.to_errno(), libc::EROFS);
    }

    #[test]
    fn corruption_classification() {
        assert!(SfsError::ExcludeInconsistent { group: 0, bit: 3 }.is_corruption());
        assert!(!SfsError::NoSpace.is_corruption());
    }
}
