#![forbid(unsafe_code)]
//! Error types for fsimg.
//!
//! # Error Taxonomy
//!
//! fsimg uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `fsimg-types` | On-disk format violations detected during byte decoding |
//! | Runtime | `ImgError` | `fsimg-error` (this crate) | User-facing errors for CLI and API consumers |
//!
//! `fsimg-error` is intentionally independent of `fsimg-types` to avoid
//! cyclic dependencies; `fsimg-volume` and `fsimg-imager` convert
//! `ParseError` into `ImgError::Corruption` (live metadata decodes invalid)
//! or `ImgError::Format` (structural misuse) at their boundaries.
//!
//! Transfer-size errors are deliberately distinct from I/O errors: a read or
//! write that *fails* surfaces the OS error verbatim through `Io`, while one
//! that *succeeds with fewer bytes than requested* is `ShortRead` /
//! `ShortWrite`. Imaging aborts on both, but the distinction matters for
//! diagnosing truncated images versus failing devices.
//!
//! Every variant maps to exactly one POSIX errno via [`ImgError::to_errno`].
//! The match is exhaustive so adding a variant without assigning an errno is
//! a compile error.

use thiserror::Error;

/// Unified error type for all fsimg operations.
///
/// Any error aborts the whole transcoding operation immediately; the
/// operations never continue past a failed block group or bitmap chunk.
#[derive(Debug, Error)]
pub enum ImgError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A block group's descriptor records no inode table location.
    #[error("group {group} has no inode table")]
    MissingInodeTable { group: u32 },

    /// A block group's inode table lies outside the volume's valid block range.
    #[error("group {group} inode table at block {block} is out of range")]
    BadInodeTable { group: u32, block: u64 },

    /// The group-descriptor table is not resident in memory.
    #[error("group descriptor table not loaded")]
    NoGroupDesc,

    /// A read returned fewer bytes than requested.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// A write consumed fewer bytes than requested.
    #[error("short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },

    /// Structural misuse or invalid geometry (bad arguments, range outside a
    /// bitmap, size mismatch).
    #[error("invalid structure: {0}")]
    Format(String),

    /// On-volume metadata decoded invalid at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },
}

impl ImgError {
    /// Convert this error into a POSIX errno for exit-status reporting.
    ///
    /// Policy notes:
    /// - `ShortRead`/`ShortWrite` → `EIO`: the transfer stopped early on an
    ///   otherwise healthy descriptor, which callers treat like a device
    ///   failure when deciding to abort a dump/restore workflow.
    /// - `MissingInodeTable`/`BadInodeTable`/`NoGroupDesc` → `EINVAL`: the
    ///   volume handed to the imager is structurally unfit for imaging.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ShortRead { .. } | Self::ShortWrite { .. } | Self::Corruption { .. } => libc::EIO,
            Self::MissingInodeTable { .. }
            | Self::BadInodeTable { .. }
            | Self::NoGroupDesc
            | Self::Format(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `ImgError`.
pub type Result<T> = std::result::Result<T, ImgError>;
