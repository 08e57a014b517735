#![forbid(unsafe_code)]
//! fsimg public API facade.
//!
//! Re-exports the metadata image transcoding entry points from
//! `fsimg-imager` through a stable external interface. This is the crate
//! that downstream consumers (CLI, orchestrators) depend on.

pub use fsimg_imager::*;
