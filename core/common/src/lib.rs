//! Common utilities and types shared across FFLocker modules.
//!
//! This module provides the error taxonomy used by every crate, the
//! zero-on-release secret buffer and the locked-item registry record.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{LockedItemRecord, SecureBuffer};
