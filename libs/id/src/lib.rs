//! # tfrun-id
//!
//! Stable ID types, parsing, and validation for tfrun.
//!
//! All resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `ws_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `run_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `user_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix keeps a workspace ID from ever being passed where a run ID is
//! expected, and the ULID keeps IDs time-ordered.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
