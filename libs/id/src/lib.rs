//! # berth-id
//!
//! Typed identifiers for the berth resource manager.
//!
//! ## Design Principles
//!
//! - IDs are typed to prevent mixing allocations, jobs, agents and containers
//! - IDs are opaque strings; agents and callers may supply their own
//! - Generated IDs use a prefixed format: `{prefix}_{ulid}`
//! - IDs order by their string form, which the fitting engine relies on
//!   as its final tie-break
//!
//! Examples of generated IDs:
//! - `alloc_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `ctr_01HV4Z3MXNKPQR9HSTZ7WCLD4E`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for the `define_id!` macro.
pub use ulid::Ulid;

/// Maximum accepted ID length in bytes.
pub const MAX_ID_LEN: usize = 255;

/// Validates an externally supplied ID string.
pub fn validate(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong {
            len: s.len(),
            max: MAX_ID_LEN,
        });
    }
    if let Some((index, ch)) = s
        .char_indices()
        .find(|(_, c)| c.is_whitespace() || c.is_control())
    {
        return Err(IdError::InvalidCharacter { ch, index });
    }
    Ok(())
}
