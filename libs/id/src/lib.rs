//! # jobplane-id
//!
//! Typed identifiers for the job-execution control plane.
//!
//! ## Design Principles
//!
//! - IDs are assigned by the durable store and are plain positive integers
//! - Each resource type gets its own newtype so a project id can never be
//!   passed where an inventory id is expected
//! - Every ID has a canonical string form `{prefix}_{n}` with strict parsing
//! - Node identity is the hostname, wrapped in [`Hostname`]
//!
//! Examples:
//! - `item_1042`
//! - `prj_7`
//! - `inv_3`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
