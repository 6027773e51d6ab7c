//! Ingestd-Common: Shared types and utilities.
//!
//! This crate provides the vocabulary shared by the catalog layer and the
//! coordination core:
//!
//! - **Typed IDs**: catalog artifact ids, artifact type ids, lease owner tokens
//! - **Core Types**: the artifact [`ProcessState`] machine
//! - **Error Handling**: the unified [`Error`] and [`Result`] alias
//!
//! # Examples
//!
//! ```
//! use ingestd_common::{ArtifactId, OwnerToken, ProcessState, Error, Result};
//!
//! let id = ArtifactId::new(42);
//! let owner = OwnerToken::new();
//! assert_ne!(owner, OwnerToken::new());
//! assert_eq!(ProcessState::try_from(1).unwrap(), ProcessState::Success);
//!
//! fn example() -> Result<()> {
//!     Err(Error::not_found("artifact"))
//! }
//! ```

pub mod error;
pub mod ids;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;
