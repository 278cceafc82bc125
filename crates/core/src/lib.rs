//! `warden-core`: identifiers, tuples, and the error taxonomy shared by
//! every access-control component.
//!
//! This crate is pure: no IO, no async, no caches.

pub mod error;
pub mod id;
pub mod tuple;

pub use error::{WardenError, WardenResult};
pub use id::{RoleId, TenantId, UserId};
pub use tuple::{Effect, GroupingKind, GroupingTuple, PolicyKey, PolicyTuple};
