//! Foundation types for starrydb.
//!
//! Every other starry crate depends on `starry-types`.
//!
//! # Key Types
//!
//! - [`Value`] -- a stored document: nested maps, lists, and scalars
//! - [`Segment`] -- one step into a document (map key, list index, projection)
//! - [`Route`] -- a document key plus the branch and filters addressing a part of it

pub mod error;
pub mod route;
pub mod value;

pub use error::TypeError;
pub use route::{validate_key, Route, Segment};
pub use value::Value;
