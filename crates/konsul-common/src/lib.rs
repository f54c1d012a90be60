//! Shared error types and small utilities used across the Konsul workspace.

pub mod error;

pub use error::{ConError, ErrorKind};
