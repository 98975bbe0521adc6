//! Shared contracts of the DBT dispatch core.
//!
//! Defines the guest-CPU descriptor consumed by the backend and the
//! dispatch controller, and the error type threaded through fallible
//! construction and translation paths.

pub mod error;
pub mod guest;

pub use error::Error;
pub use guest::{Guest, InterruptCheckFn};
