//! Identifiers and errors shared by the execution core.
//!
//! No infrastructure concerns live here: no locks, no IO, no clocks.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{JobId, RunId, WorkerId};
