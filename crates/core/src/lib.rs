//! Pure domain logic for the robotq execution queue.
//!
//! Holds the shared id/timestamp types, the domain error enum, and the
//! runner adapter that drives the external Robot Framework executable.
//! Nothing in this crate touches the database.

pub mod error;
pub mod runner;
pub mod types;
