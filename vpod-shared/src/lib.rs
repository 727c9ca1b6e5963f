//! Shared data model for the vpod workspace.
//!
//! Configuration types, runtime state records, and the error taxonomy
//! used by every other crate. This crate holds data only; behavior
//! lives with the subsystem that owns it.

pub mod config;
pub mod device;
pub mod error;
pub mod netinfo;
pub mod state;
pub mod user;
pub mod volumes;

pub use error::{Error, Result};
