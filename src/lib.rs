//! findmy-bridge library
//!
//! Exposes modules for integration testing and the two binaries.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
