//! Shared helpers for binaries and runtime components.

pub mod bootstrap;
pub mod retry;
