//! Implementations of [crate::Source].

pub mod file;
pub mod memory;
