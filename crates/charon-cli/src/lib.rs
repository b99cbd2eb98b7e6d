//! Shared pieces of the Charon utility binaries.

pub mod methods;
