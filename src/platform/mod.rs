//! Platform shims shared by every layer of the sync engine.

pub mod runtime;
