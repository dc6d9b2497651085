//! Library half of the `muster` binary; exposes the command implementations
//! so they can be exercised from integration tests.

pub mod commands;
