// ABOUTME: Shared plumbing for the liteboxd binary: runtime wiring and terminal output helpers
// ABOUTME: Kept in a library so the wiring can be tested without spawning the binary

pub mod context;
pub mod output;

pub use context::{Runtime, SubstrateKind};
