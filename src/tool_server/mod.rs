//! Tool server — serves named tools to an orchestrator over stdio.
//!
//! Used by the `math-server` and `string-server` binaries, and by tests
//! that need a real peer.

pub mod builtin;
pub mod server;

pub use server::{ToolFailure, ToolHandler, ToolServer};
