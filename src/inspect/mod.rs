//! Variable tree inspection
//!
//! Container references handed out by the adapter are expanded into child
//! variables through the session, and whole subtrees are compared against
//! an expected shape.

mod expected;
mod tree;

pub use expected::{Expected, SUMMARY_KEY};
pub use tree::{VariableNode, VariableTree, DEFAULT_MAX_DEPTH};
