//! Hierarchical MCP router.
//!
//! Downstream MCP servers expose hundreds of tool schemas that would eat an
//! agent's context before any work begins. This crate inverts that: agents
//! see exactly two meta-tools, `get_tools_in_category` for navigating a
//! browsable category tree loaded from disk, and `execute_tool` for invoking
//! real tools by dot path. The backing MCP server is spawned or connected
//! lazily, the first time one of its tools is executed.

pub mod config;
pub mod error;
pub mod generator;
pub mod hierarchy;
pub mod registry;
pub mod router;
