//! Tool hierarchy: the on-disk node model, the startup loader, and the
//! immutable in-memory store behind `get_tools_in_category` and
//! `resolve_tool_path`.

mod loader;
mod node;
mod store;

pub use loader::{load_hierarchy, LoadedHierarchy};
pub use node::{HierarchyNode, ServerRef, ToolDefinition};
pub use store::{CategoryView, ChildView, HierarchyStore, ToolView};
