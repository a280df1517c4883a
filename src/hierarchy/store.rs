//! In-memory hierarchy store: navigation views and tool-path resolution.
//!
//! The store is a flat `path -> node` map built once at startup and immutable
//! afterwards, so lookups need no locking. The empty string is the canonical
//! root key; `"/"` is accepted as an alias on input.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use serde::Serialize;

use super::node::{HierarchyNode, ToolDefinition};
use crate::error::RouterError;

/// Immutable path-keyed tree.
#[derive(Debug)]
pub struct HierarchyStore {
    nodes: HashMap<String, HierarchyNode>,
}

/// Navigation view for one category level, JSON-encoded as the result of
/// `get_tools_in_category`.
#[derive(Debug, Serialize)]
pub struct CategoryView {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<BTreeMap<String, ChildView>>,
    pub tools: BTreeMap<String, ToolView>,
}

/// Child summary: leaves advertise their tool count, branches their overview.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ChildView {
    Leaf { is_leaf: bool, tool_count: usize },
    Branch {
        #[serde(skip_serializing_if = "Option::is_none")]
        overview: Option<String>,
    },
}

/// A tool callable from the viewed level.
#[derive(Debug, Serialize)]
pub struct ToolView {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub tool_path: String,
}

impl HierarchyStore {
    /// Build a store from loader output. The root node (key `""`) must be
    /// present.
    pub fn new(nodes: HashMap<String, HierarchyNode>) -> Result<Self> {
        if !nodes.contains_key("") {
            bail!("hierarchy has no root node");
        }
        Ok(Self { nodes })
    }

    /// Map `"/"` to the root key and trim stray dots.
    pub fn canonicalize(path: &str) -> &str {
        if path == "/" {
            ""
        } else {
            path.trim_matches('.')
        }
    }

    pub fn root(&self) -> &HierarchyNode {
        self.nodes.get("").expect("root checked at construction")
    }

    /// All node paths, root included (as the empty string).
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Navigation query: children of the node at `path` plus the tools
    /// callable from that level.
    ///
    /// Direct tools are always listed. When the node has no direct tools and
    /// every direct child is a leaf, the children's tools are aggregated
    /// upward so one level of exploration is enough for shallow layouts; a
    /// single branch child suppresses aggregation. Aggregated tool paths
    /// point at the child, not the parent.
    pub fn get_tools_in_category(&self, path: &str) -> Result<CategoryView, RouterError> {
        let path = Self::canonicalize(path);
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| RouterError::PathNotFound(path.to_string()))?;

        let mut children = BTreeMap::new();
        let mut all_children_are_leaves = true;
        let mut aggregated = BTreeMap::new();

        for (node_path, child) in &self.nodes {
            let Some(name) = direct_child_name(path, node_path) else {
                continue;
            };
            if child.is_leaf() {
                children.insert(
                    name.to_string(),
                    ChildView::Leaf {
                        is_leaf: true,
                        tool_count: child.tools.len(),
                    },
                );
                for (tool_name, tool) in &child.tools {
                    aggregated.insert(
                        tool_name.clone(),
                        ToolView {
                            description: tool.description.clone(),
                            tool_path: qualified_tool_path(node_path, tool_name),
                        },
                    );
                }
            } else {
                all_children_are_leaves = false;
                children.insert(
                    name.to_string(),
                    ChildView::Branch {
                        overview: child.overview.clone(),
                    },
                );
            }
        }

        let tools = if !node.tools.is_empty() {
            node.tools
                .iter()
                .map(|(name, tool)| {
                    (
                        name.clone(),
                        ToolView {
                            description: tool.description.clone(),
                            tool_path: qualified_tool_path(path, name),
                        },
                    )
                })
                .collect()
        } else if all_children_are_leaves && !aggregated.is_empty() {
            aggregated
        } else {
            BTreeMap::new()
        };

        Ok(CategoryView {
            path: path.to_string(),
            overview: node.overview.clone(),
            children: if children.is_empty() { None } else { Some(children) },
            tools,
        })
    }

    /// Resolve an agent-supplied tool path to its definition and downstream
    /// server name. The empty server name denotes a meta-tool.
    ///
    /// Two strategies, first hit wins:
    /// 1. the whole path names a node holding a tool named like its last
    ///    segment (flat one-tool leaves);
    /// 2. progressively shorter prefixes of the path, down to the root, are
    ///    checked for a tool named like the last segment. Extra trailing
    ///    segments an agent invented during navigation fall away here.
    pub fn resolve_tool_path(&self, tool_path: &str) -> Result<(&ToolDefinition, &str), RouterError> {
        let parts: Vec<&str> = tool_path.split('.').collect();
        let last = parts[parts.len() - 1];

        if let Some(node) = self.nodes.get(tool_path) {
            if let Some(tool) = node.tools.get(last) {
                return Ok((tool, tool.server.as_str()));
            }
        }

        for i in (0..parts.len()).rev() {
            let category = parts[..i].join(".");
            if let Some(node) = self.nodes.get(category.as_str()) {
                if let Some(tool) = node.tools.get(last) {
                    return Ok((tool, tool.server.as_str()));
                }
            }
        }

        Err(RouterError::ToolNotFound(tool_path.to_string()))
    }
}

/// The final segment of `candidate` when it is a direct child of `parent`.
fn direct_child_name<'a>(parent: &str, candidate: &'a str) -> Option<&'a str> {
    if candidate.is_empty() || candidate == parent {
        return None;
    }
    if parent.is_empty() {
        return (!candidate.contains('.')).then_some(candidate);
    }
    let rest = candidate.strip_prefix(parent)?.strip_prefix('.')?;
    (!rest.contains('.')).then_some(rest)
}

/// Rendered tool path for a tool hosted at `node_path`. Flat one-tool leaves
/// already end in the tool name; everything else gets the name appended so
/// the rendered path stays resolvable.
fn qualified_tool_path(node_path: &str, tool_name: &str) -> String {
    if node_path == tool_name
        || (node_path.len() > tool_name.len()
            && node_path.ends_with(tool_name)
            && node_path.as_bytes()[node_path.len() - tool_name.len() - 1] == b'.')
    {
        return node_path.to_string();
    }
    if node_path.is_empty() {
        tool_name.to_string()
    } else {
        format!("{node_path}.{tool_name}")
    }
}
