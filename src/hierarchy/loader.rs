//! One-shot filesystem walk that materializes the hierarchy store.
//!
//! Layout consumed (read-only, at startup):
//!
//! ```text
//! <root>/
//!   root.json                        # required
//!   <cat>/<cat>.json                 # nested convention: node "cat"
//!   <cat>/<tool>.json                # flat convention: node "cat.tool"
//!   <cat>/<sub>/<sub>.json           # node "cat.sub"
//! ```
//!
//! Loading is best-effort: a malformed file logs a warning and is skipped; a
//! missing root is fatal.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::node::{HierarchyNode, ServerRef, ToolDefinition};
use super::store::HierarchyStore;
use crate::config::ServerConfig;
use crate::router::{EXECUTE_TOOL, NAVIGATE_TOOL};

/// Everything the walk produced: the store plus the transport configs the
/// hierarchy files declared inline via `mcp_server`.
#[derive(Debug)]
pub struct LoadedHierarchy {
    pub store: HierarchyStore,
    pub servers: HashMap<String, ServerConfig>,
}

/// Raw file shape. Tool entries are parsed leniently so one bad tool does not
/// sink the whole node.
#[derive(Deserialize)]
struct NodeData {
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    tools: HashMap<String, serde_json::Value>,
    #[serde(default)]
    mcp_server: Option<ServerRef>,
}

/// Load a hierarchy directory into an immutable store.
pub fn load_hierarchy(root_dir: &Path) -> Result<LoadedHierarchy> {
    let root_file = root_dir.join("root.json");
    let root_node = load_node(&root_file)
        .with_context(|| format!("failed to load root node: {}", root_file.display()))?;

    let mut nodes = HashMap::new();
    nodes.insert(String::new(), root_node);

    walk(root_dir, root_dir, &mut nodes)?;

    apply_server_inheritance(&mut nodes);
    let servers = collect_servers(&nodes);
    warn_on_orphans(&nodes);
    warn_on_serverless_tools(&nodes);

    log::info!(
        "loaded {} hierarchy nodes from {}",
        nodes.len(),
        root_dir.display()
    );

    let store = HierarchyStore::new(nodes)?;
    Ok(LoadedHierarchy { store, servers })
}

fn walk(root: &Path, dir: &Path, nodes: &mut HashMap<String, HierarchyNode>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, nodes)?;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if dir == root && path.file_name().is_some_and(|n| n == "root.json") {
            continue; // already loaded
        }
        let Some(key) = node_key(root, &path) else {
            continue;
        };
        match load_node(&path) {
            Ok(node) => {
                log::debug!("loaded hierarchy node '{}' from {}", key, path.display());
                nodes.insert(key, node);
            }
            Err(err) => {
                log::warn!("skipping malformed hierarchy file {}: {err:#}", path.display());
            }
        }
    }
    Ok(())
}

/// Hierarchy key for a node file. `dir/dir.json` names the directory itself
/// (nested convention); any other `dir/x.json` names `dir.x` (flat
/// convention).
fn node_key(root: &Path, file: &Path) -> Option<String> {
    let rel = file.parent()?.strip_prefix(root).ok()?;
    let dir_key = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join(".");
    let stem = file.file_stem()?.to_string_lossy();
    let dirname = rel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if stem == dirname.as_str() {
        Some(dir_key)
    } else if dir_key.is_empty() {
        Some(stem.into_owned())
    } else {
        Some(format!("{dir_key}.{stem}"))
    }
}

fn load_node(path: &Path) -> Result<HierarchyNode> {
    let data = fs::read_to_string(path)?;
    let raw: NodeData = serde_json::from_str(&data)?;

    let mut node = HierarchyNode {
        overview: raw.overview,
        tools: HashMap::new(),
        mcp_server: raw.mcp_server,
    };

    for (name, value) in raw.tools {
        match serde_json::from_value::<ToolDefinition>(value) {
            Ok(mut tool) => {
                if tool.maps_to.is_empty() {
                    tool.maps_to = name.clone();
                }
                node.tools.insert(name, tool);
            }
            Err(err) => {
                log::warn!("skipping malformed tool '{}' in {}: {err}", name, path.display());
            }
        }
    }

    Ok(node)
}

/// Populate empty per-tool `server` fields from the nearest ancestor (the
/// node itself included) that declares an `mcp_server`. The resolver only
/// ever reads the per-tool field.
fn apply_server_inheritance(nodes: &mut HashMap<String, HierarchyNode>) {
    let declared: HashMap<String, String> = nodes
        .iter()
        .filter_map(|(key, node)| {
            node.mcp_server
                .as_ref()
                .map(|server| (key.clone(), server.name.clone()))
        })
        .collect();

    for (key, node) in nodes.iter_mut() {
        if node.tools.is_empty() {
            continue;
        }
        let Some(server) = nearest_declared(&declared, key) else {
            continue;
        };
        for tool in node.tools.values_mut() {
            if tool.server.is_empty() {
                tool.server = server.clone();
            }
        }
    }
}

fn nearest_declared(declared: &HashMap<String, String>, key: &str) -> Option<String> {
    let mut prefix = key;
    loop {
        if let Some(name) = declared.get(prefix) {
            return Some(name.clone());
        }
        match prefix.rfind('.') {
            Some(idx) => prefix = &prefix[..idx],
            None if !prefix.is_empty() => prefix = "",
            None => return None,
        }
    }
}

/// Gather the transport configs declared inline on hierarchy nodes.
fn collect_servers(nodes: &HashMap<String, HierarchyNode>) -> HashMap<String, ServerConfig> {
    let mut servers = HashMap::new();
    for (key, node) in nodes {
        let Some(server_ref) = node.mcp_server.as_ref() else {
            continue;
        };
        match server_ref.to_server_config() {
            Some(config) => {
                servers.insert(server_ref.name.clone(), config);
            }
            None => log::warn!(
                "node '{}' declares server '{}' with unknown transport type '{}'",
                key,
                server_ref.name,
                server_ref.transport
            ),
        }
    }
    servers
}

/// Every non-root key should have every strict dot-prefix present too.
fn warn_on_orphans(nodes: &HashMap<String, HierarchyNode>) {
    for key in nodes.keys() {
        let mut prefix = key.as_str();
        while let Some(idx) = prefix.rfind('.') {
            prefix = &prefix[..idx];
            if !nodes.contains_key(prefix) {
                log::warn!("hierarchy node '{}' has no parent node '{}'", key, prefix);
            }
        }
    }
}

/// A tool that resolves to no server at all can only ever fail at execution
/// time; flag it now. The meta-tools are declared serverless on purpose.
fn warn_on_serverless_tools(nodes: &HashMap<String, HierarchyNode>) {
    for (key, node) in nodes {
        for (name, tool) in &node.tools {
            if tool.server.is_empty() && name != NAVIGATE_TOOL && name != EXECUTE_TOOL {
                log::warn!("tool '{}' under '{}' resolves to no server", name, key);
            }
        }
    }
}
