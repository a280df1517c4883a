//! Structure generator: introspects configured MCP servers and writes the
//! on-disk hierarchy the router consumes.
//!
//! Layout produced, two layers deep:
//!
//! ```text
//! <out>/
//!   root.json                # regenerated last, from the server branches
//!   <server>/<server>.json   # branch: "name: N tools; t1, t2, ..."
//!   <server>/<tool>.json     # one flat leaf per tool
//! ```
//!
//! `regenerate` re-indexes an existing directory, so tool folders can be
//! reorganized by hand and the branch/root files rebuilt afterwards.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::hierarchy::{HierarchyNode, ServerRef, ToolDefinition};
use crate::registry::client::DownstreamClient;

/// How many tool names a generated branch overview lists before eliding.
const OVERVIEW_TOOL_LIMIT: usize = 8;
const BRIEF_LIMIT: usize = 80;

/// Connect to every configured server, introspect its tools, and write the
/// hierarchy. Servers that fail to connect are skipped with a warning so one
/// dead server does not block generation.
pub async fn generate(config: &Config, output: &Path) -> Result<()> {
    fs::create_dir_all(output)
        .with_context(|| format!("failed to create output directory: {}", output.display()))?;

    let mut names: Vec<&String> = config.servers.keys().collect();
    names.sort();

    for name in names {
        let server_config = &config.servers[name];
        match introspect_server(name, server_config).await {
            Ok(tools) => {
                log::info!("<{}> discovered {} tools", name, tools.len());
                write_server_structure(name, server_config, &tools, output)?;
            }
            Err(err) => log::warn!("<{}> skipping server: {err:#}", name),
        }
    }

    regenerate(output)
}

async fn introspect_server(
    name: &str,
    config: &crate::config::ServerConfig,
) -> Result<Vec<rmcp::model::Tool>> {
    let client = DownstreamClient::connect(name, config)
        .await
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let tools = client
        .list_tools()
        .await
        .with_context(|| format!("failed to list tools for server: {name}"))?;
    client.close().await;
    Ok(tools)
}

/// One flat leaf file per tool, plus the branch declaring the server's
/// transport so the router can connect without a separate config entry.
fn write_server_structure(
    server: &str,
    config: &crate::config::ServerConfig,
    tools: &[rmcp::model::Tool],
    output: &Path,
) -> Result<()> {
    let dir = output.join(server);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create server directory: {}", dir.display()))?;

    for tool in tools {
        let name = tool.name.to_string();
        let definition = ToolDefinition {
            description: tool
                .description
                .as_deref()
                .unwrap_or_default()
                .to_string(),
            maps_to: name.clone(),
            server: server.to_string(),
            input_schema: Some(serde_json::Value::Object((*tool.input_schema).clone())),
        };
        let mut leaf = HierarchyNode::default();
        leaf.tools.insert(name.clone(), definition);
        write_json(&dir.join(format!("{name}.json")), &leaf)?;
    }

    let branch = HierarchyNode {
        overview: None, // filled in by regenerate
        tools: HashMap::new(),
        mcp_server: Some(server_ref(server, config)),
    };
    write_json(&dir.join(format!("{server}.json")), &branch)?;

    Ok(())
}

fn server_ref(name: &str, config: &crate::config::ServerConfig) -> ServerRef {
    use crate::config::ServerConfig;
    match config {
        ServerConfig::Stdio(c) => ServerRef {
            name: name.to_string(),
            transport: "stdio".to_string(),
            command: c.command.clone(),
            args: c.args.clone(),
            env: c.env.clone(),
            ..Default::default()
        },
        ServerConfig::Sse(c) => ServerRef {
            name: name.to_string(),
            transport: "sse".to_string(),
            url: c.url.clone(),
            headers: c.headers.clone(),
            ..Default::default()
        },
        ServerConfig::StreamableHttp(c) => ServerRef {
            name: name.to_string(),
            transport: "streamable-http".to_string(),
            url: c.url.clone(),
            headers: c.headers.clone(),
            timeout: c.timeout_secs,
            ..Default::default()
        },
    }
}

/// Rebuild every branch file and `root.json` from the directory contents.
/// Manually edited overviews are preserved; only overviews matching the
/// generated format are replaced.
pub fn regenerate(output: &Path) -> Result<()> {
    let mut dirs: Vec<std::path::PathBuf> = Vec::new();
    for entry in fs::read_dir(output)
        .with_context(|| format!("failed to read output directory: {}", output.display()))?
    {
        let entry = entry?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let mut summaries = Vec::new();
    let mut total_tools = 0;

    for dir in &dirs {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tool_count = regenerate_directory(dir, &name)?;
        total_tools += tool_count;

        let branch_path = dir.join(format!("{name}.json"));
        let overview = read_node(&branch_path)
            .ok()
            .and_then(|node| node.overview)
            .unwrap_or_default();
        summaries.push(format!("{name} -> {}", brief(&overview)));
    }

    let overview = if summaries.is_empty() {
        "Hierarchical tool organization. Use get_tools_in_category to explore available \
         categories and execute_tool to run tools."
            .to_string()
    } else {
        format!(
            "Root: {} servers, {} tools; {}",
            summaries.len(),
            total_tools,
            summaries.join(", ")
        )
    };

    let root = HierarchyNode {
        overview: Some(overview),
        ..Default::default()
    };
    write_json(&output.join("root.json"), &root)
}

/// Recursively rebuild one directory's branch file. Returns the number of
/// tools found under it.
fn regenerate_directory(dir: &Path, name: &str) -> Result<usize> {
    let mut tool_names = Vec::new();
    let mut count = 0;

    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            let sub_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            count += regenerate_directory(&path, &sub_name)?;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if stem == name {
            continue; // the branch file itself
        }
        match read_node(&path) {
            Ok(node) => {
                count += node.tools.len();
                tool_names.extend(node.tools.keys().cloned());
            }
            Err(err) => log::warn!("skipping unreadable node {}: {err:#}", path.display()),
        }
    }
    tool_names.sort();

    let branch_path = dir.join(format!("{name}.json"));
    let existing = read_node(&branch_path).ok();
    let generated_prefix = format!("{name}: ");
    let overview = match existing.as_ref().and_then(|node| node.overview.as_deref()) {
        // An overview that does not look generated was edited by hand.
        Some(current) if !current.starts_with(&generated_prefix) => current.to_string(),
        _ => generated_overview(name, count, &tool_names),
    };

    let branch = HierarchyNode {
        overview: Some(overview),
        tools: HashMap::new(),
        mcp_server: existing.and_then(|node| node.mcp_server),
    };
    write_json(&branch_path, &branch)?;

    Ok(count)
}

fn generated_overview(name: &str, count: usize, tool_names: &[String]) -> String {
    let listed: Vec<&str> = tool_names
        .iter()
        .take(OVERVIEW_TOOL_LIMIT)
        .map(String::as_str)
        .collect();
    let elided = tool_names.len().saturating_sub(listed.len());
    let mut overview = format!("{name}: {count} tools; {}", listed.join(", "));
    if elided > 0 {
        overview.push_str(&format!(" and {elided} more"));
    }
    overview
}

/// First sentence of an overview, or up to the first semicolon, capped at 80
/// characters.
fn brief(overview: &str) -> String {
    let cut = overview
        .find(['.', ';'])
        .map(|idx| &overview[..idx])
        .unwrap_or(overview);
    let trimmed = cut.trim();
    if trimmed.len() <= BRIEF_LIMIT {
        trimmed.to_string()
    } else {
        let mut end = BRIEF_LIMIT;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}

fn read_node(path: &Path) -> Result<HierarchyNode> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_json(path: &Path, node: &HierarchyNode) -> Result<()> {
    let data = serde_json::to_string_pretty(node)?;
    fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))
}
