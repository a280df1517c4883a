//! Router configuration: outward-facing settings plus the table of
//! downstream MCP server transports.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Top-level configuration file.
///
/// ```json
/// {
///   "router": { "name": "canopy", "hierarchy": "mcp_hierarchy" },
///   "servers": {
///     "everything": { "stdio": { "command": "npx", "args": ["-y", "@modelcontextprotocol/server-everything"] } },
///     "search": { "sse": { "url": "https://example.com/sse" } }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub router: RouterSettings,
    pub servers: HashMap<String, ServerConfig>,
}

/// Settings for the router's own MCP surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouterSettings {
    pub name: String,
    pub version: String,
    /// Directory the hierarchy is loaded from.
    pub hierarchy: String,
    /// Bearer tokens accepted by the HTTP surface. Empty disables auth.
    pub auth_tokens: Vec<String>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hierarchy: "mcp_hierarchy".to_string(),
            auth_tokens: Vec::new(),
        }
    }
}

/// Transport-tagged downstream server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerConfig {
    Stdio(StdioConfig),
    Sse(SseConfig),
    StreamableHttp(StreamableHttpConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StdioConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SseConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamableHttpConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-request timeout in seconds.
    #[serde(default, rename = "timeout")]
    pub timeout_secs: Option<u64>,
}

impl ServerConfig {
    /// Reject configs that cannot possibly produce a transport. Runs before
    /// any subprocess or connection work.
    pub fn validate(&self) -> Result<()> {
        match self {
            ServerConfig::Stdio(c) if c.command.is_empty() => {
                bail!("command is required for stdio transport")
            }
            ServerConfig::Sse(c) if c.url.is_empty() => bail!("url is required for sse transport"),
            ServerConfig::StreamableHttp(c) if c.url.is_empty() => {
                bail!("url is required for streamable-http transport")
            }
            _ => Ok(()),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        match self {
            ServerConfig::Stdio(_) => "stdio",
            ServerConfig::Sse(_) => "sse",
            ServerConfig::StreamableHttp(_) => "streamable-http",
        }
    }
}

/// Load a config file, optionally expanding `${VAR}` references in the raw
/// text before parsing.
pub fn load(path: &Path, expand_env: bool) -> Result<Config> {
    let mut text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    if expand_env {
        text = expand_env_vars(&text);
    }
    let config: Config = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Replace `${VAR}` with the variable's value. Unset variables expand to the
/// empty string.
pub fn expand_env_vars(text: &str) -> String {
    static VAR: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern"));
    VAR.replace_all(text, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
