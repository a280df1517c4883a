//! On-disk hierarchy node schema.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{ServerConfig, SseConfig, StdioConfig, StreamableHttpConfig};

/// A node in the tool hierarchy. Leaves carry a non-empty `tools` map;
/// branches carry an overview and get their children from sibling files on
/// disk. A node may declare an `mcp_server` that child tools inherit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HierarchyNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<ServerRef>,
}

impl HierarchyNode {
    /// Leaves are exactly the nodes with direct tools.
    pub fn is_leaf(&self) -> bool {
        !self.tools.is_empty()
    }
}

/// A tool as declared in a hierarchy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Downstream tool name actually invoked. The loader defaults it to the
    /// hierarchy tool name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub maps_to: String,
    /// Downstream server key. Empty means "no downstream", which is how the
    /// meta-tools themselves are declared.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    /// Opaque JSON Schema passed through to the downstream server. The
    /// router never validates arguments against it.
    #[serde(default, rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

/// Full transport reference attached to a node via `mcp_server`. Uses the
/// flat `type`-tagged shape of the hierarchy files, unlike the config file's
/// externally tagged [`ServerConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerRef {
    pub name: String,
    #[serde(rename = "type")]
    pub transport: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ServerRef {
    /// Convert to the registry's transport-tagged config. Unknown transport
    /// types yield `None`; the loader warns and moves on.
    pub fn to_server_config(&self) -> Option<ServerConfig> {
        match self.transport.as_str() {
            "stdio" => Some(ServerConfig::Stdio(StdioConfig {
                command: self.command.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
            })),
            "sse" => Some(ServerConfig::Sse(SseConfig {
                url: self.url.clone(),
                headers: self.headers.clone(),
            })),
            "streamable-http" => Some(ServerConfig::StreamableHttp(StreamableHttpConfig {
                url: self.url.clone(),
                headers: self.headers.clone(),
                timeout_secs: self.timeout,
            })),
            _ => None,
        }
    }
}
