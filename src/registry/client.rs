//! Downstream MCP client handle, uniform over the stdio, SSE, and
//! streamable-HTTP transports.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientCapabilities, ClientInfo, ClientRequest,
    Implementation, PaginatedRequestParam, PingRequest, Tool,
};
use rmcp::service::{Peer, RunningService};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{
    ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
};
use rmcp::{RoleClient, ServiceError, ServiceExt};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::error::RouterError;

/// A live, initialized connection to one downstream MCP server. The handle
/// exclusively owns its transport (subprocess pipes or HTTP connection);
/// dropping or closing it tears the transport down.
#[derive(Debug)]
pub struct DownstreamClient {
    name: String,
    needs_ping: bool,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ClientInfo>>>,
}

impl DownstreamClient {
    /// Build the transport and run the MCP initialize handshake. Subprocess
    /// spawn, remote connect, and the handshake all happen on the caller's
    /// path; only fully initialized handles are returned.
    pub async fn connect(name: &str, config: &ServerConfig) -> Result<Self, RouterError> {
        let connect_failed = |message: String| RouterError::ConnectFailed {
            server: name.to_string(),
            message,
        };

        config
            .validate()
            .map_err(|err| connect_failed(err.to_string()))?;

        let info = client_info();
        let (service, needs_ping) = match config {
            ServerConfig::Stdio(c) => {
                let transport = TokioChildProcess::new(Command::new(&c.command).configure(|cmd| {
                    cmd.args(&c.args);
                    for (key, value) in &c.env {
                        cmd.env(key, value);
                    }
                }))
                .map_err(|err| connect_failed(format!("failed to spawn '{}': {err}", c.command)))?;
                let service = info
                    .serve(transport)
                    .await
                    .map_err(|err| connect_failed(format!("initialize failed: {err}")))?;
                (service, false)
            }
            ServerConfig::Sse(c) => {
                let http = http_client(&c.headers, None)
                    .map_err(|err| connect_failed(err.to_string()))?;
                let transport = SseClientTransport::start_with_client(
                    http,
                    SseClientConfig {
                        sse_endpoint: c.url.clone().into(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|err| connect_failed(format!("sse connect failed: {err}")))?;
                let service = info
                    .serve(transport)
                    .await
                    .map_err(|err| connect_failed(format!("initialize failed: {err}")))?;
                (service, true)
            }
            ServerConfig::StreamableHttp(c) => {
                let http = http_client(&c.headers, c.timeout_secs.map(Duration::from_secs))
                    .map_err(|err| connect_failed(err.to_string()))?;
                let transport = StreamableHttpClientTransport::with_client(
                    http,
                    StreamableHttpClientTransportConfig {
                        uri: c.url.clone().into(),
                        ..Default::default()
                    },
                );
                let service = info
                    .serve(transport)
                    .await
                    .map_err(|err| connect_failed(format!("initialize failed: {err}")))?;
                (service, true)
            }
        };

        log::info!("<{}> initialized MCP client ({})", name, config.transport_name());

        Ok(Self {
            name: name.to_string(),
            needs_ping,
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this transport needs periodic liveness checks. Subprocess
    /// transports surface liveness through the pipe; the HTTP transports do
    /// not.
    pub fn needs_ping(&self) -> bool {
        self.needs_ping
    }

    /// Invoke a tool on the downstream server, passing arguments through
    /// verbatim. The raw [`ServiceError`] is returned so the dispatcher can
    /// relay downstream MCP errors untouched.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult, ServiceError> {
        self.peer
            .call_tool(CallToolRequestParam {
                name: tool.to_string().into(),
                arguments,
            })
            .await
    }

    /// Page through the downstream server's full tool list.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, ServiceError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = cursor
                .take()
                .map(|c| PaginatedRequestParam { cursor: Some(c) });
            let page = self.peer.list_tools(request).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<(), ServiceError> {
        self.peer
            .send_request(ClientRequest::PingRequest(PingRequest::default()))
            .await
            .map(|_| ())
    }

    /// Close the underlying transport. Idempotent; errors are logged.
    pub async fn close(&self) {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            if let Err(err) = service.cancel().await {
                log::warn!("<{}> error closing MCP client: {err}", self.name);
            }
        }
    }
}

fn client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        },
    }
}

/// A reqwest client carrying the configured default headers. The request
/// timeout only applies to the streamable-HTTP transport; SSE streams must
/// stay open indefinitely.
fn http_client(
    headers: &HashMap<String, String>,
    timeout: Option<Duration>,
) -> anyhow::Result<reqwest::Client> {
    let mut default_headers = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .with_context(|| format!("invalid header name: {key}"))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for: {key}"))?;
        default_headers.insert(name, value);
    }
    let mut builder = reqwest::Client::builder().default_headers(default_headers);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().context("failed to build HTTP client")
}
