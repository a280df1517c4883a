//! Lazy-loading integration tests against a live downstream MCP server.
//!
//! The downstream is this crate's own binary serving its meta-tools over
//! stdio, so the tests exercise the real subprocess transport and initialize
//! handshake without any network dependency.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use canopy::config::{ServerConfig, StdioConfig};
use canopy::hierarchy::{HierarchyNode, HierarchyStore, ToolDefinition};
use canopy::registry::ServerRegistry;
use canopy::router::RouterServer;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Write the downstream's config and hierarchy, returning a stdio config
/// that launches this crate's binary as an MCP server. Besides its
/// meta-tools, the downstream routes `slow.wait` to a "stall" server whose
/// command never answers the MCP handshake, so a relayed call can be held in
/// flight for as long as a test needs.
fn downstream_config(tmp: &TempDir) -> ServerConfig {
    let dir = tmp.path();
    let hierarchy = dir.join("downstream_hierarchy");
    fs::create_dir_all(&hierarchy).unwrap();
    fs::write(
        hierarchy.join("root.json"),
        r#"{"overview": "Downstream test hierarchy"}"#,
    )
    .unwrap();
    fs::write(
        hierarchy.join("slow.json"),
        r#"{"tools": {"wait": {"description": "Stalls forever", "server": "stall"}}}"#,
    )
    .unwrap();

    let config = dir.join("downstream_config.json");
    fs::write(
        &config,
        r#"{
            "router": {"name": "downstream"},
            "servers": {"stall": {"stdio": {"command": "sleep", "args": ["60"]}}}
        }"#,
    )
    .unwrap();

    ServerConfig::Stdio(StdioConfig {
        command: env!("CARGO_BIN_EXE_canopy").to_string(),
        args: vec![
            "--config".to_string(),
            config.display().to_string(),
            "--hierarchy".to_string(),
            hierarchy.display().to_string(),
        ],
        env: HashMap::new(),
    })
}

/// Upstream hierarchy: one leaf whose `probe` and `relay` tools map onto the
/// downstream's own meta-tools.
fn upstream_store() -> Arc<HierarchyStore> {
    let mut nodes = HashMap::new();
    nodes.insert(
        String::new(),
        HierarchyNode {
            overview: Some("Upstream test hierarchy".to_string()),
            ..Default::default()
        },
    );
    let mut leaf = HierarchyNode::default();
    leaf.tools.insert(
        "probe".to_string(),
        ToolDefinition {
            description: "Ask the downstream for its root view".to_string(),
            maps_to: "get_tools_in_category".to_string(),
            server: "sub".to_string(),
            input_schema: None,
        },
    );
    leaf.tools.insert(
        "relay".to_string(),
        ToolDefinition {
            description: "Forward an execute_tool call to the downstream".to_string(),
            maps_to: "execute_tool".to_string(),
            server: "sub".to_string(),
            input_schema: None,
        },
    );
    nodes.insert("sub".to_string(), leaf);
    Arc::new(HierarchyStore::new(nodes).unwrap())
}

fn registry_with_downstream(tmp: &TempDir) -> Arc<ServerRegistry> {
    let mut servers = HashMap::new();
    servers.insert("sub".to_string(), downstream_config(tmp));
    Arc::new(ServerRegistry::new(servers))
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_callers_share_one_initialization() {
    let tmp = TempDir::new().unwrap();
    let registry = registry_with_downstream(&tmp);
    let ct = CancellationToken::new();

    // Ten callers race the first activation; exactly one subprocess comes up
    // and everybody gets the same handle.
    let first_round = futures::future::join_all(
        (0..10).map(|_| registry.get_or_load(&ct, "sub")),
    )
    .await;

    let mut clients = Vec::new();
    for result in first_round {
        clients.push(result.expect("activation should succeed"));
    }
    for client in &clients[1..] {
        assert!(
            Arc::ptr_eq(&clients[0], client),
            "all callers must observe the same client handle"
        );
    }

    // A second round touches the cache only.
    let second_round =
        futures::future::join_all((0..10).map(|_| registry.get_or_load(&ct, "sub"))).await;
    for result in second_round {
        assert!(Arc::ptr_eq(&clients[0], &result.unwrap()));
    }

    registry.close_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_tool_round_trips_through_a_live_subprocess() {
    let tmp = TempDir::new().unwrap();
    let registry = registry_with_downstream(&tmp);
    let router = RouterServer::new(
        upstream_store(),
        registry.clone(),
        "canopy-test".to_string(),
        "0.0.0".to_string(),
    );
    let ct = CancellationToken::new();

    assert!(!registry.is_loaded("sub"), "no client before first execution");

    let arguments = json!({
        "tool_path": "sub.probe",
        "arguments": {"path": ""}
    });
    let result = router
        .handle_execute_tool(&ct, arguments.as_object())
        .await
        .expect("execute_tool should relay the downstream result");

    assert!(registry.is_loaded("sub"), "first execution activates the server");

    let text = result.content[0]
        .as_text()
        .map(|t| t.text.clone())
        .unwrap_or_default();
    let view: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(view["path"], "");
    assert_eq!(view["overview"], "Downstream test hierarchy");

    registry.close_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_caller_aborts_an_in_flight_call() {
    let tmp = TempDir::new().unwrap();
    let registry = registry_with_downstream(&tmp);
    let router = RouterServer::new(
        upstream_store(),
        registry.clone(),
        "canopy-test".to_string(),
        "0.0.0".to_string(),
    );

    // Warm up so the downstream is already activated; the cancellation below
    // must land on the downstream call itself, not on initialization.
    let warmup = CancellationToken::new();
    let probe = json!({"tool_path": "sub.probe", "arguments": {"path": ""}});
    router
        .handle_execute_tool(&warmup, probe.as_object())
        .await
        .expect("warmup probe should succeed");
    assert!(registry.is_loaded("sub"));

    // slow.wait stalls inside the downstream indefinitely, so only the
    // caller's own deadline can end this call early.
    let ct = CancellationToken::new();
    let started = Instant::now();
    let call = {
        let router = router.clone();
        let ct = ct.clone();
        tokio::spawn(async move {
            let arguments = json!({
                "tool_path": "sub.relay",
                "arguments": {"tool_path": "slow.wait", "arguments": {}}
            });
            router.handle_execute_tool(&ct, arguments.as_object()).await
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    ct.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert!(err.message.contains("cancelled"));
    // The caller's deadline wins long before the router's 15-second cutoff.
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "cancellation took {:?}",
        started.elapsed()
    );

    registry.close_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_activation_unwinds_and_recovers() {
    let tmp = TempDir::new().unwrap();
    let registry = registry_with_downstream(&tmp);

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = registry.get_or_load(&cancelled, "sub").await.unwrap_err();
    assert!(err.to_string().contains("cancelled"));
    assert!(
        !registry.is_loaded("sub"),
        "a cancelled activation must leave the slot empty"
    );

    // A fresh caller re-initializes from scratch.
    let ct = CancellationToken::new();
    let client = registry.get_or_load(&ct, "sub").await.unwrap();
    assert_eq!(client.name(), "sub");
    assert!(registry.is_loaded("sub"));

    registry.close_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_server_name_never_creates_an_entry() {
    let tmp = TempDir::new().unwrap();
    let registry = registry_with_downstream(&tmp);
    let ct = CancellationToken::new();

    let err = registry.get_or_load(&ct, "ghost").await.unwrap_err();
    assert!(err.to_string().contains("ghost"));
    assert!(!registry.is_loaded("ghost"));

    registry.close_all().await;
}

/// Broken downstream commands fail the caller but stay retryable. Keeps the
/// registry honest about not caching errors.
#[tokio::test(flavor = "multi_thread")]
async fn failed_activation_is_retried_from_scratch() {
    let mut servers = HashMap::new();
    servers.insert(
        "broken".to_string(),
        ServerConfig::Stdio(StdioConfig {
            command: "this-binary-does-not-exist-canopy-test".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }),
    );
    let registry = ServerRegistry::new(servers);
    let ct = CancellationToken::new();

    for _ in 0..2 {
        let err = registry.get_or_load(&ct, "broken").await.unwrap_err();
        assert!(err.to_string().contains("failed to connect"));
        assert!(!registry.is_loaded("broken"));
    }
}
