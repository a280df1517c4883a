use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod cli;

use canopy::registry::ServerRegistry;
use canopy::router::RouterServer;
use canopy::{config, generator, hierarchy};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    if let Some(command) = cli.command {
        return match command {
            Commands::Generate { output } => {
                let config = config::load(&cli.config, !cli.no_expand_env)?;
                generator::generate(&config, &output).await
            }
            Commands::Regenerate { dir } => generator::regenerate(&dir),
        };
    }

    let config = config::load(&cli.config, !cli.no_expand_env)?;
    let hierarchy_dir = cli
        .hierarchy
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.router.hierarchy));

    log::info!("loading hierarchy from {}", hierarchy_dir.display());
    let loaded = hierarchy::load_hierarchy(&hierarchy_dir)?;

    if cli.list_paths {
        let mut paths: Vec<&str> = loaded.store.paths().collect();
        paths.sort_unstable();
        for path in paths {
            println!("{}", if path.is_empty() { "/" } else { path });
        }
        return Ok(());
    }

    // Hierarchy files may declare server transports inline; the config file
    // wins when both name the same server.
    let mut servers = loaded.servers;
    servers.extend(config.servers.clone());

    let registry = Arc::new(ServerRegistry::new(servers));
    let router = RouterServer::new(
        Arc::new(loaded.store),
        registry.clone(),
        config.router.name.clone(),
        config.router.version.clone(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let result = match cli.http {
        Some(addr) => {
            router
                .serve_http(addr, config.router.auth_tokens.clone(), shutdown.clone())
                .await
        }
        None => {
            tokio::select! {
                result = router.serve_stdio() => result,
                _ = shutdown.cancelled() => Ok(()),
            }
        }
    };

    registry.close_all().await;
    result
}

/// Cancel the shutdown token once the process is told to stop: SIGTERM or
/// Ctrl-C on unix, Ctrl-C elsewhere. Shutdown then drains through the token,
/// so this task never touches the registry itself.
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(err) => {
                log::warn!("failed to register SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    log::info!("shutdown signal received");
    token.cancel();
}
