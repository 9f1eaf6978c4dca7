#![cfg_attr(not(test), deny(clippy::panic))]

use clap::Parser;
use phi_session_server::auth_client::HttpAuthClient;
use phi_session_server::ban_store::InMemoryBanStore;
use phi_session_server::chart_service::HttpChartService;
use phi_session_server::config;
use phi_session_server::federation::Federation;
use phi_session_server::logging;
use phi_session_server::metrics::ServerMetrics;
use phi_session_server::protocol_engine::{EngineHandle, FederationRouter, ProtocolEngine};
use phi_session_server::room::RoomStore;
use phi_session_server::session::SessionTable;
use phi_session_server::transport::{self, ConnectionRegistry, ProxySink};
use phi_session_server::web;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// phi-session-server -- multiplayer rhythm-game session server
#[derive(Parser, Debug)]
#[command(name = "phi-session-server")]
#[command(about = "A multiplayer rhythm-game session server: room lifecycle, federation, and a read-only web bridge")]
#[command(version)]
struct Cli {
    /// Validate configuration and exit without starting the server.
    /// Useful for CI/CD pipelines and pre-deployment checks.
    #[arg(long, short = 'c', conflicts_with = "print_config")]
    validate_config: bool,

    /// Print the loaded configuration to stdout (as JSON) and exit.
    /// Useful for debugging configuration loading from multiple sources.
    #[arg(long, conflicts_with = "validate_config")]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = Arc::new(config::load());

    if cli.print_config {
        let json = serde_json::to_string_pretty(&*cfg)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    let validation_result = config::validate_config_security(&cfg);

    if cli.validate_config {
        match validation_result {
            Ok(()) => {
                println!("Configuration validation passed");
                println!();
                println!("Configuration summary:");
                println!("  TCP port: {} (enabled: {})", cfg.port, cfg.tcp_enabled);
                println!("  Web port: {} (enabled: {})", cfg.web_port, cfg.enable_web_server);
                println!("  Server name: {}", cfg.server_name);
                println!("  TLS enabled: {}", cfg.security.transport.tls.enabled);
                println!("  Federation enabled: {}", cfg.federation.enabled);
                println!("  Room size: {}", cfg.server.room_size);
                return Ok(());
            }
            Err(e) => {
                eprintln!("Configuration validation failed:\n{e}");
                std::process::exit(1);
            }
        }
    }

    validation_result?;

    logging::init_with_config(&cfg.logging);

    tracing::info!(server_name = %cfg.server_name, "starting phi-session-server");

    let sessions = SessionTable::new();
    let rooms = RoomStore::new();
    let metrics = Arc::new(ServerMetrics::new());
    let ban_store = Arc::new(InMemoryBanStore::load(&cfg.data_dir));

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.auth.auth_timeout_secs.max(cfg.auth.chart_fetch_timeout_secs)))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let auth_client = Arc::new(HttpAuthClient::new(http_client.clone(), cfg.auth.phira_api_url.clone()));
    let chart_service = Arc::new(HttpChartService::new(http_client.clone(), cfg.auth.phira_api_url.clone()));

    let registry = ConnectionRegistry::new();

    let engine = ProtocolEngine::new(
        sessions.clone(),
        rooms.clone(),
        auth_client,
        chart_service,
        ban_store.clone(),
        metrics.clone(),
        registry.clone(),
        cfg.auth.token_length,
        cfg.server.room_size,
    );

    let federation = if cfg.federation.enabled {
        let fed = Federation::new(
            cfg.federation.clone(),
            cfg.data_dir.clone(),
            cfg.server_name.clone(),
            metrics.clone(),
        );
        fed.set_engine_handle(engine.clone() as Arc<dyn EngineHandle>).await;
        engine.set_federation_router(fed.clone() as Arc<dyn FederationRouter>).await;
        registry.set_proxy_sink(fed.clone() as Arc<dyn ProxySink>).await;
        Some(fed)
    } else {
        None
    };

    if let Some(fed) = &federation {
        fed.spawn_bootstrap();

        let health_fed = fed.clone();
        let health_rooms = rooms.clone();
        tokio::spawn(async move {
            health_fed.run_health_loop(health_rooms).await;
        });

        let sync_fed = fed.clone();
        let sync_rooms = rooms.clone();
        tokio::spawn(async move {
            sync_fed.run_sync_loop(sync_rooms).await;
        });
    }

    {
        let rooms = rooms.clone();
        let cleanup_interval = Duration::from_secs(cfg.server.room_cleanup_interval_secs);
        let max_age_ms = cfg.server.inactive_room_timeout_secs as i64 * 1000;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp_millis();
                let removed = rooms.sweep_inactive(max_age_ms, now).await;
                if !removed.is_empty() {
                    tracing::debug!(count = removed.len(), "swept inactive rooms");
                }
            }
        });
    }

    if cfg.tcp_enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let engine = engine.clone();
        let registry = registry.clone();
        let metrics = metrics.clone();
        let heartbeat_interval = Duration::from_secs(cfg.server.heartbeat_interval_secs);
        let heartbeat_timeout = Duration::from_secs(cfg.server.heartbeat_timeout_secs);
        tokio::spawn(async move {
            if let Err(err) = transport::run(listener, engine, registry, metrics, heartbeat_interval, heartbeat_timeout).await {
                tracing::error!(error = %err, "TCP transport stopped");
            }
        });
        tracing::info!(%addr, "TCP transport listening");
    }

    if cfg.enable_web_server {
        let web_state = web::WebState::new(
            cfg.clone(),
            sessions.clone(),
            rooms.clone(),
            engine.clone(),
            ban_store.clone(),
            federation.clone(),
            metrics.clone(),
        );
        let app = web::router(web_state);
        let web_addr = SocketAddr::from(([0, 0, 0, 0], cfg.web_port));
        let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

        #[cfg(feature = "tls")]
        if cfg.security.transport.tls.enabled {
            let tls_config = phi_session_server::security::build_rustls_config(&cfg.security.transport.tls)
                .map_err(|err| anyhow::anyhow!("failed to initialize TLS configuration: {err}"))?;
            tracing::info!(%web_addr, "web bridge listening over HTTPS");
            axum_server::bind_rustls(web_addr, tls_config).serve(make_service).await?;
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(web_addr).await?;
        tracing::info!(%web_addr, "web bridge listening");
        axum::serve(listener, make_service).await?;
    } else if cfg.tcp_enabled {
        // Park the process on the signal future; the TCP transport already runs in its own task.
        tokio::signal::ctrl_c().await?;
    } else {
        tracing::warn!("neither the TCP transport nor the web bridge is enabled; nothing to serve");
    }

    Ok(())
}

#[cfg(test)]
mod cli_tests {
    use super::Cli;
    use clap::Parser;

    #[test]
    fn test_cli_default_no_flags() {
        let cli = Cli::try_parse_from(["phi-session-server"]).unwrap();
        assert!(!cli.validate_config);
        assert!(!cli.print_config);
    }

    #[test]
    fn test_cli_validate_config_long() {
        let cli = Cli::try_parse_from(["phi-session-server", "--validate-config"]).unwrap();
        assert!(cli.validate_config);
        assert!(!cli.print_config);
    }

    #[test]
    fn test_cli_validate_config_short() {
        let cli = Cli::try_parse_from(["phi-session-server", "-c"]).unwrap();
        assert!(cli.validate_config);
        assert!(!cli.print_config);
    }

    #[test]
    fn test_cli_print_config() {
        let cli = Cli::try_parse_from(["phi-session-server", "--print-config"]).unwrap();
        assert!(!cli.validate_config);
        assert!(cli.print_config);
    }

    #[test]
    fn test_cli_validate_and_print_config_conflict() {
        let result = Cli::try_parse_from(["phi-session-server", "--validate-config", "--print-config"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("cannot be used with"));
    }

    #[test]
    fn test_cli_help_contains_flags() {
        let result = Cli::try_parse_from(["phi-session-server", "--help"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        let help_text = err.to_string();
        assert!(help_text.contains("--validate-config"));
        assert!(help_text.contains("--print-config"));
        assert!(help_text.contains("-c"));
    }

    #[test]
    fn test_cli_version() {
        let result = Cli::try_parse_from(["phi-session-server", "--version"]);
        assert!(result.is_err());
    }
}
