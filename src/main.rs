//! icebridge - Ice protocol server
//!
//! Hosts a demo greeter servant behind the identity `greeter`.

use async_trait::async_trait;
use icebridge_core::{DispatchError, DispatchResult, IncomingRequest};
use icebridge_protocol::Identity;
use icebridge_server::{Config, Router, Servant, Server, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// `::Demo::Greeter` with `greet(name: string) -> string`.
struct Greeter;

#[async_trait]
impl Servant for Greeter {
    fn type_ids(&self) -> &[&'static str] {
        &["::Demo::Greeter"]
    }

    async fn dispatch(&self, request: IncomingRequest) -> DispatchResult {
        match request.operation() {
            "greet" => {
                let name = request.params_decoder().decode_string()?;
                if name.is_empty() {
                    return Err(DispatchError::unhandled("name must not be empty"));
                }
                tracing::info!("[{}] Greeting {}", request.peer.addr, name);
                request.encode_result(|encoder| {
                    encoder.encode_string(&format!("Hello, {}!", name));
                    Ok(())
                })
            }
            _ => Err(DispatchError::OperationNotFound),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // File from ICEBRIDGE_CONFIG if set, then ICEBRIDGE_* overrides
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Ok(path) = std::env::var("ICEBRIDGE_CONFIG") {
        tracing::info!("Loaded config from {}", path);
    }

    tracing::info!("Starting icebridge server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Idle timeout: {}s ({})",
        config.connection.idle_timeout_secs,
        config.connection.idle_check_mode.as_str()
    );
    if config.connection.inactivity_timeout_secs > 0 {
        tracing::info!(
            "  Inactivity timeout: {}s",
            config.connection.inactivity_timeout_secs
        );
    }
    tracing::info!(
        "  Exception enforcement: {}",
        config.connection.exception_enforcement.as_str()
    );
    if config.tls.enabled {
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    } else {
        tracing::info!("  TLS: disabled");
    }

    let server_config = ServerConfig::from_config(&config)?;
    let router = Arc::new(Router::new(config.connection.exception_enforcement));
    router.add(Identity::new("greeter"), Arc::new(Greeter));

    let server = Arc::new(Server::new(server_config, router));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
