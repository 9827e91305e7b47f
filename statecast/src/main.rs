mod server;

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use statecast_core::{bootstrap::load_config, logging, StateCache};
use statecast_relay::{EventBus, Hooks, RedisBus, Relay, StaticTokenVerifier};

use server::StatecastServer;

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    // Several instances may share a host
    let suffix = nanoid::nanoid!(6);

    format!("{hostname}-{suffix}")
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = load_config()?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    let node_id = generate_node_id();
    info!(node_id = %node_id, "Statecast relay starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. State Cache and hooks
    let cache = StateCache::new(config.cache.ttl(), config.cache.max_capacity);

    let mut hooks = Hooks::new();
    if config.auth.tokens.is_empty() {
        info!("No auth tokens configured, token verification disabled");
    } else {
        hooks = hooks.with_verifier(Arc::new(StaticTokenVerifier::new(config.auth.tokens.clone())));
        info!(tokens = config.auth.tokens.len(), "Static token verifier installed");
    }

    // 5. Relay, with a Redis bus when configured
    let relay = Relay::new(node_id, &config.relay, cache, hooks);

    let bus: Option<Arc<dyn EventBus>> = if config.redis.url.is_empty() {
        info!("Redis not configured, running in single-node mode");
        None
    } else {
        match RedisBus::new(&config.redis.url, config.redis.channel.clone()) {
            Ok(bus) => {
                info!(channel = %config.redis.channel, "Redis bus configured");
                Some(Arc::new(bus))
            }
            Err(e) => {
                warn!(error = %e, "Invalid Redis configuration, running in single-node mode");
                None
            }
        }
    };
    relay.start(bus).await;

    // 6. Serve until shutdown
    StatecastServer::new(config, relay).start().await
}
