/*
 * Responsibility
 * - Load Config, set up tracing and the panic hook
 * - Build shared services (AppState) and background permission sync
 * - Assemble the Router (local API + admission-guarded proxy) and serve
 */
use anyhow::{Context, Result};
use axum::Router;
use axum::http::HeaderValue;
use std::time::Duration;
use std::{panic, process, sync::Arc};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api;
use crate::config::{Config, StoreBackend};
use crate::middleware::{self, admission, http::HttpLimits};
use crate::repos::{ValkeyRuleRepo, ValkeyUserRepo};
use crate::services::auth::{TokenCodec, TokenService};
use crate::services::cache::{CacheClient, MemoryCache, ValkeyClient};
use crate::services::permission::{
    PermissionReloader, PermissionTable, spawn_periodic_resync, spawn_sync_listener,
};
use crate::services::pipeline::AuthPipeline;
use crate::services::proxy::UpstreamProxy;
use crate::services::session::SessionStore;
use crate::services::whitelist::WhitelistMatcher;
use crate::state::AppState;

/// Slack on top of the upstream timeout before the edge gives up with 408.
const EDGE_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

fn init_tracing() {
    // RUST_LOG=info,admission_gateway=debug,tower_http=debug cargo run
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_panic_hook(abort_on_panic: bool) {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        tracing::error!(?info, "panic");

        // Development fails fast; production keeps serving.
        if abort_on_panic {
            process::abort();
        } else {
            default_hook(info);
        }
    }))
}

pub async fn run() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;
    init_panic_hook(!config.app_env.is_production());

    info!(config = ?config, "starting admission gateway");

    let (cache, valkey) = connect_store(&config.store).await?;
    let state = build_state(&config, cache)?;

    // Initial load; on failure only the admin role passes until a resync succeeds.
    match state.reloader.load_now().await {
        Ok(count) => info!(rules = count, "permission rules loaded"),
        Err(e) => warn!(error = %e, "initial permission load failed, starting with empty table"),
    }

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    if let Some(client) = valkey {
        tasks.push(spawn_sync_listener(
            client,
            config.perm_sync_channel.clone(),
            state.reloader.clone(),
        ));
    }
    if let Some(handle) = spawn_periodic_resync(state.reloader.clone(), config.perm_resync_interval)
    {
        tasks.push(handle);
    }

    let app = build_router(state, &config);
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("bind {}", config.addr))?;
    info!(addr = %config.addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn connect_store(
    backend: &StoreBackend,
) -> Result<(Arc<dyn CacheClient>, Option<ValkeyClient>)> {
    match backend {
        StoreBackend::Valkey(url) => {
            let client = ValkeyClient::new(url)
                .await
                .context("connect to shared store")?;
            let cache: Arc<dyn CacheClient> = Arc::new(client.clone());
            Ok((cache, Some(client)))
        }
        StoreBackend::Memory => {
            warn!("using the in-process store; sessions and rules are not shared");
            let cache: Arc<dyn CacheClient> = Arc::new(MemoryCache::new());
            Ok((cache, None))
        }
    }
}

/// Wire every service on top of `cache`. No I/O happens here.
pub fn build_state(config: &Config, cache: Arc<dyn CacheClient>) -> Result<AppState> {
    let codec = TokenCodec::new(
        config.jwt_secret.as_bytes(),
        config.access_token_ttl_seconds,
        config.refresh_token_ttl_seconds,
        config.token_leeway_seconds,
    )?;
    let sessions = SessionStore::new(cache.clone(), config.store_timeout);
    let users = Arc::new(ValkeyUserRepo::new(cache.clone()));
    let tokens = Arc::new(TokenService::new(codec.clone(), sessions.clone(), users));

    let table = Arc::new(PermissionTable::new(
        config.admin_role.clone(),
        config.match_cache_capacity,
        config.match_cache_ttl,
    ));
    let rules = Arc::new(ValkeyRuleRepo::new(cache));
    let reloader = Arc::new(PermissionReloader::new(
        table.clone(),
        rules,
        config.perm_reload_debounce,
        config.perm_reload_timeout,
    ));

    let whitelist = Arc::new(
        WhitelistMatcher::new(&config.whitelist).context("compile GATEWAY_WHITELIST")?,
    );
    let pipeline = AuthPipeline::standard(whitelist, codec, sessions, table);

    let proxy = Arc::new(
        UpstreamProxy::new(config.routes.clone(), config.upstream_timeout)
            .context("build upstream client")?,
    );
    let internal_secret =
        HeaderValue::from_str(&config.internal_secret).context("INTERNAL_SECRET header value")?;

    Ok(AppState::new(
        tokens,
        pipeline,
        proxy,
        reloader,
        internal_secret,
    ))
}

/// Local endpoints are matched first; every other request goes through admission and,
/// once admitted, to its upstream.
pub fn build_router(state: AppState, config: &Config) -> Router {
    let gateway = admission::apply(
        Router::new().fallback(admission::forward_upstream),
        state.clone(),
    );

    let router = api::routes()
        .fallback_service(gateway.with_state(state.clone()))
        .with_state(state);

    let router = middleware::cors::apply(router, config.app_env, &config.cors_allowed_origins);
    middleware::http::apply(
        router,
        HttpLimits {
            body_limit_bytes: config.request_body_limit_bytes,
            request_timeout: config.upstream_timeout + EDGE_TIMEOUT_MARGIN,
        },
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
