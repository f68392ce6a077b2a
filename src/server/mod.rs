//! Control server: axum router, controller websocket, and the background
//! maintenance tasks that keep the registry, metrics, store and rate
//! limiter tidy.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cdp_bridge::{CdpBridge, ChromiumTransport, TabEvent};
use tabrelay_core_types::SessionState;
use tabrelay_metrics::MetricsHub;
use tabrelay_registry::SessionRegistry;
use tabrelay_store::{now_ms, RelayStore};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::tab_host::BridgeTabHost;

pub mod rate_limit;
mod router;
mod state;
mod ws;

use rate_limit::RateLimiter;
use state::ServeState;

/// Bring the whole relay up and serve until ctrl-c.
pub async fn run(config: RelayConfig) -> Result<()> {
    let bridge_config = config.bridge_config();
    let transport = Arc::new(ChromiumTransport::new(bridge_config.transport.clone()));
    let bridge = CdpBridge::new(transport, bridge_config);
    bridge.start().await.context("failed to start cdp transport")?;

    let registry = Arc::new(SessionRegistry::new());
    let metrics = Arc::new(MetricsHub::new(config.metrics_window));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));
    let store = RelayStore::open(&config.store_path)
        .with_context(|| format!("failed to open store at {}", config.store_path.display()))?;

    orphan_departed_owners(&store);

    let target_path = config
        .websocket_url
        .clone()
        .unwrap_or_else(|| format!("launch:{}", config.store_path.display()));

    let dispatcher = Arc::new(Dispatcher::new(
        bridge.clone(),
        registry.clone(),
        store.clone(),
        metrics.clone(),
        rate_limiter.clone(),
        target_path,
    ));

    spawn_tab_event_listener(&bridge, registry.clone());
    spawn_maintenance(&config, &bridge, registry.clone(), metrics, rate_limiter.clone(), store.clone());

    let state = ServeState::new(dispatcher, bridge.clone(), registry, rate_limiter);
    let app = router::build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "control server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // leave our records adoptable by the next process
    match store.orphan_owned_by(process::id()) {
        Ok(count) if count > 0 => info!(count, "orphaned owned session records"),
        Ok(_) => {}
        Err(err) => warn!(%err, "failed to orphan session records on shutdown"),
    }
    bridge.shutdown().await;
    Ok(())
}

/// Records still marked active but owned by a process that is no longer us
/// belong to a dead controller; flag them for adoption.
fn orphan_departed_owners(store: &RelayStore) {
    let my_pid = process::id();
    match store.list_relay_sessions() {
        Ok(records) => {
            for record in records {
                if record.state == SessionState::Active && record.owner_pid != my_pid {
                    if let Err(err) = store.mark_orphaned(&record.session_id) {
                        warn!(%err, session = %record.session_id, "failed to orphan stale record");
                    }
                }
            }
        }
        Err(err) => warn!(%err, "failed to scan session records at startup"),
    }
}

fn spawn_tab_event_listener(bridge: &Arc<CdpBridge>, registry: Arc<SessionRegistry>) {
    let mut events = bridge.subscribe_tab_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TabEvent::Closed(tab)) => {
                    registry.note_tab_closed(tab);
                }
                Ok(TabEvent::Created(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "tab event listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn spawn_maintenance(
    config: &RelayConfig,
    bridge: &Arc<CdpBridge>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<MetricsHub>,
    rate_limiter: Arc<RateLimiter>,
    store: RelayStore,
) {
    let group_idle = config.group_idle;
    let record_ttl_ms = config.record_ttl_ms();
    let host = BridgeTabHost::new(bridge.clone());

    tokio::spawn(async move {
        let mut sweep = interval(Duration::from_secs(60));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            sweep.tick().await;

            let dropped = registry.sweep_idle(&host, group_idle).await;
            if dropped > 0 {
                info!(dropped, "closed idle tab groups");
            }

            let swept = metrics.sweep();
            if swept > 0 {
                debug!(swept, "dropped out-of-window metric events");
            }

            let pruned = rate_limiter.prune_idle(Duration::from_secs(300));
            if pruned > 0 {
                debug!(pruned, "pruned idle rate-limit buckets");
            }

            match store.cleanup_expired(record_ttl_ms, now_ms()) {
                Ok(expired) if expired > 0 => info!(expired, "expired session records"),
                Ok(_) => {}
                Err(err) => warn!(%err, "store cleanup failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
}
