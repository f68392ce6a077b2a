use std::sync::Arc;
use std::time::Instant;

use cdp_bridge::{CdpBridge, LinkState};
use tabrelay_registry::{GroupSummary, SessionRegistry};

use crate::dispatch::Dispatcher;

use super::rate_limit::RateLimiter;

#[derive(Clone)]
pub(crate) struct ServeState {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) bridge: Arc<CdpBridge>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) started_at: Instant,
}

impl ServeState {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        bridge: Arc<CdpBridge>,
        registry: Arc<SessionRegistry>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            dispatcher,
            bridge,
            registry,
            rate_limiter,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub(crate) fn browser_connected(&self) -> bool {
        *self.bridge.link_state().borrow() == LinkState::Connected
    }

    pub(crate) fn relay_summaries(&self) -> Vec<GroupSummary> {
        self.registry.summaries()
    }
}
