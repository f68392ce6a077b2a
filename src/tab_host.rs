//! Registry-side view of the browser: tab allocation and existence probes
//! backed by the CDP bridge.

use std::sync::Arc;

use async_trait::async_trait;
use cdp_bridge::CdpBridge;
use tabrelay_core_types::{RelayError, TabId};
use tabrelay_registry::TabHost;

pub struct BridgeTabHost {
    bridge: Arc<CdpBridge>,
}

impl BridgeTabHost {
    pub fn new(bridge: Arc<CdpBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl TabHost for BridgeTabHost {
    async fn create_tab(&self, url: &str) -> Result<TabId, RelayError> {
        self.bridge.create_tab(url).await
    }

    async fn tab_exists(&self, tab: TabId) -> bool {
        self.bridge.tab_exists(tab)
    }

    async fn close_tab(&self, tab: TabId) -> Result<(), RelayError> {
        self.bridge.close_tab(tab).await
    }
}
