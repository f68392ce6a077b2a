//! Startup configuration. Defaults, then `TABRELAY_*` environment
//! overrides, immutable once the server is up.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use cdp_bridge::{BridgeConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Connect to an existing DevTools endpoint instead of launching Chromium.
    pub websocket_url: Option<String>,
    pub chrome_executable: Option<PathBuf>,
    pub headless: bool,
    pub default_deadline_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_cap_ms: u64,
    pub attach_idle_ms: u64,
    pub reattach_settle_ms: u64,
    pub group_idle: Duration,
    pub capture_max_dimension: u32,
    pub capture_fullpage_viewport_cap: u32,
    pub rate_limit_per_minute: u32,
    pub metrics_window: Duration,
    pub store_path: PathBuf,
    pub record_ttl: Duration,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            bind_addr: "127.0.0.1:8777".parse().expect("static addr"),
            websocket_url: None,
            chrome_executable: None,
            headless: transport.headless,
            default_deadline_ms: transport.default_deadline_ms,
            heartbeat_interval_ms: transport.heartbeat_interval_ms,
            backoff_base_ms: transport.backoff_base_ms,
            backoff_factor: transport.backoff_factor,
            backoff_cap_ms: transport.backoff_cap_ms,
            attach_idle_ms: 5_000,
            reattach_settle_ms: 75,
            group_idle: Duration::from_secs(30 * 60),
            capture_max_dimension: 7_800,
            capture_fullpage_viewport_cap: 30,
            rate_limit_per_minute: 60,
            metrics_window: Duration::from_secs(60 * 60),
            store_path: PathBuf::from("./tabrelay.db"),
            record_ttl: Duration::from_secs(60 * 60),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_overrides(|name| env::var(name).ok());
        cfg
    }

    /// Apply `TABRELAY_*` overrides from a lookup, so tests can inject a map
    /// instead of mutating the process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("TABRELAY_BIND") {
            match raw.parse() {
                Ok(addr) => self.bind_addr = addr,
                Err(err) => warn!(%raw, %err, "ignoring invalid TABRELAY_BIND"),
            }
        }
        if let Some(url) = lookup("TABRELAY_WS_URL") {
            if !url.trim().is_empty() {
                self.websocket_url = Some(url.trim().to_string());
            }
        }
        if let Some(path) = lookup("TABRELAY_CHROME") {
            if !path.trim().is_empty() {
                self.chrome_executable = Some(PathBuf::from(path.trim()));
            }
        }
        if let Some(raw) = lookup("TABRELAY_HEADLESS") {
            let lower = raw.to_ascii_lowercase();
            self.headless = !matches!(lower.as_str(), "0" | "false" | "no" | "off");
        }

        parse_into(&lookup, "TABRELAY_DEADLINE_MS", &mut self.default_deadline_ms);
        parse_into(&lookup, "TABRELAY_HEARTBEAT_MS", &mut self.heartbeat_interval_ms);
        parse_into(&lookup, "TABRELAY_BACKOFF_BASE_MS", &mut self.backoff_base_ms);
        parse_into(&lookup, "TABRELAY_BACKOFF_FACTOR", &mut self.backoff_factor);
        parse_into(&lookup, "TABRELAY_BACKOFF_CAP_MS", &mut self.backoff_cap_ms);
        parse_into(&lookup, "TABRELAY_ATTACH_IDLE_MS", &mut self.attach_idle_ms);
        parse_into(&lookup, "TABRELAY_REATTACH_SETTLE_MS", &mut self.reattach_settle_ms);
        parse_into(&lookup, "TABRELAY_CAPTURE_MAX_DIM", &mut self.capture_max_dimension);
        parse_into(&lookup, "TABRELAY_FULLPAGE_CAP", &mut self.capture_fullpage_viewport_cap);
        parse_into(&lookup, "TABRELAY_RATE_LIMIT_PER_MIN", &mut self.rate_limit_per_minute);

        parse_duration_into(&lookup, "TABRELAY_GROUP_IDLE", &mut self.group_idle);
        parse_duration_into(&lookup, "TABRELAY_METRICS_WINDOW", &mut self.metrics_window);
        parse_duration_into(&lookup, "TABRELAY_RECORD_TTL", &mut self.record_ttl);

        if let Some(path) = lookup("TABRELAY_STORE_PATH") {
            if !path.trim().is_empty() {
                self.store_path = PathBuf::from(path.trim());
            }
        }
        if let Some(level) = lookup("TABRELAY_LOG") {
            if !level.trim().is_empty() {
                self.log_level = level.trim().to_string();
            }
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        let mut transport = TransportConfig::default();
        transport.websocket_url = self.websocket_url.clone();
        if self.chrome_executable.is_some() {
            transport.executable = self.chrome_executable.clone();
        }
        transport.headless = self.headless;
        transport.default_deadline_ms = self.default_deadline_ms;
        transport.heartbeat_interval_ms = self.heartbeat_interval_ms;
        transport.backoff_base_ms = self.backoff_base_ms;
        transport.backoff_factor = self.backoff_factor;
        transport.backoff_cap_ms = self.backoff_cap_ms;

        BridgeConfig {
            transport,
            attach_idle_ms: self.attach_idle_ms,
            reattach_settle_ms: self.reattach_settle_ms,
            capture_max_dimension: self.capture_max_dimension,
            capture_fullpage_viewport_cap: self.capture_fullpage_viewport_cap,
        }
    }

    pub fn record_ttl_ms(&self) -> i64 {
        self.record_ttl.as_millis() as i64
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(name) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(%name, %raw, "ignoring unparseable override"),
        }
    }
}

fn parse_duration_into(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut Duration,
) {
    if let Some(raw) = lookup(name) {
        match humantime::parse_duration(raw.trim()) {
            Ok(value) => *slot = value,
            Err(err) => warn!(%name, %raw, %err, "ignoring unparseable duration override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn overrides_apply_over_defaults() {
        let mut cfg = RelayConfig::default();
        cfg.apply_overrides(lookup_from(&[
            ("TABRELAY_BIND", "0.0.0.0:9000"),
            ("TABRELAY_WS_URL", "ws://127.0.0.1:9222/devtools/browser/abc"),
            ("TABRELAY_RATE_LIMIT_PER_MIN", "120"),
            ("TABRELAY_GROUP_IDLE", "45m"),
            ("TABRELAY_HEADLESS", "off"),
            ("TABRELAY_LOG", "debug,cdp-transport=trace"),
        ]));

        assert_eq!(cfg.bind_addr.port(), 9000);
        assert_eq!(
            cfg.websocket_url.as_deref(),
            Some("ws://127.0.0.1:9222/devtools/browser/abc")
        );
        assert_eq!(cfg.rate_limit_per_minute, 120);
        assert_eq!(cfg.group_idle, Duration::from_secs(45 * 60));
        assert!(!cfg.headless);
        assert_eq!(cfg.log_level, "debug,cdp-transport=trace");
    }

    #[test]
    fn bad_values_keep_defaults() {
        let mut cfg = RelayConfig::default();
        let before = cfg.clone();
        cfg.apply_overrides(lookup_from(&[
            ("TABRELAY_BIND", "not-an-addr"),
            ("TABRELAY_BACKOFF_FACTOR", "fast"),
            ("TABRELAY_METRICS_WINDOW", "later"),
        ]));

        assert_eq!(cfg.bind_addr, before.bind_addr);
        assert_eq!(cfg.backoff_factor, before.backoff_factor);
        assert_eq!(cfg.metrics_window, before.metrics_window);
    }

    #[test]
    fn bridge_config_carries_the_transport_knobs() {
        let mut cfg = RelayConfig::default();
        cfg.websocket_url = Some("ws://example/devtools/browser/1".into());
        cfg.backoff_base_ms = 500;
        cfg.attach_idle_ms = 9_000;

        let bridge = cfg.bridge_config();
        assert_eq!(
            bridge.transport.websocket_url.as_deref(),
            Some("ws://example/devtools/browser/1")
        );
        assert_eq!(bridge.transport.backoff_base_ms, 500);
        assert_eq!(bridge.attach_idle_ms, 9_000);
    }
}
