//! Verb dispatch: decode one envelope into a typed command, run it against
//! the core, and shape the response. Rate limiting and metrics wrap every
//! verb.

use std::process;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use cdp_bridge::{CaptureMode, CdpBridge, ImageFormat};
use serde::Deserialize;
use serde_json::{json, Value};
use tabrelay_core_types::{
    RelayError, RelayErrorKind, RpcEnvelope, RpcResponse, SessionId, SessionState, TabId,
};
use tabrelay_metrics::MetricsHub;
use tabrelay_registry::SessionRegistry;
use tabrelay_store::{now_ms, RelaySessionRecord, RelayStore};
use tracing::{debug, warn};

use crate::server::rate_limit::RateLimiter;
use crate::tab_host::BridgeTabHost;

/// One decoded controller request.
#[derive(Debug)]
enum Command {
    Ping,
    SessionEnsure { label: Option<String> },
    SessionResolveTab,
    TabNavigate { url: String },
    TabEvaluate { expression: String },
    TabReattach,
    Screenshot(ScreenshotParams),
    MetricsSnapshot,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnsureParams {
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavigateParams {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateParams {
    expression: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotParams {
    #[serde(default)]
    mode: ScreenshotMode,
    selector: Option<String>,
    format: Option<String>,
    quality: Option<u8>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
enum ScreenshotMode {
    #[default]
    Viewport,
    Element,
    Fullpage,
}

impl Command {
    fn parse(verb: &str, payload: &Value) -> Result<Self, RelayError> {
        match verb {
            "ping" => Ok(Command::Ping),
            "session.ensure" => {
                let params: EnsureParams = decode_params(payload)?;
                Ok(Command::SessionEnsure {
                    label: params.label,
                })
            }
            "session.resolve_tab" => Ok(Command::SessionResolveTab),
            "tab.navigate" => {
                let params: NavigateParams = decode_params(payload)?;
                Ok(Command::TabNavigate { url: params.url })
            }
            "tab.evaluate" => {
                let params: EvaluateParams = decode_params(payload)?;
                Ok(Command::TabEvaluate {
                    expression: params.expression,
                })
            }
            "tab.reattach" => Ok(Command::TabReattach),
            "screenshot" => Ok(Command::Screenshot(decode_params(payload)?)),
            "metrics.snapshot" => Ok(Command::MetricsSnapshot),
            other => Err(RelayError::new(RelayErrorKind::UnknownVerb)
                .with_hint(format!("unknown verb {other:?}"))),
        }
    }
}

fn decode_params<T: for<'de> Deserialize<'de>>(payload: &Value) -> Result<T, RelayError> {
    serde_json::from_value(payload.clone()).map_err(|err| {
        RelayError::new(RelayErrorKind::Validation).with_hint(format!("bad payload: {err}"))
    })
}

pub struct Dispatcher {
    bridge: Arc<CdpBridge>,
    host: BridgeTabHost,
    registry: Arc<SessionRegistry>,
    store: RelayStore,
    metrics: Arc<MetricsHub>,
    rate_limiter: Arc<RateLimiter>,
    /// Identity of the browser this process drives; orphaned session records
    /// with the same target path are adoptable after a restart.
    target_path: String,
}

impl Dispatcher {
    pub fn new(
        bridge: Arc<CdpBridge>,
        registry: Arc<SessionRegistry>,
        store: RelayStore,
        metrics: Arc<MetricsHub>,
        rate_limiter: Arc<RateLimiter>,
        target_path: String,
    ) -> Self {
        Self {
            host: BridgeTabHost::new(bridge.clone()),
            bridge,
            registry,
            store,
            metrics,
            rate_limiter,
            target_path,
        }
    }

    /// Run one envelope end to end; never panics, always yields a response
    /// correlated to the request id.
    pub async fn handle(&self, envelope: RpcEnvelope, caller: &str) -> RpcResponse {
        let started = Instant::now();
        let verb = envelope.verb.clone();
        let id = envelope.id.clone();

        let result = match self.rate_limiter.check(caller) {
            Ok(()) => self.execute(&envelope).await,
            Err(err) => Err(err),
        };

        let error_code = result.as_ref().err().map(|err| err.code());
        self.metrics
            .record(&verb, started.elapsed(), result.is_ok(), error_code);

        match result {
            Ok(value) => RpcResponse::ok(id, value),
            Err(err) => {
                debug!(target: "dispatch", %verb, code = err.code(), "verb failed");
                RpcResponse::err(id, err.to_string(), err.code())
            }
        }
    }

    async fn execute(&self, envelope: &RpcEnvelope) -> Result<Value, RelayError> {
        let command = Command::parse(&envelope.verb, &envelope.payload)?;
        match command {
            Command::Ping => Ok(json!({
                "pong": true,
                "now": chrono::Utc::now().timestamp_millis(),
            })),
            Command::SessionEnsure { label } => self.ensure_session(envelope, label).await,
            Command::SessionResolveTab => {
                let session_id = require_session(envelope)?;
                let tab = self
                    .registry
                    .resolve_target_tab(&self.host, &session_id)
                    .await?;
                self.touch_store(&session_id);
                Ok(json!({ "tabId": tab.0 }))
            }
            Command::TabNavigate { url } => {
                let tab = self.resolve_tab(envelope).await?;
                self.bridge.navigate(tab, &url).await?;
                self.mark_tab_used(envelope, tab);
                Ok(json!({ "tabId": tab.0, "url": url }))
            }
            Command::TabEvaluate { expression } => {
                let tab = self.resolve_tab(envelope).await?;
                let value = self.bridge.evaluate(tab, &expression).await?;
                self.mark_tab_used(envelope, tab);
                Ok(json!({ "tabId": tab.0, "value": value }))
            }
            Command::TabReattach => {
                let tab = self.resolve_tab(envelope).await?;
                self.bridge.reattach(tab).await?;
                Ok(json!({ "tabId": tab.0, "reattached": true }))
            }
            Command::Screenshot(params) => self.screenshot(envelope, params).await,
            Command::MetricsSnapshot => {
                let snapshot = self.metrics.snapshot();
                serde_json::to_value(snapshot).map_err(|err| {
                    RelayError::new(RelayErrorKind::Internal).with_hint(err.to_string())
                })
            }
        }
    }

    async fn ensure_session(
        &self,
        envelope: &RpcEnvelope,
        label: Option<String>,
    ) -> Result<Value, RelayError> {
        let session_id = require_session(envelope)?;
        let label = label.unwrap_or_else(|| session_id.0.clone());

        let group = self
            .registry
            .get_or_create_group(&self.host, &session_id, &label)
            .await?;

        let state = self.persist_session(&session_id, &label);

        Ok(json!({
            "sessionId": group.session_id,
            "label": group.label,
            "color": group.color,
            "tabIds": group.tab_ids.iter().map(|t| t.0).collect::<Vec<_>>(),
            "activeTab": group.active_tab.map(|t| t.0),
            "state": state.as_str(),
        }))
    }

    /// Record the session durably. An orphaned record for the same session
    /// (left behind by a previous controller process) is adopted rather than
    /// recreated. Store trouble is logged, never surfaced to the caller.
    fn persist_session(&self, session_id: &SessionId, label: &str) -> SessionState {
        let pid = process::id();
        let now = now_ms();

        match self.store.get_relay_session(session_id) {
            Ok(Some(record)) if record.state == SessionState::Orphaned => {
                match self.store.adopt(session_id, pid, now) {
                    Ok(true) => return SessionState::Recovered,
                    Ok(false) => {}
                    Err(err) => warn!(target: "dispatch", %err, "session adoption failed"),
                }
            }
            Ok(Some(_)) => {
                if let Err(err) = self.store.touch_activity(session_id, now) {
                    warn!(target: "dispatch", %err, "failed to touch session record");
                }
                return SessionState::Active;
            }
            Ok(None) => {}
            Err(err) => warn!(target: "dispatch", %err, "session lookup failed"),
        }

        let record = RelaySessionRecord {
            session_id: session_id.clone(),
            label: label.to_string(),
            target_path: self.target_path.clone(),
            owner_pid: pid,
            created_at_ms: now,
            last_activity_ms: now,
            state: SessionState::Active,
        };
        if let Err(err) = self.store.upsert_relay_session(&record) {
            warn!(target: "dispatch", %err, "failed to persist session record");
        }
        SessionState::Active
    }

    async fn screenshot(
        &self,
        envelope: &RpcEnvelope,
        params: ScreenshotParams,
    ) -> Result<Value, RelayError> {
        let format = parse_format(params.format.as_deref(), params.quality)?;
        let tab = self.resolve_tab(envelope).await?;

        let shot = match params.mode {
            ScreenshotMode::Viewport => {
                self.bridge.capture(tab, CaptureMode::Viewport, format).await?
            }
            ScreenshotMode::Fullpage => {
                self.bridge.capture(tab, CaptureMode::FullPage, format).await?
            }
            ScreenshotMode::Element => {
                let selector = params.selector.as_deref().ok_or_else(|| {
                    RelayError::new(RelayErrorKind::Validation)
                        .with_hint("element capture requires a selector")
                })?;
                self.bridge.capture_element(tab, selector, format).await?
            }
        };

        self.mark_tab_used(envelope, tab);
        Ok(json!({
            "tabId": tab.0,
            "format": shot.format.cdp_name(),
            "width": shot.width,
            "height": shot.height,
            "dataBase64": BASE64_STANDARD.encode(&shot.bytes),
            "notes": shot.notes,
        }))
    }

    /// Tab resolution order: explicit handle, else the session's active tab.
    async fn resolve_tab(&self, envelope: &RpcEnvelope) -> Result<TabId, RelayError> {
        if let Some(tab) = envelope.tab_id {
            if !self.bridge.tab_exists(tab) {
                return Err(RelayError::new(RelayErrorKind::Validation)
                    .with_hint(format!("tab {} is gone", tab.0)));
            }
            return Ok(tab);
        }
        if let Some(session_id) = &envelope.session_id {
            if !self.registry.contains(session_id) {
                self.registry
                    .get_or_create_group(&self.host, session_id, &session_id.0)
                    .await?;
                // a lazily created session gets the same durable record as
                // an ensured one, so recovery can find it
                self.persist_session(session_id, &session_id.0);
            }
            return self
                .registry
                .resolve_target_tab(&self.host, session_id)
                .await;
        }
        Err(RelayError::new(RelayErrorKind::Validation)
            .with_hint("request needs a sessionId or tabId"))
    }

    fn mark_tab_used(&self, envelope: &RpcEnvelope, tab: TabId) {
        if let Some(session_id) = &envelope.session_id {
            self.registry.mark_active(session_id, tab);
            self.touch_store(session_id);
        }
    }

    fn touch_store(&self, session_id: &SessionId) {
        if let Err(err) = self.store.touch_activity(session_id, now_ms()) {
            debug!(target: "dispatch", %err, "failed to touch session activity");
        }
    }
}

fn require_session(envelope: &RpcEnvelope) -> Result<SessionId, RelayError> {
    envelope.session_id.clone().ok_or_else(|| {
        RelayError::new(RelayErrorKind::Validation).with_hint("sessionId is required")
    })
}

fn parse_format(format: Option<&str>, quality: Option<u8>) -> Result<ImageFormat, RelayError> {
    match format.unwrap_or("png") {
        "png" => Ok(ImageFormat::Png),
        "jpeg" | "jpg" => Ok(ImageFormat::Jpeg {
            quality: quality.unwrap_or(80),
        }),
        "webp" => Ok(ImageFormat::Webp {
            quality: quality.unwrap_or(80),
        }),
        other => Err(RelayError::new(RelayErrorKind::Validation)
            .with_hint(format!("unsupported image format {other:?}"))),
    }
}
