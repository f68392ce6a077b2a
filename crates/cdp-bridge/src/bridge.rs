//! High-level tab operations over the persistent connection.
//!
//! `CdpBridge` ties the pieces together: the transport supplies a command
//! channel and raw events, the target index names tabs, and the session
//! manager scopes tab-level commands to a debugging session. A broadcast
//! channel publishes tab lifecycle changes so callers can prune their own
//! bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tabrelay_core_types::{RelayError, RelayErrorKind, TabId};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::capture::{plan_capture, CaptureMode, ImageFormat, PageGeometry, Rect};
use crate::config::BridgeConfig;
use crate::session::{CdpSessionManager, TabAttacher};
use crate::targets::TargetIndex;
use crate::transport::{CdpTransport, CommandTarget, LinkState, TransportEvent};

/// Tab lifecycle change observed from browser events.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TabEvent {
    Created(TabId),
    Closed(TabId),
}

/// A finished screenshot.
#[derive(Clone, Debug)]
pub struct CaptureResult {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub notes: Vec<String>,
}

struct TransportAttacher {
    transport: Arc<dyn CdpTransport>,
    deadline: Duration,
}

#[async_trait]
impl TabAttacher for TransportAttacher {
    async fn attach(&self, target_id: &str) -> Result<String, RelayError> {
        let result = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                self.deadline,
            )
            .await?;
        result["sessionId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                RelayError::new(RelayErrorKind::Internal)
                    .with_hint("attachToTarget returned no sessionId")
            })
    }

    async fn detach(&self, session_id: &str) -> Result<(), RelayError> {
        self.transport
            .send_command(
                CommandTarget::Browser,
                "Target.detachFromTarget",
                json!({ "sessionId": session_id }),
                self.deadline,
            )
            .await
            .map(|_| ())
    }
}

pub struct CdpBridge {
    transport: Arc<dyn CdpTransport>,
    targets: Arc<TargetIndex>,
    sessions: Arc<CdpSessionManager>,
    cfg: BridgeConfig,
    deadline: Duration,
    tab_events: broadcast::Sender<TabEvent>,
}

impl CdpBridge {
    pub fn new(transport: Arc<dyn CdpTransport>, cfg: BridgeConfig) -> Arc<Self> {
        let deadline = Duration::from_millis(cfg.transport.default_deadline_ms);
        let attacher = Arc::new(TransportAttacher {
            transport: transport.clone(),
            deadline,
        });
        let sessions = CdpSessionManager::new(
            attacher,
            Duration::from_millis(cfg.attach_idle_ms),
            Duration::from_millis(cfg.reattach_settle_ms),
        );
        let (tab_events, _) = broadcast::channel(64);

        let bridge = Arc::new(Self {
            transport,
            targets: Arc::new(TargetIndex::new()),
            sessions,
            cfg,
            deadline,
            tab_events,
        });
        bridge.spawn_event_pump();
        bridge.spawn_link_watcher();
        bridge
    }

    pub async fn start(&self) -> Result<(), RelayError> {
        self.transport.start().await
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.transport.link_state()
    }

    pub fn subscribe_tab_events(&self) -> broadcast::Receiver<TabEvent> {
        self.tab_events.subscribe()
    }

    pub fn tab_count(&self) -> usize {
        self.targets.len()
    }

    /// Open a new page and hand back its relay handle.
    pub async fn create_tab(&self, url: &str) -> Result<TabId, RelayError> {
        let result = self
            .browser_command("Target.createTarget", json!({ "url": url }))
            .await?;
        let target_id = result["targetId"].as_str().ok_or_else(|| {
            RelayError::new(RelayErrorKind::Internal).with_hint("createTarget returned no targetId")
        })?;
        let tab = self.targets.register(target_id);
        info!(target: "cdp-bridge", tab = tab.0, %url, "tab created");
        Ok(tab)
    }

    pub async fn close_tab(&self, tab: TabId) -> Result<(), RelayError> {
        let target_id = self.target_for(tab)?;
        self.sessions.release(tab).await;
        self.browser_command("Target.closeTarget", json!({ "targetId": target_id }))
            .await?;
        self.targets.remove_target(&target_id);
        Ok(())
    }

    pub fn tab_exists(&self, tab: TabId) -> bool {
        self.targets.contains(tab)
    }

    pub async fn navigate(&self, tab: TabId, url: &str) -> Result<(), RelayError> {
        let (session_id, _) = self.tab_session(tab).await?;
        let result = self
            .session_command(&session_id, "Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(error_text) = result["errorText"].as_str() {
            return Err(RelayError::new(RelayErrorKind::Validation)
                .with_hint(format!("navigation failed: {error_text}")));
        }
        Ok(())
    }

    /// Evaluate an expression in the tab, returning its JSON value.
    pub async fn evaluate(&self, tab: TabId, expression: &str) -> Result<Value, RelayError> {
        let (session_id, _) = self.tab_session(tab).await?;
        self.evaluate_in(&session_id, expression).await
    }

    pub async fn reattach(&self, tab: TabId) -> Result<(), RelayError> {
        let target_id = self.target_for(tab)?;
        self.sessions.reattach(tab, &target_id).await?;
        Ok(())
    }

    /// Screenshot the first element matching a CSS selector. The clip is
    /// page-absolute, so the element does not need to be scrolled into view.
    pub async fn capture_element(
        &self,
        tab: TabId,
        selector: &str,
        format: ImageFormat,
    ) -> Result<CaptureResult, RelayError> {
        let (session_id, _) = self.tab_session(tab).await?;
        let rect = self.resolve_selector_rect(&session_id, selector).await?;
        self.capture_attached(tab, &session_id, CaptureMode::Element { rect }, format)
            .await
    }

    async fn resolve_selector_rect(
        &self,
        session_id: &str,
        selector: &str,
    ) -> Result<Rect, RelayError> {
        let quoted = serde_json::to_string(selector).map_err(|err| {
            RelayError::new(RelayErrorKind::Validation).with_hint(err.to_string())
        })?;
        let expression = format!(
            "(() => {{ const el = document.querySelector({quoted}); if (!el) return null; \
             const r = el.getBoundingClientRect(); \
             return {{ x: r.x + window.scrollX, y: r.y + window.scrollY, \
             width: r.width, height: r.height }}; }})()"
        );
        let value = self.evaluate_in(session_id, &expression).await?;
        if value.is_null() {
            return Err(RelayError::new(RelayErrorKind::Validation)
                .with_hint(format!("no element matches selector {selector:?}")));
        }
        let rect: Rect = serde_json::from_value(value).map_err(|err| {
            RelayError::new(RelayErrorKind::Internal)
                .with_hint(format!("bad element rect: {err}"))
        })?;
        if rect.width <= 0.0 || rect.height <= 0.0 {
            return Err(RelayError::new(RelayErrorKind::Validation)
                .with_hint(format!("element {selector:?} has no visible box")));
        }
        Ok(rect)
    }

    /// Take a screenshot of the tab in the requested mode.
    pub async fn capture(
        &self,
        tab: TabId,
        mode: CaptureMode,
        format: ImageFormat,
    ) -> Result<CaptureResult, RelayError> {
        let (session_id, _) = self.tab_session(tab).await?;
        self.capture_attached(tab, &session_id, mode, format).await
    }

    async fn capture_attached(
        &self,
        tab: TabId,
        session_id: &str,
        mode: CaptureMode,
        format: ImageFormat,
    ) -> Result<CaptureResult, RelayError> {
        let geometry = self.page_geometry(session_id).await?;
        let plan = plan_capture(
            &mode,
            geometry,
            format,
            self.cfg.capture_max_dimension,
            self.cfg.capture_fullpage_viewport_cap,
        );
        for note in &plan.notes {
            warn!(target: "cdp-bridge", tab = tab.0, note = %note, "capture adjusted");
        }

        let result = self
            .session_command(session_id, "Page.captureScreenshot", plan.to_params())
            .await?;
        let encoded = result["data"].as_str().ok_or_else(|| {
            RelayError::new(RelayErrorKind::Internal)
                .with_hint("captureScreenshot returned no data")
        })?;
        let bytes = BASE64_STANDARD.decode(encoded).map_err(|err| {
            RelayError::new(RelayErrorKind::Internal)
                .with_hint(format!("screenshot payload was not base64: {err}"))
        })?;

        let (width, height) = plan.pixel_size();
        Ok(CaptureResult {
            bytes,
            width,
            height,
            format,
            notes: plan.notes,
        })
    }

    async fn page_geometry(&self, session_id: &str) -> Result<PageGeometry, RelayError> {
        let metrics = self
            .session_command(session_id, "Page.getLayoutMetrics", json!({}))
            .await?;
        let viewport = (
            metrics["cssVisualViewport"]["clientWidth"]
                .as_f64()
                .unwrap_or(0.0),
            metrics["cssVisualViewport"]["clientHeight"]
                .as_f64()
                .unwrap_or(0.0),
        );
        let content = (
            metrics["cssContentSize"]["width"].as_f64().unwrap_or(0.0),
            metrics["cssContentSize"]["height"].as_f64().unwrap_or(0.0),
        );
        // pageX/pageY place the visual viewport within the document
        let scroll = (
            metrics["cssVisualViewport"]["pageX"].as_f64().unwrap_or(0.0),
            metrics["cssVisualViewport"]["pageY"].as_f64().unwrap_or(0.0),
        );

        let dpr = self
            .evaluate_in(session_id, "window.devicePixelRatio")
            .await?
            .as_f64()
            .filter(|v| *v > 0.0)
            .unwrap_or(1.0);

        Ok(PageGeometry {
            viewport,
            content,
            scroll,
            dpr,
        })
    }

    async fn evaluate_in(&self, session_id: &str, expression: &str) -> Result<Value, RelayError> {
        let result = self
            .session_command(
                session_id,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("script threw");
            return Err(RelayError::new(RelayErrorKind::Validation)
                .with_hint(format!("evaluate failed: {text}")));
        }
        Ok(result["result"]["value"].clone())
    }

    async fn tab_session(&self, tab: TabId) -> Result<(String, String), RelayError> {
        let target_id = self.target_for(tab)?;
        let session_id = self.sessions.acquire(tab, &target_id).await?;
        Ok((session_id, target_id))
    }

    fn target_for(&self, tab: TabId) -> Result<String, RelayError> {
        self.targets.target_for(tab).ok_or_else(|| {
            RelayError::new(RelayErrorKind::Validation)
                .with_hint(format!("unknown tab handle {}", tab.0))
        })
    }

    async fn browser_command(&self, method: &str, params: Value) -> Result<Value, RelayError> {
        self.transport
            .send_command(CommandTarget::Browser, method, params, self.deadline)
            .await
    }

    async fn session_command(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RelayError> {
        self.transport
            .send_command(
                CommandTarget::Session(session_id.to_string()),
                method,
                params,
                self.deadline,
            )
            .await
    }

    fn spawn_event_pump(self: &Arc<Self>) {
        let bridge = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(strong) = bridge.upgrade() else { return };
                let Some(event) = strong.transport.next_event().await else {
                    return;
                };
                strong.handle_event(event);
            }
        });
    }

    fn handle_event(&self, event: TransportEvent) {
        match event.method.as_str() {
            "Target.targetCreated" => {
                let info = &event.params["targetInfo"];
                if info["type"].as_str() != Some("page") {
                    return;
                }
                if let Some(target_id) = info["targetId"].as_str() {
                    let tab = self.targets.register(target_id);
                    let _ = self.tab_events.send(TabEvent::Created(tab));
                }
            }
            "Target.targetDestroyed" => {
                if let Some(target_id) = event.params["targetId"].as_str() {
                    if let Some(tab) = self.targets.remove_target(target_id) {
                        debug!(target: "cdp-bridge", tab = tab.0, "tab destroyed");
                        let _ = self.tab_events.send(TabEvent::Closed(tab));
                    }
                }
            }
            _ => {}
        }
    }

    fn spawn_link_watcher(self: &Arc<Self>) {
        let bridge = Arc::downgrade(self);
        let mut state_rx = self.transport.link_state();
        tokio::spawn(async move {
            loop {
                if state_rx.changed().await.is_err() {
                    return;
                }
                let state = *state_rx.borrow();
                let Some(strong) = bridge.upgrade() else { return };
                match state {
                    LinkState::Connected => {
                        if let Err(err) = strong
                            .browser_command(
                                "Target.setDiscoverTargets",
                                json!({ "discover": true }),
                            )
                            .await
                        {
                            warn!(target: "cdp-bridge", %err, "failed to enable target discovery");
                        }
                        // attach is explicit via the session manager
                        if let Err(err) = strong
                            .browser_command(
                                "Target.setAutoAttach",
                                json!({
                                    "autoAttach": false,
                                    "waitForDebuggerOnStart": false,
                                    "flatten": true,
                                }),
                            )
                            .await
                        {
                            warn!(target: "cdp-bridge", %err, "failed to disable auto-attach");
                        }
                    }
                    LinkState::Disconnected => {
                        // every session id died with the connection
                        strong.sessions.invalidate_all().await;
                    }
                    LinkState::Connecting => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    type Handler = Box<dyn Fn(&str, &Value) -> Result<Value, RelayError> + Send + Sync>;

    struct StubTransport {
        handler: Handler,
        calls: StdMutex<VecDeque<(String, Value)>>,
        events_tx: mpsc::Sender<TransportEvent>,
        events_rx: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
        state_rx: watch::Receiver<LinkState>,
        _state_tx: watch::Sender<LinkState>,
    }

    impl StubTransport {
        fn new(handler: Handler) -> Arc<Self> {
            let (events_tx, events_rx) = mpsc::channel(16);
            let (state_tx, state_rx) = watch::channel(LinkState::Connected);
            Arc::new(Self {
                handler,
                calls: StdMutex::new(VecDeque::new()),
                events_tx,
                events_rx: tokio::sync::Mutex::new(events_rx),
                state_rx,
                _state_tx: state_tx,
            })
        }

        async fn inject(&self, method: &str, params: Value, session_id: Option<&str>) {
            self.events_tx
                .send(TransportEvent {
                    method: method.to_string(),
                    params,
                    session_id: session_id.map(str::to_string),
                })
                .await
                .unwrap();
        }
    }

    #[async_trait]
    impl CdpTransport for StubTransport {
        async fn start(&self) -> Result<(), RelayError> {
            Ok(())
        }

        async fn next_event(&self) -> Option<TransportEvent> {
            self.events_rx.lock().await.recv().await
        }

        async fn send_command(
            &self,
            _target: CommandTarget,
            method: &str,
            params: Value,
            _deadline: Duration,
        ) -> Result<Value, RelayError> {
            self.calls
                .lock()
                .unwrap()
                .push_back((method.to_string(), params.clone()));
            (self.handler)(method, &params)
        }

        fn link_state(&self) -> watch::Receiver<LinkState> {
            self.state_rx.clone()
        }

        async fn shutdown(&self) {}
    }

    fn canned_handler() -> Handler {
        Box::new(|method, params| match method {
            "Target.createTarget" => Ok(json!({ "targetId": "TARGET-1" })),
            "Target.attachToTarget" => Ok(json!({ "sessionId": "SESSION-1" })),
            "Target.detachFromTarget" | "Target.closeTarget" | "Target.setDiscoverTargets" => {
                Ok(json!({}))
            }
            "Page.navigate" => Ok(json!({ "frameId": "FRAME-1" })),
            "Page.getLayoutMetrics" => Ok(json!({
                "cssVisualViewport": {
                    "clientWidth": 1280.0, "clientHeight": 800.0,
                    "pageX": 0.0, "pageY": 150.0,
                },
                "cssContentSize": { "width": 1280.0, "height": 3000.0 },
            })),
            "Runtime.evaluate" => {
                let expr = params["expression"].as_str().unwrap_or_default();
                if expr == "window.devicePixelRatio" {
                    Ok(json!({ "result": { "value": 2.0 } }))
                } else if expr.contains("querySelector") {
                    if expr.contains("#missing") {
                        Ok(json!({ "result": { "value": null } }))
                    } else {
                        Ok(json!({ "result": { "value": {
                            "x": 10.0, "y": 20.0, "width": 300.0, "height": 150.0,
                        } } }))
                    }
                } else if expr.contains("boom") {
                    Ok(json!({ "exceptionDetails": { "text": "ReferenceError: boom" } }))
                } else {
                    Ok(json!({ "result": { "value": 42 } }))
                }
            }
            "Page.captureScreenshot" => {
                Ok(json!({ "data": BASE64_STANDARD.encode(b"not-a-real-png") }))
            }
            other => Err(RelayError::new(RelayErrorKind::Internal)
                .with_hint(format!("unexpected method {other}"))),
        })
    }

    #[tokio::test]
    async fn create_tab_registers_a_handle() {
        let transport = StubTransport::new(canned_handler());
        let bridge = CdpBridge::new(transport.clone(), BridgeConfig::default());

        let tab = bridge.create_tab("about:blank").await.unwrap();
        assert!(bridge.tab_exists(tab));
        assert_eq!(bridge.tab_count(), 1);
    }

    #[tokio::test]
    async fn destroyed_target_prunes_and_broadcasts() {
        let transport = StubTransport::new(canned_handler());
        let bridge = CdpBridge::new(transport.clone(), BridgeConfig::default());
        let mut events = bridge.subscribe_tab_events();

        let tab = bridge.create_tab("about:blank").await.unwrap();
        transport
            .inject(
                "Target.targetDestroyed",
                json!({ "targetId": "TARGET-1" }),
                None,
            )
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(event, TabEvent::Closed(tab));
        assert!(!bridge.tab_exists(tab));
    }

    #[tokio::test]
    async fn evaluate_returns_value_and_maps_exceptions() {
        let transport = StubTransport::new(canned_handler());
        let bridge = CdpBridge::new(transport.clone(), BridgeConfig::default());
        let tab = bridge.create_tab("about:blank").await.unwrap();

        let value = bridge.evaluate(tab, "6 * 7").await.unwrap();
        assert_eq!(value, json!(42));

        let err = bridge.evaluate(tab, "boom()").await.unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::Validation);
        assert!(err.hint.as_deref().unwrap_or_default().contains("boom"));
    }

    #[tokio::test]
    async fn capture_decodes_payload_and_reports_dimensions() {
        let transport = StubTransport::new(canned_handler());
        let bridge = CdpBridge::new(transport.clone(), BridgeConfig::default());
        let tab = bridge.create_tab("about:blank").await.unwrap();

        let shot = bridge
            .capture(tab, CaptureMode::Viewport, ImageFormat::Png)
            .await
            .unwrap();
        assert_eq!(shot.bytes, b"not-a-real-png");
        // 1280x800 css at dpr 2
        assert_eq!((shot.width, shot.height), (2_560, 1_600));
        assert!(shot.notes.is_empty());
    }

    #[tokio::test]
    async fn viewport_capture_clips_at_the_scroll_offset() {
        let transport = StubTransport::new(canned_handler());
        let bridge = CdpBridge::new(transport.clone(), BridgeConfig::default());
        let tab = bridge.create_tab("about:blank").await.unwrap();

        bridge
            .capture(tab, CaptureMode::Viewport, ImageFormat::Png)
            .await
            .unwrap();

        let calls = transport.calls.lock().unwrap();
        let (_, params) = calls
            .iter()
            .find(|(method, _)| method == "Page.captureScreenshot")
            .expect("captureScreenshot was issued");
        // the canned layout metrics report a page scrolled to y=150
        assert_eq!(params["clip"]["x"], 0.0);
        assert_eq!(params["clip"]["y"], 150.0);
        assert_eq!(params["captureBeyondViewport"], false);
    }

    #[tokio::test]
    async fn element_capture_uses_the_resolved_rect() {
        let transport = StubTransport::new(canned_handler());
        let bridge = CdpBridge::new(transport.clone(), BridgeConfig::default());
        let tab = bridge.create_tab("about:blank").await.unwrap();

        let shot = bridge
            .capture_element(tab, "#hero", ImageFormat::Png)
            .await
            .unwrap();
        // 300x150 css at dpr 2
        assert_eq!((shot.width, shot.height), (600, 300));

        let err = bridge
            .capture_element(tab, "#missing", ImageFormat::Png)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::Validation);
    }

    #[tokio::test]
    async fn navigate_surfaces_error_text() {
        let transport = StubTransport::new(Box::new(|method, _| match method {
            "Target.createTarget" => Ok(json!({ "targetId": "TARGET-1" })),
            "Target.attachToTarget" => Ok(json!({ "sessionId": "SESSION-1" })),
            "Page.navigate" => Ok(json!({ "errorText": "net::ERR_NAME_NOT_RESOLVED" })),
            _ => Ok(json!({})),
        }));
        let bridge = CdpBridge::new(transport, BridgeConfig::default());
        let tab = bridge.create_tab("about:blank").await.unwrap();

        let err = bridge.navigate(tab, "https://no-such-host.invalid").await.unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::Validation);
    }

    #[tokio::test]
    async fn unknown_tab_is_a_validation_error() {
        let transport = StubTransport::new(canned_handler());
        let bridge = CdpBridge::new(transport, BridgeConfig::default());

        let err = bridge.navigate(TabId(99), "about:blank").await.unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::Validation);
    }
}
