//! Persistent browser connection: state machine, keepalive and reconnect.
//!
//! A single supervisor task owns the connection lifecycle. It walks
//! `Disconnected -> Connecting -> Connected` (published on a watch channel),
//! runs the command/event loop while connected, and re-dials with
//! exponential backoff when the link dies. A heartbeat command is issued on
//! an interval; inbound silence longer than 1.5x that interval force-closes
//! the connection and re-enters the reconnect path. The same tick sweeps
//! pending calls whose deadline has passed.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::io::{AsyncBufReadExt, BufReader};
use futures::{future::BoxFuture, StreamExt};
use serde_json::Value;
use tabrelay_core_types::{RelayError, RelayErrorKind};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::pending::{PendingCalls, ResolveOutcome};

/// Connection lifecycle as observed by the rest of the bridge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Raw protocol event forwarded out of the loop.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Where a command is addressed: the browser target or one tab session.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), RelayError>;
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, RelayError>;
    fn link_state(&self) -> watch::Receiver<LinkState>;
    async fn shutdown(&self);
}

/// Reconnect delay schedule: floor, multiplicative growth, cap; reset to the
/// floor after every successful connection.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            base,
            factor,
            cap,
            current: None,
        }
    }

    /// Delay before the next attempt.
    pub fn next(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(prev) => {
                let grown = prev.as_secs_f64() * self.factor;
                Duration::from_secs_f64(grown).min(self.cap)
            }
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

struct ControlMessage {
    target: CommandTarget,
    method: String,
    params: Value,
    deadline: Duration,
    responder: oneshot::Sender<Result<Value, RelayError>>,
}

/// One decoded inbound frame: a correlated command reply or a protocol event.
enum WireFrame {
    Reply {
        id: CallId,
        payload: Result<Value, RelayError>,
    },
    Event(TransportEvent),
}

/// The slice of the connection the command loop needs. Split out so the loop
/// (and its silence/expiry handling) can be driven by a scripted wire in
/// tests.
#[async_trait]
trait BrowserWire: Send {
    fn submit(
        &mut self,
        method: MethodId,
        session: Option<CdpSessionId>,
        params: Value,
    ) -> Result<CallId, RelayError>;
    /// `Some(Err)` is a connection-level failure; `None` means closed.
    async fn recv(&mut self) -> Option<Result<WireFrame, RelayError>>;
}

struct LiveWire<'a> {
    conn: &'a mut Connection<CdpEventMessage>,
}

#[async_trait]
impl BrowserWire for LiveWire<'_> {
    fn submit(
        &mut self,
        method: MethodId,
        session: Option<CdpSessionId>,
        params: Value,
    ) -> Result<CallId, RelayError> {
        self.conn.submit_command(method, session, params).map_err(|err| {
            RelayError::new(RelayErrorKind::Connection)
                .with_hint(err.to_string())
                .retriable(true)
        })
    }

    async fn recv(&mut self) -> Option<Result<WireFrame, RelayError>> {
        loop {
            return match self.conn.next().await {
                Some(Ok(Message::Response(resp))) => Some(Ok(WireFrame::Reply {
                    id: resp.id,
                    payload: reply_payload(resp),
                })),
                Some(Ok(Message::Event(event))) => match decode_event(event) {
                    Some(event) => Some(Ok(WireFrame::Event(event))),
                    // undecodable event, already logged; keep reading
                    None => continue,
                },
                Some(Err(err)) => Some(Err(RelayError::new(RelayErrorKind::Connection)
                    .with_hint(err.to_string())
                    .retriable(true))),
                None => None,
            };
        }
    }
}

fn reply_payload(resp: Response) -> Result<Value, RelayError> {
    if let Some(result) = resp.result {
        Ok(result)
    } else if let Some(error) = resp.error {
        let retriable = error.code >= 500;
        Err(RelayError::new(RelayErrorKind::Connection)
            .with_hint(format!("cdp error {}: {}", error.code, error.message))
            .retriable(retriable))
    } else {
        Err(RelayError::new(RelayErrorKind::Internal).with_hint("empty cdp response"))
    }
}

fn decode_event(event: CdpEventMessage) -> Option<TransportEvent> {
    let raw: CdpJsonEventMessage = match event.try_into() {
        Ok(raw) => raw,
        Err(err) => {
            warn!(target: "cdp-transport", ?err, "failed to decode cdp event");
            return None;
        }
    };
    Some(TransportEvent {
        method: raw.method.into_owned(),
        params: raw.params,
        session_id: raw.session_id,
    })
}

struct BrowserLink {
    conn: Connection<CdpEventMessage>,
    child: Option<Child>,
}

type LinkFactory =
    Arc<dyn Fn(TransportConfig) -> BoxFuture<'static, Result<BrowserLink, RelayError>> + Send + Sync>;

pub struct ChromiumTransport {
    cfg: TransportConfig,
    command_tx: mpsc::Sender<ControlMessage>,
    command_rx: Mutex<Option<mpsc::Receiver<ControlMessage>>>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    events_tx: mpsc::Sender<TransportEvent>,
    state_tx: watch::Sender<LinkState>,
    state_rx: watch::Receiver<LinkState>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    factory: LinkFactory,
}

impl ChromiumTransport {
    pub fn new(cfg: TransportConfig) -> Self {
        let factory: LinkFactory = Arc::new(|cfg: TransportConfig| {
            Box::pin(async move { BrowserLink::dial(&cfg).await })
        });
        Self::with_factory(cfg, factory)
    }

    fn with_factory(cfg: TransportConfig, factory: LinkFactory) -> Self {
        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(512);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        Self {
            cfg,
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            events_rx: Mutex::new(events_rx),
            events_tx,
            state_tx,
            state_rx,
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
            factory,
        }
    }

    async fn supervise(
        cfg: TransportConfig,
        factory: LinkFactory,
        mut command_rx: mpsc::Receiver<ControlMessage>,
        events_tx: mpsc::Sender<TransportEvent>,
        state_tx: watch::Sender<LinkState>,
        shutdown: CancellationToken,
    ) {
        let mut backoff = Backoff::new(
            Duration::from_millis(cfg.backoff_base_ms),
            cfg.backoff_factor,
            Duration::from_millis(cfg.backoff_cap_ms),
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let _ = state_tx.send(LinkState::Connecting);

            match (factory)(cfg.clone()).await {
                Ok(mut link) => {
                    backoff.reset();
                    let _ = state_tx.send(LinkState::Connected);
                    info!(target: "cdp-transport", "browser connection established");

                    let exit = {
                        let mut wire = LiveWire {
                            conn: &mut link.conn,
                        };
                        Self::run_loop(&mut wire, &mut command_rx, &events_tx, &cfg, &shutdown)
                            .await
                    };
                    let _ = state_tx.send(LinkState::Disconnected);
                    link.teardown().await;

                    match exit {
                        LoopExit::Shutdown => break,
                        LoopExit::ConnectionLost(err) => {
                            warn!(target: "cdp-transport", %err, "connection lost");
                        }
                    }
                }
                Err(err) => {
                    let _ = state_tx.send(LinkState::Disconnected);
                    warn!(target: "cdp-transport", %err, "connect attempt failed");
                }
            }

            let delay = backoff.next();
            debug!(target: "cdp-transport", delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        let _ = state_tx.send(LinkState::Disconnected);
    }

    async fn run_loop<W: BrowserWire>(
        wire: &mut W,
        command_rx: &mut mpsc::Receiver<ControlMessage>,
        events_tx: &mpsc::Sender<TransportEvent>,
        cfg: &TransportConfig,
        shutdown: &CancellationToken,
    ) -> LoopExit {
        let mut pending: PendingCalls<CallId> = PendingCalls::new();
        let heartbeat_every = Duration::from_millis(cfg.heartbeat_interval_ms);
        // silence threshold: 1.5x the expected heartbeat cadence
        let silence_limit = heartbeat_every + heartbeat_every / 2;
        let mut heartbeat = interval(heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    pending.fail_all(
                        RelayError::new(RelayErrorKind::Connection).with_hint("transport shutdown"),
                    );
                    return LoopExit::Shutdown;
                }
                Some(cmd) = command_rx.recv() => {
                    if let Err(err) = Self::submit(wire, cmd, &mut pending) {
                        pending.fail_all(err.clone());
                        return LoopExit::ConnectionLost(err);
                    }
                }
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() > silence_limit {
                        let err = RelayError::new(RelayErrorKind::Connection)
                            .with_hint("no inbound traffic, connection presumed dead")
                            .retriable(true);
                        pending.fail_all(err.clone());
                        return LoopExit::ConnectionLost(err);
                    }
                    let expired = pending.expire(Instant::now());
                    if expired > 0 {
                        debug!(target: "cdp-transport", expired, "timed-out calls removed from the pending table");
                    }
                    // fire-and-forget keepalive; the reply refreshes last_inbound
                    let (tx, _rx) = oneshot::channel();
                    let probe = ControlMessage {
                        target: CommandTarget::Browser,
                        method: "Browser.getVersion".to_string(),
                        params: Value::Object(Default::default()),
                        deadline: heartbeat_every,
                        responder: tx,
                    };
                    if let Err(err) = Self::submit(wire, probe, &mut pending) {
                        pending.fail_all(err.clone());
                        return LoopExit::ConnectionLost(err);
                    }
                }
                frame = wire.recv() => {
                    match frame {
                        Some(Ok(WireFrame::Reply { id, payload })) => {
                            last_inbound = Instant::now();
                            match pending.resolve(&id, payload) {
                                ResolveOutcome::Delivered => {}
                                ResolveOutcome::Abandoned => {
                                    debug!(target: "cdp-transport", call_id = ?id, "late response discarded");
                                }
                                ResolveOutcome::Unmatched => {
                                    debug!(target: "cdp-transport", call_id = ?id, "unmatched response discarded");
                                }
                            }
                        }
                        Some(Ok(WireFrame::Event(event))) => {
                            last_inbound = Instant::now();
                            if events_tx.send(event).await.is_err() {
                                debug!(target: "cdp-transport", "event receiver dropped");
                            }
                        }
                        Some(Err(err)) => {
                            pending.fail_all(err.clone());
                            return LoopExit::ConnectionLost(err);
                        }
                        None => {
                            let err = RelayError::new(RelayErrorKind::Connection)
                                .with_hint("cdp connection closed")
                                .retriable(true);
                            pending.fail_all(err.clone());
                            return LoopExit::ConnectionLost(err);
                        }
                    }
                }
            }
        }
    }

    fn submit<W: BrowserWire>(
        wire: &mut W,
        cmd: ControlMessage,
        pending: &mut PendingCalls<CallId>,
    ) -> Result<(), RelayError> {
        let session = match cmd.target {
            CommandTarget::Browser => None,
            CommandTarget::Session(session_id) => Some(CdpSessionId::from(session_id)),
        };
        match wire.submit(cmd.method.into(), session, cmd.params) {
            Ok(call_id) => {
                pending.register(call_id, cmd.responder, Instant::now() + cmd.deadline);
                Ok(())
            }
            Err(err) => {
                let _ = cmd.responder.send(Err(err.clone()));
                Err(err)
            }
        }
    }
}

enum LoopExit {
    Shutdown,
    ConnectionLost(RelayError),
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), RelayError> {
        let mut guard = self.command_rx.lock().await;
        let command_rx = match guard.take() {
            Some(rx) => rx,
            None => return Ok(()), // already started
        };
        let task = tokio::spawn(Self::supervise(
            self.cfg.clone(),
            Arc::clone(&self.factory),
            command_rx,
            self.events_tx.clone(),
            self.state_tx.clone(),
            self.shutdown.clone(),
        ));
        *self.supervisor.lock().await = Some(task);
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, RelayError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            target,
            method: method.to_string(),
            params,
            deadline,
            responder: resp_tx,
        };

        self.command_tx.send(message).await.map_err(|err| {
            RelayError::new(RelayErrorKind::Connection)
                .with_hint(err.to_string())
                .retriable(true)
        })?;

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(RelayError::new(RelayErrorKind::Connection)
                .with_hint("command response channel closed")
                .retriable(true)),
            Err(_) => Err(RelayError::new(RelayErrorKind::Timeout)
                .with_hint(format!("{method} timed out after {}ms", deadline.as_millis()))),
        }
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.supervisor.lock().await.take() {
            let _ = task.await;
        }
    }
}

impl BrowserLink {
    /// Connect to a configured websocket url, or launch a local browser and
    /// scrape its DevTools url.
    async fn dial(cfg: &TransportConfig) -> Result<Self, RelayError> {
        let (child, ws_url) = if let Some(url) = cfg.websocket_url.clone() {
            (None, url)
        } else {
            let browser_cfg = Self::browser_config(cfg)?;
            Self::launch(browser_cfg).await?
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| {
                RelayError::new(RelayErrorKind::Connection)
                    .with_hint(err.to_string())
                    .retriable(true)
            })?;

        Ok(Self { conn, child })
    }

    async fn launch(config: BrowserConfig) -> Result<(Option<Child>, String), RelayError> {
        let mut child = config.launch().map_err(|err| {
            RelayError::new(RelayErrorKind::Connection)
                .with_hint(format!("failed to launch chromium: {err}"))
        })?;
        let ws_url = scrape_devtools_url(&mut child, Duration::from_secs(20)).await?;
        Ok((Some(child), ws_url))
    }

    fn browser_config(cfg: &TransportConfig) -> Result<BrowserConfig, RelayError> {
        let executable = cfg.resolve_executable().ok_or_else(|| {
            RelayError::new(RelayErrorKind::Connection)
                .with_hint("chrome/chromium executable not found; set TABRELAY_CHROME or --ws-url")
        })?;

        fs::create_dir_all(&cfg.user_data_dir).map_err(|err| {
            RelayError::new(RelayErrorKind::Internal)
                .with_hint(format!("failed to ensure user-data-dir: {err}"))
        })?;

        let mut builder = BrowserConfig::builder()
            .request_timeout(Duration::from_millis(cfg.default_deadline_ms))
            .launch_timeout(Duration::from_secs(20))
            .chrome_executable(executable)
            .user_data_dir(cfg.user_data_dir.clone());

        if !cfg.headless {
            builder = builder.with_head();
        }

        let mut args = vec![
            "--disable-background-networking",
            "--disable-background-timer-throttling",
            "--disable-default-apps",
            "--disable-hang-monitor",
            "--disable-popup-blocking",
            "--disable-prompt-on-repost",
            "--disable-sync",
            "--no-first-run",
            "--no-default-browser-check",
            "--remote-allow-origins=*",
        ];
        if cfg.headless {
            args.push("--headless=new");
            args.push("--hide-scrollbars");
            args.push("--mute-audio");
        }
        builder = builder.args(args);

        builder.build().map_err(|err| {
            RelayError::new(RelayErrorKind::Internal)
                .with_hint(format!("browser config error: {err}"))
        })
    }

    async fn teardown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                warn!(target: "cdp-transport", ?err, "failed to kill chromium child");
            }
        }
    }
}

/// A freshly launched browser announces its endpoint on stderr as a single
/// `ws://.../devtools/browser/<uuid>` token; everything else on that stream
/// is noise.
fn devtools_url_in(line: &str) -> Option<&str> {
    line.split_whitespace()
        .find(|token| token.starts_with("ws://") && token.contains("/devtools/browser/"))
}

async fn scrape_devtools_url(child: &mut Child, wait: Duration) -> Result<String, RelayError> {
    let stderr = child.stderr.take().ok_or_else(|| {
        RelayError::new(RelayErrorKind::Connection)
            .with_hint("launched browser has no stderr to announce its devtools url")
    })?;
    let mut lines = BufReader::new(stderr).lines();

    let scan = async {
        while let Some(line) = lines.next().await {
            let line = line.map_err(|err| {
                RelayError::new(RelayErrorKind::Connection)
                    .with_hint(format!("reading browser stderr failed: {err}"))
            })?;
            if let Some(url) = devtools_url_in(&line) {
                return Ok(url.to_string());
            }
        }
        Err(RelayError::new(RelayErrorKind::Connection)
            .with_hint("browser exited before announcing a devtools url"))
    };

    tokio::time::timeout(wait, scan).await.map_err(|_| {
        RelayError::new(RelayErrorKind::Connection)
            .with_hint("gave up waiting for the browser to announce its devtools url")
    })?
}
