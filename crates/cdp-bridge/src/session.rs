//! Per-tab debugging session lifecycle.
//!
//! Every tab has a gate (an async mutex) that serializes attach, detach and
//! refresh. `acquire` reuses a live attachment when one exists; otherwise it
//! attaches and schedules an idle auto-release. A generation counter guards
//! the release timer: refreshes and reattaches bump it, so a stale timer can
//! never tear down a newer attachment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tabrelay_core_types::{RelayError, RelayErrorKind, TabId};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

/// The two wire operations session management needs from the transport.
#[async_trait]
pub trait TabAttacher: Send + Sync {
    /// `Target.attachToTarget { flatten: true }`; returns the session id.
    async fn attach(&self, target_id: &str) -> Result<String, RelayError>;
    /// `Target.detachFromTarget` for the given session.
    async fn detach(&self, session_id: &str) -> Result<(), RelayError>;
}

#[derive(Debug, Default)]
struct SlotState {
    session_id: Option<String>,
    generation: u64,
    last_used: Option<Instant>,
}

#[derive(Debug, Default)]
struct TabSlot {
    gate: Mutex<SlotState>,
}

pub struct CdpSessionManager {
    attacher: Arc<dyn TabAttacher>,
    slots: DashMap<TabId, Arc<TabSlot>>,
    attach_idle: Duration,
    reattach_settle: Duration,
}

impl CdpSessionManager {
    pub fn new(
        attacher: Arc<dyn TabAttacher>,
        attach_idle: Duration,
        reattach_settle: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            attacher,
            slots: DashMap::new(),
            attach_idle,
            reattach_settle,
        })
    }

    fn slot(&self, tab: TabId) -> Arc<TabSlot> {
        self.slots
            .entry(tab)
            .or_insert_with(|| Arc::new(TabSlot::default()))
            .clone()
    }

    /// Attach (or reuse) the debugging session for a tab, waiting for any
    /// in-flight operation on the same tab.
    pub async fn acquire(self: &Arc<Self>, tab: TabId, target_id: &str) -> Result<String, RelayError> {
        let slot = self.slot(tab);
        let mut state = slot.gate.lock().await;
        self.acquire_locked(tab, target_id, &mut state).await
    }

    /// Like `acquire`, but fails with `Busy` instead of queueing behind an
    /// operation already holding the tab.
    pub async fn try_acquire(
        self: &Arc<Self>,
        tab: TabId,
        target_id: &str,
    ) -> Result<String, RelayError> {
        let slot = self.slot(tab);
        let mut state = slot.gate.try_lock().map_err(|_| {
            RelayError::new(RelayErrorKind::Busy)
                .with_hint("tab is busy with another operation")
                .retriable(true)
        })?;
        self.acquire_locked(tab, target_id, &mut state).await
    }

    async fn acquire_locked(
        self: &Arc<Self>,
        tab: TabId,
        target_id: &str,
        state: &mut SlotState,
    ) -> Result<String, RelayError> {
        if let Some(session_id) = &state.session_id {
            state.last_used = Some(Instant::now());
            return Ok(session_id.clone());
        }

        let session_id = self.attacher.attach(target_id).await?;
        state.generation += 1;
        state.session_id = Some(session_id.clone());
        state.last_used = Some(Instant::now());
        self.schedule_auto_release(tab, state.generation);
        debug!(target: "cdp-session", tab = tab.0, %session_id, "attached");
        Ok(session_id)
    }

    /// Detach and forget the tab's session. No-op when nothing is attached.
    pub async fn release(&self, tab: TabId) {
        let slot = self.slot(tab);
        let mut state = slot.gate.lock().await;
        self.release_locked(tab, &mut state).await;
    }

    async fn release_locked(&self, tab: TabId, state: &mut SlotState) {
        let Some(session_id) = state.session_id.take() else {
            return;
        };
        state.generation += 1;
        state.last_used = None;
        if let Err(err) = self.attacher.detach(&session_id).await {
            // the session may already be gone with the tab; state is cleared
            // either way
            warn!(target: "cdp-session", tab = tab.0, %err, "detach failed");
        } else {
            debug!(target: "cdp-session", tab = tab.0, %session_id, "released");
        }
    }

    /// Force a fresh attachment: detach, settle, attach, settle. The tab's
    /// gate is held for the whole cycle so nothing interleaves.
    pub async fn reattach(self: &Arc<Self>, tab: TabId, target_id: &str) -> Result<String, RelayError> {
        let slot = self.slot(tab);
        let mut state = slot.gate.lock().await;

        self.release_locked(tab, &mut state).await;
        sleep(self.reattach_settle).await;
        let session_id = self.acquire_locked(tab, target_id, &mut state).await?;
        sleep(self.reattach_settle).await;
        Ok(session_id)
    }

    pub async fn is_attached(&self, tab: TabId) -> bool {
        match self.slots.get(&tab) {
            Some(slot) => {
                let slot = slot.clone();
                let state = slot.gate.lock().await;
                state.session_id.is_some()
            }
            None => false,
        }
    }

    /// Drop all local session state without detaching; used when the browser
    /// connection is lost and every session id is already invalid.
    pub async fn invalidate_all(&self) {
        for entry in self.slots.iter() {
            let slot = entry.value().clone();
            let mut state = slot.gate.lock().await;
            state.session_id = None;
            state.generation += 1;
            state.last_used = None;
        }
    }

    fn schedule_auto_release(self: &Arc<Self>, tab: TabId, generation: u64) {
        let manager = Arc::downgrade(self);
        let idle = self.attach_idle;
        tokio::spawn(async move {
            let mut wait = idle;
            loop {
                sleep(wait).await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let Some(slot) = manager.slots.get(&tab).map(|s| s.clone()) else {
                    return;
                };
                let mut state = slot.gate.lock().await;
                if state.generation != generation || state.session_id.is_none() {
                    return;
                }
                let elapsed = state
                    .last_used
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= idle {
                    debug!(target: "cdp-session", tab = tab.0, "idle auto-release");
                    manager.release_locked(tab, &mut state).await;
                    return;
                }
                wait = idle - elapsed;
            }
        });
    }
}
