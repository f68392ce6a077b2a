//! Session-to-tab-group registry.
//!
//! Maps external session identifiers to groups of managed tabs. Groups are
//! created lazily on first use, validated against the browser on reuse
//! (handles go stale across browser restarts), pruned when tabs close and
//! swept when idle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tabrelay_core_types::{RelayError, RelayErrorKind, SessionId, SessionState, TabId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fixed palette cycled deterministically across group creations.
pub const GROUP_PALETTE: [&str; 8] = [
    "grey", "blue", "red", "yellow", "green", "pink", "purple", "cyan",
];

/// Seam to the browser side: tab allocation, existence probes, closure.
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn create_tab(&self, url: &str) -> Result<TabId, RelayError>;
    async fn tab_exists(&self, tab: TabId) -> bool;
    async fn close_tab(&self, tab: TabId) -> Result<(), RelayError>;
}

/// One session's group of tabs.
#[derive(Clone, Debug)]
pub struct TabGroup {
    pub session_id: SessionId,
    pub label: String,
    pub color: &'static str,
    pub tab_ids: Vec<TabId>,
    pub active_tab: Option<TabId>,
    pub state: SessionState,
    last_activity: Instant,
}

/// Serializable view for health reporting.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub session_id: SessionId,
    pub label: String,
    pub color: &'static str,
    pub tab_count: usize,
    pub state: SessionState,
    pub idle_seconds: u64,
}

pub struct SessionRegistry {
    groups: DashMap<SessionId, TabGroup>,
    // serializes create/validate per session so concurrent first uses do not
    // both allocate a tab
    creation_locks: DashMap<SessionId, Arc<Mutex<()>>>,
    created: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
            creation_locks: DashMap::new(),
            created: AtomicU64::new(0),
        }
    }

    fn creation_lock(&self, session: &SessionId) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(session.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Look up the group for `session_id`, validating that its tabs still
    /// exist; stale records are discarded and a fresh group is created with
    /// a new tab and the next palette color.
    pub async fn get_or_create_group(
        &self,
        host: &dyn TabHost,
        session_id: &SessionId,
        label: &str,
    ) -> Result<TabGroup, RelayError> {
        let lock = self.creation_lock(session_id);
        let _guard = lock.lock().await;

        if let Some(group) = self.groups.get(session_id).map(|g| g.clone()) {
            let mut live = Vec::with_capacity(group.tab_ids.len());
            for tab in &group.tab_ids {
                if host.tab_exists(*tab).await {
                    live.push(*tab);
                }
            }
            if !live.is_empty() {
                if let Some(mut entry) = self.groups.get_mut(session_id) {
                    entry.tab_ids = live.clone();
                    if entry.active_tab.map(|t| !live.contains(&t)).unwrap_or(true) {
                        entry.active_tab = live.first().copied();
                    }
                    entry.last_activity = Instant::now();
                    return Ok(entry.clone());
                }
            }
            warn!(
                target: "tab-registry",
                session = %session_id,
                "group handle stale, discarding and recreating"
            );
            self.groups.remove(session_id);
        }

        let tab = host.create_tab("about:blank").await?;
        let ordinal = self.created.fetch_add(1, Ordering::Relaxed) as usize;
        let group = TabGroup {
            session_id: session_id.clone(),
            label: label.to_string(),
            color: GROUP_PALETTE[ordinal % GROUP_PALETTE.len()],
            tab_ids: vec![tab],
            active_tab: Some(tab),
            state: SessionState::Active,
            last_activity: Instant::now(),
        };
        info!(
            target: "tab-registry",
            session = %session_id,
            %tab,
            color = group.color,
            "tab group created"
        );
        self.groups.insert(session_id.clone(), group.clone());
        Ok(group)
    }

    /// Pick the tab a command should run against: the active tab, else the
    /// first tracked tab, else a freshly allocated one.
    pub async fn resolve_target_tab(
        &self,
        host: &dyn TabHost,
        session_id: &SessionId,
    ) -> Result<TabId, RelayError> {
        {
            let mut entry = self.groups.get_mut(session_id).ok_or_else(|| {
                RelayError::new(RelayErrorKind::Validation)
                    .with_hint(format!("no tab group for session {session_id}"))
            })?;
            entry.last_activity = Instant::now();
            if let Some(active) = entry.active_tab {
                if entry.tab_ids.contains(&active) {
                    return Ok(active);
                }
            }
            if let Some(first) = entry.tab_ids.first().copied() {
                entry.active_tab = Some(first);
                return Ok(first);
            }
        }

        // group exists but is empty; allocate outside the map reference
        let tab = host.create_tab("about:blank").await?;
        let mut entry = self.groups.get_mut(session_id).ok_or_else(|| {
            RelayError::new(RelayErrorKind::Validation)
                .with_hint(format!("tab group vanished for session {session_id}"))
        })?;
        entry.tab_ids.push(tab);
        entry.active_tab = Some(tab);
        Ok(tab)
    }

    /// Track a tab that a handler opened into the session's group.
    pub fn track_tab(&self, session_id: &SessionId, tab: TabId) {
        if let Some(mut entry) = self.groups.get_mut(session_id) {
            if !entry.tab_ids.contains(&tab) {
                entry.tab_ids.push(tab);
            }
            entry.last_activity = Instant::now();
        }
    }

    pub fn mark_active(&self, session_id: &SessionId, tab: TabId) {
        if let Some(mut entry) = self.groups.get_mut(session_id) {
            if entry.tab_ids.contains(&tab) {
                entry.active_tab = Some(tab);
            }
            entry.last_activity = Instant::now();
        }
    }

    pub fn touch(&self, session_id: &SessionId) {
        if let Some(mut entry) = self.groups.get_mut(session_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Tab-closure notification: prune the tab everywhere; a group losing its
    /// last tab is deleted immediately instead of waiting for the idle sweep.
    pub fn note_tab_closed(&self, tab: TabId) {
        let mut emptied = Vec::new();
        for mut entry in self.groups.iter_mut() {
            entry.tab_ids.retain(|t| *t != tab);
            if entry.active_tab == Some(tab) {
                entry.active_tab = entry.tab_ids.first().copied();
            }
            if entry.tab_ids.is_empty() {
                emptied.push(entry.session_id.clone());
            }
        }
        for session in emptied {
            debug!(target: "tab-registry", %session, "last tab closed, dropping group");
            self.groups.remove(&session);
            self.creation_locks.remove(&session);
        }
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.groups.contains_key(session_id)
    }

    pub fn group(&self, session_id: &SessionId) -> Option<TabGroup> {
        self.groups.get(session_id).map(|g| g.clone())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn summaries(&self) -> Vec<GroupSummary> {
        self.groups
            .iter()
            .map(|entry| GroupSummary {
                session_id: entry.session_id.clone(),
                label: entry.label.clone(),
                color: entry.color,
                tab_count: entry.tab_ids.len(),
                state: entry.state,
                idle_seconds: entry.last_activity.elapsed().as_secs(),
            })
            .collect()
    }

    /// Close and drop groups idle for longer than `idle`. Returns the number
    /// of groups removed.
    pub async fn sweep_idle(&self, host: &dyn TabHost, idle: Duration) -> usize {
        let stale: Vec<(SessionId, Vec<TabId>)> = self
            .groups
            .iter()
            .filter(|entry| entry.last_activity.elapsed() > idle)
            .map(|entry| (entry.session_id.clone(), entry.tab_ids.clone()))
            .collect();

        let mut removed = 0;
        for (session, tabs) in stale {
            if self.groups.remove(&session).is_some() {
                removed += 1;
                self.creation_locks.remove(&session);
                info!(target: "tab-registry", %session, tabs = tabs.len(), "idle group swept");
                for tab in tabs {
                    if let Err(err) = host.close_tab(tab).await {
                        warn!(target: "tab-registry", %tab, ?err, "failed to close swept tab");
                    }
                }
            }
        }
        removed
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::Mutex as AsyncMutex;

    /// In-memory tab host tracking which tabs are alive.
    struct FakeHost {
        next: AtomicU64,
        alive: AsyncMutex<HashSet<u64>>,
    }

    impl FakeHost {
        fn new() -> Self {
            Self {
                next: AtomicU64::new(1),
                alive: AsyncMutex::new(HashSet::new()),
            }
        }

        async fn kill(&self, tab: TabId) {
            self.alive.lock().await.remove(&tab.0);
        }
    }

    #[async_trait]
    impl TabHost for FakeHost {
        async fn create_tab(&self, _url: &str) -> Result<TabId, RelayError> {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            self.alive.lock().await.insert(id);
            Ok(TabId(id))
        }

        async fn tab_exists(&self, tab: TabId) -> bool {
            self.alive.lock().await.contains(&tab.0)
        }

        async fn close_tab(&self, tab: TabId) -> Result<(), RelayError> {
            self.alive.lock().await.remove(&tab.0);
            Ok(())
        }
    }

    #[tokio::test]
    async fn creates_group_lazily_and_reuses_it() {
        let registry = SessionRegistry::new();
        let host = FakeHost::new();
        let sid = SessionId::new("s1");

        let first = registry.get_or_create_group(&host, &sid, "demo").await.unwrap();
        let again = registry.get_or_create_group(&host, &sid, "demo").await.unwrap();
        assert_eq!(first.tab_ids, again.tab_ids);
        assert_eq!(registry.group_count(), 1);
    }

    #[tokio::test]
    async fn palette_cycles_deterministically() {
        let registry = SessionRegistry::new();
        let host = FakeHost::new();
        let mut colors = Vec::new();
        for i in 0..GROUP_PALETTE.len() + 2 {
            let sid = SessionId::new(format!("s{i}"));
            let group = registry.get_or_create_group(&host, &sid, "x").await.unwrap();
            colors.push(group.color);
        }
        assert_eq!(&colors[..GROUP_PALETTE.len()], &GROUP_PALETTE);
        assert_eq!(colors[GROUP_PALETTE.len()], GROUP_PALETTE[0]);
        assert_eq!(colors[GROUP_PALETTE.len() + 1], GROUP_PALETTE[1]);
    }

    #[tokio::test]
    async fn stale_group_is_discarded_and_recreated() {
        let registry = SessionRegistry::new();
        let host = FakeHost::new();
        let sid = SessionId::new("s1");

        let first = registry.get_or_create_group(&host, &sid, "demo").await.unwrap();
        for tab in &first.tab_ids {
            host.kill(*tab).await;
        }

        let fresh = registry.get_or_create_group(&host, &sid, "demo").await.unwrap();
        assert_ne!(first.tab_ids, fresh.tab_ids);
        assert_eq!(fresh.tab_ids.len(), 1);
    }

    #[tokio::test]
    async fn closed_tab_is_pruned_and_next_resolve_allocates() {
        let registry = SessionRegistry::new();
        let host = FakeHost::new();
        let sid = SessionId::new("s1");

        let group = registry.get_or_create_group(&host, &sid, "demo").await.unwrap();
        let original = group.tab_ids[0];
        // keep a second tab so the group survives the closure
        let extra = host.create_tab("about:blank").await.unwrap();
        registry.track_tab(&sid, extra);

        registry.note_tab_closed(original);
        let group = registry.group(&sid).unwrap();
        assert!(!group.tab_ids.contains(&original));

        let resolved = registry.resolve_target_tab(&host, &sid).await.unwrap();
        assert_eq!(resolved, extra);
    }

    #[tokio::test]
    async fn losing_last_tab_drops_group_immediately() {
        let registry = SessionRegistry::new();
        let host = FakeHost::new();
        let sid = SessionId::new("s1");

        let group = registry.get_or_create_group(&host, &sid, "demo").await.unwrap();
        registry.note_tab_closed(group.tab_ids[0]);
        assert!(!registry.contains(&sid));
    }

    #[tokio::test]
    async fn resolve_prefers_active_then_first() {
        let registry = SessionRegistry::new();
        let host = FakeHost::new();
        let sid = SessionId::new("s1");

        registry.get_or_create_group(&host, &sid, "demo").await.unwrap();
        let second = host.create_tab("about:blank").await.unwrap();
        registry.track_tab(&sid, second);
        registry.mark_active(&sid, second);

        assert_eq!(registry.resolve_target_tab(&host, &sid).await.unwrap(), second);
    }

    #[tokio::test]
    async fn idle_sweep_closes_tabs_and_removes_groups() {
        let registry = SessionRegistry::new();
        let host = FakeHost::new();
        let sid = SessionId::new("s1");

        let group = registry.get_or_create_group(&host, &sid, "demo").await.unwrap();
        let tab = group.tab_ids[0];

        assert_eq!(registry.sweep_idle(&host, Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.sweep_idle(&host, Duration::from_millis(10)).await, 1);
        assert!(!registry.contains(&sid));
        assert!(!host.tab_exists(tab).await);
    }
}
