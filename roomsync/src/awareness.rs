//! Awareness protocol for real-time cursor & selection presence.
//!
//! Tracks "who is looking at what" — cursor positions, selections, editing
//! indicators, and user profiles. Awareness state is ephemeral: it is never
//! persisted, never merged as CRDT data, and the latest update per client
//! simply wins.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! AwarenessTable::set_cursor()
//!       │  (rate-limited: 30fps)
//!       ▼
//! AwarenessUpdate::State { … }
//!       │
//!       ▼   (transport broadcast)
//! Remote AwarenessTable::apply_remote()
//!       │
//!       ▼
//! subscribers (UI presence layer)
//! ```
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | State encode | <200ns |
//! | Memory per client | <1KB |
//! | Idle sweep, 100 clients | <10µs |
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Cursor updates are throttled to 30fps to bound presence bandwidth.
const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

/// Clients silent for this long are treated as departed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// User profile attached to a client's presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    /// RGBA color for cursor/selection rendering, stable per client id.
    pub color: [f32; 4],
}

impl UserInfo {
    /// Build a profile with a stable, visually distinct color derived from
    /// the client id. The hue comes from the id hash; high saturation keeps
    /// cursors vivid against document text.
    pub fn new(client_id: Uuid, name: impl Into<String>) -> Self {
        let hash = client_id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self {
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Cursor position in document coordinates: a container plus a visible
/// index within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub container: String,
    pub index: usize,
}

/// Selection range within one container. `anchor` is where the selection
/// started, `head` is where the cursor currently sits; `head < anchor` for
/// backwards selections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub container: String,
    pub anchor: usize,
    pub head: usize,
}

/// One client's full presence state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: Uuid,
    pub user: UserInfo,
    pub cursor: Option<CursorPos>,
    pub selection: Option<Selection>,
    /// Actively typing right now (drives the "is editing…" indicator).
    pub editing: bool,
    /// Sender-local monotonic revision. Receivers keep the entry with the
    /// highest revision per client; there is no cross-client ordering.
    pub updated_at: u64,
}

/// Awareness messages sent over the wire.
///
/// Serialized inside `Envelope::Awareness` payloads. State updates are
/// full-entry replacements, so lost frames only delay presence rather than
/// corrupting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessUpdate {
    /// Full presence state for one client (latest revision wins).
    State(AwarenessEntry),
    /// Clean departure.
    Left { client_id: Uuid },
}

impl AwarenessUpdate {
    /// Get the client id from any variant.
    pub fn client_id(&self) -> Uuid {
        match self {
            AwarenessUpdate::State(entry) => entry.client_id,
            AwarenessUpdate::Left { client_id } => *client_id,
        }
    }
}

/// Change notification delivered to local subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum AwarenessEvent {
    Updated(AwarenessEntry),
    Left(Uuid),
}

/// Handle returned by [`AwarenessTable::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AwarenessSubscription(u64);

struct PeerState {
    entry: AwarenessEntry,
    last_seen: Instant,
}

// ───────────────────────────────────────────────────────────────────
// Awareness table — local state plus all remote peers
// ───────────────────────────────────────────────────────────────────

/// Presence table for one room: the local client's state plus every remote
/// peer heard from recently.
///
/// The local client is the sole writer of its own entry; remote `State`
/// frames carrying our own client id are ignored.
pub struct AwarenessTable {
    local: AwarenessEntry,
    peers: HashMap<Uuid, PeerState>,
    /// Rate limiter: last time a cursor update was handed to the transport.
    last_broadcast: Instant,
    broadcast_interval: Duration,
    /// Local changes made while throttled, waiting for a flush.
    dirty: bool,
    idle_timeout: Duration,
    subscribers: Vec<(AwarenessSubscription, Box<dyn Fn(&AwarenessEvent) + Send>)>,
    next_sub: u64,
}

impl AwarenessTable {
    pub fn new(client_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            local: AwarenessEntry {
                client_id,
                user: UserInfo::new(client_id, name),
                cursor: None,
                selection: None,
                editing: false,
                updated_at: 0,
            },
            peers: HashMap::new(),
            // Allow an immediate first broadcast.
            last_broadcast: Instant::now() - Duration::from_secs(1),
            broadcast_interval: CURSOR_BROADCAST_INTERVAL,
            dirty: false,
            idle_timeout: IDLE_TIMEOUT,
            subscribers: Vec::new(),
            next_sub: 0,
        }
    }

    /// Create with custom throttle/idle intervals (for testing).
    pub fn with_intervals(
        client_id: Uuid,
        name: impl Into<String>,
        broadcast_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let mut table = Self::new(client_id, name);
        table.broadcast_interval = broadcast_interval;
        table.idle_timeout = idle_timeout;
        table
    }

    pub fn client_id(&self) -> Uuid {
        self.local.client_id
    }

    pub fn local_entry(&self) -> &AwarenessEntry {
        &self.local
    }

    // ── Local updates ────────────────────────────────────────────────

    /// Move the local cursor. Returns an update to broadcast, or `None`
    /// when throttled (the change is kept and sent by the next flush).
    pub fn set_cursor(&mut self, container: impl Into<String>, index: usize) -> Option<AwarenessUpdate> {
        self.local.cursor = Some(CursorPos {
            container: container.into(),
            index,
        });
        self.bump();

        if self.last_broadcast.elapsed() < self.broadcast_interval {
            self.dirty = true;
            return None; // Throttled
        }
        Some(self.take_broadcast())
    }

    /// Change the local selection (`None` clears it). Selection changes are
    /// lower frequency than cursor moves and always broadcast immediately.
    pub fn set_selection(&mut self, selection: Option<Selection>) -> AwarenessUpdate {
        self.local.selection = selection;
        self.bump();
        self.take_broadcast()
    }

    /// Toggle the local editing indicator. Always broadcasts immediately.
    pub fn set_editing(&mut self, editing: bool) -> Option<AwarenessUpdate> {
        if self.local.editing == editing {
            return None;
        }
        self.local.editing = editing;
        self.bump();
        Some(self.take_broadcast())
    }

    /// Hand out a pending throttled update once the interval has passed.
    /// The session calls this on its periodic sweep.
    pub fn flush_local(&mut self) -> Option<AwarenessUpdate> {
        if !self.dirty || self.last_broadcast.elapsed() < self.broadcast_interval {
            return None;
        }
        Some(self.take_broadcast())
    }

    /// Current local state regardless of throttling. Used on reconnect so
    /// new peers learn about us immediately.
    pub fn force_broadcast(&mut self) -> AwarenessUpdate {
        self.bump();
        self.take_broadcast()
    }

    /// Clean departure announcement for the local client.
    pub fn remove_local(&self) -> AwarenessUpdate {
        AwarenessUpdate::Left {
            client_id: self.local.client_id,
        }
    }

    fn bump(&mut self) {
        self.local.updated_at += 1;
    }

    fn take_broadcast(&mut self) -> AwarenessUpdate {
        self.dirty = false;
        self.last_broadcast = Instant::now();
        AwarenessUpdate::State(self.local.clone())
    }

    // ── Remote updates ───────────────────────────────────────────────

    /// Merge a remote awareness frame. Updates carrying our own client id
    /// are ignored (the local client is the sole writer of its entry).
    pub fn apply_remote(&mut self, update: AwarenessUpdate) {
        if update.client_id() == self.local.client_id {
            return;
        }

        match update {
            AwarenessUpdate::State(entry) => {
                let newer = self
                    .peers
                    .get(&entry.client_id)
                    .map(|p| entry.updated_at > p.entry.updated_at)
                    .unwrap_or(true);
                if !newer {
                    // Stale revision, but the client is clearly alive.
                    if let Some(p) = self.peers.get_mut(&entry.client_id) {
                        p.last_seen = Instant::now();
                    }
                    return;
                }
                let event = AwarenessEvent::Updated(entry.clone());
                self.peers.insert(
                    entry.client_id,
                    PeerState {
                        entry,
                        last_seen: Instant::now(),
                    },
                );
                self.notify(&event);
            }
            AwarenessUpdate::Left { client_id } => {
                if self.peers.remove(&client_id).is_some() {
                    self.notify(&AwarenessEvent::Left(client_id));
                }
            }
        }
    }

    // ── Views ────────────────────────────────────────────────────────

    /// All known entries, local client included.
    pub fn entries(&self) -> Vec<AwarenessEntry> {
        let mut out: Vec<AwarenessEntry> =
            self.peers.values().map(|p| p.entry.clone()).collect();
        out.push(self.local.clone());
        out
    }

    /// Entry for a specific remote peer.
    pub fn peer(&self, client_id: &Uuid) -> Option<&AwarenessEntry> {
        self.peers.get(client_id).map(|p| &p.entry)
    }

    /// Number of remote peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop peers silent for longer than the idle timeout. Fires exactly
    /// one `Left` event per dropped peer (removal makes a second sweep a
    /// no-op).
    pub fn expire_idle(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
            self.notify(&AwarenessEvent::Left(*id));
        }
        stale
    }

    // ── Subscriptions ────────────────────────────────────────────────

    pub fn subscribe(&mut self, f: impl Fn(&AwarenessEvent) + Send + 'static) -> AwarenessSubscription {
        self.next_sub += 1;
        let id = AwarenessSubscription(self.next_sub);
        self.subscribers.push((id, Box::new(f)));
        id
    }

    pub fn unsubscribe(&mut self, id: AwarenessSubscription) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    fn notify(&self, event: &AwarenessEvent) {
        for (_, f) in &self.subscribers {
            f(event);
        }
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn remote_entry(client_id: Uuid, updated_at: u64) -> AwarenessEntry {
        AwarenessEntry {
            client_id,
            user: UserInfo::new(client_id, "Remote"),
            cursor: Some(CursorPos {
                container: "body".into(),
                index: 3,
            }),
            selection: None,
            editing: false,
            updated_at,
        }
    }

    #[test]
    fn test_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = UserInfo::new(id, "Test");
        let b = UserInfo::new(id, "Test");
        assert_eq!(a.color, b.color);
        assert_eq!(a.color[3], 1.0);
    }

    #[test]
    fn test_cursor_rate_limiting() {
        let mut table = AwarenessTable::new(Uuid::new_v4(), "Alice");

        // First update goes through (initialized ready to broadcast).
        assert!(table.set_cursor("body", 0).is_some());
        // Immediate second update is throttled.
        assert!(table.set_cursor("body", 1).is_none());
        // But the change is retained locally.
        assert_eq!(
            table.local_entry().cursor,
            Some(CursorPos {
                container: "body".into(),
                index: 1
            })
        );
    }

    #[test]
    fn test_flush_after_interval() {
        let mut table = AwarenessTable::with_intervals(
            Uuid::new_v4(),
            "Alice",
            Duration::from_millis(5),
            IDLE_TIMEOUT,
        );

        let _ = table.set_cursor("body", 0);
        assert!(table.set_cursor("body", 1).is_none());
        assert!(table.flush_local().is_none()); // still inside the window

        thread::sleep(Duration::from_millis(10));
        let update = table.flush_local();
        match update {
            Some(AwarenessUpdate::State(entry)) => {
                assert_eq!(entry.cursor.unwrap().index, 1);
            }
            other => panic!("expected flushed state, got {other:?}"),
        }
        // Nothing left to flush.
        thread::sleep(Duration::from_millis(10));
        assert!(table.flush_local().is_none());
    }

    #[test]
    fn test_selection_broadcasts_immediately() {
        let mut table = AwarenessTable::new(Uuid::new_v4(), "Alice");
        let _ = table.set_cursor("body", 0);

        let update = table.set_selection(Some(Selection {
            container: "body".into(),
            anchor: 2,
            head: 7,
        }));
        match update {
            AwarenessUpdate::State(entry) => {
                assert_eq!(entry.selection.unwrap().head, 7);
            }
            other => panic!("expected state update, got {other:?}"),
        }
    }

    #[test]
    fn test_editing_indicator_dedup() {
        let mut table = AwarenessTable::new(Uuid::new_v4(), "Alice");
        assert!(table.set_editing(true).is_some());
        assert!(table.set_editing(true).is_none()); // unchanged
        assert!(table.set_editing(false).is_some());
    }

    #[test]
    fn test_apply_remote_latest_wins() {
        let mut table = AwarenessTable::new(Uuid::new_v4(), "Alice");
        let peer = Uuid::new_v4();

        table.apply_remote(AwarenessUpdate::State(remote_entry(peer, 5)));
        // Stale revision ignored.
        let mut stale = remote_entry(peer, 3);
        stale.editing = true;
        table.apply_remote(AwarenessUpdate::State(stale));
        assert!(!table.peer(&peer).unwrap().editing);

        // Newer revision applies.
        let mut newer = remote_entry(peer, 9);
        newer.editing = true;
        table.apply_remote(AwarenessUpdate::State(newer));
        assert!(table.peer(&peer).unwrap().editing);
    }

    #[test]
    fn test_ignores_own_id() {
        let id = Uuid::new_v4();
        let mut table = AwarenessTable::new(id, "Alice");
        table.apply_remote(AwarenessUpdate::State(remote_entry(id, 99)));
        assert_eq!(table.peer_count(), 0);
        assert_eq!(table.local_entry().updated_at, 0);
    }

    #[test]
    fn test_left_removes_peer() {
        let mut table = AwarenessTable::new(Uuid::new_v4(), "Alice");
        let peer = Uuid::new_v4();
        table.apply_remote(AwarenessUpdate::State(remote_entry(peer, 1)));
        assert_eq!(table.peer_count(), 1);

        table.apply_remote(AwarenessUpdate::Left { client_id: peer });
        assert_eq!(table.peer_count(), 0);
    }

    #[test]
    fn test_entries_include_local() {
        let id = Uuid::new_v4();
        let mut table = AwarenessTable::new(id, "Alice");
        table.apply_remote(AwarenessUpdate::State(remote_entry(Uuid::new_v4(), 1)));

        let entries = table.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.client_id == id));
    }

    #[test]
    fn test_expire_idle_fires_left_once() {
        let mut table = AwarenessTable::with_intervals(
            Uuid::new_v4(),
            "Alice",
            CURSOR_BROADCAST_INTERVAL,
            Duration::from_millis(5),
        );
        let peer = Uuid::new_v4();
        table.apply_remote(AwarenessUpdate::State(remote_entry(peer, 1)));

        let left_events = Arc::new(AtomicUsize::new(0));
        let counter = left_events.clone();
        table.subscribe(move |event| {
            if matches!(event, AwarenessEvent::Left(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        thread::sleep(Duration::from_millis(10));
        assert_eq!(table.expire_idle(), vec![peer]);
        // Second sweep finds nothing; Left fired exactly once.
        assert!(table.expire_idle().is_empty());
        assert_eq!(left_events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_state_refreshes_liveness() {
        let mut table = AwarenessTable::with_intervals(
            Uuid::new_v4(),
            "Alice",
            CURSOR_BROADCAST_INTERVAL,
            Duration::from_millis(20),
        );
        let peer = Uuid::new_v4();
        table.apply_remote(AwarenessUpdate::State(remote_entry(peer, 5)));

        thread::sleep(Duration::from_millis(12));
        // A stale revision still proves the peer is alive.
        table.apply_remote(AwarenessUpdate::State(remote_entry(peer, 2)));
        thread::sleep(Duration::from_millis(12));
        assert!(table.expire_idle().is_empty());
    }

    #[test]
    fn test_subscribe_events() {
        let mut table = AwarenessTable::new(Uuid::new_v4(), "Alice");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let sub = table.subscribe(move |event| {
            if let Ok(mut sink) = sink.lock() {
                sink.push(event.clone());
            }
        });

        let peer = Uuid::new_v4();
        table.apply_remote(AwarenessUpdate::State(remote_entry(peer, 1)));
        table.apply_remote(AwarenessUpdate::Left { client_id: peer });

        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 2);
            assert!(matches!(events[0], AwarenessEvent::Updated(_)));
            assert_eq!(events[1], AwarenessEvent::Left(peer));
        }

        assert!(table.unsubscribe(sub));
        table.apply_remote(AwarenessUpdate::State(remote_entry(peer, 2)));
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_remove_local() {
        let id = Uuid::new_v4();
        let table = AwarenessTable::new(id, "Alice");
        assert_eq!(table.remove_local(), AwarenessUpdate::Left { client_id: id });
    }
}
