//! Room session: one client editing one document in one room.
//!
//! The session wires the pieces together and owns the background loop:
//!
//! ```text
//! edit()/set_cursor()            TransportEvent stream
//!        │                               │
//!        ▼                               ▼
//! ┌─────────────────── session event loop ──────────────────┐
//! │  local ops ──► transport queue        Status ──► watch   │
//! │  awareness ──► transport queue        OpsApplied ──► …   │
//! │  heartbeat tick ──► registry          Awareness ──► table│
//! │  sweep tick ──► idle expiry, flush, resync, cache save   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Editing is always local-first: mutations apply to the in-memory document
//! immediately and the transport delivers them when it can. Connecting,
//! reconnecting, and cache persistence all happen off the caller's path.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Multi-Leader Replication)

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::{AwarenessTable, AwarenessUpdate, Selection};
use crate::cache::{CacheConfig, CacheError, DocumentCache, SaveDebouncer};
use crate::crdt::{ContainerView, DocError, Document, Mutation, Operation};
use crate::registry::{PresenceRegistry, RegistryConfig, RegistryError};
use crate::transport::{ConnectionState, TransportConfig, TransportEvent, TransportProvider};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9090`.
    pub relay_url: String,
    /// Cache directory (`None` disables local persistence).
    pub cache_dir: Option<PathBuf>,
    pub registry: RegistryConfig,
    /// Registry heartbeat cadence while connected.
    pub heartbeat_interval: Duration,
    /// Housekeeping cadence: idle expiry, awareness flush, cache saves.
    pub sweep_interval: Duration,
    /// How long an op may wait for a causal predecessor before the session
    /// requests a full resync.
    pub resync_after: Duration,
    pub max_queue: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9090".to_string(),
            cache_dir: None,
            registry: RegistryConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            resync_after: Duration::from_secs(5),
            max_queue: 10_000,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(3),
        }
    }
}

impl SessionConfig {
    /// Config for testing (tight intervals, small queues).
    pub fn for_testing(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            cache_dir: None,
            registry: RegistryConfig::default(),
            heartbeat_interval: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(25),
            resync_after: Duration::from_millis(300),
            max_queue: 64,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(300),
        }
    }

    fn transport(&self, room_id: &str) -> TransportConfig {
        TransportConfig {
            url: self.relay_url.clone(),
            room_id: room_id.to_string(),
            max_queue: self.max_queue,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            handshake_timeout: self.handshake_timeout,
        }
    }
}

/// Who this client is, as shown to other room members.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub name: String,
}

impl UserIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Session errors.
#[derive(Debug)]
pub enum SessionError {
    Doc(DocError),
    Cache(CacheError),
    Registry(RegistryError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Doc(e) => write!(f, "document error: {e}"),
            SessionError::Cache(e) => write!(f, "cache error: {e}"),
            SessionError::Registry(e) => write!(f, "registry error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DocError> for SessionError {
    fn from(e: DocError) -> Self {
        SessionError::Doc(e)
    }
}

impl From<CacheError> for SessionError {
    fn from(e: CacheError) -> Self {
        SessionError::Cache(e)
    }
}

impl From<RegistryError> for SessionError {
    fn from(e: RegistryError) -> Self {
        SessionError::Registry(e)
    }
}

enum SessionCommand {
    LocalOp(Operation),
    Awareness(AwarenessUpdate),
    Shutdown,
}

/// A live editing session for one `(document, room)` pair.
pub struct RoomSession {
    document_id: String,
    room_id: String,
    client_id: Uuid,
    doc: Arc<Mutex<Document>>,
    awareness: Arc<Mutex<AwarenessTable>>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomSession {
    /// Open a session: restore the cached document if one exists, start the
    /// transport, and wait briefly for the initial sync. Returns even if the
    /// relay is unreachable — editing is never blocked on connectivity.
    pub async fn connect(
        config: SessionConfig,
        identity: UserIdentity,
        document_id: impl Into<String>,
        room_id: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let document_id = document_id.into();
        let room_id = room_id.into();

        // Restore from cache if possible; the restored replica resumes its
        // identity so its op counter chain stays unbroken.
        let cache = match &config.cache_dir {
            Some(dir) => Some(DocumentCache::new(dir)?),
            None => None,
        };
        let doc = match cache.as_ref().and_then(|c| c.load(&document_id)) {
            Some(blob) => match Document::decode_state(&blob) {
                Ok(doc) => {
                    log::info!("restored {document_id} from cache");
                    doc
                }
                Err(e) => {
                    log::warn!("cache blob for {document_id} unusable ({e}), starting fresh");
                    Document::new(Uuid::new_v4())
                }
            },
            None => Document::new(Uuid::new_v4()),
        };
        let client_id = doc.replica();
        let doc = Arc::new(Mutex::new(doc));

        let awareness = Arc::new(Mutex::new(AwarenessTable::new(client_id, identity.name.clone())));

        let registry = PresenceRegistry::new(config.registry.clone())?;
        registry.announce_join(&room_id, &document_id, client_id, &identity.name);

        let mut transport =
            TransportProvider::new(config.transport(&room_id), client_id, doc.clone());
        let event_rx = match transport.take_event_rx() {
            Some(rx) => rx,
            None => unreachable!("fresh transport always has an event receiver"),
        };
        transport.connect();

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let event_loop = SessionLoop {
            document_id: document_id.clone(),
            room_id: room_id.clone(),
            client_id,
            doc: doc.clone(),
            awareness: awareness.clone(),
            transport,
            registry,
            cache,
            debouncer: SaveDebouncer::new(&CacheConfig::new(
                config.cache_dir.clone().unwrap_or_default(),
            )),
            config: config.clone(),
            state_tx,
        };
        let task = tokio::spawn(event_loop.run(cmd_rx, event_rx));

        let session = Self {
            document_id,
            room_id,
            client_id,
            doc,
            awareness,
            cmd_tx,
            state_rx,
            task: Mutex::new(Some(task)),
        };
        session.await_initial_sync(config.handshake_timeout * 2).await;
        Ok(session)
    }

    /// Wait for the first sync, bounded. A timeout is not an error: the
    /// session simply continues offline and syncs later.
    async fn await_initial_sync(&self, limit: Duration) {
        let mut state_rx = self.state_rx.clone();
        let _ = tokio::time::timeout(limit, async {
            while *state_rx.borrow() != ConnectionState::Synced {
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Shared document handle, for subscriptions and snapshots.
    pub fn document(&self) -> Arc<Mutex<Document>> {
        self.doc.clone()
    }

    /// Shared awareness handle, for subscriptions and presence views.
    pub fn awareness(&self) -> Arc<Mutex<AwarenessTable>> {
        self.awareness.clone()
    }

    /// Apply a local mutation and queue it for broadcast. Local-first:
    /// succeeds and is visible immediately regardless of connectivity.
    pub async fn edit(&self, container: &str, mutation: Mutation) -> Result<(), SessionError> {
        let op = {
            let mut doc = self.doc.lock().await;
            doc.apply_local(container, mutation)?
        };
        let _ = self.cmd_tx.send(SessionCommand::LocalOp(op)).await;
        Ok(())
    }

    /// Snapshot a container by name.
    pub async fn snapshot(&self, container: &str) -> Result<ContainerView, SessionError> {
        let doc = self.doc.lock().await;
        Ok(doc.snapshot(container)?)
    }

    pub async fn set_cursor(&self, container: &str, index: usize) {
        let update = self.awareness.lock().await.set_cursor(container, index);
        if let Some(update) = update {
            let _ = self.cmd_tx.send(SessionCommand::Awareness(update)).await;
        }
    }

    pub async fn set_selection(&self, selection: Option<Selection>) {
        let update = self.awareness.lock().await.set_selection(selection);
        let _ = self.cmd_tx.send(SessionCommand::Awareness(update)).await;
    }

    pub async fn set_editing(&self, editing: bool) {
        let update = self.awareness.lock().await.set_editing(editing);
        if let Some(update) = update {
            let _ = self.cmd_tx.send(SessionCommand::Awareness(update)).await;
        }
    }

    /// Announce departure, persist, and stop the background loop.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// State owned by the background task.
struct SessionLoop {
    document_id: String,
    room_id: String,
    client_id: Uuid,
    doc: Arc<Mutex<Document>>,
    awareness: Arc<Mutex<AwarenessTable>>,
    transport: TransportProvider,
    registry: PresenceRegistry,
    cache: Option<DocumentCache>,
    debouncer: SaveDebouncer,
    config: SessionConfig,
    state_tx: watch::Sender<ConnectionState>,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut event_rx: mpsc::Receiver<TransportEvent>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::LocalOp(op)) => {
                        self.transport.send_op(op).await;
                        self.debouncer.note_ops(1);
                    }
                    Some(SessionCommand::Awareness(update)) => {
                        self.transport.send_awareness(update).await;
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },

                event = event_rx.recv() => match event {
                    Some(TransportEvent::Status(state)) => {
                        let _ = self.state_tx.send(state);
                        if state == ConnectionState::Connected {
                            // New socket: make sure peers learn about us.
                            let update = self.awareness.lock().await.force_broadcast();
                            self.transport.send_awareness(update).await;
                        }
                    }
                    Some(TransportEvent::OpsApplied(n)) => {
                        self.debouncer.note_ops(n as u64);
                    }
                    Some(TransportEvent::Awareness(update)) => {
                        self.awareness.lock().await.apply_remote(update);
                    }
                    // Transport ended; shutdown will follow via cmd channel.
                    None => {}
                },

                _ = heartbeat.tick() => {
                    let state = *self.state_tx.borrow();
                    if matches!(state, ConnectionState::Connected | ConnectionState::Synced) {
                        self.registry.heartbeat(&self.room_id, &self.document_id, self.client_id);
                        // Coarse cursor for lobby views rides the heartbeat
                        // cadence, not the 30 fps awareness channel.
                        let cursor = self
                            .awareness
                            .lock()
                            .await
                            .entries()
                            .into_iter()
                            .find(|e| e.client_id == self.client_id)
                            .and_then(|e| e.cursor);
                        if let Some(cursor) = cursor {
                            self.registry.update_cursor(&self.room_id, self.client_id, &cursor);
                        }
                    }
                }

                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }

        self.teardown().await;
    }

    /// Periodic housekeeping.
    async fn sweep(&mut self) {
        {
            let mut awareness = self.awareness.lock().await;
            awareness.expire_idle();
            if let Some(update) = awareness.flush_local() {
                drop(awareness);
                self.transport.send_awareness(update).await;
            }
        }

        let stale = {
            let doc = self.doc.lock().await;
            doc.has_stale_pending(self.config.resync_after)
        };
        if stale {
            log::info!("stale buffered ops in {}, requesting resync", self.room_id);
            self.transport.request_resync();
        }

        if self.cache.is_some() && self.debouncer.needs_save() {
            self.save_cache().await;
        }
    }

    async fn save_cache(&mut self) {
        let Some(cache) = &self.cache else { return };
        let blob = {
            let doc = self.doc.lock().await;
            doc.encode_state()
        };
        match blob {
            Ok(blob) => {
                if let Err(e) = cache.save(&self.document_id, &blob) {
                    log::warn!("cache save for {} failed: {e}", self.document_id);
                } else {
                    self.debouncer.mark_saved();
                }
            }
            Err(e) => log::warn!("state encode for {} failed: {e}", self.document_id),
        }
    }

    async fn teardown(&mut self) {
        // Persist whatever is unsaved.
        if self.cache.is_some() && self.debouncer.dirty() {
            self.save_cache().await;
        }

        let left = self.awareness.lock().await.remove_local();
        self.transport.send_awareness(left).await;
        // Give the departure frame a moment to leave the outbound queue.
        tokio::time::sleep(Duration::from_millis(50)).await;

        self.registry
            .announce_leave(&self.room_id, &self.document_id, self.client_id);
        self.transport.disconnect().await;
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        log::info!("session for {} in {} closed", self.document_id, self.room_id);
    }
}

/// Tracks open sessions and enforces one live session per
/// `(document, room)` pair: connecting again replaces the old session.
pub struct SessionManager {
    config: SessionConfig,
    sessions: HashMap<(String, String), Arc<RoomSession>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, document_id: &str, room_id: &str) -> Option<Arc<RoomSession>> {
        self.sessions
            .get(&(document_id.to_string(), room_id.to_string()))
            .cloned()
    }

    /// Open (or replace) the session for a `(document, room)` pair.
    pub async fn connect(
        &mut self,
        identity: UserIdentity,
        document_id: impl Into<String>,
        room_id: impl Into<String>,
    ) -> Result<Arc<RoomSession>, SessionError> {
        let document_id = document_id.into();
        let room_id = room_id.into();
        let key = (document_id.clone(), room_id.clone());

        if let Some(old) = self.sessions.remove(&key) {
            log::info!("replacing existing session for {document_id} in {room_id}");
            old.shutdown().await;
        }

        let session = Arc::new(
            RoomSession::connect(self.config.clone(), identity, document_id, room_id).await?,
        );
        self.sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Close one session.
    pub async fn disconnect(&mut self, document_id: &str, room_id: &str) {
        let key = (document_id.to_string(), room_id.to_string());
        if let Some(session) = self.sessions.remove(&key) {
            session.shutdown().await;
        }
    }

    /// Close everything.
    pub async fn shutdown_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.relay_url, "ws://127.0.0.1:9090");
        assert!(config.cache_dir.is_none());
        assert_eq!(config.resync_after, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_offline_session_edits_locally() {
        // Nothing listens on this port; the session must still come up and
        // accept edits.
        let config = SessionConfig::for_testing("ws://127.0.0.1:1");
        let session = RoomSession::connect(
            config,
            UserIdentity::new("Alice"),
            "doc-offline",
            "room-offline",
        )
        .await
        .unwrap();

        session
            .edit(
                "body",
                Mutation::TextInsert {
                    index: 0,
                    text: "offline".into(),
                },
            )
            .await
            .unwrap_err(); // container not created yet

        {
            let doc = session.document();
            let mut doc = doc.lock().await;
            doc.get_text("body").unwrap();
        }
        session
            .edit(
                "body",
                Mutation::TextInsert {
                    index: 0,
                    text: "offline".into(),
                },
            )
            .await
            .unwrap();

        match session.snapshot("body").await.unwrap() {
            ContainerView::Text(text) => assert_eq!(text, "offline"),
            other => panic!("expected text view, got {other:?}"),
        }
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_replaces_duplicate() {
        let mut manager = SessionManager::new(SessionConfig::for_testing("ws://127.0.0.1:1"));

        let first = manager
            .connect(UserIdentity::new("Alice"), "doc", "room")
            .await
            .unwrap();
        let first_id = first.client_id();

        let second = manager
            .connect(UserIdentity::new("Alice"), "doc", "room")
            .await
            .unwrap();

        assert_eq!(manager.session_count(), 1);
        assert_ne!(first_id, second.client_id());
        manager.shutdown_all().await;
        assert_eq!(manager.session_count(), 0);
    }
}
