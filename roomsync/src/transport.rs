//! WebSocket transport provider for room synchronization.
//!
//! Owns the connection lifecycle for one room:
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──► Connected ──► Synced
//!      ▲                          │              │  SyncRequest /
//!      │                          │              │  SyncResponse
//!      └────── backoff ◄──────────┴──────────────┘
//! ```
//!
//! On every (re)connect the provider announces its state vector with a
//! `SyncRequest`; the first `SyncResponse` (or a quiet handshake window,
//! meaning we are the first replica in the room) promotes the connection to
//! `Synced` and flushes the offline queue. Document operations queued while
//! offline are never dropped; awareness frames are, oldest first, when the
//! queue overflows.
//!
//! Reference: Kleppmann, Chapter 5 — Replication
//! Reference: Kleppmann, Chapter 8 — Unreliable Networks

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::AwarenessUpdate;
use crate::crdt::{AppliedResult, Document, Operation, ReplicaId};
use crate::protocol::{Envelope, EnvelopeKind};

/// Connection lifecycle state, observable by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, initial sync exchange still in flight.
    Connected,
    /// Initial sync complete; live ops flowing.
    Synced,
    /// Last attempt failed abnormally; a retry is scheduled.
    Error,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    /// Room to join. Frames for other rooms never reach us, but the room id
    /// is checked on receive anyway.
    pub room_id: String,
    /// Soft bound on the offline queue. Awareness frames beyond it are
    /// dropped; ops are kept regardless, with a warning.
    pub max_queue: usize,
    /// First reconnect delay; doubles per failed attempt.
    pub initial_backoff: Duration,
    /// Reconnect delay cap.
    pub max_backoff: Duration,
    /// How long to wait for a `SyncResponse` before concluding we are the
    /// first replica in the room.
    pub handshake_timeout: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            room_id: room_id.into(),
            max_queue: 10_000,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(3),
        }
    }

    /// Config for testing (tight timeouts).
    pub fn for_testing(url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            room_id: room_id.into(),
            max_queue: 64,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(300),
        }
    }
}

/// Events emitted to the session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection state changed.
    Status(ConnectionState),
    /// Remote ops were merged into the document.
    OpsApplied(usize),
    /// Remote awareness frame received.
    Awareness(AwarenessUpdate),
}

enum Outbound {
    Op(Operation),
    Awareness(AwarenessUpdate),
}

/// Offline queue. Ops are essential and survive overflow; awareness frames
/// are disposable presence hints and go first.
struct OutboundQueue {
    items: VecDeque<Outbound>,
    max: usize,
}

impl OutboundQueue {
    fn new(max: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max,
        }
    }

    fn push_op(&mut self, op: Operation) {
        if self.items.len() >= self.max {
            if let Some(pos) = self
                .items
                .iter()
                .position(|i| matches!(i, Outbound::Awareness(_)))
            {
                self.items.remove(pos);
            } else {
                log::warn!(
                    "outbound queue over bound ({} ops); keeping op anyway",
                    self.items.len()
                );
            }
        }
        self.items.push_back(Outbound::Op(op));
    }

    /// Returns `false` when the frame was dropped.
    fn push_awareness(&mut self, update: AwarenessUpdate) -> bool {
        if self.items.len() >= self.max {
            return false;
        }
        self.items.push_back(Outbound::Awareness(update));
        true
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    /// Split into op batch + awareness frames, preserving op order.
    fn drain(&mut self) -> (Vec<Operation>, Vec<AwarenessUpdate>) {
        let mut ops = Vec::new();
        let mut awareness = Vec::new();
        for item in self.items.drain(..) {
            match item {
                Outbound::Op(op) => ops.push(op),
                Outbound::Awareness(u) => awareness.push(u),
            }
        }
        (ops, awareness)
    }
}

/// Reconnect jitter derived from a fresh v4 uuid, keeping simultaneous
/// reconnects from herding.
fn jitter() -> Duration {
    Duration::from_millis((Uuid::new_v4().as_u128() % 250) as u64)
}

/// The transport provider: one WebSocket connection per room, supervised
/// with exponential backoff, feeding remote ops straight into the shared
/// document.
pub struct TransportProvider {
    config: TransportConfig,
    replica: ReplicaId,
    doc: Arc<Mutex<Document>>,
    state: Arc<RwLock<ConnectionState>>,
    queue: Arc<Mutex<OutboundQueue>>,
    /// Wakes the supervisor when the queue gains items.
    outbound_notify: Arc<Notify>,
    /// Wakes the supervisor to re-announce its state vector.
    resync_notify: Arc<Notify>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl TransportProvider {
    pub fn new(config: TransportConfig, replica: ReplicaId, doc: Arc<Mutex<Document>>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let max_queue = config.max_queue;
        Self {
            config,
            replica,
            doc,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            queue: Arc::new(Mutex::new(OutboundQueue::new(max_queue))),
            outbound_notify: Arc::new(Notify::new()),
            resync_notify: Arc::new(Notify::new()),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            task: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Start the supervisor. Connection failures are retried internally
    /// with capped exponential backoff; this never blocks editing.
    pub fn connect(&mut self) {
        if self.task.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            config: self.config.clone(),
            replica: self.replica,
            doc: self.doc.clone(),
            state: self.state.clone(),
            queue: self.queue.clone(),
            outbound_notify: self.outbound_notify.clone(),
            resync_notify: self.resync_notify.clone(),
            event_tx: self.event_tx.clone(),
        };
        self.task = Some(tokio::spawn(supervisor.run(shutdown_rx)));
    }

    /// Stop the supervisor and close the socket.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Queue a local op for broadcast. Ops are never dropped: offline they
    /// wait in the queue and flush after the next successful sync.
    pub async fn send_op(&self, op: Operation) {
        self.queue.lock().await.push_op(op);
        self.outbound_notify.notify_one();
    }

    /// Queue an awareness frame. Disposable: dropped when offline with a
    /// full queue.
    pub async fn send_awareness(&self, update: AwarenessUpdate) {
        if !self.queue.lock().await.push_awareness(update) {
            log::debug!("dropping awareness frame, outbound queue full");
            return;
        }
        self.outbound_notify.notify_one();
    }

    /// Ask the supervisor to re-announce its state vector. Used when a
    /// buffered op has waited too long for its causal predecessor.
    pub fn request_resync(&self) {
        self.resync_notify.notify_one();
    }
}

/// Everything the supervisor task owns.
struct Supervisor {
    config: TransportConfig,
    replica: ReplicaId,
    doc: Arc<Mutex<Document>>,
    state: Arc<RwLock<ConnectionState>>,
    queue: Arc<Mutex<OutboundQueue>>,
    outbound_notify: Arc<Notify>,
    resync_notify: Arc<Notify>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl Supervisor {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
        let _ = self.event_tx.send(TransportEvent::Status(state)).await;
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.initial_backoff;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting).await;

            let connected = tokio::time::timeout(
                self.config.handshake_timeout,
                tokio_tungstenite::connect_async(&self.config.url),
            )
            .await;

            let ws = match connected {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => {
                    log::warn!("connect to {} failed: {e}", self.config.url);
                    self.set_state(ConnectionState::Error).await;
                    if !self.sleep_backoff(&mut shutdown, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    continue;
                }
                Err(_) => {
                    log::warn!("connect to {} timed out", self.config.url);
                    self.set_state(ConnectionState::Error).await;
                    if !self.sleep_backoff(&mut shutdown, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    continue;
                }
            };

            match self.pump(ws, &mut shutdown).await {
                PumpExit::Shutdown => break,
                PumpExit::Synced => backoff = self.config.initial_backoff,
                PumpExit::Failed => backoff = (backoff * 2).min(self.config.max_backoff),
            }

            self.set_state(ConnectionState::Disconnected).await;
            if !self.sleep_backoff(&mut shutdown, backoff).await {
                break;
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Returns `false` when shutdown fired during the wait.
    async fn sleep_backoff(&self, shutdown: &mut watch::Receiver<bool>, backoff: Duration) -> bool {
        tokio::select! {
            _ = shutdown.changed() => false,
            _ = tokio::time::sleep(backoff + jitter()) => true,
        }
    }

    /// Drive one live connection until it drops or shutdown fires.
    async fn pump(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        let (mut sink, mut reader) = ws.split();

        // Writer task: forward encoded frames to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if sink
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.set_state(ConnectionState::Connected).await;

        // Announce what we have seen; peers answer with what we miss.
        let sv = self.doc.lock().await.state_vector();
        self.send_frame(
            &out_tx,
            Envelope::sync_request(&self.config.room_id, self.replica, &sv),
        )
        .await;

        let sync_deadline = tokio::time::Instant::now() + self.config.handshake_timeout;
        let mut synced = false;
        let mut reached_sync = false;

        let exit = loop {
            tokio::select! {
                _ = shutdown.changed() => break PumpExit::Shutdown,

                // Quiet handshake window: we are the first replica in the
                // room, nothing to catch up on.
                _ = tokio::time::sleep_until(sync_deadline), if !synced => {
                    synced = true;
                    reached_sync = true;
                    self.set_state(ConnectionState::Synced).await;
                    self.flush_queue(&out_tx, synced).await;
                }

                _ = self.outbound_notify.notified() => {
                    self.flush_queue(&out_tx, synced).await;
                }

                _ = self.resync_notify.notified() => {
                    let sv = self.doc.lock().await.state_vector();
                    log::info!("re-announcing state vector for {}", self.config.room_id);
                    self.send_frame(
                        &out_tx,
                        Envelope::sync_request(&self.config.room_id, self.replica, &sv),
                    )
                    .await;
                }

                msg = reader.next() => {
                    match msg {
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            if let Some(now_synced) = self.handle_frame(&bytes, &out_tx, synced).await {
                                if now_synced && !synced {
                                    synced = true;
                                    reached_sync = true;
                                    self.set_state(ConnectionState::Synced).await;
                                    self.flush_queue(&out_tx, synced).await;
                                }
                            }
                        }
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                            break if reached_sync { PumpExit::Synced } else { PumpExit::Failed };
                        }
                        Some(Err(e)) => {
                            log::warn!("socket error on {}: {e}", self.config.room_id);
                            break if reached_sync { PumpExit::Synced } else { PumpExit::Failed };
                        }
                        Some(Ok(_)) => {} // ping/pong/text — ignore
                    }
                }
            }
        };

        drop(out_tx);
        let _ = writer.await;
        exit
    }

    /// Handle one inbound frame. Returns `Some(true)` when the frame
    /// completed the initial sync.
    async fn handle_frame(
        &self,
        bytes: &[u8],
        out_tx: &mpsc::Sender<Vec<u8>>,
        synced: bool,
    ) -> Option<bool> {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("undecodable frame on {}: {e}", self.config.room_id);
                return None;
            }
        };
        if envelope.sender == self.replica || envelope.room_id != self.config.room_id {
            return None;
        }

        match envelope.kind {
            EnvelopeKind::Op => {
                match envelope.ops() {
                    Ok(ops) => self.apply_ops(ops).await,
                    Err(e) => log::warn!("bad op payload: {e}"),
                }
                Some(false)
            }
            EnvelopeKind::Awareness => {
                if let Ok(update) = envelope.awareness_update() {
                    let _ = self.event_tx.send(TransportEvent::Awareness(update)).await;
                }
                Some(false)
            }
            EnvelopeKind::SyncRequest => {
                if let Ok(sv) = envelope.state_vector() {
                    let missing = self.doc.lock().await.missing_ops(&sv);
                    if !missing.is_empty() {
                        self.send_frame(
                            out_tx,
                            Envelope::sync_response(&self.config.room_id, self.replica, &missing),
                        )
                        .await;
                    }
                }
                Some(false)
            }
            EnvelopeKind::SyncResponse => {
                match envelope.ops() {
                    Ok(ops) => self.apply_ops(ops).await,
                    Err(e) => log::warn!("bad sync response payload: {e}"),
                }
                Some(!synced)
            }
        }
    }

    async fn apply_ops(&self, ops: Vec<Operation>) {
        let mut applied = 0;
        {
            let mut doc = self.doc.lock().await;
            for op in ops {
                if matches!(doc.apply_remote(op), AppliedResult::Applied(_)) {
                    applied += 1;
                }
            }
        }
        if applied > 0 {
            let _ = self.event_tx.send(TransportEvent::OpsApplied(applied)).await;
        }
    }

    /// Send queued traffic. Ops wait until synced (peers answer our sync
    /// request first, keeping causal order sane); awareness flows as soon
    /// as the socket is up.
    async fn flush_queue(&self, out_tx: &mpsc::Sender<Vec<u8>>, synced: bool) {
        let (ops, awareness) = {
            let mut queue = self.queue.lock().await;
            if !synced {
                // Keep ops queued, but presence can go out now.
                let (ops, awareness) = queue.drain();
                for op in ops {
                    queue.push_op(op);
                }
                (Vec::new(), awareness)
            } else {
                queue.drain()
            }
        };

        if !ops.is_empty() {
            log::info!("flushing {} queued ops for {}", ops.len(), self.config.room_id);
            self.send_frame(out_tx, Envelope::op(&self.config.room_id, self.replica, &ops))
                .await;
        }
        for update in awareness {
            self.send_frame(
                out_tx,
                Envelope::awareness(&self.config.room_id, self.replica, &update),
            )
            .await;
        }
    }

    async fn send_frame(&self, out_tx: &mpsc::Sender<Vec<u8>>, envelope: Envelope) {
        match envelope.encode() {
            Ok(bytes) => {
                let _ = out_tx.send(bytes).await;
            }
            Err(e) => log::warn!("frame encode failed: {e}"),
        }
    }
}

enum PumpExit {
    Shutdown,
    Synced,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Mutation;

    fn provider() -> TransportProvider {
        let replica = Uuid::new_v4();
        let doc = Arc::new(Mutex::new(Document::new(replica)));
        TransportProvider::new(
            TransportConfig::for_testing("ws://127.0.0.1:1", "room"),
            replica,
            doc,
        )
    }

    fn sample_op(doc: &Arc<Mutex<Document>>) -> Operation {
        let mut doc = doc.try_lock().unwrap();
        doc.get_text("t").unwrap();
        doc.apply_local(
            "t",
            Mutation::TextInsert {
                index: 0,
                text: "x".into(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_initial_state() {
        let provider = provider();
        assert_eq!(provider.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(provider.queued_len().await, 0);
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut provider = provider();
        assert!(provider.take_event_rx().is_some());
        assert!(provider.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_offline_ops_queue() {
        let provider = provider();
        let op = sample_op(&provider.doc);
        provider.send_op(op.clone()).await;
        provider.send_op(op).await;
        assert_eq!(provider.queued_len().await, 2);
    }

    #[tokio::test]
    async fn test_ops_survive_queue_overflow() {
        let replica = Uuid::new_v4();
        let doc = Arc::new(Mutex::new(Document::new(replica)));
        let mut config = TransportConfig::for_testing("ws://127.0.0.1:1", "room");
        config.max_queue = 4;
        let provider = TransportProvider::new(config, replica, doc.clone());

        // Fill with awareness, then push ops past the bound: awareness is
        // evicted first, ops all kept.
        for _ in 0..4 {
            provider
                .send_awareness(AwarenessUpdate::Left {
                    client_id: Uuid::new_v4(),
                })
                .await;
        }
        for _ in 0..6 {
            let op = sample_op(&doc);
            provider.send_op(op).await;
        }

        let (ops, awareness) = provider.queue.lock().await.drain();
        assert_eq!(ops.len(), 6);
        assert!(awareness.len() < 4);
    }

    #[tokio::test]
    async fn test_awareness_dropped_when_full() {
        let replica = Uuid::new_v4();
        let doc = Arc::new(Mutex::new(Document::new(replica)));
        let mut config = TransportConfig::for_testing("ws://127.0.0.1:1", "room");
        config.max_queue = 2;
        let provider = TransportProvider::new(config, replica, doc);

        for _ in 0..5 {
            provider
                .send_awareness(AwarenessUpdate::Left {
                    client_id: Uuid::new_v4(),
                })
                .await;
        }
        assert_eq!(provider.queued_len().await, 2);
    }

    #[test]
    fn test_jitter_bounded() {
        for _ in 0..32 {
            assert!(jitter() < Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let mut provider = provider();
        provider.disconnect().await;
        assert_eq!(provider.connection_state().await, ConnectionState::Disconnected);
    }
}
