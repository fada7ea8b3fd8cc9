//! Optional HTTP presence registry.
//!
//! Some deployments run a directory service next to the relay so lobby UIs
//! can show who is in which room without joining it. The registry is purely
//! advisory: every call is fire-and-forget with bounded retries, and a dead
//! registry never affects editing or sync.
//!
//! Endpoints (all POST, JSON bodies):
//! - `{base}/rooms/{room}/join`      — client entered the room
//! - `{base}/rooms/{room}/leave`     — client left
//! - `{base}/rooms/{room}/heartbeat` — client is still here
//! - `{base}/rooms/{room}/cursor`    — coarse cursor position for lobby views
//! - `{base}/rooms/{room}/broadcast` — free-form room event

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::awareness::CursorPos;

/// Registry configuration. `base_url: None` disables the registry entirely.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: Option<String>,
    /// Attempts per call before giving up with a warning.
    pub retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            retries: 3,
            retry_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }

    /// Config for testing (single attempt, short timeouts).
    pub fn for_testing(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            retries: 1,
            retry_delay: Duration::from_millis(10),
            request_timeout: Duration::from_millis(200),
        }
    }
}

/// Registry errors. Only construction can fail; calls degrade to warnings.
#[derive(Debug)]
pub enum RegistryError {
    Client(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Client(e) => write!(f, "registry client error: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Fire-and-forget presence registry client.
#[derive(Clone)]
pub struct PresenceRegistry {
    config: RegistryConfig,
    client: reqwest::Client,
}

impl PresenceRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RegistryError::Client(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Registry disabled (no base URL configured)?
    pub fn enabled(&self) -> bool {
        self.config.base_url.is_some()
    }

    pub fn announce_join(&self, room_id: &str, document_id: &str, client_id: Uuid, name: &str) {
        self.post(
            room_id,
            "join",
            json!({ "document_id": document_id, "client_id": client_id, "name": name }),
        );
    }

    pub fn announce_leave(&self, room_id: &str, document_id: &str, client_id: Uuid) {
        self.post(
            room_id,
            "leave",
            json!({ "document_id": document_id, "client_id": client_id }),
        );
    }

    pub fn heartbeat(&self, room_id: &str, document_id: &str, client_id: Uuid) {
        self.post(
            room_id,
            "heartbeat",
            json!({ "document_id": document_id, "client_id": client_id }),
        );
    }

    /// Coarse cursor position for lobby views; distinct from the in-room
    /// awareness channel.
    pub fn update_cursor(&self, room_id: &str, client_id: Uuid, cursor: &CursorPos) {
        self.post(
            room_id,
            "cursor",
            json!({
                "client_id": client_id,
                "container": cursor.container,
                "index": cursor.index,
            }),
        );
    }

    /// Free-form room event, e.g. `("export_ready", {...})`.
    pub fn broadcast(&self, room_id: &str, client_id: Uuid, event_type: &str, data: serde_json::Value) {
        self.post(
            room_id,
            "broadcast",
            json!({ "client_id": client_id, "event": event_type, "data": data }),
        );
    }

    /// Spawn a retried POST; never blocks the caller.
    fn post(&self, room_id: &str, endpoint: &str, body: serde_json::Value) {
        let base = match &self.config.base_url {
            Some(base) => base.clone(),
            None => return,
        };
        let url = format!("{}/rooms/{}/{}", base.trim_end_matches('/'), room_id, endpoint);
        let client = self.client.clone();
        let retries = self.config.retries.max(1);
        let retry_delay = self.config.retry_delay;

        tokio::spawn(async move {
            for attempt in 1..=retries {
                let result = client.post(&url).json(&body).send().await;
                match result {
                    Ok(resp) if resp.status().is_success() => return,
                    Ok(resp) => {
                        log::debug!("registry POST {url} returned {}", resp.status());
                    }
                    Err(e) => {
                        log::debug!("registry POST {url} failed: {e}");
                    }
                }
                if attempt < retries {
                    tokio::time::sleep(retry_delay).await;
                }
            }
            log::warn!("registry POST {url} gave up after {retries} attempts");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_disabled() {
        let config = RegistryConfig::default();
        assert!(config.base_url.is_none());
        assert_eq!(config.retries, 3);
    }

    #[tokio::test]
    async fn test_disabled_registry_is_noop() {
        let registry = PresenceRegistry::new(RegistryConfig::default()).unwrap();
        assert!(!registry.enabled());
        // None of these should panic or spawn network work.
        registry.announce_join("room", "doc", Uuid::new_v4(), "Alice");
        registry.heartbeat("room", "doc", Uuid::new_v4());
        registry.announce_leave("room", "doc", Uuid::new_v4());
    }

    #[tokio::test]
    async fn test_unreachable_registry_does_not_block() {
        let registry =
            PresenceRegistry::new(RegistryConfig::for_testing("http://127.0.0.1:1")).unwrap();
        assert!(registry.enabled());
        // Fire-and-forget: returns immediately even though nothing listens.
        registry.announce_join("room", "doc", Uuid::new_v4(), "Alice");
        registry.update_cursor(
            "room",
            Uuid::new_v4(),
            &CursorPos {
                container: "body".into(),
                index: 3,
            },
        );
        registry.broadcast("room", Uuid::new_v4(), "hello", serde_json::json!({ "n": 1 }));
    }
}
