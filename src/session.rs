//! Session storage.
//!
//! Everything expensive (rendering, segmentation, OCR, prefill) happens once
//! at upload time and is frozen into a [`SessionBundle`]. Extraction requests
//! only ever read the bundle, so any number of them can run concurrently
//! against the same session, and cancelling one cannot corrupt anything.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use schemars::JsonSchema;
use tokio::{sync::RwLock, task::JoinHandle};
use uuid::Uuid;

use crate::{
    error::ExtractError,
    layout::{BoundingBox, RegionKind},
    prelude::*,
};

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id.
    pub fn generate() -> SessionId {
        SessionId(Uuid::new_v4().to_string())
    }

    /// Wrap an id received from a caller.
    pub fn from_raw(raw: impl Into<String>) -> SessionId {
        SessionId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Summary of one processed page.
#[derive(Debug, Clone)]
pub struct PageSummary {
    /// 0-based page index.
    pub index: usize,
    pub width: u32,
    pub height: u32,
}

/// Summary of one recognized region.
#[derive(Debug, Clone)]
pub struct RegionSummary {
    /// 0-based index of the page this region belongs to.
    pub page_index: usize,
    /// 1-based reading-order index within the page.
    pub index: usize,
    pub kind: RegionKind,
    pub bbox: BoundingBox,
    /// Recognized text, capped to the configured length at creation.
    pub text: String,
    /// Length of the full recognized text, before capping.
    pub chars: usize,
}

/// Everything computed at upload time. Immutable once stored.
#[derive(Debug, Default)]
pub struct SessionData {
    pub pages: Vec<PageSummary>,
    pub regions: Vec<RegionSummary>,
    /// Cleaned, marker-annotated text of the whole document.
    pub aggregate_text: String,
    /// Deterministic prefill values, keyed by canonical field name.
    pub prefill: BTreeMap<String, String>,
}

/// A stored session.
#[derive(Debug)]
pub struct SessionBundle {
    pub id: SessionId,
    pub created_at: Instant,
    pub data: SessionData,
}

/// Interface to session storage.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Store a new session under a freshly generated id.
    async fn create(&self, data: SessionData) -> SessionId;

    /// Look up a live session. Unknown ids and sessions past the retention
    /// window both come back as [`ExtractError::SessionNotFound`].
    async fn get(&self, id: &SessionId) -> Result<Arc<SessionBundle>, ExtractError>;

    /// Drop expired sessions, returning how many were removed.
    async fn purge_expired(&self) -> usize;
}

/// In-memory session store with a retention window.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionBundle>>>,
    retention: Duration,
}

impl InMemorySessionStore {
    pub fn new(retention: Duration) -> InMemorySessionStore {
        InMemorySessionStore {
            sessions: RwLock::new(HashMap::new()),
            retention,
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, data: SessionData) -> SessionId {
        let mut sessions = self.sessions.write().await;
        // UUID collisions are vanishingly rare, but an id must never point
        // at two different uploads.
        let id = loop {
            let id = SessionId::generate();
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        let bundle = SessionBundle {
            id: id.clone(),
            created_at: Instant::now(),
            data,
        };
        sessions.insert(id.clone(), Arc::new(bundle));
        id
    }

    async fn get(&self, id: &SessionId) -> Result<Arc<SessionBundle>, ExtractError> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            // An expired session is invisible even if the sweeper has not
            // gotten to it yet.
            Some(bundle) if bundle.created_at.elapsed() <= self.retention => {
                Ok(bundle.clone())
            }
            _ => Err(ExtractError::SessionNotFound(id.clone())),
        }
    }

    async fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, bundle| bundle.created_at.elapsed() <= self.retention);
        before - sessions.len()
    }
}

/// Handle for the background expiry sweeper. Aborts the sweeper when
/// dropped.
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn a task that purges expired sessions on a fixed interval,
/// independently of request handling.
pub fn spawn_expiry_sweeper(
    store: Arc<dyn SessionStore>,
    every: Duration,
) -> SweeperHandle {
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let purged = store.purge_expired().await;
            if purged > 0 {
                debug!(purged, "Purged expired sessions");
            }
        }
    });
    SweeperHandle { handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(text: &str) -> SessionData {
        SessionData {
            aggregate_text: text.to_owned(),
            ..SessionData::default()
        }
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        let id = store.create(sample_data("hello")).await;
        let bundle = store.get(&id).await.unwrap();
        assert_eq!(bundle.id, id);
        assert_eq!(bundle.data.aggregate_text, "hello");
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        let err = store.get(&SessionId::from_raw("no-such-session")).await;
        assert!(matches!(err, Err(ExtractError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn sessions_expire_after_the_retention_window() {
        let store = InMemorySessionStore::new(Duration::ZERO);
        let id = store.create(sample_data("short-lived")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = store.get(&id).await;
        assert!(matches!(err, Err(ExtractError::SessionNotFound(_))));
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn live_sessions_survive_purging() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        let first = store.create(sample_data("a")).await;
        let second = store.create(sample_data("b")).await;
        assert_ne!(first, second);
        assert_eq!(store.purge_expired().await, 0);
        assert!(store.get(&first).await.is_ok());
        assert!(store.get(&second).await.is_ok());
    }

    #[tokio::test]
    async fn sweeper_purges_in_the_background() {
        let store: Arc<dyn SessionStore> =
            Arc::new(InMemorySessionStore::new(Duration::ZERO));
        let id = store.create(sample_data("doomed")).await;
        let _sweeper = spawn_expiry_sweeper(store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            store.get(&id).await,
            Err(ExtractError::SessionNotFound(_))
        ));
        assert_eq!(store.purge_expired().await, 0);
    }
}
