//! Store connection lifecycle.
//!
//! [`ConnectionManager`] owns the single store handle of a process (or of a
//! test). It tracks readiness, serialises connect attempts, verifies liveness
//! on demand and broadcasts [`ConnectionEvent`]s to subscribers. The actual
//! driver sits behind the [`StoreConnector`] / [`StoreHandle`] seam so tests
//! can substitute in-memory fakes.

use crate::services::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::Document;
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use service_core::error::AppError;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const NOT_CONNECTED: &str = "Not connected";
/// Headline status when readiness claims a connection the probe disproves.
pub const NOT_ACTUALLY_CONNECTED: &str = "Not actually connected";

/// Readiness of the store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReadyState {
    Disconnected,
    Connected,
    Connecting,
    Disconnecting,
}

impl ReadyState {
    /// Numeric code reported alongside the name (0..=3).
    pub fn code(self) -> u8 {
        match self {
            ReadyState::Disconnected => 0,
            ReadyState::Connected => 1,
            ReadyState::Connecting => 2,
            ReadyState::Disconnecting => 3,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::Disconnected => "Disconnected",
            ReadyState::Connected => "Connected",
            ReadyState::Connecting => "Connecting",
            ReadyState::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// Driver options applied on every connect attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub server_selection_timeout: Duration,
    /// Upper bound for a single liveness probe round trip.
    pub socket_timeout: Duration,
    pub max_pool_size: u32,
    pub min_pool_size: Option<u32>,
    pub retry_writes: bool,
    pub retry_reads: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            server_selection_timeout: Duration::from_secs(30),
            socket_timeout: Duration::from_secs(45),
            max_pool_size: 10,
            min_pool_size: None,
            retry_writes: true,
            retry_reads: true,
        }
    }
}

/// Lifecycle notification broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Connected { host: String, database: String },
    Error { message: String },
    Disconnected,
}

/// A live connection to the document store.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    fn host(&self) -> &str;

    fn database_name(&self) -> &str;

    /// Round trip to the server; succeeds only if the store is usable.
    async fn ping(&self) -> Result<(), AppError>;

    /// Insert a document and return its id as a string.
    async fn insert_document(&self, collection: &str, document: Document)
        -> Result<String, AppError>;

    async fn find_documents(
        &self,
        collection: &str,
        filter: Document,
        limit: i64,
    ) -> Result<Vec<Document>, AppError>;

    async fn find_one(&self, collection: &str, filter: Document)
        -> Result<Option<Document>, AppError>;

    /// Close pooled connections. The handle must not be used afterwards.
    async fn shutdown(&self);
}

/// Opens store handles. One call is one connection attempt.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
        database: &str,
        options: &ConnectOptions,
        notifier: DriverNotifier,
    ) -> Result<Arc<dyn StoreHandle>, AppError>;
}

struct ConnectionState {
    ready_state: ReadyState,
    handle: Option<Arc<dyn StoreHandle>>,
}

struct Inner {
    uri: Option<Secret<String>>,
    database: String,
    options: ConnectOptions,
    connector: Arc<dyn StoreConnector>,
    state: RwLock<ConnectionState>,
    connect_lock: Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Inner {
    fn snapshot(&self) -> (ReadyState, Option<Arc<dyn StoreHandle>>) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        (state.ready_state, state.handle.clone())
    }

    fn set_state(&self, ready_state: ReadyState, handle: Option<Arc<dyn StoreHandle>>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.ready_state = ready_state;
        state.handle = handle;
        metrics::set_ready_state(ready_state);
    }

    /// Flip readiness without touching the handle; returns whether it changed.
    fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.ready_state != from || state.handle.is_none() {
            return false;
        }
        state.ready_state = to;
        metrics::set_ready_state(to);
        true
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Callback surface handed to the driver so that asynchronous server
/// monitoring can update readiness after the initial connect.
///
/// Holds a weak reference: a driver outliving its manager is a no-op.
#[derive(Clone)]
pub struct DriverNotifier {
    inner: Weak<Inner>,
}

impl DriverNotifier {
    /// The driver reached a server again after losing all of them.
    pub fn server_available(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.transition(ReadyState::Disconnected, ReadyState::Connected) {
            if let (_, Some(handle)) = inner.snapshot() {
                tracing::info!(host = %handle.host(), "Store connection restored");
                inner.emit(ConnectionEvent::Connected {
                    host: handle.host().to_string(),
                    database: handle.database_name().to_string(),
                });
            }
        }
    }

    /// The driver can no longer reach any server.
    pub fn server_unavailable(&self, message: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.transition(ReadyState::Connected, ReadyState::Disconnected) {
            tracing::warn!(error = %message, "Store connection lost");
            inner.emit(ConnectionEvent::Error {
                message: message.to_string(),
            });
            inner.emit(ConnectionEvent::Disconnected);
        }
    }
}

/// Snapshot returned by [`ConnectionManager::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub server: &'static str,
    /// Headline status: the readiness name, or [`NOT_ACTUALLY_CONNECTED`]
    /// when the liveness probe failed.
    pub database: String,
    pub ready_state: u8,
    pub actually_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_error: Option<String>,
    pub database_host: String,
    pub database_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Owner of the process' store connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        uri: Option<Secret<String>>,
        database: impl Into<String>,
        options: ConnectOptions,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        metrics::set_ready_state(ReadyState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                uri,
                database: database.into(),
                options,
                connector,
                state: RwLock::new(ConnectionState {
                    ready_state: ReadyState::Disconnected,
                    handle: None,
                }),
                connect_lock: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.snapshot().0
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    pub fn has_uri(&self) -> bool {
        self.inner.uri.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The current handle if readiness is `Connected`.
    pub fn connected_handle(&self) -> Option<Arc<dyn StoreHandle>> {
        match self.inner.snapshot() {
            (ReadyState::Connected, handle) => handle,
            _ => None,
        }
    }

    /// Handle for request handlers; `ServiceUnavailable` when not connected.
    pub fn store(&self) -> Result<Arc<dyn StoreHandle>, AppError> {
        self.connected_handle().ok_or(AppError::ServiceUnavailable)
    }

    /// Connect to the store unless already connected.
    ///
    /// Returns `Ok(None)` without attempting anything when no URI is
    /// configured. Concurrent callers wait for the attempt in flight and
    /// then observe its result instead of starting their own.
    pub async fn connect(&self) -> Result<Option<Arc<dyn StoreHandle>>, AppError> {
        let Some(uri) = self.inner.uri.as_ref() else {
            tracing::error!("MONGODB_URI not set, skipping store connection");
            return Ok(None);
        };

        if let Some(handle) = self.connected_handle() {
            return Ok(Some(handle));
        }

        let _guard = self.inner.connect_lock.lock().await;
        if let Some(handle) = self.connected_handle() {
            return Ok(Some(handle));
        }

        tracing::info!(database = %self.inner.database, "Connecting to MongoDB");
        // A stale handle (driver lost every server) is closed before the new
        // attempt so its monitor cannot touch the replacement's readiness.
        let (_, stale) = self.inner.snapshot();
        self.inner.set_state(ReadyState::Connecting, None);
        if let Some(stale) = stale {
            tracing::info!(host = %stale.host(), "Closing stale store handle");
            stale.shutdown().await;
        }
        self.inner.emit(ConnectionEvent::Connecting);
        metrics::record_connect_attempt();

        let notifier = DriverNotifier {
            inner: Arc::downgrade(&self.inner),
        };
        match self
            .inner
            .connector
            .connect(
                uri.expose_secret(),
                &self.inner.database,
                &self.inner.options,
                notifier,
            )
            .await
        {
            Ok(handle) => {
                tracing::info!(
                    host = %handle.host(),
                    database = %handle.database_name(),
                    ready_state = ReadyState::Connected.code(),
                    "MongoDB connected"
                );
                self.inner
                    .set_state(ReadyState::Connected, Some(handle.clone()));
                self.inner.emit(ConnectionEvent::Connected {
                    host: handle.host().to_string(),
                    database: handle.database_name().to_string(),
                });
                Ok(Some(handle))
            }
            Err(e) => {
                tracing::error!(error = %e, "MongoDB connection failed");
                metrics::record_connect_failure();
                self.inner.set_state(ReadyState::Disconnected, None);
                self.inner.emit(ConnectionEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Close the connection, passing through `Disconnecting`.
    pub async fn disconnect(&self) {
        let _guard = self.inner.connect_lock.lock().await;
        let (_, handle) = self.inner.snapshot();
        let Some(handle) = handle else {
            self.inner.set_state(ReadyState::Disconnected, None);
            return;
        };

        tracing::info!(host = %handle.host(), "Disconnecting from MongoDB");
        self.inner
            .set_state(ReadyState::Disconnecting, Some(handle.clone()));
        handle.shutdown().await;
        self.inner.set_state(ReadyState::Disconnected, None);
        self.inner.emit(ConnectionEvent::Disconnected);
    }

    /// Report readiness and, when readiness claims `Connected`, verify it
    /// with a ping bounded by the socket timeout.
    pub async fn health_check(&self) -> HealthReport {
        let (ready_state, handle) = self.inner.snapshot();

        let (actually_connected, probe_error) = match (ready_state, handle.as_ref()) {
            (ReadyState::Connected, Some(handle)) => {
                match tokio::time::timeout(self.inner.options.socket_timeout, handle.ping()).await
                {
                    Ok(Ok(())) => (true, None),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Liveness probe failed");
                        (false, Some(e.to_string()))
                    }
                    Err(_) => {
                        let message = format!(
                            "Liveness probe timed out after {}ms",
                            self.inner.options.socket_timeout.as_millis()
                        );
                        tracing::warn!("{}", message);
                        (false, Some(message))
                    }
                }
            }
            _ => (false, None),
        };

        let database = if probe_error.is_some() {
            NOT_ACTUALLY_CONNECTED.to_string()
        } else {
            ready_state.to_string()
        };

        HealthReport {
            server: "Running",
            database,
            ready_state: ready_state.code(),
            actually_connected,
            probe_error,
            database_host: handle
                .as_ref()
                .map(|h| h.host().to_string())
                .unwrap_or_else(|| NOT_CONNECTED.to_string()),
            database_name: handle
                .as_ref()
                .map(|h| h.database_name().to_string())
                .unwrap_or_else(|| NOT_CONNECTED.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Log every lifecycle event until the manager is dropped.
pub fn spawn_event_logger(manager: &ConnectionManager) -> tokio::task::JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Connecting) => tracing::debug!("store event: connecting"),
                Ok(ConnectionEvent::Connected { host, database }) => {
                    tracing::info!(host = %host, database = %database, "store event: connected")
                }
                Ok(ConnectionEvent::Error { message }) => {
                    tracing::error!(error = %message, "store event: error")
                }
                Ok(ConnectionEvent::Disconnected) => tracing::warn!("store event: disconnected"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "store event logger lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubHandle {
        ping_ok: AtomicBool,
    }

    #[async_trait]
    impl StoreHandle for StubHandle {
        fn host(&self) -> &str {
            "stub-host:27017"
        }

        fn database_name(&self) -> &str {
            "stub_db"
        }

        async fn ping(&self) -> Result<(), AppError> {
            if self.ping_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(AppError::DatabaseError(anyhow::anyhow!("server selection timeout")))
            }
        }

        async fn insert_document(&self, _: &str, _: Document) -> Result<String, AppError> {
            Ok("id".to_string())
        }

        async fn find_documents(&self, _: &str, _: Document, _: i64) -> Result<Vec<Document>, AppError> {
            Ok(Vec::new())
        }

        async fn find_one(&self, _: &str, _: Document) -> Result<Option<Document>, AppError> {
            Ok(None)
        }

        async fn shutdown(&self) {}
    }

    #[derive(Default)]
    struct StubConnector {
        calls: AtomicUsize,
        fail: AtomicBool,
        notifier: std::sync::Mutex<Option<DriverNotifier>>,
    }

    #[async_trait]
    impl StoreConnector for StubConnector {
        async fn connect(
            &self,
            _uri: &str,
            _database: &str,
            _options: &ConnectOptions,
            notifier: DriverNotifier,
        ) -> Result<Arc<dyn StoreHandle>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.notifier.lock().unwrap() = Some(notifier);
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::DatabaseError(anyhow::anyhow!("connection refused")));
            }
            Ok(Arc::new(StubHandle {
                ping_ok: AtomicBool::new(true),
            }))
        }
    }

    fn manager(connector: Arc<StubConnector>) -> ConnectionManager {
        ConnectionManager::new(
            Some(Secret::new("mongodb://stub".to_string())),
            "stub_db",
            ConnectOptions::default(),
            connector,
        )
    }

    #[test]
    fn test_ready_state_codes() {
        assert_eq!(ReadyState::Disconnected.code(), 0);
        assert_eq!(ReadyState::Connected.code(), 1);
        assert_eq!(ReadyState::Connecting.code(), 2);
        assert_eq!(ReadyState::Disconnecting.code(), 3);
        assert_eq!(ReadyState::Connecting.to_string(), "Connecting");
    }

    #[test]
    fn test_connect_options_default() {
        let options = ConnectOptions::default();
        assert_eq!(options.server_selection_timeout, Duration::from_secs(30));
        assert_eq!(options.socket_timeout, Duration::from_secs(45));
        assert_eq!(options.max_pool_size, 10);
        assert!(options.retry_writes && options.retry_reads);
    }

    #[tokio::test]
    async fn test_connect_without_uri_is_soft_failure() {
        let connector = Arc::new(StubConnector::default());
        let manager = ConnectionManager::new(
            None,
            "stub_db",
            ConnectOptions::default(),
            connector.clone(),
        );

        let result = manager.connect().await;
        assert!(matches!(result, Ok(None)));
        assert_eq!(manager.ready_state(), ReadyState::Disconnected);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let connector = Arc::new(StubConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let manager = manager(connector.clone());
        let mut events = manager.subscribe();

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.ready_state(), ReadyState::Disconnected);
        assert!(matches!(manager.store(), Err(AppError::ServiceUnavailable)));

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connecting);
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Error { message } if message.contains("connection refused")
        ));
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let connector = Arc::new(StubConnector::default());
        let manager = manager(connector.clone());

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_some());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_driver_notifications_flip_readiness() {
        let connector = Arc::new(StubConnector::default());
        let manager = manager(connector.clone());
        manager.connect().await.unwrap();
        let mut events = manager.subscribe();

        let notifier = connector.notifier.lock().unwrap().clone().unwrap();
        notifier.server_unavailable("heartbeat failed");
        assert_eq!(manager.ready_state(), ReadyState::Disconnected);
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Error { .. }));
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);

        // Repeated failures while already down are not re-announced.
        notifier.server_unavailable("heartbeat failed");

        notifier.server_available();
        assert_eq!(manager.ready_state(), ReadyState::Connected);
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn test_notifier_outliving_manager_is_noop() {
        let connector = Arc::new(StubConnector::default());
        let manager = manager(connector.clone());
        manager.connect().await.unwrap();
        drop(manager);

        let notifier = connector.notifier.lock().unwrap().clone().unwrap();
        notifier.server_unavailable("gone");
        notifier.server_available();
    }

    #[tokio::test]
    async fn test_disconnect_clears_handle() {
        let connector = Arc::new(StubConnector::default());
        let manager = manager(connector);
        manager.connect().await.unwrap();
        let mut events = manager.subscribe();

        manager.disconnect().await;
        assert_eq!(manager.ready_state(), ReadyState::Disconnected);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);

        let report = manager.health_check().await;
        assert_eq!(report.database_host, NOT_CONNECTED);
        assert!(!report.actually_connected);
    }
}
