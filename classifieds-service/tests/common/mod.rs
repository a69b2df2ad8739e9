#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use classifieds_service::config::{ClassifiedsConfig, DeploymentMode};
use classifieds_service::services::{
    ConnectOptions, ConnectionManager, DriverNotifier, StoreConnector, StoreHandle,
};
use classifieds_service::startup::{build_router, AppState};
use http_body_util::BodyExt;
use mongodb::bson::{oid::ObjectId, Document};
use service_core::config::Config as CoreConfig;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tower::util::ServiceExt;

pub const TEST_URI: &str = "mongodb://fake-host:27017/classifieds_test";
pub const TEST_HOST: &str = "fake-host:27017";
pub const TEST_DATABASE: &str = "classifieds_test";

/// In-memory document store.
pub struct FakeStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    pub ping_ok: AtomicBool,
    pub panic_on_list: AtomicBool,
    pub shut_down: AtomicBool,
}

impl FakeStore {
    fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            ping_ok: AtomicBool::new(true),
            panic_on_list: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, value)| document.get(key) == Some(value))
}

#[async_trait]
impl StoreHandle for FakeStore {
    fn host(&self) -> &str {
        TEST_HOST
    }

    fn database_name(&self) -> &str {
        TEST_DATABASE
    }

    async fn ping(&self) -> Result<(), AppError> {
        if self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::DatabaseError(anyhow::anyhow!(
                "Server selection timeout: No available servers"
            )))
        }
    }

    async fn insert_document(
        &self,
        collection: &str,
        mut document: Document,
    ) -> Result<String, AppError> {
        let mut collections = self.collections.lock().unwrap();
        let documents = collections.entry(collection.to_string()).or_default();

        if collection == "users" {
            let email = document.get("email");
            if documents.iter().any(|d| d.get("email") == email) {
                return Err(AppError::Conflict(anyhow::anyhow!("Document already exists")));
            }
        }

        let id = ObjectId::new();
        document.insert("_id", id);
        documents.push(document);
        Ok(id.to_hex())
    }

    async fn find_documents(
        &self,
        collection: &str,
        filter: Document,
        limit: i64,
    ) -> Result<Vec<Document>, AppError> {
        if self.panic_on_list.load(Ordering::SeqCst) {
            panic!("cursor exploded: secret-internal-detail");
        }
        Ok(self
            .documents(collection)
            .into_iter()
            .rev()
            .filter(|d| matches(d, &filter))
            .take(limit as usize)
            .collect())
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, AppError> {
        Ok(self
            .documents(collection)
            .into_iter()
            .find(|d| matches(d, &filter)))
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Connector that fails a configurable number of times before succeeding.
pub struct FakeConnector {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    attempts: Mutex<Vec<Instant>>,
    notifier: Mutex<Option<DriverNotifier>>,
    pub store: Arc<FakeStore>,
}

impl FakeConnector {
    pub fn reachable() -> Arc<Self> {
        Self::reachable_after(0)
    }

    pub fn reachable_after(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
            notifier: Mutex::new(None),
            store: Arc::new(FakeStore::new()),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Self::reachable_after(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn make_reachable(&self) {
        self.failures_left.store(0, Ordering::SeqCst);
    }

    pub fn notifier(&self) -> Option<DriverNotifier> {
        self.notifier.lock().unwrap().clone()
    }
}

#[async_trait]
impl StoreConnector for FakeConnector {
    async fn connect(
        &self,
        uri: &str,
        _database: &str,
        _options: &ConnectOptions,
        notifier: DriverNotifier,
    ) -> Result<Arc<dyn StoreHandle>, AppError> {
        assert_eq!(uri, TEST_URI);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().unwrap().push(Instant::now());
        *self.notifier.lock().unwrap() = Some(notifier);

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                (left > 0).then(|| left.saturating_sub(1))
            })
            .is_ok();
        if failing {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "connection refused (fake-host:27017)"
            )));
        }

        Ok(self.store.clone())
    }
}

pub fn test_config(mode: DeploymentMode, vars: &[(&str, &str)]) -> ClassifiedsConfig {
    let mut env: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mode = match mode {
        DeploymentMode::LongRunning => "long-running",
        DeploymentMode::OnDemand => "on-demand",
    };
    env.insert("DEPLOYMENT_MODE".to_string(), mode.to_string());

    ClassifiedsConfig::from_lookup(CoreConfig { port: 0 }, |key| env.get(key).cloned())
        .expect("Failed to build test configuration")
}

pub fn manager(uri: Option<&str>, connector: Arc<FakeConnector>) -> ConnectionManager {
    ConnectionManager::new(
        uri.map(|u| secrecy::Secret::new(u.to_string())),
        TEST_DATABASE,
        ConnectOptions::default(),
        connector,
    )
}

/// Router plus handles to its state and fake connector.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub connector: Arc<FakeConnector>,
}

impl TestApp {
    pub fn new(mode: DeploymentMode, connector: Arc<FakeConnector>) -> Self {
        Self::with_vars(mode, connector, &[("MONGODB_URI", TEST_URI)])
    }

    pub fn with_vars(
        mode: DeploymentMode,
        connector: Arc<FakeConnector>,
        vars: &[(&str, &str)],
    ) -> Self {
        let state = AppState::new(test_config(mode, vars), connector.clone());
        let router = build_router(state.clone());
        Self {
            router,
            state,
            connector,
        }
    }

    /// Long-running app whose store is already connected.
    pub async fn connected() -> Self {
        let app = Self::new(DeploymentMode::LongRunning, FakeConnector::reachable());
        app.state
            .connection
            .connect()
            .await
            .expect("Failed to connect fake store");
        app
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let (status, bytes) = self.raw_request(method, uri, body).await;
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    pub async fn raw_request(
        &self,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        self.request(Method::POST, uri, Some(body)).await
    }
}
