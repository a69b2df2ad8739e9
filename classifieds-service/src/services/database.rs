use crate::models::USERS_COLLECTION;
use crate::services::connection::{ConnectOptions, DriverNotifier, StoreConnector, StoreHandle};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Bson, Document},
    error::{ErrorKind, WriteFailure},
    event::sdam::{SdamEventHandler, ServerHeartbeatFailedEvent, ServerHeartbeatSucceededEvent},
    options::{ClientOptions, FindOptions, IndexOptions},
    Client as MongoClient, Database, IndexModel,
};
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

const DUPLICATE_KEY_CODE: i32 = 11000;

/// Production [`StoreConnector`] backed by the official MongoDB driver.
#[derive(Clone, Default)]
pub struct MongoConnector;

#[async_trait]
impl StoreConnector for MongoConnector {
    async fn connect(
        &self,
        uri: &str,
        database: &str,
        options: &ConnectOptions,
        notifier: DriverNotifier,
    ) -> Result<Arc<dyn StoreHandle>, AppError> {
        let mut client_options = ClientOptions::parse(uri).await.map_err(|e| {
            tracing::error!("Failed to parse MongoDB connection string: {}", e);
            AppError::from(e)
        })?;

        client_options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        client_options.server_selection_timeout = Some(options.server_selection_timeout);
        client_options.max_pool_size = Some(options.max_pool_size);
        client_options.min_pool_size = options.min_pool_size;
        client_options.retry_writes = Some(options.retry_writes);
        client_options.retry_reads = Some(options.retry_reads);
        client_options.sdam_event_handler = Some(Arc::new(HeartbeatMonitor::new(notifier)));

        let host = client_options
            .hosts
            .first()
            .map(|address| address.to_string())
            .unwrap_or_default();
        // A database named in the URI wins over the configured default.
        let database_name = client_options
            .default_database
            .clone()
            .unwrap_or_else(|| database.to_string());

        let client = MongoClient::with_options(client_options)?;
        let store = MongoStore {
            db: client.database(&database_name),
            client,
            host,
            database_name,
        };

        // The driver connects lazily; a ping forces server selection so a
        // bad endpoint fails here instead of on the first request.
        store.ping().await?;
        store.initialize_indexes().await?;

        Ok(Arc::new(store))
    }
}

/// A connected MongoDB database.
#[derive(Clone)]
pub struct MongoStore {
    client: MongoClient,
    db: Database,
    host: String,
    database_name: String,
}

impl MongoStore {
    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for classifieds-service");

        let email_index = IndexModel::builder()
            .keys(doc! { "email": 1 })
            .options(
                IndexOptions::builder()
                    .name("email_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        self.db
            .collection::<Document>(USERS_COLLECTION)
            .create_index(email_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create users email index: {}", e);
                AppError::from(e)
            })?;

        Ok(())
    }
}

#[async_trait]
impl StoreHandle for MongoStore {
    fn host(&self) -> &str {
        &self.host
    }

    fn database_name(&self) -> &str {
        &self.database_name
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB ping failed: {}", e);
                AppError::from(e)
            })?;
        Ok(())
    }

    async fn insert_document(
        &self,
        collection: &str,
        document: Document,
    ) -> Result<String, AppError> {
        let result = self
            .db
            .collection::<Document>(collection)
            .insert_one(document, None)
            .await
            .map_err(|e| {
                if is_duplicate_key(&e) {
                    return AppError::Conflict(anyhow::anyhow!("Document already exists"));
                }
                tracing::error!(collection = %collection, "Failed to insert document: {}", e);
                AppError::from(e)
            })?;

        Ok(match result.inserted_id {
            Bson::ObjectId(id) => id.to_hex(),
            other => other.to_string(),
        })
    }

    async fn find_documents(
        &self,
        collection: &str,
        filter: Document,
        limit: i64,
    ) -> Result<Vec<Document>, AppError> {
        let find_options = FindOptions::builder()
            .sort(doc! { "_id": -1 })
            .limit(limit)
            .build();

        let cursor = self
            .db
            .collection::<Document>(collection)
            .find(filter, find_options)
            .await
            .map_err(|e| {
                tracing::error!(collection = %collection, "Failed to list documents: {}", e);
                AppError::from(e)
            })?;

        cursor.try_collect().await.map_err(|e| {
            tracing::error!(collection = %collection, "Failed to collect documents: {}", e);
            AppError::from(e)
        })
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, AppError> {
        self.db
            .collection::<Document>(collection)
            .find_one(filter, None)
            .await
            .map_err(|e| {
                tracing::error!(collection = %collection, "Failed to find document: {}", e);
                AppError::from(e)
            })
    }

    async fn shutdown(&self) {
        self.client.clone().shutdown().await;
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY_CODE
    )
}

/// Turns per-server heartbeats into whole-deployment availability.
///
/// One member of a replica set going quiet does not make the store
/// unavailable; an empty reachable set after any failure does.
pub struct HeartbeatMonitor {
    notifier: DriverNotifier,
    reachable: Mutex<HashSet<String>>,
}

impl HeartbeatMonitor {
    pub fn new(notifier: DriverNotifier) -> Self {
        Self {
            notifier,
            reachable: Mutex::new(HashSet::new()),
        }
    }

    pub fn record_success(&self, server: &str) {
        let mut reachable = self.reachable.lock().unwrap_or_else(PoisonError::into_inner);
        let was_empty = reachable.is_empty();
        reachable.insert(server.to_string());
        if was_empty {
            self.notifier.server_available();
        }
    }

    /// Readiness only flips on a real transition, so repeating the
    /// notification while already down is harmless.
    pub fn record_failure(&self, server: &str, failure: &str) {
        let mut reachable = self.reachable.lock().unwrap_or_else(PoisonError::into_inner);
        reachable.remove(server);
        if reachable.is_empty() {
            self.notifier.server_unavailable(failure);
        }
    }
}

impl SdamEventHandler for HeartbeatMonitor {
    fn handle_server_heartbeat_succeeded_event(&self, event: ServerHeartbeatSucceededEvent) {
        self.record_success(&event.server_address.to_string());
    }

    fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
        self.record_failure(&event.server_address.to_string(), &event.failure.to_string());
    }
}
