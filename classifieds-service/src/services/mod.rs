pub mod connection;
pub mod database;
pub mod metrics;
pub mod reconnect;

pub use connection::{
    spawn_event_logger, ConnectOptions, ConnectionEvent, ConnectionManager, DriverNotifier,
    HealthReport, ReadyState, StoreConnector, StoreHandle, NOT_ACTUALLY_CONNECTED,
};
pub use database::{HeartbeatMonitor, MongoConnector, MongoStore};
pub use metrics::{get_metrics, init_metrics};
pub use reconnect::{reconnect, spawn_reconnect, ReconnectOutcome, RetryPolicy};
