pub mod fallback;
pub mod metrics;
pub mod tracing;

pub use fallback::{not_found_handler, panic_response};
pub use metrics::metrics_middleware;
pub use tracing::{REQUEST_ID_HEADER, http_request_span, request_id_middleware};
