use crate::services::{ConnectionManager, ReadyState};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

/// On-demand deployments only: make one connect attempt before the handler
/// runs whenever the store is not connected.
///
/// A failed attempt is logged and the request still proceeds; handlers that
/// need the store answer `503` on their own.
pub async fn cold_start_middleware(
    State(connection): State<ConnectionManager>,
    req: Request,
    next: Next,
) -> Response {
    let ready_state = connection.ready_state();
    if ready_state != ReadyState::Connected {
        tracing::info!(
            ready_state = %ready_state,
            path = %req.uri().path(),
            "Store not connected, connecting before handling request"
        );
        if let Err(e) = connection.connect().await {
            tracing::warn!(error = %e, "Cold-start connect failed");
        }
    }

    next.run(req).await
}
