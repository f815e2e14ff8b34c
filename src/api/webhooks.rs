use crate::api::AppState;
use crate::services::webhook_processor::Verified;
use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use tracing::{info, warn};

const MAX_WEBHOOK_BODY: usize = 256 * 1024;

/// POST /payments/webhooks/{provider}
///
/// Acknowledges as soon as the delivery is verified; the ledger update runs
/// in the background.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    request: Request,
) -> Response {
    let peer = peer_address(&request);
    let headers = request.headers().clone();

    let body = match to_bytes(request.into_body(), MAX_WEBHOOK_BODY).await {
        Ok(body) => body,
        Err(e) => {
            warn!(provider = %provider, error = %e, "webhook body unreadable");
            return reject(StatusCode::BAD_REQUEST, "unreadable body");
        }
    };

    match state.webhooks.verify(&provider, peer, &headers, &body) {
        Ok(Verified::Fresh(event)) => {
            state.webhooks.dispatch(event);
            (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
        }
        Ok(Verified::Replay { event_id }) => {
            info!(provider = %provider, event_id = %event_id, "duplicate webhook acknowledged");
            (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
        }
        Err(e) => {
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
            reject(status, &e.to_string())
        }
    }
}

fn reject(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "rejected", "error": message })),
    )
        .into_response()
}

/// The socket peer when available, else the hop our own proxy appended.
fn peer_address(request: &Request) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip());
    }
    forwarded_for(request.headers())
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .rsplit(',')
        .next()
        .and_then(|entry| entry.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_forwarded_hop_is_used() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_for(&headers), None);

        headers.insert("x-forwarded-for", "198.51.100.1, 10.0.0.2".parse().unwrap());
        assert_eq!(forwarded_for(&headers), Some("10.0.0.2".parse().unwrap()));

        headers.insert("x-forwarded-for", "garbage".parse().unwrap());
        assert_eq!(forwarded_for(&headers), None);
    }
}
