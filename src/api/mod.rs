//! HTTP surface.

pub mod health;
pub mod payments;
pub mod webhooks;

use crate::health::HealthChecker;
use crate::middleware::logging::{request_logging_middleware, UuidRequestId, REQUEST_ID_HEADER};
use crate::payments::types::ProviderName;
use crate::services::payment_orchestrator::PaymentOrchestrator;
use crate::services::webhook_processor::WebhookProcessor;
use axum::{
    routing::{get, post},
    Router,
};
use http::HeaderName;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: PaymentOrchestrator,
    pub webhooks: WebhookProcessor,
    pub health: HealthChecker,
    /// Merchant id per provider, embedded in generated QR codes
    pub qr_merchants: Arc<HashMap<ProviderName, String>>,
}

pub fn router(state: AppState) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    let payments = Router::new()
        .route("/deposit", post(payments::create_deposit))
        .route("/withdrawal", post(payments::create_withdrawal))
        .route("/transactions/{id}", get(payments::get_transaction))
        .route("/transactions/{id}/status", get(payments::get_transaction_status))
        .route("/transactions/{id}/cancel", post(payments::cancel_transaction))
        .route("/transactions/{id}/refund", post(payments::refund_transaction))
        .route(
            "/users/{user_id}/transactions",
            get(payments::list_user_transactions),
        )
        .route("/users/{user_id}/methods", get(payments::list_payment_methods))
        .route("/methods", post(payments::create_payment_method))
        .route("/methods/{id}/verify", post(payments::verify_payment_method))
        .route(
            "/methods/{id}/deactivate",
            post(payments::deactivate_payment_method),
        )
        .route("/qr-code", post(payments::generate_qr_code))
        .route("/providers", get(payments::list_providers))
        .route("/providers/{provider}/enable", post(payments::enable_provider))
        .route("/providers/{provider}/disable", post(payments::disable_provider))
        .route("/webhooks/{provider}", post(webhooks::handle_webhook));

    Router::new()
        .route("/health", get(health::health))
        .nest("/payments", payments)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::new(request_id)),
        )
        .with_state(state)
}
