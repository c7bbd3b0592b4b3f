//! HTTP surface for the billing engine.
//!
//! Handlers translate JSON requests into lifecycle, gate and webhook calls
//! and map [`BillingError`](crate::billing::BillingError) through
//! [`AppError`](crate::error::AppError). Authentication is left to the host.

mod handlers;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::billing::{
    PaymentGateway, SubscriptionLifecycle, SubscriptionStore, UserDirectory,
    WebhookHandler, WorkspaceAccessGate,
};

pub use handlers::{
    CancelRequest, ChangeRequest, CreateRequest, PlansQuery, PreviewQuery, SyncRequest,
};

/// Shared state for the billing router.
pub struct BillingState<S, D, G>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    pub lifecycle: Arc<SubscriptionLifecycle<S, D, G>>,
    pub gate: Arc<WorkspaceAccessGate<S, D>>,
    pub webhooks: Arc<WebhookHandler<S, D, G>>,
}

impl<S, D, G> Clone for BillingState<S, D, G>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    fn clone(&self) -> Self {
        Self {
            lifecycle: self.lifecycle.clone(),
            gate: self.gate.clone(),
            webhooks: self.webhooks.clone(),
        }
    }
}

/// Build the billing router.
///
/// ```rust,ignore
/// let app = billing_router(BillingState { lifecycle, gate, webhooks });
/// axum::serve(listener, app).await?;
/// ```
pub fn billing_router<S, D, G>(state: BillingState<S, D, G>) -> Router
where
    S: SubscriptionStore + Clone + 'static,
    D: UserDirectory + 'static,
    G: PaymentGateway + Clone + 'static,
{
    Router::new()
        .route("/billing/plans", get(handlers::list_plans::<S, D, G>))
        .route("/billing/subscriptions", post(handlers::create_subscription::<S, D, G>))
        .route(
            "/billing/subscriptions/change",
            post(handlers::change_subscription::<S, D, G>),
        )
        .route(
            "/billing/subscriptions/cancel",
            post(handlers::cancel_subscription::<S, D, G>),
        )
        .route(
            "/billing/subscriptions/sync",
            post(handlers::sync_subscription::<S, D, G>),
        )
        .route(
            "/billing/proration-preview",
            get(handlers::proration_preview::<S, D, G>),
        )
        .route("/workspaces/{id}/access", get(handlers::workspace_access::<S, D, G>))
        .route("/billing/webhooks/stripe", post(handlers::stripe_webhook::<S, D, G>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
