use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::BillingState;
use crate::billing::{
    CancelOutcome, ChangeOutcome, CreateOutcome, PaymentGateway, ProrationBehavior,
    ProrationConfig, SubscriptionPlan, SubscriptionStore, SyncOutcome, UserDirectory,
    WebhookOutcome, WorkspaceAccessStatus,
};
use crate::error::{AppError, Result};

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Default, Deserialize)]
pub struct PlansQuery {
    pub country: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub user_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub country_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRequest {
    pub user_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub proration_behavior: Option<ProrationBehavior>,
    #[serde(default)]
    pub add_on_price_ids: Option<Vec<String>>,
    #[serde(default)]
    pub country_code: Option<String>,
}

impl ChangeRequest {
    fn proration_config(&self) -> ProrationConfig {
        ProrationConfig {
            behavior: self.proration_behavior.unwrap_or_default(),
            add_on_price_ids: self.add_on_price_ids.clone(),
            country_code: self.country_code.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub subscription_id: String,
    pub plan_id: String,
}

pub(super) async fn list_plans<S, D, G>(
    State(state): State<BillingState<S, D, G>>,
    Query(query): Query<PlansQuery>,
) -> Result<Json<Vec<SubscriptionPlan>>>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    let plans = state
        .lifecycle
        .catalog()
        .available_plans(query.country.as_deref())
        .await?;
    Ok(Json(plans))
}

pub(super) async fn create_subscription<S, D, G>(
    State(state): State<BillingState<S, D, G>>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateOutcome>>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    let outcome = state
        .lifecycle
        .create(&req.user_id, &req.plan_id, req.country_code.as_deref())
        .await?;
    Ok(Json(outcome))
}

pub(super) async fn change_subscription<S, D, G>(
    State(state): State<BillingState<S, D, G>>,
    Json(req): Json<ChangeRequest>,
) -> Result<Json<ChangeOutcome>>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    let config = req.proration_config();
    let outcome = state
        .lifecycle
        .change(&req.user_id, &req.plan_id, &config)
        .await?;
    Ok(Json(outcome))
}

pub(super) async fn cancel_subscription<S, D, G>(
    State(state): State<BillingState<S, D, G>>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancelOutcome>>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    Ok(Json(state.lifecycle.cancel(&req.user_id).await?))
}

pub(super) async fn sync_subscription<S, D, G>(
    State(state): State<BillingState<S, D, G>>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncOutcome>>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    Ok(Json(state.lifecycle.sync(&req.user_id).await?))
}

/// 204 when no preview could be computed.
pub(super) async fn proration_preview<S, D, G>(
    State(state): State<BillingState<S, D, G>>,
    Query(query): Query<PreviewQuery>,
) -> Response
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    match state
        .lifecycle
        .proration()
        .preview(&query.subscription_id, &query.plan_id)
        .await
    {
        Some(preview) => Json(preview).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub(super) async fn workspace_access<S, D, G>(
    State(state): State<BillingState<S, D, G>>,
    Path(workspace_id): Path<String>,
) -> Result<Json<WorkspaceAccessStatus>>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    Ok(Json(state.gate.status_for(&workspace_id).await?))
}

pub(super) async fn stripe_webhook<S, D, G>(
    State(state): State<BillingState<S, D, G>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_request("Missing Stripe-Signature header"))?;

    Ok(Json(state.webhooks.handle(&body, signature).await?))
}
