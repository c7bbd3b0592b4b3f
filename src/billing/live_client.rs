//! Live Stripe gateway.
//!
//! Reads are retried with exponential backoff. Mutations run once under the
//! request timeout and always carry an idempotency key, so a caller that
//! retries a failed mutation cannot double-charge.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::checkout::{CheckoutSession, CreateCheckoutSessionRequest, StripeCheckoutClient};
use super::client::{GatewayPrice, StripePriceClient};
use super::customer::{CreateCustomerRequest, GatewayCustomer, META_USER_ID, StripeCustomerClient};
use super::error::{BillingError, Result};
use super::invoice::{InvoicePreview, InvoicePreviewLine, StripeInvoiceClient, UpcomingInvoiceRequest};
use super::subscription::{
    GatewaySubscription, GatewaySubscriptionItem, ProrationBehavior, StripeSubscriptionClient,
    SubscriptionItemUpdate, UpdateSubscriptionRequest,
};

/// Metadata key carrying the variant id on checkout sessions and subscriptions.
const META_PLAN_ID: &str = "plan_id";

const DEFAULT_API_BASE: &str = "https://api.stripe.com";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the live Stripe client.
#[derive(Debug, Clone)]
pub struct LiveStripeClientConfig {
    /// Maximum number of retry attempts for transient read failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
    /// Base URL for the raw HTTP calls the SDK does not cover.
    pub api_base: String,
}

impl Default for LiveStripeClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 30,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl LiveStripeClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }
}

// ============================================================================
// API Key Validation
// ============================================================================

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    pub reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid Stripe API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

impl From<InvalidApiKeyError> for BillingError {
    fn from(err: InvalidApiKeyError) -> Self {
        BillingError::configuration(err.to_string())
    }
}

/// Secret (`sk_`) and restricted (`rk_`) keys in either mode are accepted.
fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_"
                .to_string(),
        });
    }

    Ok(())
}

fn parse_customer_id(id: &str) -> Result<stripe::CustomerId> {
    id.parse()
        .map_err(|_| BillingError::invalid_input(format!("Invalid customer ID: {}", id)))
}

fn parse_subscription_id(id: &str) -> Result<stripe::SubscriptionId> {
    id.parse()
        .map_err(|_| BillingError::invalid_input(format!("Invalid subscription ID: {}", id)))
}

fn parse_price_id(id: &str) -> Result<stripe::PriceId> {
    id.parse()
        .map_err(|_| BillingError::invalid_input(format!("Invalid price ID: {}", id)))
}

// ============================================================================
// Live Stripe Client
// ============================================================================

/// Stripe implementation of every gateway trait.
///
/// ```rust,ignore
/// let gateway = LiveStripeClient::new(config.stripe_secret_key.clone(), LiveStripeClientConfig::default())?;
/// let lifecycle = SubscriptionLifecycle::new(store, directory, gateway, catalog, checkout);
/// ```
#[derive(Clone)]
pub struct LiveStripeClient {
    client: stripe::Client,
    http: reqwest::Client,
    config: LiveStripeClientConfig,
    api_key: SecretString,
}

impl LiveStripeClient {
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn new(
        api_key: impl Into<SecretString>,
        config: LiveStripeClientConfig,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        let client = stripe::Client::new(api_key.expose_secret()).with_app_info(
            "workspace-billing".to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );

        Ok(Self {
            client,
            http: reqwest::Client::new(),
            config,
            api_key,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn with_default_config(
        api_key: impl Into<SecretString>,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        Self::new(api_key, LiveStripeClientConfig::default())
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    #[must_use]
    pub fn is_live_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_live_") || key.starts_with("rk_live_")
    }

    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    #[inline]
    fn generate_idempotency_key(operation: &str) -> String {
        format!("{}_{}", operation, uuid::Uuid::new_v4())
    }

    /// A client that sends a fresh idempotency key with every request.
    #[inline]
    fn idempotent_client(&self, operation: &str) -> stripe::Client {
        let key = Self::generate_idempotency_key(operation);
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key))
    }
}

impl std::fmt::Debug for LiveStripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeClient")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Retry Logic
// ============================================================================

/// Failures from either transport that the retry loop can classify.
trait GatewayFailure: std::fmt::Display {
    fn is_transient(&self) -> bool;
    fn into_billing_error(self, operation: &str) -> BillingError;
}

impl GatewayFailure for stripe::StripeError {
    fn is_transient(&self) -> bool {
        is_retryable_error(self)
    }

    fn into_billing_error(self, operation: &str) -> BillingError {
        map_stripe_error(self, operation)
    }
}

fn timeout_error(operation: &str, seconds: u64) -> BillingError {
    BillingError::Gateway {
        operation: operation.to_string(),
        message: format!("Request timed out after {} seconds", seconds),
        code: None,
        http_status: Some(408),
    }
}

/// Retry a read on 429, 5xx and timeouts.
async fn with_retry<T, E, F, Fut>(
    config: &LiveStripeClientConfig,
    operation: &str,
    operation_fn: F,
) -> Result<T>
where
    E: GatewayFailure,
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
{
    let timeout_duration = Duration::from_secs(config.timeout_seconds);
    let mut attempts = 0;

    loop {
        let result = tokio::time::timeout(timeout_duration, operation_fn()).await;

        match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                if !e.is_transient() || attempts >= config.max_retries {
                    return Err(e.into_billing_error(operation));
                }
                log_retry(operation, attempts, &e, config);
                sleep_with_backoff(attempts, config).await;
                attempts += 1;
            }
            Err(_timeout) => {
                if attempts >= config.max_retries {
                    return Err(timeout_error(operation, config.timeout_seconds));
                }

                tracing::warn!(
                    target: "workspace_billing::billing::stripe",
                    operation = operation,
                    attempt = attempts + 1,
                    timeout_seconds = config.timeout_seconds,
                    "Stripe API request timed out, retrying"
                );

                sleep_with_backoff(attempts, config).await;
                attempts += 1;
            }
        }
    }
}

/// Run a mutation exactly once under the request timeout.
async fn once<T, Fut>(config: &LiveStripeClientConfig, operation: &str, fut: Fut) -> Result<T>
where
    Fut: std::future::Future<Output = std::result::Result<T, stripe::StripeError>>,
{
    match tokio::time::timeout(Duration::from_secs(config.timeout_seconds), fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            let err = map_stripe_error(e, operation);
            tracing::error!(
                target: "workspace_billing::billing::stripe",
                operation = operation,
                error = %err,
                "Stripe mutation failed"
            );
            Err(err)
        }
        Err(_timeout) => Err(timeout_error(operation, config.timeout_seconds)),
    }
}

#[inline]
fn log_retry(
    operation: &str,
    attempts: u32,
    error: &dyn std::fmt::Display,
    config: &LiveStripeClientConfig,
) {
    let delay = calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
    tracing::warn!(
        target: "workspace_billing::billing::stripe",
        operation = operation,
        attempt = attempts + 1,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Retrying Stripe API call after transient error"
    );
}

#[inline]
async fn sleep_with_backoff(attempts: u32, config: &LiveStripeClientConfig) {
    let delay = calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
    tokio::time::sleep(delay).await;
}

#[inline]
fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[inline]
fn is_retryable_error(error: &stripe::StripeError) -> bool {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            is_retryable_status(request_error.http_status)
        }
        stripe::StripeError::Timeout => true,
        _ => false,
    }
}

/// Exponential backoff with 0-25% jitter.
#[inline]
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

// ============================================================================
// Error Mapping
// ============================================================================

fn map_stripe_error(error: stripe::StripeError, operation: &str) -> BillingError {
    let gateway = |message: String, http_status: Option<u16>| BillingError::Gateway {
        operation: operation.to_string(),
        message,
        code: None,
        http_status,
    };

    match error {
        stripe::StripeError::Stripe(request_error) => BillingError::Gateway {
            operation: operation.to_string(),
            message: request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string()),
            code: request_error.code.as_ref().map(|c| format!("{c:?}")),
            http_status: Some(request_error.http_status),
        },
        stripe::StripeError::QueryStringSerialize(e) => {
            gateway(format!("Failed to serialize request: {e}"), None)
        }
        stripe::StripeError::JSONSerialize(e) => {
            gateway(format!("Failed to serialize JSON: {e}"), None)
        }
        stripe::StripeError::UnsupportedVersion => {
            BillingError::configuration("Unsupported Stripe API version")
        }
        stripe::StripeError::ClientError(msg) => gateway(format!("HTTP client error: {msg}"), None),
        stripe::StripeError::Timeout => gateway("Request timed out".to_string(), Some(408)),
    }
}

// ============================================================================
// Raw HTTP (upcoming invoice)
// ============================================================================

/// Failure of a raw HTTP call to the Stripe API.
#[derive(Debug)]
enum HttpFailure {
    Transport(reqwest::Error),
    Api {
        status: u16,
        message: String,
        code: Option<String>,
    },
}

impl std::fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "HTTP client error: {}", e),
            Self::Api { status, message, .. } => write!(f, "[HTTP {}] {}", status, message),
        }
    }
}

impl GatewayFailure for HttpFailure {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => is_retryable_status(*status),
        }
    }

    fn into_billing_error(self, operation: &str) -> BillingError {
        match self {
            Self::Transport(e) => BillingError::Gateway {
                operation: operation.to_string(),
                message: format!("HTTP client error: {e}"),
                code: None,
                http_status: e.status().map(|s| s.as_u16()),
            },
            Self::Api { status, message, code } => BillingError::Gateway {
                operation: operation.to_string(),
                message,
                code,
                http_status: Some(status),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpcomingInvoiceBody {
    currency: String,
    amount_due: i64,
    total: i64,
    #[serde(default)]
    period_end: Option<i64>,
    lines: UpcomingInvoiceLines,
}

#[derive(Debug, Deserialize)]
struct UpcomingInvoiceLines {
    #[serde(default)]
    data: Vec<InvoicePreviewLine>,
}

impl From<UpcomingInvoiceBody> for InvoicePreview {
    fn from(body: UpcomingInvoiceBody) -> Self {
        InvoicePreview {
            currency: body.currency.to_lowercase(),
            amount_due: body.amount_due,
            total: body.total,
            lines: body.lines.data,
            period_end: body.period_end.map(to_unix),
        }
    }
}

/// Form-style query pairs for `GET /v1/invoices/upcoming`.
fn upcoming_invoice_query(request: &UpcomingInvoiceRequest) -> Vec<(String, String)> {
    let mut pairs = vec![
        ("customer".to_string(), request.customer_id.clone()),
        ("subscription".to_string(), request.subscription_id.clone()),
        (
            "subscription_proration_behavior".to_string(),
            request.proration_behavior.as_str().to_string(),
        ),
    ];

    for (i, item) in request.items.iter().enumerate() {
        let key = |field: &str| format!("subscription_items[{}][{}]", i, field);
        match item {
            SubscriptionItemUpdate::Swap { item_id, price_id } => {
                pairs.push((key("id"), item_id.clone()));
                pairs.push((key("price"), price_id.clone()));
            }
            SubscriptionItemUpdate::Delete { item_id } => {
                pairs.push((key("id"), item_id.clone()));
                pairs.push((key("deleted"), "true".to_string()));
            }
            SubscriptionItemUpdate::Add { price_id } => {
                pairs.push((key("price"), price_id.clone()));
            }
        }
    }

    pairs
}

async fn fetch_upcoming_invoice(
    http: &reqwest::Client,
    url: &url::Url,
    api_key: &SecretString,
) -> std::result::Result<InvoicePreview, HttpFailure> {
    let response = http
        .get(url.clone())
        .bearer_auth(api_key.expose_secret())
        .send()
        .await
        .map_err(HttpFailure::Transport)?;

    let status = response.status();
    if !status.is_success() {
        let detail = response
            .json::<ApiErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or(ApiErrorDetail {
                message: None,
                code: None,
            });
        return Err(HttpFailure::Api {
            status: status.as_u16(),
            message: detail
                .message
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error").to_string()),
            code: detail.code,
        });
    }

    let body: UpcomingInvoiceBody = response.json().await.map_err(HttpFailure::Transport)?;
    Ok(body.into())
}

// ============================================================================
// Mapping
// ============================================================================

#[inline]
fn to_unix(ts: i64) -> u64 {
    u64::try_from(ts).unwrap_or(0)
}

fn status_str(status: &stripe::SubscriptionStatus) -> &'static str {
    match status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
        stripe::SubscriptionStatus::Paused => "paused",
    }
}

fn map_subscription(sub: stripe::Subscription) -> GatewaySubscription {
    let customer_id = match &sub.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    };

    // Items without a price cannot be matched against the catalog.
    let items = sub
        .items
        .data
        .iter()
        .filter_map(|item| {
            item.price.as_ref().map(|price| GatewaySubscriptionItem {
                id: item.id.to_string(),
                price_id: price.id.to_string(),
                quantity: item.quantity.unwrap_or(1),
            })
        })
        .collect();

    GatewaySubscription {
        id: sub.id.to_string(),
        customer_id,
        status: status_str(&sub.status).to_string(),
        items,
        current_period_start: to_unix(sub.current_period_start),
        current_period_end: to_unix(sub.current_period_end),
        cancel_at_period_end: sub.cancel_at_period_end,
        canceled_at: sub.canceled_at.map(to_unix),
        trial_start: sub.trial_start.map(to_unix),
        trial_end: sub.trial_end.map(to_unix),
        created: to_unix(sub.created),
        metadata: sub.metadata,
    }
}

fn map_item_updates(items: &[SubscriptionItemUpdate]) -> Vec<stripe::UpdateSubscriptionItems> {
    items
        .iter()
        .map(|item| match item {
            SubscriptionItemUpdate::Swap { item_id, price_id } => stripe::UpdateSubscriptionItems {
                id: Some(item_id.clone()),
                price: Some(price_id.clone()),
                ..Default::default()
            },
            SubscriptionItemUpdate::Delete { item_id } => stripe::UpdateSubscriptionItems {
                id: Some(item_id.clone()),
                deleted: Some(true),
                ..Default::default()
            },
            SubscriptionItemUpdate::Add { price_id } => stripe::UpdateSubscriptionItems {
                price: Some(price_id.clone()),
                ..Default::default()
            },
        })
        .collect()
}

// ============================================================================
// Gateway trait implementations
// ============================================================================

#[async_trait]
impl StripeCustomerClient for LiveStripeClient {
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<String> {
        let client = self.idempotent_client("create_customer");

        let mut params = stripe::CreateCustomer::new();
        params.email = Some(&request.email);
        if let Some(ref name) = request.name {
            params.name = Some(name);
        }
        let mut meta = HashMap::new();
        meta.insert(META_USER_ID.to_string(), request.user_id.clone());
        params.metadata = Some(meta);

        let customer = once(
            &self.config,
            "create_customer",
            stripe::Customer::create(&client, params),
        )
        .await?;

        tracing::info!(
            target: "workspace_billing::billing::stripe",
            user_id = %request.user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn retrieve_customer(&self, customer_id: &str) -> Result<GatewayCustomer> {
        let id = parse_customer_id(customer_id)?;

        let customer = with_retry(&self.config, "retrieve_customer", || {
            let client = self.client.clone();
            let id = id.clone();
            async move { stripe::Customer::retrieve(&client, &id, &[]).await }
        })
        .await?;

        Ok(GatewayCustomer {
            id: customer.id.to_string(),
            email: customer.email,
            deleted: customer.deleted,
        })
    }
}

#[async_trait]
impl StripePriceClient for LiveStripeClient {
    async fn retrieve_price(&self, price_id: &str) -> Result<GatewayPrice> {
        let id = parse_price_id(price_id)?;

        let price = with_retry(&self.config, "retrieve_price", || {
            let client = self.client.clone();
            let id = id.clone();
            async move { stripe::Price::retrieve(&client, &id, &[]).await }
        })
        .await?;

        Ok(GatewayPrice {
            id: price.id.to_string(),
            currency: price
                .currency
                .map(|c| c.to_string().to_lowercase())
                .unwrap_or_default(),
            unit_amount: price.unit_amount,
            product_id: price.product.as_ref().map(|p| p.id().to_string()),
            active: price.active.unwrap_or(false),
        })
    }
}

#[async_trait]
impl StripeSubscriptionClient for LiveStripeClient {
    async fn get_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
        let id = parse_subscription_id(subscription_id)?;

        let subscription = with_retry(&self.config, "get_subscription", || {
            let client = self.client.clone();
            let id = id.clone();
            async move { stripe::Subscription::retrieve(&client, &id, &[]).await }
        })
        .await?;

        Ok(map_subscription(subscription))
    }

    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<GatewaySubscription>> {
        let customer = parse_customer_id(customer_id)?;

        let list = with_retry(&self.config, "list_subscriptions", || {
            let client = self.client.clone();
            let mut params = stripe::ListSubscriptions::new();
            params.customer = Some(customer.clone());
            params.status = Some(stripe::SubscriptionStatusFilter::All);
            params.limit = Some(100);
            async move { stripe::Subscription::list(&client, &params).await }
        })
        .await?;

        if list.has_more {
            tracing::warn!(
                target: "workspace_billing::billing::stripe",
                customer_id = customer_id,
                "Customer has more than 100 subscriptions; only the first page was read"
            );
        }

        Ok(list.data.into_iter().map(map_subscription).collect())
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        request: UpdateSubscriptionRequest,
    ) -> Result<GatewaySubscription> {
        use stripe::generated::billing::subscription::SubscriptionProrationBehavior as SPB;

        let client = self.idempotent_client("update_subscription");
        let id = parse_subscription_id(subscription_id)?;

        let mut params = stripe::UpdateSubscription::new();
        params.items = Some(map_item_updates(&request.items));
        params.proration_behavior = Some(match request.proration_behavior {
            ProrationBehavior::CreateProrations => SPB::CreateProrations,
            ProrationBehavior::None => SPB::None,
        });

        let subscription = once(
            &self.config,
            "update_subscription",
            stripe::Subscription::update(&client, &id, params),
        )
        .await?;

        Ok(map_subscription(subscription))
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
        let client = self.idempotent_client("cancel_subscription");
        let id = parse_subscription_id(subscription_id)?;

        let subscription = once(
            &self.config,
            "cancel_subscription",
            stripe::Subscription::cancel(&client, &id, stripe::CancelSubscription::default()),
        )
        .await?;

        Ok(map_subscription(subscription))
    }
}

#[async_trait]
impl StripeInvoiceClient for LiveStripeClient {
    async fn preview_upcoming_invoice(&self, request: UpcomingInvoiceRequest) -> Result<InvoicePreview> {
        let endpoint = format!("{}/v1/invoices/upcoming", self.config.api_base);
        let url = url::Url::parse_with_params(&endpoint, upcoming_invoice_query(&request))
            .map_err(|e| BillingError::configuration(format!("Invalid Stripe API base: {e}")))?;

        with_retry(&self.config, "preview_upcoming_invoice", || {
            fetch_upcoming_invoice(&self.http, &url, &self.api_key)
        })
        .await
    }
}

#[async_trait]
impl StripeCheckoutClient for LiveStripeClient {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession> {
        let client = self.idempotent_client("create_checkout_session");
        let customer_id = parse_customer_id(&request.customer_id)?;

        let mut meta = HashMap::new();
        meta.insert(META_USER_ID.to_string(), request.metadata.user_id.clone());
        meta.insert(META_PLAN_ID.to_string(), request.metadata.plan_id.clone());

        let mut params = stripe::CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.mode = Some(stripe::CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&request.metadata.user_id);
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(meta.clone());
        params.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
            metadata: Some(meta),
            ..Default::default()
        });

        let session = once(
            &self.config,
            "create_checkout_session",
            stripe::CheckoutSession::create(&client, params),
        )
        .await?;

        let url = session.url.ok_or_else(|| BillingError::Gateway {
            operation: "create_checkout_session".to_string(),
            message: "Checkout session URL missing".to_string(),
            code: None,
            http_status: None,
        })?;

        Ok(CheckoutSession {
            id: session.id.to_string(),
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_api_key_valid() {
        assert!(validate_api_key("sk_test_1234567890abcdef").is_ok());
        assert!(validate_api_key("sk_live_1234567890abcdef").is_ok());
        assert!(validate_api_key("rk_test_1234567890abcdef").is_ok());
        assert!(validate_api_key("rk_live_1234567890abcdef").is_ok());
    }

    #[test]
    fn test_validate_api_key_invalid() {
        assert!(validate_api_key("").is_err());
        assert!(validate_api_key("invalid_key").is_err());
        assert!(validate_api_key("sk_test_short").is_err());
        assert!(validate_api_key("pk_test_1234567890abcdef").is_err());
    }

    #[test]
    fn test_invalid_key_is_configuration_error() {
        let err: BillingError = validate_api_key("pk_test_1234567890abcdef").unwrap_err().into();
        assert!(matches!(err, BillingError::Configuration { .. }));
    }

    #[test]
    fn test_modes() {
        let client = LiveStripeClient::with_default_config("sk_test_12345678901234567890").unwrap();
        assert!(client.is_test_mode());
        assert!(!client.is_live_mode());

        let client = LiveStripeClient::with_default_config("rk_live_12345678901234567890").unwrap();
        assert!(!client.is_test_mode());
        assert!(client.is_live_mode());
    }

    #[test]
    fn test_config_builder() {
        let config = LiveStripeClientConfig::new()
            .max_retries(5)
            .base_delay_ms(1000)
            .max_delay_ms(60_000)
            .timeout_seconds(60)
            .api_base("http://localhost:12111/");

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 60_000);
        assert_eq!(config.timeout_seconds, 60);
        assert_eq!(config.api_base, "http://localhost:12111");
    }

    #[test]
    fn test_backoff_calculation() {
        let base = 500;
        let max = 30_000;

        let delay0 = calculate_backoff_delay(0, base, max);
        assert!(delay0.as_millis() >= 500 && delay0.as_millis() <= 625);

        let delay2 = calculate_backoff_delay(2, base, max);
        assert!(delay2.as_millis() >= 2000 && delay2.as_millis() <= 2500);

        let delay_high = calculate_backoff_delay(10, base, max);
        assert!(delay_high.as_millis() <= max as u128 + (max / 4) as u128);

        assert_eq!(calculate_backoff_delay(0, 0, 1000).as_millis(), 0);
    }

    #[test]
    fn test_debug_does_not_expose_api_key() {
        let client =
            LiveStripeClient::with_default_config("sk_test_secret_key_1234567890").unwrap();
        let debug_output = format!("{:?}", client);

        assert!(!debug_output.contains("sk_test_secret_key_1234567890"));
        assert!(debug_output.contains("is_test_mode: true"));
    }

    #[test]
    fn test_idempotency_keys_are_unique() {
        let key1 = LiveStripeClient::generate_idempotency_key("update_subscription");
        let key2 = LiveStripeClient::generate_idempotency_key("update_subscription");

        assert!(key1.starts_with("update_subscription_"));
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_timeout_maps_to_retryable_gateway_error() {
        let err = map_stripe_error(stripe::StripeError::Timeout, "get_subscription");
        assert!(err.is_retryable());
        assert!(!err.is_not_found());
        assert!(is_retryable_error(&stripe::StripeError::Timeout));
        assert!(!is_retryable_error(&stripe::StripeError::UnsupportedVersion));
    }

    #[test]
    fn test_http_failure_classification() {
        let not_found = HttpFailure::Api {
            status: 404,
            message: "No such subscription".to_string(),
            code: Some("resource_missing".to_string()),
        };
        assert!(!not_found.is_transient());
        let err = not_found.into_billing_error("preview_upcoming_invoice");
        assert!(err.is_not_found());

        let throttled = HttpFailure::Api {
            status: 429,
            message: "Too many requests".to_string(),
            code: None,
        };
        assert!(throttled.is_transient());
    }

    #[test]
    fn test_upcoming_invoice_query() {
        let request = UpcomingInvoiceRequest {
            customer_id: "cus_1".to_string(),
            subscription_id: "sub_1".to_string(),
            items: vec![
                SubscriptionItemUpdate::Swap {
                    item_id: "si_1".to_string(),
                    price_id: "price_pro_annual".to_string(),
                },
                SubscriptionItemUpdate::Delete {
                    item_id: "si_2".to_string(),
                },
                SubscriptionItemUpdate::Add {
                    price_id: "price_addon".to_string(),
                },
            ],
            proration_behavior: ProrationBehavior::CreateProrations,
        };

        let pairs = upcoming_invoice_query(&request);
        let get = |k: &str| {
            pairs
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("customer"), Some("cus_1"));
        assert_eq!(get("subscription"), Some("sub_1"));
        assert_eq!(get("subscription_proration_behavior"), Some("create_prorations"));
        assert_eq!(get("subscription_items[0][id]"), Some("si_1"));
        assert_eq!(get("subscription_items[0][price]"), Some("price_pro_annual"));
        assert_eq!(get("subscription_items[1][deleted]"), Some("true"));
        assert_eq!(get("subscription_items[2][price]"), Some("price_addon"));
        assert_eq!(get("subscription_items[2][id]"), None);
    }

    #[test]
    fn test_upcoming_invoice_body_parsing() {
        let json = r#"{
            "object": "invoice",
            "currency": "USD",
            "amount_due": 1500,
            "total": 1500,
            "period_end": 1767225600,
            "lines": {
                "object": "list",
                "data": [
                    {"amount": -500, "proration": true, "description": "Unused time on Pro"},
                    {"amount": 2000, "proration": true},
                    {"amount": 2000, "proration": false}
                ]
            }
        }"#;

        let body: UpcomingInvoiceBody = serde_json::from_str(json).unwrap();
        let preview = InvoicePreview::from(body);

        assert_eq!(preview.currency, "usd");
        assert_eq!(preview.period_end, Some(1_767_225_600));
        assert_eq!(preview.lines.len(), 3);
        assert_eq!(preview.proration_total(), Some(1500));
    }

    #[test]
    fn test_item_updates_map_to_stripe_params() {
        let params = map_item_updates(&[
            SubscriptionItemUpdate::Swap {
                item_id: "si_1".to_string(),
                price_id: "price_b".to_string(),
            },
            SubscriptionItemUpdate::Delete {
                item_id: "si_2".to_string(),
            },
        ]);

        assert_eq!(params[0].id.as_deref(), Some("si_1"));
        assert_eq!(params[0].price.as_deref(), Some("price_b"));
        assert_eq!(params[1].deleted, Some(true));
        assert_eq!(params[1].price, None);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(status_str(&stripe::SubscriptionStatus::Trialing), "trialing");
        assert_eq!(status_str(&stripe::SubscriptionStatus::PastDue), "past_due");
        assert_eq!(status_str(&stripe::SubscriptionStatus::IncompleteExpired), "incomplete_expired");
    }
}
