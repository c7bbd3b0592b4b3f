//! Stripe webhook handling.
//!
//! Every relevant event is reduced to "this user's subscription may have
//! changed" and answered with a [`sync`](super::lifecycle::SubscriptionLifecycle::sync).
//! Deliveries are deduplicated on the event id.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::access::AccessStatusCache;
use super::client::PaymentGateway;
use super::customer::META_USER_ID;
use super::error::{BillingError, Result};
use super::lifecycle::{SubscriptionLifecycle, SyncOutcome};
use super::storage::{SubscriptionStore, UserDirectory};
use crate::utils::now_unix;

/// Maximum age of a signed delivery, in seconds.
const SIGNATURE_TOLERANCE_SECS: u64 = 300;

/// Event types that trigger a sync.
const SYNC_EVENTS: &[&str] = &[
    "customer.subscription.created",
    "customer.subscription.updated",
    "customer.subscription.deleted",
    "checkout.session.completed",
    "invoice.paid",
    "invoice.payment_failed",
];

/// A parsed webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    pub created: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

impl WebhookEvent {
    /// Customer id on the event object, if any.
    #[must_use]
    pub fn customer_id(&self) -> Option<&str> {
        match self.data.object.get("customer")? {
            serde_json::Value::String(id) => Some(id.as_str()),
            // Expanded customer objects
            value => value.get("id")?.as_str(),
        }
    }

    /// `user_id` from the object's metadata or its subscription data.
    #[must_use]
    pub fn metadata_user_id(&self) -> Option<&str> {
        let object = &self.data.object;
        object
            .get("metadata")
            .and_then(|m| m.get(META_USER_ID))
            .or_else(|| {
                object
                    .get("subscription_details")
                    .and_then(|d| d.get("metadata"))
                    .and_then(|m| m.get(META_USER_ID))
            })
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The user's subscription was synced.
    Processed { user_id: String, sync: SyncOutcome },
    /// Not relevant, or no user could be resolved.
    Ignored,
    /// Duplicate delivery.
    AlreadyProcessed,
}

/// Verifies and processes Stripe webhooks.
///
/// The webhook secret is held as a [`SecretString`] and never appears in
/// debug output.
pub struct WebhookHandler<S, D, G>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    store: S,
    lifecycle: Arc<SubscriptionLifecycle<S, D, G>>,
    webhook_secret: SecretString,
    access_cache: Option<AccessStatusCache>,
}

impl<S, D, G> WebhookHandler<S, D, G>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    #[must_use]
    pub fn new(
        lifecycle: Arc<SubscriptionLifecycle<S, D, G>>,
        webhook_secret: impl Into<SecretString>,
    ) -> Self {
        Self {
            store: lifecycle.store().clone(),
            lifecycle,
            webhook_secret: webhook_secret.into(),
            access_cache: None,
        }
    }

    #[must_use]
    pub fn with_access_cache(mut self, cache: AccessStatusCache) -> Self {
        self.access_cache = Some(cache);
        self
    }

    /// Verify the `Stripe-Signature` header and parse the event.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        self.verify_signature_at(payload, signature, now_unix())
    }

    fn verify_signature_at(&self, payload: &[u8], signature: &str, now: u64) -> Result<WebhookEvent> {
        let parts = parse_signature_header(signature)?;

        if now.abs_diff(parts.timestamp) > SIGNATURE_TOLERANCE_SECS {
            return Err(invalid("webhook timestamp outside tolerance"));
        }

        let mut signed_payload = format!("{}.", parts.timestamp).into_bytes();
        signed_payload.extend_from_slice(payload);
        let expected = compute_signature(self.webhook_secret.expose_secret(), &signed_payload)?;

        let matched = parts.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| expected.ct_eq(&provided).unwrap_u8() == 1)
                .unwrap_or(false)
        });
        if !matched {
            return Err(invalid("invalid webhook signature"));
        }

        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "workspace_billing::billing",
                error = %e,
                "Failed to parse webhook payload"
            );
            invalid("malformed JSON payload")
        })
    }

    /// Verify, deduplicate and process one delivery.
    pub async fn handle(&self, payload: &[u8], signature: &str) -> Result<WebhookOutcome> {
        let event = self.verify_signature(payload, signature)?;
        self.handle_event(event).await
    }

    /// Process a verified event.
    ///
    /// Failed events are not marked processed, so the gateway's redelivery
    /// retries them.
    pub async fn handle_event(&self, event: WebhookEvent) -> Result<WebhookOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            tracing::debug!(
                target: "workspace_billing::billing",
                event_id = %event.id,
                "Duplicate webhook delivery"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        if !SYNC_EVENTS.contains(&event.event_type.as_str()) {
            return Ok(WebhookOutcome::Ignored);
        }

        let Some(user_id) = self.resolve_user(&event).await? else {
            tracing::warn!(
                target: "workspace_billing::billing",
                event_id = %event.id,
                event_type = %event.event_type,
                customer_id = event.customer_id(),
                "Webhook references no known user"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let sync = self.lifecycle.sync(&user_id).await?;
        if let Some(cache) = &self.access_cache {
            cache.invalidate_owner(&user_id);
        }
        self.store.mark_event_processed(&event.id).await?;

        tracing::info!(
            target: "workspace_billing::billing",
            event_id = %event.id,
            event_type = %event.event_type,
            user_id = %user_id,
            "Webhook processed"
        );

        Ok(WebhookOutcome::Processed { user_id, sync })
    }

    /// Find the user an event belongs to, linking the customer when the
    /// event carries both.
    async fn resolve_user(&self, event: &WebhookEvent) -> Result<Option<String>> {
        let customer_id = event.customer_id();
        if let Some(customer_id) = customer_id {
            if let Some(user_id) = self.store.find_user_by_customer(customer_id).await? {
                return Ok(Some(user_id));
            }
        }

        let Some(user_id) = event.metadata_user_id() else {
            return Ok(None);
        };
        if let Some(customer_id) = customer_id {
            if self.store.get_customer_id(user_id).await?.is_none() {
                self.store.set_customer_id(user_id, customer_id).await?;
            }
        }
        Ok(Some(user_id.to_string()))
    }
}

impl<S, D, G> std::fmt::Debug for WebhookHandler<S, D, G>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookHandler")
            .field("webhook_secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

fn invalid(message: &str) -> BillingError {
    BillingError::InvalidWebhook {
        message: message.to_string(),
    }
}

struct SignatureParts {
    timestamp: u64,
    signatures: Vec<String>,
}

/// Parse the Stripe-Signature header (`t=...,v1=...`).
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| invalid("invalid signature header format"))?;

        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| invalid("missing timestamp in signature"))?;
    if signatures.is_empty() {
        return Err(invalid("missing v1 signature"));
    }
    Ok(SignatureParts {
        timestamp,
        signatures,
    })
}

/// HMAC-SHA256 of `payload` under `secret`.
fn compute_signature(secret: &str, payload: &[u8]) -> Result<Vec<u8>> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::configuration("invalid webhook secret"))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}
