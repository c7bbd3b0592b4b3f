//! Checkout sessions for paid plans.

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use super::error::{BillingError, Result};

/// Metadata attached to a checkout session and its subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub user_id: String,
    /// Variant id, e.g. `pro_annual`.
    pub plan_id: String,
}

/// Request to create a subscription-mode checkout session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateCheckoutSessionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: CheckoutMetadata,
}

/// A created checkout session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Checkout operations on the gateway.
#[async_trait]
pub trait StripeCheckoutClient: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession>;
}

/// Redirect targets for checkout.
#[derive(Clone, Debug, Default)]
pub struct CheckoutConfig {
    pub success_url: String,
    pub cancel_url: String,
    /// Allowed domains for redirect URLs (empty = allow any HTTPS URL).
    pub allowed_redirect_domains: Vec<String>,
}

impl CheckoutConfig {
    #[must_use]
    pub fn new(success_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        Self {
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
            allowed_redirect_domains: Vec::new(),
        }
    }

    /// Restrict redirects to these domains (and their subdomains).
    #[must_use]
    pub fn allowed_redirect_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_redirect_domains = domains;
        self
    }

    /// Validate both redirect URLs.
    pub fn validate(&self) -> Result<()> {
        self.validate_redirect_url(&self.success_url)?;
        self.validate_redirect_url(&self.cancel_url)
    }

    /// Validate a redirect URL: HTTPS only, and within the allowed domains.
    pub fn validate_redirect_url(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url)
            .map_err(|e| BillingError::invalid_input(format!("invalid redirect URL: {}", e)))?;

        if parsed.scheme() != "https" {
            return Err(BillingError::invalid_input("redirect URL must use HTTPS"));
        }

        if !self.allowed_redirect_domains.is_empty() {
            let host = parsed
                .host_str()
                .ok_or_else(|| BillingError::invalid_input("redirect URL must have a host"))?;

            let domain_allowed = self
                .allowed_redirect_domains
                .iter()
                .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)));

            if !domain_allowed {
                return Err(BillingError::invalid_input(format!(
                    "redirect URL domain '{}' is not allowed",
                    host
                )));
            }
        }

        Ok(())
    }
}
