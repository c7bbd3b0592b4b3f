//! Gateway subscription resources.
//!
//! These types are the crate's view of a Stripe subscription, independent of
//! the `stripe` crate's generated models so the lifecycle can be tested
//! against [`MockGateway`](super::client::test::MockGateway).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::Result;

/// A line item on a gateway subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySubscriptionItem {
    pub id: String,
    pub price_id: String,
    pub quantity: u64,
}

/// A subscription as reported by the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    pub customer_id: String,
    /// Gateway status vocabulary (`active`, `past_due`, `canceled`, ...).
    pub status: String,
    pub items: Vec<GatewaySubscriptionItem>,
    pub current_period_start: u64,
    pub current_period_end: u64,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<u64>,
    pub trial_start: Option<u64>,
    pub trial_end: Option<u64>,
    pub created: u64,
    pub metadata: HashMap<String, String>,
}

impl GatewaySubscription {
    /// The first line item, which carries the plan price.
    #[must_use]
    pub fn base_item(&self) -> Option<&GatewaySubscriptionItem> {
        self.items.first()
    }

    #[must_use]
    pub fn base_price_id(&self) -> Option<&str> {
        self.base_item().map(|item| item.price_id.as_str())
    }

    /// `active` or `trialing`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.status == "canceled"
    }

    /// `canceled` or `incomplete_expired`: nothing left to bill.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "canceled" | "incomplete_expired")
    }

    /// Neither active nor terminal, e.g. `past_due`. The gateway still tries
    /// to collect, so no other subscription may be started or swapped in.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        !self.is_active() && !self.is_terminal()
    }
}

/// How the gateway prorates a mid-cycle change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationBehavior {
    /// Prorate immediately.
    #[default]
    CreateProrations,
    /// Defer the change to the next period boundary.
    None,
}

impl ProrationBehavior {
    /// Gateway wire value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateProrations => "create_prorations",
            Self::None => "none",
        }
    }
}

/// One line of a subscription item update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionItemUpdate {
    /// Move an existing item to a new price.
    Swap { item_id: String, price_id: String },
    /// Remove an existing item.
    Delete { item_id: String },
    /// Add a new item.
    Add { price_id: String },
}

/// Request to update a gateway subscription's items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateSubscriptionRequest {
    pub items: Vec<SubscriptionItemUpdate>,
    pub proration_behavior: ProrationBehavior,
}

/// Subscription operations on the gateway.
#[async_trait]
pub trait StripeSubscriptionClient: Send + Sync {
    /// Retrieve a subscription. Missing subscriptions are a not-found error.
    async fn get_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription>;

    /// Every subscription (any status) for a customer.
    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<GatewaySubscription>>;

    /// Apply an item update.
    async fn update_subscription(
        &self,
        subscription_id: &str,
        request: UpdateSubscriptionRequest,
    ) -> Result<GatewaySubscription>;

    /// Cancel immediately (not at period end).
    async fn cancel_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription>;
}
