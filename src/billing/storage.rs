//! Storage traits for billing data.
//!
//! [`SubscriptionStore`] persists the local subscription record and the gateway
//! customer handle. [`UserDirectory`] is the identity collaborator: billing
//! reads users and workspace ownership from it and writes back the workspace
//! tier label, but does not own either table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::Result;

/// Local subscription status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Canceled,
    Incomplete,
    IncompleteExpired,
}

impl SubscriptionStatus {
    /// Map the gateway's status vocabulary.
    ///
    /// Returns `None` for statuses with no local meaning (e.g. `paused`).
    #[must_use]
    pub fn from_gateway(status: &str) -> Option<Self> {
        let status = match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "unpaid" => Self::Unpaid,
            "canceled" => Self::Canceled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            _ => return None,
        };
        Some(status)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Trialing => "TRIALING",
            Self::PastDue => "PAST_DUE",
            Self::Unpaid => "UNPAID",
            Self::Canceled => "CANCELED",
            Self::Incomplete => "INCOMPLETE",
            Self::IncompleteExpired => "INCOMPLETE_EXPIRED",
        }
    }

    /// Parse the stored representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "ACTIVE" => Self::Active,
            "TRIALING" => Self::Trialing,
            "PAST_DUE" => Self::PastDue,
            "UNPAID" => Self::Unpaid,
            "CANCELED" => Self::Canceled,
            "INCOMPLETE" => Self::Incomplete,
            "INCOMPLETE_EXPIRED" => Self::IncompleteExpired,
            _ => return None,
        };
        Some(status)
    }

    /// Whether this status occupies the single active slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Whether the gateway may still bill against this row.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Canceled | Self::IncompleteExpired)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally persisted subscription row.
///
/// Timestamps are Unix seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    /// Variant id, e.g. `pro` or `pro_annual`.
    pub plan_id: String,
    /// `None` for free plans.
    pub gateway_subscription_id: Option<String>,
    pub gateway_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: u64,
    pub current_period_end: u64,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<u64>,
    pub trial_start: Option<u64>,
    pub trial_end: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Subscription {
    /// Whether the row is backed by a gateway subscription.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        self.gateway_subscription_id.is_some()
    }
}

/// Persistence for subscriptions and customer handles.
///
/// Writes go through [`SubscriptionLifecycle`](super::lifecycle::SubscriptionLifecycle)
/// only, which keeps at most one active row per user.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    // Customer handles

    /// Get the gateway customer handle for a user.
    async fn get_customer_id(&self, user_id: &str) -> Result<Option<String>>;

    /// Link a user to a gateway customer.
    async fn set_customer_id(&self, user_id: &str, customer_id: &str) -> Result<()>;

    /// Forget a stale customer handle.
    async fn clear_customer_id(&self, user_id: &str) -> Result<()>;

    /// Find the user linked to a gateway customer.
    async fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<String>>;

    // Subscriptions

    /// The user's ACTIVE or TRIALING row, if any.
    async fn active_subscription(&self, user_id: &str) -> Result<Option<Subscription>>;

    /// All rows for a user, newest first.
    async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>>;

    /// Find the row tracking a gateway subscription.
    async fn subscription_by_gateway_id(
        &self,
        gateway_subscription_id: &str,
    ) -> Result<Option<Subscription>>;

    /// Insert a new row. Marks the user as having subscribed.
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Replace an existing row by id.
    async fn update_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Whether the user has ever had a subscription row, even if since purged.
    async fn has_ever_subscribed(&self, user_id: &str) -> Result<bool>;

    // Webhook idempotency

    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;
}

/// A user as seen by billing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingUser {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    /// End of the signup trial (Unix seconds).
    pub trial_end: Option<u64>,
}

/// Identity and workspace directory owned by the host application.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<BillingUser>>;

    /// Owner of a workspace.
    async fn workspace_owner(&self, workspace_id: &str) -> Result<Option<String>>;

    /// Workspaces owned by a user.
    async fn owned_workspaces(&self, owner_id: &str) -> Result<Vec<String>>;

    /// Update the cached tier label on every workspace the user owns.
    async fn set_workspace_tier(&self, owner_id: &str, tier: &str) -> Result<()>;
}

/// In-memory implementations for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    /// In-memory subscription store.
    ///
    /// Wraps data in Arc for cheap cloning.
    #[derive(Default, Clone)]
    pub struct InMemorySubscriptionStore {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        customers: RwLock<HashMap<String, String>>,
        subscriptions: RwLock<Vec<Subscription>>,
        ever_subscribed: RwLock<HashSet<String>>,
        processed_events: RwLock<HashSet<String>>,
    }

    impl InMemorySubscriptionStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All rows (for testing).
        pub fn all_subscriptions(&self) -> Vec<Subscription> {
            self.inner.subscriptions.read().unwrap().clone()
        }

        /// Remove every row for a user while keeping the ever-subscribed marker.
        pub fn purge_subscriptions(&self, user_id: &str) {
            self.inner
                .subscriptions
                .write()
                .unwrap()
                .retain(|s| s.user_id != user_id);
        }

        /// Seed a row without going through the lifecycle (for testing).
        pub fn seed(&self, subscription: Subscription) {
            self.inner
                .ever_subscribed
                .write()
                .unwrap()
                .insert(subscription.user_id.clone());
            self.inner.subscriptions.write().unwrap().push(subscription);
        }
    }

    #[async_trait]
    impl SubscriptionStore for InMemorySubscriptionStore {
        async fn get_customer_id(&self, user_id: &str) -> Result<Option<String>> {
            Ok(self.inner.customers.read().unwrap().get(user_id).cloned())
        }

        async fn set_customer_id(&self, user_id: &str, customer_id: &str) -> Result<()> {
            self.inner
                .customers
                .write()
                .unwrap()
                .insert(user_id.to_string(), customer_id.to_string());
            Ok(())
        }

        async fn clear_customer_id(&self, user_id: &str) -> Result<()> {
            self.inner.customers.write().unwrap().remove(user_id);
            Ok(())
        }

        async fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<String>> {
            Ok(self
                .inner
                .customers
                .read()
                .unwrap()
                .iter()
                .find(|(_, cid)| cid.as_str() == customer_id)
                .map(|(uid, _)| uid.clone()))
        }

        async fn active_subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
            Ok(self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .iter()
                .filter(|s| s.user_id == user_id && s.status.is_active())
                .max_by_key(|s| s.created_at)
                .cloned())
        }

        async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
            let mut rows: Vec<Subscription> = self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .iter()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(rows)
        }

        async fn subscription_by_gateway_id(
            &self,
            gateway_subscription_id: &str,
        ) -> Result<Option<Subscription>> {
            Ok(self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .iter()
                .find(|s| s.gateway_subscription_id.as_deref() == Some(gateway_subscription_id))
                .cloned())
        }

        async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
            self.inner
                .ever_subscribed
                .write()
                .unwrap()
                .insert(subscription.user_id.clone());
            self.inner
                .subscriptions
                .write()
                .unwrap()
                .push(subscription.clone());
            Ok(())
        }

        async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
            let mut rows = self.inner.subscriptions.write().unwrap();
            if let Some(row) = rows.iter_mut().find(|s| s.id == subscription.id) {
                *row = subscription.clone();
            }
            Ok(())
        }

        async fn has_ever_subscribed(&self, user_id: &str) -> Result<bool> {
            Ok(self.inner.ever_subscribed.read().unwrap().contains(user_id))
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            Ok(self.inner.processed_events.read().unwrap().contains(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            self.inner
                .processed_events
                .write()
                .unwrap()
                .insert(event_id.to_string());
            Ok(())
        }
    }

    /// In-memory user directory.
    #[derive(Default, Clone)]
    pub struct InMemoryUserDirectory {
        inner: Arc<DirectoryInner>,
    }

    #[derive(Default)]
    struct DirectoryInner {
        users: RwLock<HashMap<String, BillingUser>>,
        workspaces: RwLock<HashMap<String, (String, String)>>,
    }

    impl InMemoryUserDirectory {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_user(&self, user: BillingUser) {
            self.inner
                .users
                .write()
                .unwrap()
                .insert(user.id.clone(), user);
        }

        /// Register a workspace on the free tier.
        pub fn add_workspace(&self, workspace_id: &str, owner_id: &str) {
            self.inner.workspaces.write().unwrap().insert(
                workspace_id.to_string(),
                (owner_id.to_string(), "free".to_string()),
            );
        }

        /// Current tier label of a workspace (for testing).
        pub fn workspace_tier(&self, workspace_id: &str) -> Option<String> {
            self.inner
                .workspaces
                .read()
                .unwrap()
                .get(workspace_id)
                .map(|(_, tier)| tier.clone())
        }
    }

    #[async_trait]
    impl UserDirectory for InMemoryUserDirectory {
        async fn get_user(&self, user_id: &str) -> Result<Option<BillingUser>> {
            Ok(self.inner.users.read().unwrap().get(user_id).cloned())
        }

        async fn workspace_owner(&self, workspace_id: &str) -> Result<Option<String>> {
            Ok(self
                .inner
                .workspaces
                .read()
                .unwrap()
                .get(workspace_id)
                .map(|(owner, _)| owner.clone()))
        }

        async fn owned_workspaces(&self, owner_id: &str) -> Result<Vec<String>> {
            let mut ids: Vec<String> = self
                .inner
                .workspaces
                .read()
                .unwrap()
                .iter()
                .filter(|(_, (owner, _))| owner == owner_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            Ok(ids)
        }

        async fn set_workspace_tier(&self, owner_id: &str, tier: &str) -> Result<()> {
            for (owner, current) in self.inner.workspaces.write().unwrap().values_mut() {
                if owner == owner_id {
                    *current = tier.to_string();
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::*;
    use super::*;

    fn row(id: &str, user: &str, status: SubscriptionStatus, created_at: u64) -> Subscription {
        Subscription {
            id: id.to_string(),
            user_id: user.to_string(),
            plan_id: "pro".to_string(),
            gateway_subscription_id: Some(format!("sub_{}", id)),
            gateway_customer_id: Some("cus_1".to_string()),
            status,
            current_period_start: 0,
            current_period_end: 100,
            cancel_at_period_end: false,
            canceled_at: None,
            trial_start: None,
            trial_end: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(SubscriptionStatus::from_gateway("past_due"), Some(SubscriptionStatus::PastDue));
        assert_eq!(
            SubscriptionStatus::from_gateway("incomplete_expired"),
            Some(SubscriptionStatus::IncompleteExpired)
        );
        assert_eq!(SubscriptionStatus::from_gateway("paused"), None);
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_queries() {
        let store = InMemorySubscriptionStore::new();
        store
            .insert_subscription(&row("a", "u1", SubscriptionStatus::Canceled, 1))
            .await
            .unwrap();
        store
            .insert_subscription(&row("b", "u1", SubscriptionStatus::Active, 2))
            .await
            .unwrap();

        let active = store.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(active.id, "b");

        let rows = store.subscriptions_for_user("u1").await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);

        let by_gateway = store.subscription_by_gateway_id("sub_a").await.unwrap().unwrap();
        assert_eq!(by_gateway.id, "a");

        store.purge_subscriptions("u1");
        assert!(store.subscriptions_for_user("u1").await.unwrap().is_empty());
        assert!(store.has_ever_subscribed("u1").await.unwrap());
        assert!(!store.has_ever_subscribed("u2").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_customer_handles() {
        let store = InMemorySubscriptionStore::new();
        store.set_customer_id("u1", "cus_1").await.unwrap();
        assert_eq!(store.find_user_by_customer("cus_1").await.unwrap().as_deref(), Some("u1"));
        store.clear_customer_id("u1").await.unwrap();
        assert!(store.get_customer_id("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_tier_updates_owned_workspaces() {
        let directory = InMemoryUserDirectory::new();
        directory.add_workspace("w1", "u1");
        directory.add_workspace("w2", "u1");
        directory.add_workspace("w3", "u2");
        directory.set_workspace_tier("u1", "pro").await.unwrap();
        assert_eq!(directory.workspace_tier("w1").as_deref(), Some("pro"));
        assert_eq!(directory.workspace_tier("w2").as_deref(), Some("pro"));
        assert_eq!(directory.workspace_tier("w3").as_deref(), Some("free"));
        assert_eq!(directory.owned_workspaces("u1").await.unwrap(), vec!["w1", "w2"]);
    }
}
