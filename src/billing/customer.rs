//! Gateway customer management.

use async_trait::async_trait;

use super::error::Result;
use super::storage::{BillingUser, SubscriptionStore};

/// Metadata key linking a gateway object to a user.
pub const META_USER_ID: &str = "user_id";

/// Request to create a gateway customer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateCustomerRequest {
    pub email: String,
    pub name: Option<String>,
    pub user_id: String,
}

/// A customer as reported by the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayCustomer {
    pub id: String,
    pub email: Option<String>,
    /// Deleted customers are still retrievable but unusable.
    pub deleted: bool,
}

/// Customer operations on the gateway.
#[async_trait]
pub trait StripeCustomerClient: Send + Sync {
    /// Create a customer and return its id.
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<String>;

    /// Retrieve a customer. Unknown ids are a not-found error.
    async fn retrieve_customer(&self, customer_id: &str) -> Result<GatewayCustomer>;
}

/// How a customer handle was obtained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CustomerHandle {
    /// The stored handle is valid.
    Existing(String),
    /// No handle was stored; a new customer was created.
    Created(String),
    /// The stored handle was stale and has been replaced.
    Recreated { stale: String, customer_id: String },
}

impl CustomerHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Existing(id) | Self::Created(id) => id,
            Self::Recreated { customer_id, .. } => customer_id,
        }
    }
}

/// Links users to gateway customers, repairing stale handles.
pub struct CustomerManager<S: SubscriptionStore, C: StripeCustomerClient> {
    store: S,
    client: C,
}

impl<S: SubscriptionStore, C: StripeCustomerClient> CustomerManager<S, C> {
    #[must_use]
    pub fn new(store: S, client: C) -> Self {
        Self { store, client }
    }

    /// Return a usable customer handle for `user`.
    ///
    /// A stored handle the gateway no longer knows (or has deleted) is
    /// cleared and a fresh customer is created in its place.
    pub async fn ensure_customer(&self, user: &BillingUser) -> Result<CustomerHandle> {
        if let Some(stored) = self.store.get_customer_id(&user.id).await? {
            match self.client.retrieve_customer(&stored).await {
                Ok(customer) if !customer.deleted => return Ok(CustomerHandle::Existing(stored)),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            tracing::warn!(
                target: "workspace_billing::billing",
                user_id = %user.id,
                customer_id = %stored,
                "Stored customer no longer exists at the gateway, recreating"
            );
            self.store.clear_customer_id(&user.id).await?;
            let customer_id = self.create(user).await?;
            return Ok(CustomerHandle::Recreated {
                stale: stored,
                customer_id,
            });
        }

        Ok(CustomerHandle::Created(self.create(user).await?))
    }

    async fn create(&self, user: &BillingUser) -> Result<String> {
        let customer_id = self
            .client
            .create_customer(CreateCustomerRequest {
                email: user.email.clone(),
                name: user.name.clone(),
                user_id: user.id.clone(),
            })
            .await?;
        self.store.set_customer_id(&user.id, &customer_id).await?;
        Ok(customer_id)
    }
}
