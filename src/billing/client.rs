//! Consolidated gateway client types.
//!
//! Individual traits stay separate so each manager asks only for what it
//! uses; [`PaymentGateway`] is the union needed by the lifecycle.

use async_trait::async_trait;

use super::checkout::StripeCheckoutClient;
use super::customer::StripeCustomerClient;
use super::error::Result;
use super::invoice::StripeInvoiceClient;
use super::subscription::StripeSubscriptionClient;

/// A price as reported by the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayPrice {
    pub id: String,
    /// Lowercase ISO 4217.
    pub currency: String,
    pub unit_amount: Option<i64>,
    pub product_id: Option<String>,
    pub active: bool,
}

/// Price operations on the gateway.
#[async_trait]
pub trait StripePriceClient: Send + Sync {
    async fn retrieve_price(&self, price_id: &str) -> Result<GatewayPrice>;
}

/// A type that implements every gateway client trait.
pub trait PaymentGateway:
    StripeCustomerClient
    + StripePriceClient
    + StripeSubscriptionClient
    + StripeInvoiceClient
    + StripeCheckoutClient
{
}

impl<T> PaymentGateway for T where
    T: StripeCustomerClient
        + StripePriceClient
        + StripeSubscriptionClient
        + StripeInvoiceClient
        + StripeCheckoutClient
{
}

/// Mock gateway for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::checkout::{CheckoutSession, CreateCheckoutSessionRequest};
    use crate::billing::customer::{CreateCustomerRequest, GatewayCustomer};
    use crate::billing::error::BillingError;
    use crate::billing::invoice::{InvoicePreview, UpcomingInvoiceRequest};
    use crate::billing::subscription::{
        GatewaySubscription, GatewaySubscriptionItem, SubscriptionItemUpdate,
        UpdateSubscriptionRequest,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    /// A mutating call made against the mock.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum GatewayCall {
        CreateCustomer { email: String },
        CreateCheckoutSession(CreateCheckoutSessionRequest),
        UpdateSubscription {
            subscription_id: String,
            request: UpdateSubscriptionRequest,
        },
        CancelSubscription { subscription_id: String },
    }

    #[derive(Default)]
    struct State {
        customers: HashMap<String, bool>,
        prices: HashMap<String, GatewayPrice>,
        subscriptions: HashMap<String, GatewaySubscription>,
        upcoming_invoice: Option<InvoicePreview>,
        mutations: Vec<GatewayCall>,
        fail_next: Option<BillingError>,
    }

    /// In-memory gateway that records every mutation.
    ///
    /// Cloning shares state, so a test can keep a handle while the lifecycle
    /// owns another.
    #[derive(Clone, Default)]
    pub struct MockGateway {
        state: Arc<Mutex<State>>,
        counter: Arc<AtomicU64>,
    }

    impl MockGateway {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{}_mock_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
        }

        fn take_failure(&self) -> Result<()> {
            match self.state.lock().unwrap().fail_next.take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        pub fn add_customer(&self, customer_id: &str) {
            self.state
                .lock()
                .unwrap()
                .customers
                .insert(customer_id.to_string(), false);
        }

        pub fn add_deleted_customer(&self, customer_id: &str) {
            self.state
                .lock()
                .unwrap()
                .customers
                .insert(customer_id.to_string(), true);
        }

        pub fn add_price(&self, price_id: &str, currency: &str, unit_amount: i64) {
            self.state.lock().unwrap().prices.insert(
                price_id.to_string(),
                GatewayPrice {
                    id: price_id.to_string(),
                    currency: currency.to_string(),
                    unit_amount: Some(unit_amount),
                    product_id: None,
                    active: true,
                },
            );
        }

        pub fn add_subscription(&self, subscription: GatewaySubscription) {
            self.state
                .lock()
                .unwrap()
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }

        pub fn remove_subscription(&self, subscription_id: &str) {
            self.state.lock().unwrap().subscriptions.remove(subscription_id);
        }

        /// Current gateway view of a subscription (for testing).
        pub fn subscription(&self, subscription_id: &str) -> Option<GatewaySubscription> {
            self.state
                .lock()
                .unwrap()
                .subscriptions
                .get(subscription_id)
                .cloned()
        }

        pub fn set_upcoming_invoice(&self, preview: InvoicePreview) {
            self.state.lock().unwrap().upcoming_invoice = Some(preview);
        }

        /// Make the next gateway call fail with `err`.
        pub fn fail_next(&self, err: BillingError) {
            self.state.lock().unwrap().fail_next = Some(err);
        }

        /// Every mutating call so far, in order.
        pub fn mutations(&self) -> Vec<GatewayCall> {
            self.state.lock().unwrap().mutations.clone()
        }

        /// Checkout session requests so far.
        pub fn checkout_requests(&self) -> Vec<CreateCheckoutSessionRequest> {
            self.mutations()
                .into_iter()
                .filter_map(|call| match call {
                    GatewayCall::CreateCheckoutSession(request) => Some(request),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: GatewayCall) {
            self.state.lock().unwrap().mutations.push(call);
        }

        fn now() -> u64 {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs()
        }
    }

    #[async_trait]
    impl StripeCustomerClient for MockGateway {
        async fn create_customer(&self, request: CreateCustomerRequest) -> Result<String> {
            self.take_failure()?;
            let id = self.next_id("cus");
            self.add_customer(&id);
            self.record(GatewayCall::CreateCustomer {
                email: request.email,
            });
            Ok(id)
        }

        async fn retrieve_customer(&self, customer_id: &str) -> Result<GatewayCustomer> {
            self.take_failure()?;
            let deleted = self
                .state
                .lock()
                .unwrap()
                .customers
                .get(customer_id)
                .copied()
                .ok_or_else(|| BillingError::CustomerNotFound {
                    customer_id: customer_id.to_string(),
                })?;
            Ok(GatewayCustomer {
                id: customer_id.to_string(),
                email: None,
                deleted,
            })
        }
    }

    #[async_trait]
    impl StripePriceClient for MockGateway {
        async fn retrieve_price(&self, price_id: &str) -> Result<GatewayPrice> {
            self.take_failure()?;
            self.state
                .lock()
                .unwrap()
                .prices
                .get(price_id)
                .cloned()
                .ok_or_else(|| BillingError::Gateway {
                    operation: "retrieve_price".to_string(),
                    message: format!("No such price: '{}'", price_id),
                    code: Some("resource_missing".to_string()),
                    http_status: Some(404),
                })
        }
    }

    #[async_trait]
    impl StripeSubscriptionClient for MockGateway {
        async fn get_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
            self.take_failure()?;
            self.subscription(subscription_id)
                .ok_or_else(|| BillingError::SubscriptionNotFound {
                    subscription_id: subscription_id.to_string(),
                })
        }

        async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<GatewaySubscription>> {
            self.take_failure()?;
            let mut subs: Vec<GatewaySubscription> = self
                .state
                .lock()
                .unwrap()
                .subscriptions
                .values()
                .filter(|s| s.customer_id == customer_id)
                .cloned()
                .collect();
            subs.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
            Ok(subs)
        }

        async fn update_subscription(
            &self,
            subscription_id: &str,
            request: UpdateSubscriptionRequest,
        ) -> Result<GatewaySubscription> {
            self.take_failure()?;
            let mut sub = self.get_subscription(subscription_id).await?;
            for update in &request.items {
                match update {
                    SubscriptionItemUpdate::Swap { item_id, price_id } => {
                        if let Some(item) = sub.items.iter_mut().find(|i| &i.id == item_id) {
                            item.price_id = price_id.clone();
                        }
                    }
                    SubscriptionItemUpdate::Delete { item_id } => {
                        sub.items.retain(|i| &i.id != item_id);
                    }
                    SubscriptionItemUpdate::Add { price_id } => {
                        sub.items.push(GatewaySubscriptionItem {
                            id: self.next_id("si"),
                            price_id: price_id.clone(),
                            quantity: 1,
                        });
                    }
                }
            }
            self.add_subscription(sub.clone());
            self.record(GatewayCall::UpdateSubscription {
                subscription_id: subscription_id.to_string(),
                request,
            });
            Ok(sub)
        }

        async fn cancel_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
            self.take_failure()?;
            let mut sub = self.get_subscription(subscription_id).await?;
            sub.status = "canceled".to_string();
            sub.canceled_at = Some(Self::now());
            self.add_subscription(sub.clone());
            self.record(GatewayCall::CancelSubscription {
                subscription_id: subscription_id.to_string(),
            });
            Ok(sub)
        }
    }

    #[async_trait]
    impl StripeInvoiceClient for MockGateway {
        async fn preview_upcoming_invoice(
            &self,
            _request: UpcomingInvoiceRequest,
        ) -> Result<InvoicePreview> {
            self.take_failure()?;
            Ok(self
                .state
                .lock()
                .unwrap()
                .upcoming_invoice
                .clone()
                .unwrap_or(InvoicePreview {
                    currency: "usd".to_string(),
                    amount_due: 0,
                    total: 0,
                    lines: Vec::new(),
                    period_end: None,
                }))
        }
    }

    #[async_trait]
    impl StripeCheckoutClient for MockGateway {
        async fn create_checkout_session(
            &self,
            request: CreateCheckoutSessionRequest,
        ) -> Result<CheckoutSession> {
            self.take_failure()?;
            let id = self.next_id("cs");
            self.record(GatewayCall::CreateCheckoutSession(request));
            Ok(CheckoutSession {
                url: format!("https://checkout.stripe.com/c/pay/{}", id),
                id,
            })
        }
    }
}
