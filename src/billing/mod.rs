//! Subscription billing and workspace entitlements.
//!
//! A two-tier catalog (free and paid, monthly and yearly) is loaded from a
//! JSON document, priced per country, and sold through Stripe. The
//! [`SubscriptionLifecycle`] is the only writer of local subscription rows;
//! the [`WorkspaceAccessGate`] reads them to decide whether a workspace is
//! locked.
//!
//! # Example
//!
//! ```rust,ignore
//! use workspace_billing::billing::{
//!     CheckoutConfig, LimitResolver, LiveStripeClient, PlanCatalog, PriceResolver,
//!     SubscriptionLifecycle,
//! };
//!
//! let catalog = Arc::new(
//!     PlanCatalog::open("config/plans.json", env, PriceResolver::new("US"), LimitResolver::from_env())
//!         .await?,
//! );
//! let lifecycle = SubscriptionLifecycle::new(store, directory, gateway, catalog, checkout);
//!
//! match lifecycle.create(&user.id, "pro_annual", Some("GB")).await? {
//!     CreateOutcome::CheckoutRequired { session, .. } => redirect(session.url),
//!     CreateOutcome::Activated { .. } => {}
//! }
//! ```

pub mod access;
pub mod audit;
pub mod catalog;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod invoice;
pub mod lifecycle;
pub mod limits;
pub mod live_client;
pub mod plans;
pub mod pricing;
pub mod proration;
#[cfg(feature = "database")]
pub mod sea_orm_store;
pub mod storage;
pub mod subscription;
pub mod validation;
pub mod webhook;

// Catalog exports
pub use catalog::{PlanCatalog, SubscriptionPlan};
pub use plans::{
    BillingInterval, CatalogDocument, CountryPrice, IntervalPrice, PlanConfig, PlanPricing,
    PlanSet, PlanVariant, PriceRef, split_variant_key, variant_key,
};

// Limits and pricing exports
pub use limits::{Feature, FeatureLimits, Limit, LimitCheckResult, LimitResolver};
pub use pricing::{
    DEFAULT_HOME_COUNTRY, PriceMatch, PriceResolver, ResolvedPrice, currency_for_country,
};

// Storage exports
pub use storage::{BillingUser, Subscription, SubscriptionStatus, SubscriptionStore, UserDirectory};

// Gateway exports
pub use checkout::{CheckoutConfig, CheckoutMetadata, CheckoutSession, StripeCheckoutClient};
pub use client::{GatewayPrice, PaymentGateway, StripePriceClient};
pub use customer::{CustomerHandle, CustomerManager, GatewayCustomer, StripeCustomerClient};
pub use invoice::{InvoicePreview, InvoicePreviewLine, StripeInvoiceClient};
pub use subscription::{
    GatewaySubscription, ProrationBehavior, StripeSubscriptionClient, SubscriptionItemUpdate,
};

// Live client exports (production Stripe client)
pub use live_client::{InvalidApiKeyError, LiveStripeClient, LiveStripeClientConfig};

// Lifecycle exports
pub use lifecycle::{
    CancelOutcome, ChangeOutcome, CreateOutcome, SubscriptionLifecycle, SyncOutcome,
};
pub use proration::{ProrationConfig, ProrationPreview, ProrationService};

// Access exports
pub use access::{
    AccessFacts, AccessStatusCache, LockReason, WorkspaceAccessGate, WorkspaceAccessStatus, decide,
};

// Webhook exports
pub use webhook::{WebhookEvent, WebhookHandler, WebhookOutcome};

// Audit exports
pub use audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger, TracingAuditLogger};

// Error exports
pub use error::{BillingError, Result};

// SeaORM storage exports
#[cfg(feature = "database")]
pub use sea_orm_store::{SeaOrmSubscriptionStore, SeaOrmUserDirectory, ensure_billing_tables};

// Validation exports
pub use validation::{validate_entity_id, validate_plan_id};

// Test doubles
#[cfg(any(test, feature = "test-billing"))]
pub use audit::test::RecordingAuditLogger;
#[cfg(any(test, feature = "test-billing"))]
pub use client::test::{GatewayCall, MockGateway};
#[cfg(any(test, feature = "test-billing"))]
pub use storage::test::{InMemorySubscriptionStore, InMemoryUserDirectory};
