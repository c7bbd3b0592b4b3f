//! Audit events for subscription lifecycle operations.
//!
//! Logging an event never fails the operation that emitted it.

use std::fmt;

use async_trait::async_trait;

/// Billing events worth keeping a trail of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingAuditEvent {
    CustomerCreated {
        user_id: String,
        customer_id: String,
    },
    /// A stale customer handle was replaced.
    CustomerRecreated {
        user_id: String,
        stale_customer_id: String,
        customer_id: String,
    },
    CheckoutStarted {
        user_id: String,
        plan_id: String,
        price_id: String,
        session_id: String,
        used_fallback: bool,
    },
    FreePlanActivated {
        user_id: String,
        plan_id: String,
        subscription_id: String,
    },
    PlanChanged {
        user_id: String,
        subscription_id: String,
        from_plan_id: String,
        to_plan_id: String,
    },
    SubscriptionCanceled {
        user_id: String,
        subscription_id: String,
        /// The gateway subscription no longer existed.
        local_only: bool,
    },
    SubscriptionSynced {
        user_id: String,
        subscription_id: String,
        plan_id: String,
        status: String,
    },
    /// Sync marked local rows canceled.
    SyncCanceled {
        user_id: String,
        count: usize,
        reason: String,
    },
}

impl BillingAuditEvent {
    /// Stable event name for structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CustomerCreated { .. } => "customer_created",
            Self::CustomerRecreated { .. } => "customer_recreated",
            Self::CheckoutStarted { .. } => "checkout_started",
            Self::FreePlanActivated { .. } => "free_plan_activated",
            Self::PlanChanged { .. } => "plan_changed",
            Self::SubscriptionCanceled { .. } => "subscription_canceled",
            Self::SubscriptionSynced { .. } => "subscription_synced",
            Self::SyncCanceled { .. } => "sync_canceled",
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::CustomerCreated { user_id, .. }
            | Self::CustomerRecreated { user_id, .. }
            | Self::CheckoutStarted { user_id, .. }
            | Self::FreePlanActivated { user_id, .. }
            | Self::PlanChanged { user_id, .. }
            | Self::SubscriptionCanceled { user_id, .. }
            | Self::SubscriptionSynced { user_id, .. }
            | Self::SyncCanceled { user_id, .. } => user_id,
        }
    }
}

impl fmt::Display for BillingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CustomerCreated { user_id, customer_id } => {
                write!(f, "Customer created: user={}, customer={}", user_id, customer_id)
            }
            Self::CustomerRecreated { user_id, stale_customer_id, customer_id } => {
                write!(
                    f,
                    "Customer recreated: user={}, stale={}, customer={}",
                    user_id, stale_customer_id, customer_id
                )
            }
            Self::CheckoutStarted { user_id, plan_id, price_id, session_id, used_fallback } => {
                write!(
                    f,
                    "Checkout started: user={}, plan={}, price={}, session={}, fallback={}",
                    user_id, plan_id, price_id, session_id, used_fallback
                )
            }
            Self::FreePlanActivated { user_id, plan_id, subscription_id } => {
                write!(f, "Free plan activated: user={}, plan={}, sub={}", user_id, plan_id, subscription_id)
            }
            Self::PlanChanged { user_id, subscription_id, from_plan_id, to_plan_id } => {
                write!(
                    f,
                    "Plan changed: user={}, sub={}, from={}, to={}",
                    user_id, subscription_id, from_plan_id, to_plan_id
                )
            }
            Self::SubscriptionCanceled { user_id, subscription_id, local_only } => {
                write!(
                    f,
                    "Subscription canceled: user={}, sub={}, local_only={}",
                    user_id, subscription_id, local_only
                )
            }
            Self::SubscriptionSynced { user_id, subscription_id, plan_id, status } => {
                write!(
                    f,
                    "Subscription synced: user={}, sub={}, plan={}, status={}",
                    user_id, subscription_id, plan_id, status
                )
            }
            Self::SyncCanceled { user_id, count, reason } => {
                write!(f, "Sync canceled {} row(s): user={}, reason={}", count, user_id, reason)
            }
        }
    }
}

/// Audit logging backend.
///
/// Implementations handle their own failures.
#[async_trait]
pub trait BillingAuditLogger: Send + Sync {
    async fn log(&self, event: BillingAuditEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl BillingAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: BillingAuditEvent) {}
}

/// Logs audit events at INFO through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl BillingAuditLogger for TracingAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        tracing::info!(
            target: "workspace_billing::billing::audit",
            event_type = event.kind(),
            user_id = event.user_id(),
            "{}", event
        );
    }
}

/// Capturing logger for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default)]
    pub struct RecordingAuditLogger {
        events: Arc<Mutex<Vec<BillingAuditEvent>>>,
    }

    impl RecordingAuditLogger {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<BillingAuditEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn kinds(&self) -> Vec<&'static str> {
            self.events().iter().map(BillingAuditEvent::kind).collect()
        }
    }

    #[async_trait]
    impl BillingAuditLogger for RecordingAuditLogger {
        async fn log(&self, event: BillingAuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
