//! Billing error taxonomy.
//!
//! Every fallible billing operation returns [`BillingError`]. The variants are
//! grouped by how callers are expected to react: configuration errors are fatal,
//! not-found errors may be recovered locally, validation errors are surfaced
//! with a readable reason, and gateway state errors are never guessed around.

use std::fmt;

/// Billing-specific errors.
///
/// Converted to [`crate::error::AppError`] at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Configuration errors
    /// The plan catalog or limit configuration is malformed.
    Configuration { message: String },

    // Not-found errors
    /// No plan with this id or name exists in the catalog.
    PlanNotFound { plan_id: String },
    /// The gateway has no such customer (or it was deleted).
    CustomerNotFound { customer_id: String },
    /// The gateway has no such subscription.
    SubscriptionNotFound { subscription_id: String },
    /// The user has no active local subscription.
    NoActiveSubscription { user_id: String },
    /// The user directory does not know this user.
    UserNotFound { user_id: String },
    /// The user directory does not know this workspace.
    WorkspaceNotFound { workspace_id: String },

    // Validation errors
    /// The requested plan is the one already held.
    SamePlan { plan_id: String },
    /// The target plan exists but cannot be moved to.
    PlanUnavailable { plan_id: String, reason: String },
    /// A yearly plan cannot be downgraded to monthly while time remains.
    DowngradeBlocked { remaining_days: u64 },
    /// Malformed caller input (ids, urls, country codes).
    InvalidInput { message: String },

    // Gateway errors
    /// The gateway subscription is in a state the automation does not handle.
    GatewayState { subscription_id: String, status: String },
    /// The resolved price is billed in a different currency than expected.
    CurrencyMismatch {
        price_id: String,
        expected: String,
        actual: String,
    },
    /// The gateway API returned an error.
    Gateway {
        operation: String,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
    },

    // Infrastructure errors
    /// The local store failed.
    Storage { message: String },
    /// An inbound webhook failed verification or could not be parsed.
    InvalidWebhook { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { message } => write!(f, "Billing configuration error: {}", message),
            Self::PlanNotFound { plan_id } => write!(f, "Plan not found: {}", plan_id),
            Self::CustomerNotFound { customer_id } => {
                write!(f, "No such customer: {}", customer_id)
            }
            Self::SubscriptionNotFound { subscription_id } => {
                write!(f, "No such subscription: {}", subscription_id)
            }
            Self::NoActiveSubscription { user_id } => {
                write!(f, "No active subscription for user: {}", user_id)
            }
            Self::UserNotFound { user_id } => write!(f, "User not found: {}", user_id),
            Self::WorkspaceNotFound { workspace_id } => {
                write!(f, "Workspace not found: {}", workspace_id)
            }
            Self::SamePlan { plan_id } => write!(f, "Already subscribed to plan: {}", plan_id),
            Self::PlanUnavailable { plan_id, reason } => {
                write!(f, "Plan {} is not available: {}", plan_id, reason)
            }
            Self::DowngradeBlocked { remaining_days } => write!(
                f,
                "Cannot switch from yearly to monthly billing while the yearly period is active ({} days remaining)",
                remaining_days
            ),
            Self::InvalidInput { message } => write!(f, "Invalid input: {}", message),
            Self::GatewayState {
                subscription_id,
                status,
            } => write!(
                f,
                "Subscription {} is in unexpected gateway state '{}'",
                subscription_id, status
            ),
            Self::CurrencyMismatch {
                price_id,
                expected,
                actual,
            } => write!(
                f,
                "Price {} is billed in {} but {} was expected",
                price_id, actual, expected
            ),
            Self::Gateway {
                operation,
                message,
                code,
                http_status,
            } => {
                write!(f, "Stripe API error during {}: {}", operation, message)?;
                if let Some(code) = code {
                    write!(f, " (code: {})", code)?;
                }
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::Storage { message } => write!(f, "Billing storage error: {}", message),
            Self::InvalidWebhook { message } => write!(f, "Invalid webhook: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl BillingError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn storage(message: impl fmt::Display) -> Self {
        Self::Storage {
            message: message.to_string(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Whether the error means a referenced resource does not exist.
    ///
    /// A gateway 404 counts, so callers can repair stale handles without
    /// knowing which client produced the error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::PlanNotFound { .. }
            | Self::CustomerNotFound { .. }
            | Self::SubscriptionNotFound { .. }
            | Self::NoActiveSubscription { .. }
            | Self::UserNotFound { .. }
            | Self::WorkspaceNotFound { .. } => true,
            Self::Gateway { http_status, .. } => *http_status == Some(404),
            _ => false,
        }
    }

    /// Whether the error is a rejected request that the caller can correct.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::SamePlan { .. }
                | Self::PlanUnavailable { .. }
                | Self::DowngradeBlocked { .. }
                | Self::InvalidInput { .. }
        )
    }

    /// Whether retrying the same call might succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway { http_status, .. } => {
                matches!(http_status, Some(408 | 429) | Some(500..=599))
            }
            _ => false,
        }
    }
}

/// Result type for billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(status: Option<u16>) -> BillingError {
        BillingError::Gateway {
            operation: "get_subscription".to_string(),
            message: "boom".to_string(),
            code: None,
            http_status: status,
        }
    }

    #[test]
    fn test_gateway_404_is_not_found() {
        assert!(gateway(Some(404)).is_not_found());
        assert!(!gateway(Some(400)).is_not_found());
        assert!(
            BillingError::CustomerNotFound {
                customer_id: "cus_1".to_string()
            }
            .is_not_found()
        );
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(gateway(Some(429)).is_retryable());
        assert!(gateway(Some(503)).is_retryable());
        assert!(gateway(Some(408)).is_retryable());
        assert!(!gateway(Some(402)).is_retryable());
        assert!(!gateway(None).is_retryable());
        assert!(!BillingError::configuration("bad").is_retryable());
    }

    #[test]
    fn test_downgrade_message_carries_days() {
        let err = BillingError::DowngradeBlocked { remaining_days: 10 };
        assert!(err.is_validation());
        assert!(err.to_string().contains("10 days remaining"));
    }

    #[test]
    fn test_gateway_display_includes_code_and_status() {
        let err = BillingError::Gateway {
            operation: "create_customer".to_string(),
            message: "Invalid email".to_string(),
            code: Some("email_invalid".to_string()),
            http_status: Some(400),
        };
        let msg = err.to_string();
        assert!(msg.contains("create_customer"));
        assert!(msg.contains("email_invalid"));
        assert!(msg.contains("HTTP 400"));
    }
}
