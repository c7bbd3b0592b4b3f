//! Upcoming invoice previews.

use async_trait::async_trait;
use serde::Deserialize;

use super::error::Result;
use super::subscription::{ProrationBehavior, SubscriptionItemUpdate};

/// Request to preview the next invoice with an item change applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpcomingInvoiceRequest {
    pub customer_id: String,
    pub subscription_id: String,
    pub items: Vec<SubscriptionItemUpdate>,
    pub proration_behavior: ProrationBehavior,
}

/// A line on a previewed invoice.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct InvoicePreviewLine {
    /// Amount in minor units; negative for credits.
    pub amount: i64,
    #[serde(default)]
    pub proration: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// A previewed invoice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoicePreview {
    pub currency: String,
    pub amount_due: i64,
    pub total: i64,
    pub lines: Vec<InvoicePreviewLine>,
    pub period_end: Option<u64>,
}

impl InvoicePreview {
    /// Sum of proration lines, or `None` when the invoice has none.
    #[must_use]
    pub fn proration_total(&self) -> Option<i64> {
        let mut lines = self.lines.iter().filter(|l| l.proration).peekable();
        lines.peek()?;
        Some(lines.map(|l| l.amount).sum())
    }
}

/// Invoice operations on the gateway.
#[async_trait]
pub trait StripeInvoiceClient: Send + Sync {
    async fn preview_upcoming_invoice(&self, request: UpcomingInvoiceRequest) -> Result<InvoicePreview>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(amount: i64, proration: bool) -> InvoicePreviewLine {
        InvoicePreviewLine {
            amount,
            proration,
            description: None,
        }
    }

    #[test]
    fn test_proration_total() {
        let preview = InvoicePreview {
            currency: "usd".to_string(),
            amount_due: 1500,
            total: 1500,
            lines: vec![line(-600, true), line(1100, true), line(1200, false)],
            period_end: None,
        };
        assert_eq!(preview.proration_total(), Some(500));
    }

    #[test]
    fn test_no_proration_lines() {
        let preview = InvoicePreview {
            currency: "usd".to_string(),
            amount_due: 1200,
            total: 1200,
            lines: vec![line(1200, false)],
            period_end: None,
        };
        assert_eq!(preview.proration_total(), None);
    }
}
