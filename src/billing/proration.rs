//! Mid-cycle plan changes on the gateway.
//!
//! [`ProrationService`] previews the cost of switching plans and performs the
//! switch by swapping the subscription's first item to the new price. Add-on
//! items (every item after the first) are kept, pruned or appended according
//! to the caller's add-on set.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::catalog::PlanCatalog;
use super::client::PaymentGateway;
use super::error::{BillingError, Result};
use super::invoice::UpcomingInvoiceRequest;
use super::plans::{BillingInterval, variant_key};
use super::pricing::verify_currency;
use super::subscription::{
    GatewaySubscription, GatewaySubscriptionItem, ProrationBehavior, SubscriptionItemUpdate,
    UpdateSubscriptionRequest,
};

const SECONDS_PER_DAY: u64 = 86_400;

/// Caller options for an applied change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProrationConfig {
    #[serde(default)]
    pub behavior: ProrationBehavior,
    /// Desired add-on prices. `None` leaves existing add-ons untouched.
    #[serde(default)]
    pub add_on_price_ids: Option<Vec<String>>,
    /// Country for price resolution. Defaults to the country of the current price.
    #[serde(default)]
    pub country_code: Option<String>,
}

/// Display-only cost breakdown of a pending change. Amounts are minor units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProrationPreview {
    pub current_plan_cost: i64,
    pub new_plan_cost: i64,
    pub proration_amount: i64,
    pub next_invoice_amount: i64,
    pub immediate_charge: i64,
    pub currency: String,
    pub period_end: u64,
}

/// Reject a yearly to monthly switch while the yearly period still runs.
///
/// The rejection carries the remaining days, rounded up.
pub fn check_interval_downgrade(
    current: BillingInterval,
    target: BillingInterval,
    current_period_end: u64,
    now: u64,
) -> Result<()> {
    if current == BillingInterval::Yearly
        && target == BillingInterval::Monthly
        && current_period_end > now
    {
        let remaining_days = (current_period_end - now).div_ceil(SECONDS_PER_DAY);
        return Err(BillingError::DowngradeBlocked { remaining_days });
    }
    Ok(())
}

/// Build the item updates for moving `items` to `new_price_id`.
///
/// The first item is the plan and is swapped. With `add_ons` set, later items
/// whose price is not in the set are deleted and missing prices are appended.
#[must_use]
pub fn build_item_updates(
    items: &[GatewaySubscriptionItem],
    new_price_id: &str,
    add_ons: Option<&[String]>,
) -> Vec<SubscriptionItemUpdate> {
    let mut updates = Vec::new();
    let Some((base, extras)) = items.split_first() else {
        return updates;
    };

    updates.push(SubscriptionItemUpdate::Swap {
        item_id: base.id.clone(),
        price_id: new_price_id.to_string(),
    });

    let Some(add_ons) = add_ons else {
        return updates;
    };

    for item in extras {
        if !add_ons.contains(&item.price_id) {
            updates.push(SubscriptionItemUpdate::Delete {
                item_id: item.id.clone(),
            });
        }
    }

    let mut appended: Vec<&str> = Vec::new();
    for price_id in add_ons {
        let present = extras.iter().any(|item| &item.price_id == price_id);
        if !present && !appended.contains(&price_id.as_str()) {
            appended.push(price_id);
            updates.push(SubscriptionItemUpdate::Add {
                price_id: price_id.clone(),
            });
        }
    }

    updates
}

/// Previews and applies plan changes against the gateway.
pub struct ProrationService<G: PaymentGateway> {
    gateway: G,
    catalog: Arc<PlanCatalog>,
}

impl<G: PaymentGateway> ProrationService<G> {
    #[must_use]
    pub fn new(gateway: G, catalog: Arc<PlanCatalog>) -> Self {
        Self { gateway, catalog }
    }

    /// Preview switching `subscription_id` to `new_plan_id`.
    ///
    /// Returns `None` if anything needed for the preview cannot be found.
    pub async fn preview(&self, subscription_id: &str, new_plan_id: &str) -> Option<ProrationPreview> {
        match self.try_preview(subscription_id, new_plan_id).await {
            Ok(preview) => preview,
            Err(e) => {
                tracing::warn!(
                    target: "workspace_billing::billing",
                    subscription_id = subscription_id,
                    new_plan_id = new_plan_id,
                    error = %e,
                    "Proration preview failed"
                );
                None
            }
        }
    }

    async fn try_preview(
        &self,
        subscription_id: &str,
        new_plan_id: &str,
    ) -> Result<Option<ProrationPreview>> {
        let subscription = self.gateway.get_subscription(subscription_id).await?;
        let Some(base) = subscription.base_item() else {
            return Ok(None);
        };

        let plans = self.catalog.snapshot().await;
        let prices = self.catalog.price_resolver();

        let Some(current) = prices.find_plan_by_price_handle(&plans, &base.price_id) else {
            return Ok(None);
        };
        let Some(current_variant) =
            plans.resolve_variant(&variant_key(&current.plan_id, current.interval))
        else {
            return Ok(None);
        };
        let Some(target) = plans.resolve_variant(new_plan_id) else {
            return Ok(None);
        };

        let country = current.country.as_deref();
        let current_price = prices.resolve(current_variant.plan, current.interval, country)?;
        let target_price = prices.resolve(target.plan, target.interval, country)?;
        let Some(target_price_id) = target_price.price_id.as_deref() else {
            return Ok(None);
        };

        let invoice = self
            .gateway
            .preview_upcoming_invoice(UpcomingInvoiceRequest {
                customer_id: subscription.customer_id.clone(),
                subscription_id: subscription.id.clone(),
                items: build_item_updates(&subscription.items, target_price_id, None),
                proration_behavior: ProrationBehavior::CreateProrations,
            })
            .await?;

        // Upgrades do not always produce a dedicated proration line.
        let proration_amount = invoice
            .proration_total()
            .unwrap_or_else(|| invoice.amount_due.max(0));

        Ok(Some(ProrationPreview {
            current_plan_cost: current_price.amount_cents,
            new_plan_cost: target_price.amount_cents,
            proration_amount,
            next_invoice_amount: invoice.amount_due,
            immediate_charge: proration_amount.max(0),
            currency: invoice.currency,
            period_end: invoice.period_end.unwrap_or(subscription.current_period_end),
        }))
    }

    /// Switch `subscription_id` to `new_plan_id` at the gateway.
    ///
    /// The target price's currency is verified first; a mismatch aborts
    /// before any mutation.
    pub async fn apply_change(
        &self,
        subscription_id: &str,
        new_plan_id: &str,
        config: &ProrationConfig,
    ) -> Result<GatewaySubscription> {
        let subscription = self.gateway.get_subscription(subscription_id).await?;
        self.apply_change_to(&subscription, new_plan_id, config).await
    }

    /// Like [`apply_change`](Self::apply_change) for an already retrieved subscription.
    pub async fn apply_change_to(
        &self,
        subscription: &GatewaySubscription,
        new_plan_id: &str,
        config: &ProrationConfig,
    ) -> Result<GatewaySubscription> {
        if subscription.items.is_empty() {
            return Err(BillingError::GatewayState {
                subscription_id: subscription.id.clone(),
                status: format!("{} (no items)", subscription.status),
            });
        }

        let plans = self.catalog.snapshot().await;
        let prices = self.catalog.price_resolver();
        let target = plans
            .resolve_variant(new_plan_id)
            .ok_or_else(|| BillingError::PlanNotFound {
                plan_id: new_plan_id.to_string(),
            })?;

        let current_country = subscription
            .base_price_id()
            .and_then(|price_id| prices.find_plan_by_price_handle(&plans, price_id))
            .and_then(|found| found.country);
        let country = config.country_code.as_deref().or(current_country.as_deref());

        let resolved = prices.resolve(target.plan, target.interval, country)?;
        let price_id = resolved
            .price_id
            .clone()
            .ok_or_else(|| BillingError::PlanUnavailable {
                plan_id: new_plan_id.to_string(),
                reason: "plan is not billed through the gateway".to_string(),
            })?;
        verify_currency(&self.gateway, &resolved).await?;

        let items = build_item_updates(
            &subscription.items,
            &price_id,
            config.add_on_price_ids.as_deref(),
        );

        tracing::info!(
            target: "workspace_billing::billing",
            subscription_id = %subscription.id,
            new_plan_id = new_plan_id,
            price_id = %price_id,
            proration = config.behavior.as_str(),
            item_updates = items.len(),
            "Applying plan change at gateway"
        );

        self.gateway
            .update_subscription(
                &subscription.id,
                UpdateSubscriptionRequest {
                    items,
                    proration_behavior: config.behavior,
                },
            )
            .await
    }

    /// Check that moving from `current_plan_id` to `new_plan_id` is allowed.
    ///
    /// An unknown current plan is logged and tolerated: users must be able
    /// to leave a plan that was removed from the catalog.
    pub async fn validate_change(&self, current_plan_id: Option<&str>, new_plan_id: &str) -> Result<()> {
        if current_plan_id == Some(new_plan_id) {
            return Err(BillingError::SamePlan {
                plan_id: new_plan_id.to_string(),
            });
        }

        let plans = self.catalog.snapshot().await;
        let target = plans
            .resolve_variant(new_plan_id)
            .ok_or_else(|| BillingError::PlanNotFound {
                plan_id: new_plan_id.to_string(),
            })?;

        if !target.plan.active {
            return Err(BillingError::PlanUnavailable {
                plan_id: new_plan_id.to_string(),
                reason: "plan is no longer offered".to_string(),
            });
        }
        if target.is_free() {
            return Err(BillingError::PlanUnavailable {
                plan_id: new_plan_id.to_string(),
                reason: "plan is not billed through the gateway".to_string(),
            });
        }

        if let Some(current) = current_plan_id {
            if plans.resolve_variant(current).is_none() {
                tracing::warn!(
                    target: "workspace_billing::billing",
                    current_plan_id = current,
                    new_plan_id = new_plan_id,
                    "Current plan is not in the catalog, allowing change"
                );
            }
        }

        Ok(())
    }
}
