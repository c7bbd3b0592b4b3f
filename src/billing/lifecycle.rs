//! Subscription lifecycle orchestration.
//!
//! [`SubscriptionLifecycle`] is the only writer of subscription rows. Every
//! operation can be re-run with the same inputs and converges on the same end
//! state: at most one ACTIVE (or TRIALING) row per user, with fields matching
//! the gateway's last known values.
//!
//! Local writes and gateway calls are not transactional. A crash between them
//! leaves the local row behind the gateway, which [`sync`](SubscriptionLifecycle::sync)
//! repairs.

use std::sync::Arc;

use serde::Serialize;

use super::access::AccessStatusCache;
use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::catalog::PlanCatalog;
use super::checkout::{CheckoutConfig, CheckoutMetadata, CheckoutSession, CreateCheckoutSessionRequest};
use super::client::PaymentGateway;
use super::customer::{CustomerHandle, CustomerManager};
use super::error::{BillingError, Result};
use super::plans::{PlanSet, split_variant_key, variant_key};
use super::pricing::{ResolvedPrice, verify_currency};
use super::proration::{ProrationConfig, ProrationService, check_interval_downgrade};
use super::storage::{BillingUser, Subscription, SubscriptionStatus, SubscriptionStore, UserDirectory};
use super::subscription::GatewaySubscription;
use super::validation::{validate_entity_id, validate_plan_id};
use crate::utils::now_unix;

/// Length of the local period window for free plans.
const FREE_PERIOD_SECS: u64 = 365 * 86_400;

/// Tier label used when no catalog plan is free.
const DEFAULT_FREE_TIER: &str = "free";

/// Result of [`SubscriptionLifecycle::create`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreateOutcome {
    /// A free plan was activated locally.
    Activated { subscription: Subscription },
    /// The user must complete checkout; the gateway webhook finishes the job.
    CheckoutRequired {
        session: CheckoutSession,
        price: ResolvedPrice,
    },
}

/// Result of [`SubscriptionLifecycle::change`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChangeOutcome {
    /// Already on the requested plan.
    Unchanged { subscription: Subscription },
    /// No updatable paid subscription; handled as a create.
    Delegated { created: CreateOutcome },
    Changed { subscription: Subscription },
}

/// Result of [`SubscriptionLifecycle::cancel`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    Canceled { subscription: Subscription },
    /// Nothing active to cancel.
    AlreadyCanceled,
}

/// Result of [`SubscriptionLifecycle::sync`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The local row mirrors the chosen gateway subscription.
    Synced {
        subscription: Subscription,
        changed: bool,
    },
    /// The gateway has no subscriptions; paid rows were canceled.
    Cleared { canceled: usize },
    /// The gateway subscription's price maps to no catalog plan.
    Unresolvable {
        gateway_subscription_id: String,
        canceled: usize,
    },
}

/// Orchestrates create, change, cancel and sync.
pub struct SubscriptionLifecycle<S, D, G>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    store: S,
    directory: D,
    gateway: G,
    catalog: Arc<PlanCatalog>,
    proration: ProrationService<G>,
    customers: CustomerManager<S, G>,
    checkout: CheckoutConfig,
    audit: Arc<dyn BillingAuditLogger>,
    access_cache: Option<AccessStatusCache>,
}

impl<S, D, G> SubscriptionLifecycle<S, D, G>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    #[must_use]
    pub fn new(
        store: S,
        directory: D,
        gateway: G,
        catalog: Arc<PlanCatalog>,
        checkout: CheckoutConfig,
    ) -> Self {
        Self {
            proration: ProrationService::new(gateway.clone(), catalog.clone()),
            customers: CustomerManager::new(store.clone(), gateway.clone()),
            store,
            directory,
            gateway,
            catalog,
            checkout,
            audit: Arc::new(NoOpAuditLogger),
            access_cache: None,
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Invalidate `cache` for the affected owner after every write.
    #[must_use]
    pub fn with_access_cache(mut self, cache: AccessStatusCache) -> Self {
        self.access_cache = Some(cache);
        self
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<PlanCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn proration(&self) -> &ProrationService<G> {
        &self.proration
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    // Create

    /// Start a subscription to `plan_id` for `user_id`.
    ///
    /// Free plans are activated locally. Paid plans cancel any existing paid
    /// subscription, make sure the user has a usable gateway customer, and
    /// return a checkout session for the price resolved for `country`.
    pub async fn create(
        &self,
        user_id: &str,
        plan_id: &str,
        country: Option<&str>,
    ) -> Result<CreateOutcome> {
        validate_entity_id("user", user_id)?;
        validate_plan_id(plan_id)?;

        let plans = self.catalog.snapshot().await;
        let variant = plans
            .resolve_variant(plan_id)
            .ok_or_else(|| BillingError::PlanNotFound {
                plan_id: plan_id.to_string(),
            })?;
        if !variant.plan.active {
            return Err(BillingError::PlanUnavailable {
                plan_id: plan_id.to_string(),
                reason: "plan is no longer offered".to_string(),
            });
        }

        let user = self.get_user(user_id).await?;
        let resolved = self
            .catalog
            .price_resolver()
            .resolve(variant.plan, variant.interval, country)?;

        if resolved.is_free() {
            let subscription = self
                .activate_free(&user, &variant.id(), &variant.plan.name)
                .await?;
            return Ok(CreateOutcome::Activated { subscription });
        }

        let Some(price_id) = resolved.price_id.clone() else {
            return Err(BillingError::configuration(format!(
                "plan '{}' resolved without a price handle",
                plan_id
            )));
        };

        verify_currency(&self.gateway, &resolved).await?;

        self.cancel_existing_paid(user_id).await?;

        let handle = self.customers.ensure_customer(&user).await?;
        self.audit_customer(user_id, &handle).await;

        let session = self
            .gateway
            .create_checkout_session(CreateCheckoutSessionRequest {
                customer_id: handle.id().to_string(),
                price_id: price_id.clone(),
                success_url: self.checkout.success_url.clone(),
                cancel_url: self.checkout.cancel_url.clone(),
                metadata: CheckoutMetadata {
                    user_id: user_id.to_string(),
                    plan_id: variant.id(),
                },
            })
            .await?;

        tracing::info!(
            target: "workspace_billing::billing",
            user_id = user_id,
            plan_id = %variant.id(),
            price_id = %price_id,
            currency = %resolved.currency,
            used_fallback = resolved.used_fallback,
            session_id = %session.id,
            "Checkout session created"
        );
        self.audit
            .log(BillingAuditEvent::CheckoutStarted {
                user_id: user_id.to_string(),
                plan_id: variant.id(),
                price_id,
                session_id: session.id.clone(),
                used_fallback: resolved.used_fallback,
            })
            .await;

        Ok(CreateOutcome::CheckoutRequired {
            session,
            price: resolved,
        })
    }

    async fn activate_free(
        &self,
        user: &BillingUser,
        plan_variant_id: &str,
        tier: &str,
    ) -> Result<Subscription> {
        if let Some(active) = self.store.active_subscription(&user.id).await? {
            if !active.is_paid() && active.plan_id == plan_variant_id {
                return Ok(active);
            }
        }

        self.cancel_existing_paid(&user.id).await?;

        let now = now_unix();
        // Anything still active is a different free row.
        if let Some(mut previous) = self.store.active_subscription(&user.id).await? {
            self.mark_canceled(&mut previous, now).await?;
        }

        let subscription = Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            plan_id: plan_variant_id.to_string(),
            gateway_subscription_id: None,
            gateway_customer_id: None,
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: now + FREE_PERIOD_SECS,
            cancel_at_period_end: false,
            canceled_at: None,
            trial_start: None,
            trial_end: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_subscription(&subscription).await?;
        self.directory.set_workspace_tier(&user.id, tier).await?;
        self.invalidate_owner(&user.id);

        tracing::info!(
            target: "workspace_billing::billing",
            user_id = %user.id,
            plan_id = plan_variant_id,
            subscription_id = %subscription.id,
            "Free plan activated"
        );
        self.audit
            .log(BillingAuditEvent::FreePlanActivated {
                user_id: user.id.clone(),
                plan_id: plan_variant_id.to_string(),
                subscription_id: subscription.id.clone(),
            })
            .await;

        Ok(subscription)
    }

    /// Cancel every active paid subscription the user holds, at the gateway
    /// and locally. A no-op when there is none.
    ///
    /// Fails with `GatewayState` while any gateway subscription is stalled
    /// (`past_due`, `unpaid`, `incomplete`), before anything is canceled.
    async fn cancel_existing_paid(&self, user_id: &str) -> Result<usize> {
        let mut handled: Vec<String> = Vec::new();

        if let Some(customer_id) = self.store.get_customer_id(user_id).await? {
            let subs = self.list_customer_subscriptions(&customer_id).await?;
            if let Some(stalled) = subs.iter().find(|s| s.is_stalled()) {
                return Err(stalled_error(user_id, stalled));
            }
            for sub in subs {
                if !sub.is_active() {
                    continue;
                }
                let canceled = self.gateway.cancel_subscription(&sub.id).await?;
                self.record_gateway_cancel(user_id, &canceled).await?;
                handled.push(sub.id);
            }
        }

        for mut row in self.store.subscriptions_for_user(user_id).await? {
            if !row.status.is_open() {
                continue;
            }
            let Some(gateway_id) = row.gateway_subscription_id.clone() else {
                continue;
            };
            if handled.contains(&gateway_id) {
                continue;
            }
            match self.gateway.get_subscription(&gateway_id).await {
                Ok(sub) if sub.is_active() => {
                    let canceled = self.gateway.cancel_subscription(&gateway_id).await?;
                    apply_gateway_fields(&mut row, &canceled);
                    handled.push(gateway_id);
                }
                Ok(sub) if sub.is_stalled() => return Err(stalled_error(user_id, &sub)),
                Ok(sub) => apply_gateway_fields(&mut row, &sub),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            self.mark_canceled(&mut row, now_unix()).await?;
        }

        if !handled.is_empty() {
            tracing::info!(
                target: "workspace_billing::billing",
                user_id = user_id,
                canceled = handled.len(),
                "Canceled existing paid subscriptions"
            );
            self.invalidate_owner(user_id);
        }
        Ok(handled.len())
    }

    /// The paid row the gateway may still bill: the active row when it is
    /// paid, else the newest paid row that is not CANCELED or
    /// INCOMPLETE_EXPIRED.
    async fn billable_row(
        &self,
        user_id: &str,
        active: Option<&Subscription>,
    ) -> Result<Option<Subscription>> {
        if let Some(row) = active.filter(|row| row.is_paid()) {
            return Ok(Some(row.clone()));
        }
        Ok(self
            .store
            .subscriptions_for_user(user_id)
            .await?
            .into_iter()
            .find(|row| row.is_paid() && row.status.is_open()))
    }

    async fn record_gateway_cancel(&self, user_id: &str, canceled: &GatewaySubscription) -> Result<()> {
        let Some(mut row) = self.store.subscription_by_gateway_id(&canceled.id).await? else {
            return Ok(());
        };
        apply_gateway_fields(&mut row, canceled);
        self.mark_canceled(&mut row, now_unix()).await?;
        self.audit
            .log(BillingAuditEvent::SubscriptionCanceled {
                user_id: user_id.to_string(),
                subscription_id: row.id.clone(),
                local_only: false,
            })
            .await;
        Ok(())
    }

    // Change

    /// Move `user_id` to `new_plan_id`.
    ///
    /// Requests for the current plan change nothing. Without an updatable
    /// paid subscription the request is handled as a create.
    pub async fn change(
        &self,
        user_id: &str,
        new_plan_id: &str,
        config: &ProrationConfig,
    ) -> Result<ChangeOutcome> {
        validate_entity_id("user", user_id)?;
        validate_plan_id(new_plan_id)?;

        let current = self.store.active_subscription(user_id).await?;
        if let Some(subscription) = current.as_ref().filter(|s| s.plan_id == new_plan_id) {
            return Ok(ChangeOutcome::Unchanged {
                subscription: subscription.clone(),
            });
        }

        let plans = self.catalog.snapshot().await;
        let target = plans
            .resolve_variant(new_plan_id)
            .ok_or_else(|| BillingError::PlanNotFound {
                plan_id: new_plan_id.to_string(),
            })?;

        let country = config.country_code.as_deref();
        let paid = self.billable_row(user_id, current.as_ref()).await?;

        if target.is_free() {
            return self.delegate(user_id, new_plan_id, country).await;
        }
        let Some(mut row) = paid else {
            return self.delegate(user_id, new_plan_id, country).await;
        };
        let Some(gateway_id) = row.gateway_subscription_id.clone() else {
            return self.delegate(user_id, new_plan_id, country).await;
        };

        let gateway_sub = match self.gateway.get_subscription(&gateway_id).await {
            Ok(sub) => sub,
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    target: "workspace_billing::billing",
                    user_id = user_id,
                    subscription_id = %gateway_id,
                    "Gateway subscription no longer exists, starting a new one"
                );
                self.mark_canceled(&mut row, now_unix()).await?;
                return self.delegate(user_id, new_plan_id, country).await;
            }
            Err(e) => return Err(e),
        };

        if gateway_sub.is_terminal() {
            apply_gateway_fields(&mut row, &gateway_sub);
            self.mark_canceled(&mut row, now_unix()).await?;
            return self.delegate(user_id, new_plan_id, country).await;
        }
        if !gateway_sub.is_active() {
            return Err(stalled_error(user_id, &gateway_sub));
        }

        self.proration
            .validate_change(Some(&row.plan_id), new_plan_id)
            .await?;

        let (_, current_interval) = split_variant_key(&row.plan_id);
        check_interval_downgrade(
            current_interval,
            target.interval,
            gateway_sub.current_period_end,
            now_unix(),
        )?;

        let updated = self
            .proration
            .apply_change_to(&gateway_sub, new_plan_id, config)
            .await?;

        let from_plan_id = std::mem::replace(&mut row.plan_id, new_plan_id.to_string());
        apply_gateway_fields(&mut row, &updated);
        if let Some(status) = SubscriptionStatus::from_gateway(&updated.status) {
            row.status = status;
        }
        row.updated_at = now_unix();
        self.store.update_subscription(&row).await?;
        self.directory
            .set_workspace_tier(user_id, &target.plan.name)
            .await?;
        self.invalidate_owner(user_id);

        tracing::info!(
            target: "workspace_billing::billing",
            user_id = user_id,
            subscription_id = %gateway_id,
            from_plan_id = %from_plan_id,
            to_plan_id = new_plan_id,
            proration = config.behavior.as_str(),
            "Plan changed"
        );
        self.audit
            .log(BillingAuditEvent::PlanChanged {
                user_id: user_id.to_string(),
                subscription_id: row.id.clone(),
                from_plan_id,
                to_plan_id: new_plan_id.to_string(),
            })
            .await;

        Ok(ChangeOutcome::Changed { subscription: row })
    }

    async fn delegate(
        &self,
        user_id: &str,
        plan_id: &str,
        country: Option<&str>,
    ) -> Result<ChangeOutcome> {
        let created = self.create(user_id, plan_id, country).await?;
        Ok(ChangeOutcome::Delegated { created })
    }

    // Cancel

    /// Cancel the user's subscription immediately.
    ///
    /// Without an active row the newest paid row the gateway may still bill
    /// (e.g. PAST_DUE) is canceled instead. A gateway subscription that no
    /// longer exists is canceled locally only.
    pub async fn cancel(&self, user_id: &str) -> Result<CancelOutcome> {
        validate_entity_id("user", user_id)?;

        let row = match self.store.active_subscription(user_id).await? {
            Some(active) => Some(active),
            None => self.billable_row(user_id, None).await?,
        };
        let Some(mut row) = row else {
            if self.store.subscriptions_for_user(user_id).await?.is_empty() {
                return Err(BillingError::NoActiveSubscription {
                    user_id: user_id.to_string(),
                });
            }
            return Ok(CancelOutcome::AlreadyCanceled);
        };

        let local_only = match row.gateway_subscription_id.clone() {
            None => true,
            Some(gateway_id) => match self.gateway.get_subscription(&gateway_id).await {
                Ok(sub) if sub.is_terminal() => {
                    apply_gateway_fields(&mut row, &sub);
                    true
                }
                Ok(_) => {
                    let canceled = self.gateway.cancel_subscription(&gateway_id).await?;
                    apply_gateway_fields(&mut row, &canceled);
                    false
                }
                Err(e) if e.is_not_found() => true,
                Err(e) => return Err(e),
            },
        };

        row.cancel_at_period_end = false;
        self.mark_canceled(&mut row, now_unix()).await?;

        let plans = self.catalog.snapshot().await;
        self.directory
            .set_workspace_tier(user_id, &free_tier_label(&plans))
            .await?;
        self.invalidate_owner(user_id);

        tracing::info!(
            target: "workspace_billing::billing",
            user_id = user_id,
            subscription_id = %row.id,
            local_only = local_only,
            "Subscription canceled"
        );
        self.audit
            .log(BillingAuditEvent::SubscriptionCanceled {
                user_id: user_id.to_string(),
                subscription_id: row.id.clone(),
                local_only,
            })
            .await;

        Ok(CancelOutcome::Canceled { subscription: row })
    }

    // Sync

    /// Reconcile the user's local rows with the gateway.
    ///
    /// Rows are only written when a field differs, so a repeated sync with
    /// no gateway change leaves them untouched.
    pub async fn sync(&self, user_id: &str) -> Result<SyncOutcome> {
        validate_entity_id("user", user_id)?;

        let gateway_subs = match self.store.get_customer_id(user_id).await? {
            Some(customer_id) => self.list_customer_subscriptions(&customer_id).await?,
            None => Vec::new(),
        };
        let plans = self.catalog.snapshot().await;

        let Some(chosen) = pick_subscription(gateway_subs) else {
            let canceled = self.cancel_paid_rows(user_id, None).await?;
            self.finish_sync(user_id, &plans).await?;
            if canceled > 0 {
                self.audit
                    .log(BillingAuditEvent::SyncCanceled {
                        user_id: user_id.to_string(),
                        count: canceled,
                        reason: "no gateway subscriptions".to_string(),
                    })
                    .await;
            }
            return Ok(SyncOutcome::Cleared { canceled });
        };

        let found = chosen.base_price_id().and_then(|price_id| {
            self.catalog
                .price_resolver()
                .find_plan_by_price_handle(&plans, price_id)
        });
        let Some(found) = found else {
            tracing::warn!(
                target: "workspace_billing::billing",
                user_id = user_id,
                subscription_id = %chosen.id,
                price_id = chosen.base_price_id(),
                "Gateway price maps to no catalog plan, canceling local subscription"
            );
            let canceled = self.cancel_paid_rows(user_id, Some(&chosen.id)).await?;
            self.finish_sync(user_id, &plans).await?;
            if canceled > 0 {
                self.audit
                    .log(BillingAuditEvent::SyncCanceled {
                        user_id: user_id.to_string(),
                        count: canceled,
                        reason: "plan not in catalog".to_string(),
                    })
                    .await;
            }
            return Ok(SyncOutcome::Unresolvable {
                gateway_subscription_id: chosen.id,
                canceled,
            });
        };

        let status = SubscriptionStatus::from_gateway(&chosen.status).ok_or_else(|| {
            BillingError::GatewayState {
                subscription_id: chosen.id.clone(),
                status: chosen.status.clone(),
            }
        })?;
        let plan_id = variant_key(&found.plan_id, found.interval);
        let now = now_unix();

        let (subscription, changed) = match self.store.subscription_by_gateway_id(&chosen.id).await? {
            Some(existing) => {
                let mut desired = existing.clone();
                desired.plan_id = plan_id;
                desired.status = status;
                apply_gateway_fields(&mut desired, &chosen);
                if desired == existing {
                    (existing, false)
                } else {
                    desired.updated_at = now;
                    self.store.update_subscription(&desired).await?;
                    (desired, true)
                }
            }
            None => {
                let mut row = Subscription {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: user_id.to_string(),
                    plan_id,
                    gateway_subscription_id: Some(chosen.id.clone()),
                    gateway_customer_id: None,
                    status,
                    current_period_start: 0,
                    current_period_end: 0,
                    cancel_at_period_end: false,
                    canceled_at: None,
                    trial_start: None,
                    trial_end: None,
                    created_at: now,
                    updated_at: now,
                };
                apply_gateway_fields(&mut row, &chosen);
                self.store.insert_subscription(&row).await?;
                (row, true)
            }
        };

        if subscription.status.is_active() {
            for mut other in self.store.subscriptions_for_user(user_id).await? {
                if other.id != subscription.id && other.status.is_active() {
                    self.mark_canceled(&mut other, now).await?;
                }
            }
        }

        self.finish_sync(user_id, &plans).await?;

        if changed {
            tracing::info!(
                target: "workspace_billing::billing",
                user_id = user_id,
                subscription_id = %chosen.id,
                plan_id = %subscription.plan_id,
                status = %subscription.status,
                "Subscription synced"
            );
            self.audit
                .log(BillingAuditEvent::SubscriptionSynced {
                    user_id: user_id.to_string(),
                    subscription_id: subscription.id.clone(),
                    plan_id: subscription.plan_id.clone(),
                    status: subscription.status.to_string(),
                })
                .await;
        }

        Ok(SyncOutcome::Synced {
            subscription,
            changed,
        })
    }

    /// Mark the user's paid rows CANCELED, optionally only those tracking
    /// one gateway subscription.
    async fn cancel_paid_rows(&self, user_id: &str, gateway_id: Option<&str>) -> Result<usize> {
        let now = now_unix();
        let mut canceled = 0;
        for mut row in self.store.subscriptions_for_user(user_id).await? {
            let Some(row_gateway_id) = row.gateway_subscription_id.as_deref() else {
                continue;
            };
            if gateway_id.is_some_and(|id| id != row_gateway_id) {
                continue;
            }
            if self.mark_canceled(&mut row, now).await? {
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    /// Refresh the tier label from the active row and drop cached access.
    async fn finish_sync(&self, user_id: &str, plans: &PlanSet) -> Result<()> {
        let tier = match self.store.active_subscription(user_id).await? {
            Some(active) => tier_label(plans, &active.plan_id),
            None => free_tier_label(plans),
        };
        self.directory.set_workspace_tier(user_id, &tier).await?;
        self.invalidate_owner(user_id);
        Ok(())
    }

    // Helpers

    /// A customer the gateway no longer knows has no subscriptions.
    async fn list_customer_subscriptions(&self, customer_id: &str) -> Result<Vec<GatewaySubscription>> {
        match self.gateway.list_subscriptions(customer_id).await {
            Ok(subs) => Ok(subs),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn get_user(&self, user_id: &str) -> Result<BillingUser> {
        self.directory
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound {
                user_id: user_id.to_string(),
            })
    }

    /// Set CANCELED and persist. Returns whether the row changed.
    async fn mark_canceled(&self, row: &mut Subscription, now: u64) -> Result<bool> {
        if row.status == SubscriptionStatus::Canceled {
            return Ok(false);
        }
        row.status = SubscriptionStatus::Canceled;
        if row.canceled_at.is_none() {
            row.canceled_at = Some(now);
        }
        row.updated_at = now;
        self.store.update_subscription(row).await?;
        Ok(true)
    }

    async fn audit_customer(&self, user_id: &str, handle: &CustomerHandle) {
        let event = match handle {
            CustomerHandle::Existing(_) => return,
            CustomerHandle::Created(customer_id) => BillingAuditEvent::CustomerCreated {
                user_id: user_id.to_string(),
                customer_id: customer_id.clone(),
            },
            CustomerHandle::Recreated { stale, customer_id } => BillingAuditEvent::CustomerRecreated {
                user_id: user_id.to_string(),
                stale_customer_id: stale.clone(),
                customer_id: customer_id.clone(),
            },
        };
        self.audit.log(event).await;
    }

    fn invalidate_owner(&self, user_id: &str) {
        if let Some(cache) = &self.access_cache {
            cache.invalidate_owner(user_id);
        }
    }
}

impl<S, D, G> std::fmt::Debug for SubscriptionLifecycle<S, D, G>
where
    S: SubscriptionStore + Clone,
    D: UserDirectory,
    G: PaymentGateway + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionLifecycle")
            .field("catalog", &self.catalog)
            .field("checkout", &self.checkout)
            .finish_non_exhaustive()
    }
}

fn stalled_error(user_id: &str, sub: &GatewaySubscription) -> BillingError {
    tracing::error!(
        target: "workspace_billing::billing",
        user_id = user_id,
        subscription_id = %sub.id,
        status = %sub.status,
        "Gateway subscription is in a state that blocks billing changes"
    );
    BillingError::GatewayState {
        subscription_id: sub.id.clone(),
        status: sub.status.clone(),
    }
}

/// The active subscription, else the most recently created one.
fn pick_subscription(subs: Vec<GatewaySubscription>) -> Option<GatewaySubscription> {
    if let Some(active) = subs.iter().find(|s| s.is_active()) {
        return Some(active.clone());
    }
    subs.into_iter()
        .max_by(|a, b| a.created.cmp(&b.created).then_with(|| b.id.cmp(&a.id)))
}

/// Copy the gateway's period, cancel and trial fields onto a row.
fn apply_gateway_fields(row: &mut Subscription, sub: &GatewaySubscription) {
    row.gateway_customer_id = Some(sub.customer_id.clone());
    row.current_period_start = sub.current_period_start;
    row.current_period_end = sub.current_period_end;
    row.cancel_at_period_end = sub.cancel_at_period_end;
    row.canceled_at = sub.canceled_at;
    row.trial_start = sub.trial_start;
    row.trial_end = sub.trial_end;
}

/// Workspace tier label for a variant id: the base plan's name.
fn tier_label(plans: &PlanSet, plan_id: &str) -> String {
    plans
        .get_plan_by_id(plan_id)
        .map(|plan| plan.name.clone())
        .unwrap_or_else(|| split_variant_key(plan_id).0.to_string())
}

fn free_tier_label(plans: &PlanSet) -> String {
    plans
        .active_plans()
        .into_iter()
        .find(|plan| plan.is_free())
        .map_or_else(|| DEFAULT_FREE_TIER.to_string(), |plan| plan.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::test::RecordingAuditLogger;
    use crate::billing::client::test::{GatewayCall, MockGateway};
    use crate::billing::limits::LimitResolver;
    use crate::billing::plans::fixtures::CATALOG_JSON;
    use crate::billing::pricing::PriceResolver;
    use crate::billing::storage::test::{InMemorySubscriptionStore, InMemoryUserDirectory};
    use crate::billing::subscription::GatewaySubscriptionItem;
    use std::collections::HashMap;

    const DAY: u64 = 86_400;

    type Lifecycle = SubscriptionLifecycle<InMemorySubscriptionStore, InMemoryUserDirectory, MockGateway>;

    struct Fixture {
        lifecycle: Lifecycle,
        store: InMemorySubscriptionStore,
        directory: InMemoryUserDirectory,
        gateway: MockGateway,
        audit: RecordingAuditLogger,
    }

    fn fixture() -> Fixture {
        let store = InMemorySubscriptionStore::new();
        let directory = InMemoryUserDirectory::new();
        directory.add_user(BillingUser {
            id: "user_1".to_string(),
            email: "ada@example.com".to_string(),
            name: Some("Ada".to_string()),
            trial_end: None,
        });
        directory.add_workspace("ws_1", "user_1");

        let gateway = MockGateway::new();
        gateway.add_price("price_pro_monthly", "usd", 1200);
        gateway.add_price("price_pro_yearly", "usd", 12000);
        gateway.add_price("price_pro_monthly_in", "inr", 49900);
        gateway.add_price("price_pro_yearly_in", "inr", 499000);

        let catalog = Arc::new(
            PlanCatalog::from_json(CATALOG_JSON, PriceResolver::default(), LimitResolver::default())
                .unwrap(),
        );
        let audit = RecordingAuditLogger::new();
        let lifecycle = SubscriptionLifecycle::new(
            store.clone(),
            directory.clone(),
            gateway.clone(),
            catalog,
            CheckoutConfig::new("https://app.example.com/ok", "https://app.example.com/cancel"),
        )
        .with_audit_logger(Arc::new(audit.clone()));

        Fixture {
            lifecycle,
            store,
            directory,
            gateway,
            audit,
        }
    }

    fn gateway_sub(id: &str, price: &str, status: &str, created: u64) -> GatewaySubscription {
        let now = now_unix();
        GatewaySubscription {
            id: id.to_string(),
            customer_id: "cus_1".to_string(),
            status: status.to_string(),
            items: vec![GatewaySubscriptionItem {
                id: format!("si_{}", id),
                price_id: price.to_string(),
                quantity: 1,
            }],
            current_period_start: now - DAY,
            current_period_end: now + 29 * DAY,
            cancel_at_period_end: false,
            canceled_at: None,
            trial_start: None,
            trial_end: None,
            created,
            metadata: HashMap::new(),
        }
    }

    /// Link user_1 to cus_1 and mirror `sub` locally as `plan_id`.
    async fn subscribed(f: &Fixture, sub: GatewaySubscription, plan_id: &str) -> Subscription {
        f.gateway.add_customer("cus_1");
        f.store.set_customer_id("user_1", "cus_1").await.unwrap();
        let row = Subscription {
            id: format!("row_{}", sub.id),
            user_id: "user_1".to_string(),
            plan_id: plan_id.to_string(),
            gateway_subscription_id: Some(sub.id.clone()),
            gateway_customer_id: Some(sub.customer_id.clone()),
            status: SubscriptionStatus::from_gateway(&sub.status).unwrap_or(SubscriptionStatus::Active),
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            cancel_at_period_end: false,
            canceled_at: None,
            trial_start: None,
            trial_end: None,
            created_at: sub.created,
            updated_at: sub.created,
        };
        f.gateway.add_subscription(sub);
        f.store.seed(row.clone());
        row
    }

    fn active_rows(store: &InMemorySubscriptionStore) -> Vec<Subscription> {
        store
            .all_subscriptions()
            .into_iter()
            .filter(|s| s.status.is_active())
            .collect()
    }

    #[tokio::test]
    async fn test_create_free_activates_locally() {
        let f = fixture();
        let outcome = f.lifecycle.create("user_1", "free", None).await.unwrap();
        let CreateOutcome::Activated { subscription } = outcome else {
            panic!("expected activation");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.current_period_end - subscription.current_period_start, FREE_PERIOD_SECS);
        assert!(f.gateway.mutations().is_empty());
        assert_eq!(f.directory.workspace_tier("ws_1").as_deref(), Some("free"));

        // Re-running converges on the same row.
        let again = f.lifecycle.create("user_1", "free", None).await.unwrap();
        assert_eq!(again, CreateOutcome::Activated { subscription });
        assert_eq!(active_rows(&f.store).len(), 1);
        assert_eq!(f.audit.kinds(), vec!["free_plan_activated"]);
    }

    #[tokio::test]
    async fn test_create_paid_uses_country_price() {
        let f = fixture();
        let outcome = f.lifecycle.create("user_1", "pro", Some("IN")).await.unwrap();
        let CreateOutcome::CheckoutRequired { price, .. } = outcome else {
            panic!("expected checkout");
        };
        assert!(!price.used_fallback);

        let requests = f.gateway.checkout_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].price_id, "price_pro_monthly_in");
        assert_eq!(requests[0].metadata.plan_id, "pro");
        assert_eq!(f.audit.kinds(), vec!["customer_created", "checkout_started"]);
    }

    #[tokio::test]
    async fn test_create_paid_falls_back_to_default_price() {
        let f = fixture();
        let outcome = f.lifecycle.create("user_1", "pro_annual", Some("FR")).await.unwrap();
        let CreateOutcome::CheckoutRequired { price, .. } = outcome else {
            panic!("expected checkout");
        };
        assert!(price.used_fallback);
        assert_eq!(f.gateway.checkout_requests()[0].price_id, "price_pro_yearly");
        assert!(matches!(
            &f.audit.events()[1],
            BillingAuditEvent::CheckoutStarted { used_fallback: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_create_currency_mismatch_blocks_checkout() {
        let f = fixture();
        f.gateway.add_price("price_pro_monthly_in", "usd", 1200);
        let err = f.lifecycle.create("user_1", "pro", Some("IN")).await.unwrap_err();
        assert!(matches!(err, BillingError::CurrencyMismatch { .. }));
        assert!(f.gateway.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_create_repairs_stale_customer() {
        let f = fixture();
        f.store.set_customer_id("user_1", "cus_gone").await.unwrap();

        f.lifecycle.create("user_1", "pro", None).await.unwrap();

        let customer = f.store.get_customer_id("user_1").await.unwrap().unwrap();
        assert_ne!(customer, "cus_gone");
        assert_eq!(f.gateway.checkout_requests()[0].customer_id, customer);
        assert_eq!(f.audit.kinds()[0], "customer_recreated");
    }

    #[tokio::test]
    async fn test_create_paid_cancels_existing_paid_first() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_old", "price_pro_monthly", "active", now - 10 * DAY), "pro").await;

        f.lifecycle.create("user_1", "pro_annual", None).await.unwrap();

        let mutations = f.gateway.mutations();
        assert!(matches!(
            &mutations[0],
            GatewayCall::CancelSubscription { subscription_id } if subscription_id == "sub_old"
        ));
        assert!(matches!(mutations[1], GatewayCall::CreateCheckoutSession(_)));
        assert!(active_rows(&f.store).is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_and_inactive_plans() {
        let f = fixture();
        assert!(matches!(
            f.lifecycle.create("user_1", "enterprise", None).await,
            Err(BillingError::PlanNotFound { .. })
        ));
        assert!(matches!(
            f.lifecycle.create("user_1", "legacy", None).await,
            Err(BillingError::PlanUnavailable { .. })
        ));
        assert!(matches!(
            f.lifecycle.create("nobody", "pro", None).await,
            Err(BillingError::UserNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_change_same_plan_is_noop() {
        let f = fixture();
        let now = now_unix();
        let row = subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;

        for _ in 0..2 {
            let outcome = f
                .lifecycle
                .change("user_1", "pro", &ProrationConfig::default())
                .await
                .unwrap();
            assert_eq!(outcome, ChangeOutcome::Unchanged { subscription: row.clone() });
        }
        assert!(f.gateway.mutations().is_empty());
        assert_eq!(f.store.all_subscriptions(), vec![row]);
    }

    #[tokio::test]
    async fn test_change_upgrades_and_writes_back() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;

        let outcome = f
            .lifecycle
            .change("user_1", "pro_annual", &ProrationConfig::default())
            .await
            .unwrap();
        let ChangeOutcome::Changed { subscription } = outcome else {
            panic!("expected change");
        };
        assert_eq!(subscription.plan_id, "pro_annual");
        assert_eq!(
            f.gateway.subscription("sub_1").unwrap().base_price_id(),
            Some("price_pro_yearly")
        );
        assert_eq!(f.directory.workspace_tier("ws_1").as_deref(), Some("pro"));
        assert_eq!(active_rows(&f.store).len(), 1);
        assert!(f.audit.kinds().contains(&"plan_changed"));
    }

    #[tokio::test]
    async fn test_change_blocks_mid_term_yearly_downgrade() {
        let f = fixture();
        let now = now_unix();
        let mut sub = gateway_sub("sub_1", "price_pro_yearly", "active", now);
        sub.current_period_end = now + 10 * DAY;
        subscribed(&f, sub, "pro_annual").await;

        let err = f
            .lifecycle
            .change("user_1", "pro", &ProrationConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err, BillingError::DowngradeBlocked { remaining_days: 10 });
        assert!(f.gateway.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_change_without_paid_subscription_delegates() {
        let f = fixture();
        let outcome = f
            .lifecycle
            .change("user_1", "pro", &ProrationConfig::default())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ChangeOutcome::Delegated {
                created: CreateOutcome::CheckoutRequired { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_change_canceled_gateway_subscription_delegates() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;
        let mut canceled = f.gateway.subscription("sub_1").unwrap();
        canceled.status = "canceled".to_string();
        f.gateway.add_subscription(canceled);

        let outcome = f
            .lifecycle
            .change("user_1", "pro_annual", &ProrationConfig::default())
            .await
            .unwrap();
        assert!(matches!(outcome, ChangeOutcome::Delegated { .. }));
        assert_eq!(f.gateway.checkout_requests()[0].price_id, "price_pro_yearly");
    }

    #[tokio::test]
    async fn test_change_unexpected_gateway_state_is_fatal() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;
        let mut past_due = f.gateway.subscription("sub_1").unwrap();
        past_due.status = "past_due".to_string();
        f.gateway.add_subscription(past_due);

        let err = f
            .lifecycle
            .change("user_1", "pro_annual", &ProrationConfig::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BillingError::GatewayState {
                subscription_id: "sub_1".to_string(),
                status: "past_due".to_string()
            }
        );
    }

    const STALLED: [&str; 3] = ["past_due", "unpaid", "incomplete"];

    fn gateway_state(status: &str) -> BillingError {
        BillingError::GatewayState {
            subscription_id: "sub_1".to_string(),
            status: status.to_string(),
        }
    }

    #[tokio::test]
    async fn test_change_with_stalled_local_and_gateway_state_is_fatal() {
        for status in STALLED {
            let f = fixture();
            let now = now_unix();
            let row = subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", status, now), "pro").await;
            assert!(!row.status.is_active());

            let err = f
                .lifecycle
                .change("user_1", "pro_annual", &ProrationConfig::default())
                .await
                .unwrap_err();
            assert_eq!(err, gateway_state(status), "status={}", status);
            assert!(f.gateway.checkout_requests().is_empty(), "status={}", status);
            assert!(f.gateway.mutations().is_empty(), "status={}", status);
            assert_eq!(f.gateway.subscription("sub_1").unwrap().status, status);
        }
    }

    #[tokio::test]
    async fn test_change_to_free_with_stalled_subscription_is_fatal() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "unpaid", now), "pro").await;

        let err = f
            .lifecycle
            .change("user_1", "free", &ProrationConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err, gateway_state("unpaid"));
        assert!(active_rows(&f.store).is_empty());
        assert!(f.gateway.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_create_paid_with_stalled_subscription_is_fatal() {
        for status in STALLED {
            let f = fixture();
            let now = now_unix();
            subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", status, now), "pro").await;

            let err = f.lifecycle.create("user_1", "pro_annual", None).await.unwrap_err();
            assert_eq!(err, gateway_state(status), "status={}", status);
            assert!(f.gateway.checkout_requests().is_empty(), "status={}", status);
            assert_eq!(f.gateway.subscription("sub_1").unwrap().status, status);
        }
    }

    #[tokio::test]
    async fn test_create_refuses_when_local_row_behind_stalled_gateway() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;
        // Missed webhook: the gateway went past_due and no longer lists it under cus_1.
        let mut stalled = f.gateway.subscription("sub_1").unwrap();
        stalled.status = "past_due".to_string();
        stalled.customer_id = "cus_other".to_string();
        f.gateway.add_subscription(stalled);

        let err = f.lifecycle.create("user_1", "pro", None).await.unwrap_err();
        assert_eq!(err, gateway_state("past_due"));
        assert!(f.gateway.checkout_requests().is_empty());
    }

    #[tokio::test]
    async fn test_change_recovered_gateway_subscription_proceeds() {
        let f = fixture();
        let now = now_unix();
        let mut row = subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;
        row.status = SubscriptionStatus::PastDue;
        f.store.update_subscription(&row).await.unwrap();

        let outcome = f
            .lifecycle
            .change("user_1", "pro_annual", &ProrationConfig::default())
            .await
            .unwrap();
        let ChangeOutcome::Changed { subscription } = outcome else {
            panic!("expected change");
        };
        assert_eq!(subscription.id, row.id);
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert!(f.gateway.checkout_requests().is_empty());
    }

    #[tokio::test]
    async fn test_change_to_free_cancels_paid() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;

        let outcome = f
            .lifecycle
            .change("user_1", "free", &ProrationConfig::default())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ChangeOutcome::Delegated {
                created: CreateOutcome::Activated { .. }
            }
        ));
        assert!(f.gateway.subscription("sub_1").unwrap().is_canceled());
        let active = active_rows(&f.store);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].plan_id, "free");
    }

    #[tokio::test]
    async fn test_cancel_immediately_at_gateway() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;
        f.directory.set_workspace_tier("user_1", "pro").await.unwrap();

        let outcome = f.lifecycle.cancel("user_1").await.unwrap();
        let CancelOutcome::Canceled { subscription } = outcome else {
            panic!("expected cancel");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Canceled);
        assert!(subscription.canceled_at.is_some());
        assert!(f.gateway.subscription("sub_1").unwrap().is_canceled());
        assert_eq!(f.directory.workspace_tier("ws_1").as_deref(), Some("free"));

        assert_eq!(f.lifecycle.cancel("user_1").await.unwrap(), CancelOutcome::AlreadyCanceled);
        assert_eq!(f.gateway.mutations().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_missing_gateway_subscription_is_local() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;
        f.gateway.remove_subscription("sub_1");

        f.lifecycle.cancel("user_1").await.unwrap();
        assert!(f.gateway.mutations().is_empty());
        assert!(active_rows(&f.store).is_empty());
        assert_eq!(f.audit.events().last().map(BillingAuditEvent::kind), Some("subscription_canceled"));
    }

    #[tokio::test]
    async fn test_cancel_stalled_subscription_at_gateway() {
        for status in STALLED {
            let f = fixture();
            let now = now_unix();
            let row = subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", status, now), "pro").await;

            let outcome = f.lifecycle.cancel("user_1").await.unwrap();
            let CancelOutcome::Canceled { subscription } = outcome else {
                panic!("expected cancel for {}", status);
            };
            assert_eq!(subscription.id, row.id);
            assert_eq!(subscription.status, SubscriptionStatus::Canceled);
            assert!(f.gateway.subscription("sub_1").unwrap().is_canceled(), "status={}", status);
            assert_eq!(
                f.gateway.mutations(),
                vec![GatewayCall::CancelSubscription {
                    subscription_id: "sub_1".to_string()
                }]
            );

            assert_eq!(f.lifecycle.cancel("user_1").await.unwrap(), CancelOutcome::AlreadyCanceled);
        }
    }

    #[tokio::test]
    async fn test_cancel_expired_incomplete_is_already_canceled() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "incomplete_expired", now), "pro").await;

        assert_eq!(f.lifecycle.cancel("user_1").await.unwrap(), CancelOutcome::AlreadyCanceled);
        assert!(f.gateway.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_without_any_subscription() {
        let f = fixture();
        assert!(matches!(
            f.lifecycle.cancel("user_1").await,
            Err(BillingError::NoActiveSubscription { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_is_byte_identical_on_rerun() {
        let f = fixture();
        let now = now_unix();
        f.gateway.add_customer("cus_1");
        f.store.set_customer_id("user_1", "cus_1").await.unwrap();
        f.gateway.add_subscription(gateway_sub("sub_1", "price_pro_yearly_in", "active", now));

        let first = f.lifecycle.sync("user_1").await.unwrap();
        let SyncOutcome::Synced { subscription, changed } = first else {
            panic!("expected sync");
        };
        assert!(changed);
        assert_eq!(subscription.plan_id, "pro_annual");
        let snapshot = f.store.all_subscriptions();

        let second = f.lifecycle.sync("user_1").await.unwrap();
        assert!(matches!(second, SyncOutcome::Synced { changed: false, .. }));
        assert_eq!(f.store.all_subscriptions(), snapshot);
        assert!(f.gateway.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_sync_prefers_active_and_enforces_single_active_row() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_old", "price_pro_monthly", "canceled", now - 5 * DAY), "pro").await;
        f.store.seed(Subscription {
            id: "row_free".to_string(),
            user_id: "user_1".to_string(),
            plan_id: "free".to_string(),
            gateway_subscription_id: None,
            gateway_customer_id: None,
            status: SubscriptionStatus::Active,
            current_period_start: now - DAY,
            current_period_end: now + 364 * DAY,
            cancel_at_period_end: false,
            canceled_at: None,
            trial_start: None,
            trial_end: None,
            created_at: now - DAY,
            updated_at: now - DAY,
        });
        f.gateway.add_subscription(gateway_sub("sub_new", "price_pro_monthly", "active", now - 2 * DAY));

        let outcome = f.lifecycle.sync("user_1").await.unwrap();
        let SyncOutcome::Synced { subscription, .. } = outcome else {
            panic!("expected sync");
        };
        assert_eq!(subscription.gateway_subscription_id.as_deref(), Some("sub_new"));
        let active = active_rows(&f.store);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, subscription.id);
        assert_eq!(f.directory.workspace_tier("ws_1").as_deref(), Some("pro"));
    }

    #[tokio::test]
    async fn test_sync_maps_gateway_status() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;
        let mut past_due = f.gateway.subscription("sub_1").unwrap();
        past_due.status = "past_due".to_string();
        f.gateway.add_subscription(past_due);

        let outcome = f.lifecycle.sync("user_1").await.unwrap();
        let SyncOutcome::Synced { subscription, changed } = outcome else {
            panic!("expected sync");
        };
        assert!(changed);
        assert_eq!(subscription.status, SubscriptionStatus::PastDue);
        assert_eq!(f.directory.workspace_tier("ws_1").as_deref(), Some("free"));
    }

    #[tokio::test]
    async fn test_sync_without_gateway_subscriptions_cancels_paid_rows() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_pro_monthly", "active", now), "pro").await;
        f.gateway.remove_subscription("sub_1");

        assert_eq!(
            f.lifecycle.sync("user_1").await.unwrap(),
            SyncOutcome::Cleared { canceled: 1 }
        );
        assert!(active_rows(&f.store).is_empty());
        assert_eq!(
            f.lifecycle.sync("user_1").await.unwrap(),
            SyncOutcome::Cleared { canceled: 0 }
        );
    }

    #[tokio::test]
    async fn test_sync_unresolvable_plan_cancels_row() {
        let f = fixture();
        let now = now_unix();
        subscribed(&f, gateway_sub("sub_1", "price_retired_2019", "active", now), "starter").await;

        let outcome = f.lifecycle.sync("user_1").await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Unresolvable {
                gateway_subscription_id: "sub_1".to_string(),
                canceled: 1
            }
        );
        assert!(active_rows(&f.store).is_empty());
    }

    #[tokio::test]
    async fn test_sync_paused_subscription_is_gateway_state_error() {
        let f = fixture();
        let now = now_unix();
        f.gateway.add_customer("cus_1");
        f.store.set_customer_id("user_1", "cus_1").await.unwrap();
        f.gateway.add_subscription(gateway_sub("sub_1", "price_pro_monthly", "paused", now));

        assert!(matches!(
            f.lifecycle.sync("user_1").await,
            Err(BillingError::GatewayState { .. })
        ));
    }

    #[test]
    fn test_pick_subscription() {
        let subs = vec![
            gateway_sub("a", "p", "canceled", 3),
            gateway_sub("b", "p", "active", 1),
        ];
        assert_eq!(pick_subscription(subs).unwrap().id, "b");

        let subs = vec![
            gateway_sub("a", "p", "canceled", 1),
            gateway_sub("c", "p", "incomplete_expired", 5),
        ];
        assert_eq!(pick_subscription(subs).unwrap().id, "c");
        assert!(pick_subscription(Vec::new()).is_none());
    }
}
