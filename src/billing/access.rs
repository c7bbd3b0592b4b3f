//! Workspace access decisions.
//!
//! Whether a workspace may operate is derived from its owner's current
//! subscription row, the owner's signup trial and whether the owner ever
//! subscribed. The precedence lives in [`DECISION_TABLE`]; [`decide`] is the
//! only place that reads it.

use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};

use super::error::{BillingError, Result};
use super::storage::{Subscription, SubscriptionStatus, SubscriptionStore, UserDirectory};
use crate::utils::now_unix;

/// Why a workspace is locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    TrialExpired,
    PaymentFailed,
    SubscriptionInactive,
}

impl LockReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrialExpired => "trial_expired",
            Self::PaymentFailed => "payment_failed",
            Self::SubscriptionInactive => "subscription_inactive",
        }
    }
}

impl std::fmt::Display for LockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access answer for one workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceAccessStatus {
    pub is_locked: bool,
    pub reason: Option<LockReason>,
    pub owner_id: String,
}

/// Raw inputs to a decision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessFacts {
    /// The owner's current row. INCOMPLETE rows never count as current.
    pub subscription: Option<Subscription>,
    /// End of the owner's signup trial. `None` is treated as elapsed.
    pub trial_end: Option<u64>,
    pub ever_subscribed: bool,
}

/// What the current row says, relative to now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionFact {
    /// ACTIVE or TRIALING.
    Entitled,
    /// CANCELED, period end still ahead.
    PaidThrough,
    /// CANCELED, period end passed.
    Lapsed,
    /// PAST_DUE or UNPAID.
    PaymentFailed,
    /// No current row.
    Absent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrialFact {
    Running,
    Elapsed,
}

/// A rule column that either matches anything or one value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Match<T> {
    Any,
    Is(T),
}

impl<T: PartialEq> Match<T> {
    fn matches(&self, value: &T) -> bool {
        match self {
            Self::Any => true,
            Self::Is(expected) => expected == value,
        }
    }
}

/// One row of the decision table.
#[derive(Clone, Copy, Debug)]
pub struct Rule {
    pub subscription: SubscriptionFact,
    pub trial: Match<TrialFact>,
    pub ever_subscribed: Match<bool>,
    /// `None` means unlocked.
    pub decision: Option<LockReason>,
}

/// Access precedence, first match wins.
pub const DECISION_TABLE: &[Rule] = &[
    Rule {
        subscription: SubscriptionFact::Entitled,
        trial: Match::Any,
        ever_subscribed: Match::Any,
        decision: None,
    },
    Rule {
        subscription: SubscriptionFact::PaidThrough,
        trial: Match::Any,
        ever_subscribed: Match::Any,
        decision: None,
    },
    Rule {
        subscription: SubscriptionFact::Lapsed,
        trial: Match::Any,
        ever_subscribed: Match::Any,
        decision: Some(LockReason::SubscriptionInactive),
    },
    Rule {
        subscription: SubscriptionFact::PaymentFailed,
        trial: Match::Any,
        ever_subscribed: Match::Any,
        decision: Some(LockReason::PaymentFailed),
    },
    // A former subscriber never falls back to the signup trial.
    Rule {
        subscription: SubscriptionFact::Absent,
        trial: Match::Any,
        ever_subscribed: Match::Is(true),
        decision: Some(LockReason::SubscriptionInactive),
    },
    Rule {
        subscription: SubscriptionFact::Absent,
        trial: Match::Is(TrialFact::Running),
        ever_subscribed: Match::Is(false),
        decision: None,
    },
    Rule {
        subscription: SubscriptionFact::Absent,
        trial: Match::Is(TrialFact::Elapsed),
        ever_subscribed: Match::Is(false),
        decision: Some(LockReason::TrialExpired),
    },
];

impl AccessFacts {
    #[must_use]
    pub fn subscription_fact(&self, now: u64) -> SubscriptionFact {
        let Some(sub) = &self.subscription else {
            return SubscriptionFact::Absent;
        };
        match sub.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => SubscriptionFact::Entitled,
            SubscriptionStatus::Canceled if sub.current_period_end > now => {
                SubscriptionFact::PaidThrough
            }
            SubscriptionStatus::Canceled => SubscriptionFact::Lapsed,
            SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid => {
                SubscriptionFact::PaymentFailed
            }
            SubscriptionStatus::Incomplete | SubscriptionStatus::IncompleteExpired => {
                SubscriptionFact::Absent
            }
        }
    }

    #[must_use]
    pub fn trial_fact(&self, now: u64) -> TrialFact {
        match self.trial_end {
            Some(end) if end > now => TrialFact::Running,
            _ => TrialFact::Elapsed,
        }
    }
}

/// Evaluate [`DECISION_TABLE`] for `facts` at `now`.
///
/// Returns the lock reason, or `None` when access is allowed.
#[must_use]
pub fn decide(facts: &AccessFacts, now: u64) -> Option<LockReason> {
    let subscription = facts.subscription_fact(now);
    let trial = facts.trial_fact(now);

    DECISION_TABLE
        .iter()
        .find(|rule| {
            rule.subscription == subscription
                && rule.trial.matches(&trial)
                && rule.ever_subscribed.matches(&facts.ever_subscribed)
        })
        // The table covers every combination; fail closed if it ever stops.
        .map_or(Some(LockReason::SubscriptionInactive), |rule| rule.decision)
}

/// Pick the row the gate evaluates: the active one, else the newest
/// non-incomplete one.
fn current_row(rows: Vec<Subscription>) -> Option<Subscription> {
    if let Some(active) = rows.iter().find(|s| s.status.is_active()) {
        return Some(active.clone());
    }
    rows.into_iter().find(|s| {
        !matches!(
            s.status,
            SubscriptionStatus::Incomplete | SubscriptionStatus::IncompleteExpired
        )
    })
}

/// Default time-to-live of cached access answers.
pub const DEFAULT_ACCESS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Short-lived cache of access answers keyed by workspace.
///
/// Cloning shares the cache.
#[derive(Clone)]
pub struct AccessStatusCache {
    inner: Cache<String, WorkspaceAccessStatus>,
}

impl Default for AccessStatusCache {
    fn default() -> Self {
        Self::new(DEFAULT_ACCESS_CACHE_TTL)
    }
}

impl AccessStatusCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build(),
        }
    }

    pub async fn get(&self, workspace_id: &str) -> Option<WorkspaceAccessStatus> {
        self.inner.get(workspace_id).await
    }

    pub async fn insert(&self, workspace_id: &str, status: WorkspaceAccessStatus) {
        self.inner.insert(workspace_id.to_string(), status).await;
    }

    pub async fn invalidate_workspace(&self, workspace_id: &str) {
        self.inner.invalidate(workspace_id).await;
    }

    /// Drop every cached answer for workspaces owned by `owner_id`.
    pub fn invalidate_owner(&self, owner_id: &str) {
        let owner = owner_id.to_string();
        if let Err(e) = self
            .inner
            .invalidate_entries_if(move |_, status| status.owner_id == owner)
        {
            tracing::warn!(
                target: "workspace_billing::billing",
                owner_id = owner_id,
                error = %e,
                "Selective cache invalidation failed, clearing access cache"
            );
            self.inner.invalidate_all();
        }
    }
}

impl std::fmt::Debug for AccessStatusCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessStatusCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

/// Answers "may this workspace operate right now".
pub struct WorkspaceAccessGate<S: SubscriptionStore, D: UserDirectory> {
    store: S,
    directory: D,
    cache: Option<AccessStatusCache>,
}

impl<S: SubscriptionStore, D: UserDirectory> WorkspaceAccessGate<S, D> {
    #[must_use]
    pub fn new(store: S, directory: D) -> Self {
        Self {
            store,
            directory,
            cache: None,
        }
    }

    /// Serve [`status_for`](Self::status_for) through `cache`.
    #[must_use]
    pub fn with_cache(mut self, cache: AccessStatusCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn cache(&self) -> Option<&AccessStatusCache> {
        self.cache.as_ref()
    }

    /// Collect the decision inputs for a workspace owner.
    pub async fn facts_for(&self, owner_id: &str) -> Result<AccessFacts> {
        let user = self
            .directory
            .get_user(owner_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound {
                user_id: owner_id.to_string(),
            })?;

        let subscription = current_row(self.store.subscriptions_for_user(owner_id).await?);
        let ever_subscribed =
            subscription.is_some() || self.store.has_ever_subscribed(owner_id).await?;

        Ok(AccessFacts {
            subscription,
            trial_end: user.trial_end,
            ever_subscribed,
        })
    }

    /// Whether workspaces owned by `owner_id` are locked. Never cached.
    pub async fn is_locked(&self, owner_id: &str) -> Result<bool> {
        let facts = self.facts_for(owner_id).await?;
        Ok(decide(&facts, now_unix()).is_some())
    }

    /// Access answer for a workspace.
    pub async fn status_for(&self, workspace_id: &str) -> Result<WorkspaceAccessStatus> {
        if let Some(cache) = &self.cache {
            if let Some(status) = cache.get(workspace_id).await {
                return Ok(status);
            }
        }

        let owner_id = self
            .directory
            .workspace_owner(workspace_id)
            .await?
            .ok_or_else(|| BillingError::WorkspaceNotFound {
                workspace_id: workspace_id.to_string(),
            })?;

        let facts = self.facts_for(&owner_id).await?;
        let reason = decide(&facts, now_unix());
        let status = WorkspaceAccessStatus {
            is_locked: reason.is_some(),
            reason,
            owner_id,
        };

        tracing::debug!(
            target: "workspace_billing::billing",
            workspace_id = workspace_id,
            owner_id = %status.owner_id,
            is_locked = status.is_locked,
            reason = status.reason.map(|r| r.as_str()),
            "Workspace access evaluated"
        );

        if let Some(cache) = &self.cache {
            cache.insert(workspace_id, status.clone()).await;
        }
        Ok(status)
    }
}
