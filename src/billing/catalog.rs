//! Plan catalog loading and projection.
//!
//! [`PlanCatalog`] owns the current [`PlanSet`] snapshot together with the
//! price and limit resolvers, and projects plans into priced, limited
//! [`SubscriptionPlan`]s for display.
//!
//! Outside production a file-backed catalog checks the file's modification
//! time on every [`snapshot`](PlanCatalog::snapshot) and reloads it when it
//! changed. In production the document is read once at startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::RwLock;

use super::error::{BillingError, Result};
use super::limits::{FeatureLimits, LimitResolver};
use super::plans::{BillingInterval, PlanSet, variant_key};
use super::pricing::PriceResolver;
use crate::config::Environment;

/// Where the catalog document comes from.
#[derive(Clone, Debug)]
enum PlanSource {
    File(PathBuf),
    Inline,
}

struct Loaded {
    plans: Arc<PlanSet>,
    modified: Option<SystemTime>,
}

/// A plan projected for one interval and one country.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubscriptionPlan {
    /// `pro` or `pro_annual`.
    pub id: String,
    /// `pro` or `pro_annual`.
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub interval: BillingInterval,
    pub price_cents: i64,
    pub currency: String,
    pub price_id: Option<String>,
    pub product_id: Option<String>,
    pub limits: FeatureLimits,
    pub used_fallback: bool,
}

/// The plan catalog.
pub struct PlanCatalog {
    source: PlanSource,
    hot_reload: bool,
    state: RwLock<Loaded>,
    prices: PriceResolver,
    limits: LimitResolver,
}

impl PlanCatalog {
    /// Load a catalog document from disk.
    ///
    /// Fails immediately if the document is unreadable or invalid, or if any
    /// configured limit value is invalid.
    pub async fn open(
        path: impl AsRef<Path>,
        environment: Environment,
        prices: PriceResolver,
        limits: LimitResolver,
    ) -> Result<Self> {
        limits.validate()?;
        let path = path.as_ref().to_path_buf();
        let (plans, modified) = load_file(&path).await?;

        tracing::info!(
            target: "workspace_billing::billing",
            path = %path.display(),
            version = plans.version(),
            plans = plans.iter().count(),
            hot_reload = !environment.is_production(),
            "Plan catalog loaded"
        );

        Ok(Self {
            source: PlanSource::File(path),
            hot_reload: !environment.is_production(),
            state: RwLock::new(Loaded {
                plans: Arc::new(plans),
                modified,
            }),
            prices,
            limits,
        })
    }

    /// Build a catalog from an in-memory document. Never reloads.
    pub fn from_json(json: &str, prices: PriceResolver, limits: LimitResolver) -> Result<Self> {
        limits.validate()?;
        let plans = PlanSet::from_json(json)?;
        Ok(Self {
            source: PlanSource::Inline,
            hot_reload: false,
            state: RwLock::new(Loaded {
                plans: Arc::new(plans),
                modified: None,
            }),
            prices,
            limits,
        })
    }

    /// The current plan set, reloading first if the backing file changed.
    pub async fn snapshot(&self) -> Arc<PlanSet> {
        let PlanSource::File(path) = &self.source else {
            return self.state.read().await.plans.clone();
        };
        if !self.hot_reload {
            return self.state.read().await.plans.clone();
        }

        let current = file_modified(path).await;
        {
            let loaded = self.state.read().await;
            if current.is_none() || current == loaded.modified {
                return loaded.plans.clone();
            }
        }

        let mut loaded = self.state.write().await;
        if current == loaded.modified {
            return loaded.plans.clone();
        }

        match load_file(path).await {
            Ok((plans, modified)) => {
                tracing::info!(
                    target: "workspace_billing::billing",
                    path = %path.display(),
                    version = plans.version(),
                    "Plan catalog reloaded"
                );
                loaded.plans = Arc::new(plans);
                loaded.modified = modified;
            }
            Err(e) => {
                tracing::error!(
                    target: "workspace_billing::billing",
                    path = %path.display(),
                    error = %e,
                    "Plan catalog reload failed, keeping previous version"
                );
                // Do not retry the same broken revision on every access.
                loaded.modified = current;
            }
        }
        loaded.plans.clone()
    }

    #[must_use]
    pub fn price_resolver(&self) -> &PriceResolver {
        &self.prices
    }

    #[must_use]
    pub fn limit_resolver(&self) -> &LimitResolver {
        &self.limits
    }

    /// Every active plan in both intervals, priced for `country`.
    pub async fn available_plans(&self, country: Option<&str>) -> Result<Vec<SubscriptionPlan>> {
        let plans = self.snapshot().await;
        let mut out = Vec::new();

        for plan in plans.active_plans() {
            let limits = self.limits.limits_for(&plan.name)?;
            for interval in BillingInterval::ALL {
                let Some(variant) = plans.resolve_variant(&variant_key(&plan.id, interval)) else {
                    continue;
                };
                let resolved = self.prices.resolve(plan, interval, country)?;
                out.push(SubscriptionPlan {
                    id: variant.id(),
                    name: variant.name(),
                    display_name: plan.display_name.clone(),
                    description: plan.description.clone(),
                    interval,
                    price_cents: resolved.amount_cents,
                    currency: resolved.currency,
                    price_id: resolved.price_id,
                    product_id: resolved.product_id,
                    limits,
                    used_fallback: resolved.used_fallback,
                });
            }
        }

        Ok(out)
    }
}

impl std::fmt::Debug for PlanCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCatalog")
            .field("source", &self.source)
            .field("hot_reload", &self.hot_reload)
            .finish_non_exhaustive()
    }
}

async fn load_file(path: &Path) -> Result<(PlanSet, Option<SystemTime>)> {
    let json = tokio::fs::read_to_string(path).await.map_err(|e| {
        BillingError::configuration(format!(
            "cannot read plan catalog {}: {}",
            path.display(),
            e
        ))
    })?;
    let modified = file_modified(path).await;
    Ok((PlanSet::from_json(&json)?, modified))
}

async fn file_modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::limits::Limit;
    use crate::billing::plans::fixtures::CATALOG_JSON;

    fn catalog() -> PlanCatalog {
        PlanCatalog::from_json(
            CATALOG_JSON,
            PriceResolver::default(),
            LimitResolver::from_vars([("PLAN_LIMIT_PRO_WORKSPACES", "unlimited")]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_available_plans_for_india() {
        let plans = catalog().available_plans(Some("IN")).await.unwrap();
        let ids: Vec<_> = plans.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["free", "free_annual", "pro", "pro_annual"]);

        let pro = plans.iter().find(|p| p.id == "pro").unwrap();
        assert_eq!(pro.price_id.as_deref(), Some("price_pro_monthly_in"));
        assert_eq!(pro.currency, "inr");
        assert_eq!(pro.price_cents, 49900);
        assert_eq!(pro.limits.workspaces, Limit::Unlimited);
        assert!(!pro.used_fallback);
    }

    #[tokio::test]
    async fn test_available_plans_fallback() {
        let plans = catalog().available_plans(Some("FR")).await.unwrap();
        let pro_annual = plans.iter().find(|p| p.id == "pro_annual").unwrap();
        assert_eq!(pro_annual.name, "pro_annual");
        assert_eq!(pro_annual.price_id.as_deref(), Some("price_pro_yearly"));
        assert!(pro_annual.used_fallback);

        let free = plans.iter().find(|p| p.id == "free").unwrap();
        assert!(free.price_id.is_none());
        assert!(!free.used_fallback);
    }

    #[tokio::test]
    async fn test_inactive_plans_hidden() {
        let plans = catalog().available_plans(None).await.unwrap();
        assert!(plans.iter().all(|p| !p.id.starts_with("legacy")));
    }

    #[test]
    fn test_invalid_limits_fail_construction() {
        let result = PlanCatalog::from_json(
            CATALOG_JSON,
            PriceResolver::default(),
            LimitResolver::from_vars([("PLAN_LIMIT_PRO_STORAGE_GB", "-5")]),
        );
        assert!(matches!(result, Err(BillingError::Configuration { .. })));
    }

    #[test]
    fn test_malformed_document_fails_construction() {
        let result = PlanCatalog::from_json("{", PriceResolver::default(), LimitResolver::default());
        assert!(matches!(result, Err(BillingError::Configuration { .. })));
    }
}
