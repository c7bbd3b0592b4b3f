//! Plan catalog data model.
//!
//! The catalog document is a versioned JSON description of every plan:
//!
//! ```json
//! {
//!   "version": "2026-01",
//!   "plans": [
//!     {
//!       "id": "pro",
//!       "name": "pro",
//!       "display_name": "Pro",
//!       "description": "For growing teams",
//!       "active": true,
//!       "sort_order": 1,
//!       "pricing": {
//!         "monthly": {
//!           "price_cents": 1200,
//!           "currency": "usd",
//!           "product_id": "prod_pro",
//!           "price_id": { "default": "price_pro_m", "IN": { "price_id": "price_pro_m_in", "currency": "inr", "price_cents": 49900 } }
//!         },
//!         "yearly": { "price_cents": 12000, "currency": "usd", "price_id": "price_pro_y" }
//!       }
//!     }
//!   ]
//! }
//! ```
//!
//! [`PlanSet`] is the validated, immutable form. It is built once per load and
//! shared behind an `Arc`.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::error::{BillingError, Result};
use super::validation::{is_valid_currency, validate_plan_id};

/// Suffix that addresses the yearly variant of a plan.
pub const ANNUAL_SUFFIX: &str = "_annual";

/// Key of the default entry in a country price map.
pub const DEFAULT_PRICE_KEY: &str = "default";

/// Billing interval of a plan variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub const ALL: [BillingInterval; 2] = [BillingInterval::Monthly, BillingInterval::Yearly];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the variant id (or name) for a base plan id and interval.
#[must_use]
pub fn variant_key(base: &str, interval: BillingInterval) -> String {
    match interval {
        BillingInterval::Monthly => base.to_string(),
        BillingInterval::Yearly => format!("{}{}", base, ANNUAL_SUFFIX),
    }
}

/// Split a variant id (or name) into its base and interval.
#[must_use]
pub fn split_variant_key(key: &str) -> (&str, BillingInterval) {
    match key.strip_suffix(ANNUAL_SUFFIX) {
        Some(base) => (base, BillingInterval::Yearly),
        None => (key, BillingInterval::Monthly),
    }
}

/// A country entry in a price map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CountryPrice {
    Handle(String),
    Detailed {
        price_id: String,
        #[serde(default)]
        currency: Option<String>,
        #[serde(default)]
        price_cents: Option<i64>,
    },
}

impl CountryPrice {
    #[must_use]
    pub fn price_id(&self) -> &str {
        match self {
            Self::Handle(id) => id,
            Self::Detailed { price_id, .. } => price_id,
        }
    }

    #[must_use]
    pub fn currency(&self) -> Option<&str> {
        match self {
            Self::Handle(_) => None,
            Self::Detailed { currency, .. } => currency.as_deref(),
        }
    }

    #[must_use]
    pub fn price_cents(&self) -> Option<i64> {
        match self {
            Self::Handle(_) => None,
            Self::Detailed { price_cents, .. } => *price_cents,
        }
    }
}

/// Reference to the gateway price(s) for one interval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriceRef {
    /// A single default handle.
    Single(String),
    /// Country code (or `default`) to handle.
    ByCountry(BTreeMap<String, CountryPrice>),
}

impl PriceRef {
    /// The home-currency handle.
    #[must_use]
    pub fn default_handle(&self) -> Option<&str> {
        match self {
            Self::Single(id) => Some(id),
            Self::ByCountry(map) => map.get(DEFAULT_PRICE_KEY).map(CountryPrice::price_id),
        }
    }

    /// The entry configured for `country`, excluding the default entry.
    #[must_use]
    pub fn country_entry(&self, country: &str) -> Option<&CountryPrice> {
        match self {
            Self::Single(_) => None,
            Self::ByCountry(map) if country != DEFAULT_PRICE_KEY => map.get(country),
            Self::ByCountry(_) => None,
        }
    }

    /// Every handle with the country it is configured for (`None` for the default).
    pub fn handles(&self) -> Vec<(Option<&str>, &str)> {
        match self {
            Self::Single(id) => vec![(None, id.as_str())],
            Self::ByCountry(map) => map
                .iter()
                .map(|(key, entry)| {
                    let country = (key != DEFAULT_PRICE_KEY).then_some(key.as_str());
                    (country, entry.price_id())
                })
                .collect(),
        }
    }
}

/// Pricing for one billing interval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalPrice {
    /// Price in the currency's minor unit.
    pub price_cents: i64,
    pub currency: String,
    #[serde(default)]
    pub product_id: Option<String>,
    /// `None` for free plans.
    #[serde(default)]
    pub price_id: Option<PriceRef>,
}

impl IntervalPrice {
    /// A free price has zero cost or no gateway handle.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.price_cents == 0 || self.price_id.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPricing {
    #[serde(default)]
    pub monthly: Option<IntervalPrice>,
    #[serde(default)]
    pub yearly: Option<IntervalPrice>,
}

impl PlanPricing {
    #[must_use]
    pub fn get(&self, interval: BillingInterval) -> Option<&IntervalPrice> {
        match interval {
            BillingInterval::Monthly => self.monthly.as_ref(),
            BillingInterval::Yearly => self.yearly.as_ref(),
        }
    }
}

fn default_active() -> bool {
    true
}

/// One plan as described by the catalog document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub id: String,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub sort_order: i32,
    pub pricing: PlanPricing,
}

impl PlanConfig {
    #[must_use]
    pub fn price(&self, interval: BillingInterval) -> Option<&IntervalPrice> {
        self.pricing.get(interval)
    }

    /// A plan is free when every configured interval is free.
    #[must_use]
    pub fn is_free(&self) -> bool {
        BillingInterval::ALL
            .iter()
            .filter_map(|i| self.price(*i))
            .all(IntervalPrice::is_free)
    }
}

/// A plan projected onto one interval.
#[derive(Clone, Copy, Debug)]
pub struct PlanVariant<'a> {
    pub plan: &'a PlanConfig,
    pub interval: BillingInterval,
    pub price: &'a IntervalPrice,
}

impl PlanVariant<'_> {
    /// `pro` or `pro_annual`.
    #[must_use]
    pub fn id(&self) -> String {
        variant_key(&self.plan.id, self.interval)
    }

    #[must_use]
    pub fn name(&self) -> String {
        variant_key(&self.plan.name, self.interval)
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.price.is_free()
    }
}

/// The raw catalog document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub version: String,
    pub plans: Vec<PlanConfig>,
}

/// A validated, immutable catalog snapshot.
#[derive(Clone, Debug)]
pub struct PlanSet {
    version: String,
    plans: Vec<PlanConfig>,
}

impl PlanSet {
    /// Parse and validate a catalog document.
    pub fn from_json(json: &str) -> Result<Self> {
        let document: CatalogDocument = serde_json::from_str(json).map_err(|e| {
            BillingError::configuration(format!("malformed plan catalog: {}", e))
        })?;
        Self::from_document(document)
    }

    /// Validate a parsed document and sort its plans.
    pub fn from_document(document: CatalogDocument) -> Result<Self> {
        if document.version.trim().is_empty() {
            return Err(BillingError::configuration("plan catalog version is missing"));
        }

        let mut seen = HashSet::new();
        for plan in &document.plans {
            validate_plan(plan)?;
            if !seen.insert(plan.id.as_str()) {
                return Err(BillingError::configuration(format!(
                    "duplicate plan id '{}'",
                    plan.id
                )));
            }
        }

        let mut plans = document.plans;
        plans.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.id.cmp(&b.id)));

        Ok(Self {
            version: document.version,
            plans,
        })
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Every plan, active or not, in sort order.
    pub fn iter(&self) -> impl Iterator<Item = &PlanConfig> {
        self.plans.iter()
    }

    /// Look up a plan by id. A `_annual` suffix is ignored.
    #[must_use]
    pub fn get_plan_by_id(&self, id: &str) -> Option<&PlanConfig> {
        let (base, _) = split_variant_key(id);
        self.plans.iter().find(|p| p.id == base)
    }

    /// Look up a plan by name. A `_annual` suffix is ignored.
    #[must_use]
    pub fn get_plan_by_name(&self, name: &str) -> Option<&PlanConfig> {
        let (base, _) = split_variant_key(name);
        self.plans.iter().find(|p| p.name == base)
    }

    /// Active plans in sort order.
    #[must_use]
    pub fn active_plans(&self) -> Vec<&PlanConfig> {
        self.plans.iter().filter(|p| p.active).collect()
    }

    /// Active plans priced for `interval`, in sort order.
    #[must_use]
    pub fn plans_by_billing_interval(&self, interval: BillingInterval) -> Vec<PlanVariant<'_>> {
        self.plans
            .iter()
            .filter(|p| p.active)
            .filter_map(|plan| {
                plan.price(interval).map(|price| PlanVariant {
                    plan,
                    interval,
                    price,
                })
            })
            .collect()
    }

    /// Resolve a variant id such as `pro_annual` to its plan and interval.
    #[must_use]
    pub fn resolve_variant(&self, variant_id: &str) -> Option<PlanVariant<'_>> {
        let (base, interval) = split_variant_key(variant_id);
        let plan = self.plans.iter().find(|p| p.id == base)?;
        let price = plan.price(interval)?;
        Some(PlanVariant {
            plan,
            interval,
            price,
        })
    }
}

fn validate_plan(plan: &PlanConfig) -> Result<()> {
    let invalid = |reason: String| {
        BillingError::configuration(format!("plan '{}': {}", plan.id, reason))
    };

    validate_plan_id(&plan.id).map_err(|e| invalid(e.to_string()))?;
    if plan.id.ends_with(ANNUAL_SUFFIX) || plan.name.ends_with(ANNUAL_SUFFIX) {
        return Err(invalid(format!(
            "ids and names must not end with '{}'",
            ANNUAL_SUFFIX
        )));
    }
    if plan.name.trim().is_empty() {
        return Err(invalid("name is required".to_string()));
    }
    if plan.display_name.trim().is_empty() {
        return Err(invalid("display_name is required".to_string()));
    }

    if plan.pricing.monthly.is_none() && plan.pricing.yearly.is_none() {
        return Err(invalid("no interval pricing configured".to_string()));
    }

    for interval in BillingInterval::ALL {
        let Some(price) = plan.price(interval) else {
            if plan.active {
                return Err(invalid(format!("active plan is missing {} pricing", interval)));
            }
            continue;
        };
        validate_interval_price(price).map_err(|reason| invalid(format!("{}: {}", interval, reason)))?;
    }

    Ok(())
}

fn validate_interval_price(price: &IntervalPrice) -> std::result::Result<(), String> {
    if price.price_cents < 0 {
        return Err(format!("negative price {}", price.price_cents));
    }
    if !is_valid_currency(&price.currency) {
        return Err(format!("invalid currency '{}'", price.currency));
    }

    match (&price.price_id, price.price_cents) {
        (None, 0) => return Ok(()),
        (None, _) => return Err("paid price has no gateway price handle".to_string()),
        (Some(_), 0) => return Err("free price must not reference a gateway price".to_string()),
        (Some(_), _) => {}
    }

    if let Some(PriceRef::ByCountry(map)) = &price.price_id {
        if !map.contains_key(DEFAULT_PRICE_KEY) {
            return Err("country price map has no 'default' entry".to_string());
        }
        for (key, entry) in map {
            let is_country = key.len() == 2 && key.chars().all(|c| c.is_ascii_uppercase());
            if key != DEFAULT_PRICE_KEY && !is_country {
                return Err(format!("invalid country key '{}'", key));
            }
            if entry.price_id().trim().is_empty() {
                return Err(format!("empty price handle for '{}'", key));
            }
            if let Some(currency) = entry.currency() {
                if !is_valid_currency(currency) {
                    return Err(format!("invalid currency '{}' for '{}'", currency, key));
                }
            }
            if entry.price_cents().is_some_and(|c| c < 0) {
                return Err(format!("negative price for '{}'", key));
            }
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::CATALOG_JSON;
    use super::*;

    fn set() -> PlanSet {
        PlanSet::from_json(CATALOG_JSON).unwrap()
    }

    fn replace(from: &str, to: &str) -> String {
        CATALOG_JSON.replacen(from, to, 1)
    }

    #[test]
    fn test_variant_keys() {
        assert_eq!(variant_key("pro", BillingInterval::Yearly), "pro_annual");
        assert_eq!(variant_key("pro", BillingInterval::Monthly), "pro");
        assert_eq!(split_variant_key("pro_annual"), ("pro", BillingInterval::Yearly));
        assert_eq!(split_variant_key("pro"), ("pro", BillingInterval::Monthly));
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let set = set();
        assert_eq!(set.version(), "test-1");
        assert_eq!(set.get_plan_by_id("pro").unwrap().display_name, "Pro");
        assert_eq!(set.get_plan_by_id("pro_annual").unwrap().id, "pro");
        assert_eq!(set.get_plan_by_name("free").unwrap().id, "free");
        assert!(set.get_plan_by_id("enterprise").is_none());
    }

    #[test]
    fn test_active_plans_sorted() {
        let set = set();
        let ids: Vec<_> = set.active_plans().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["free", "pro"]);
    }

    #[test]
    fn test_plans_by_interval_addresses_yearly_variants() {
        let set = set();
        let yearly: Vec<_> = set
            .plans_by_billing_interval(BillingInterval::Yearly)
            .iter()
            .map(|v| (v.id(), v.name()))
            .collect();
        assert_eq!(
            yearly,
            vec![
                ("free_annual".to_string(), "free_annual".to_string()),
                ("pro_annual".to_string(), "pro_annual".to_string())
            ]
        );
    }

    #[test]
    fn test_resolve_variant() {
        let set = set();
        let variant = set.resolve_variant("pro_annual").unwrap();
        assert_eq!(variant.interval, BillingInterval::Yearly);
        assert_eq!(variant.price.price_cents, 12000);
        assert!(set.resolve_variant("legacy_annual").is_none());
        assert!(set.resolve_variant("free").unwrap().is_free());
    }

    #[test]
    fn test_free_plan_detection() {
        let set = set();
        assert!(set.get_plan_by_id("free").unwrap().is_free());
        assert!(!set.get_plan_by_id("pro").unwrap().is_free());
    }

    #[test]
    fn test_rejects_negative_price() {
        let json = replace("\"price_cents\": 1200", "\"price_cents\": -1");
        let err = PlanSet::from_json(&json).unwrap_err();
        assert!(matches!(err, BillingError::Configuration { .. }));
        assert!(err.to_string().contains("negative price"));
    }

    #[test]
    fn test_rejects_active_plan_missing_interval() {
        let json = replace("\"active\": false", "\"active\": true");
        let err = PlanSet::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("missing yearly pricing"));
    }

    #[test]
    fn test_rejects_missing_required_field() {
        let json = replace("\"display_name\": \"Pro\",", "");
        assert!(matches!(
            PlanSet::from_json(&json),
            Err(BillingError::Configuration { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let json = replace("\"id\": \"legacy\"", "\"id\": \"pro\"");
        let err = PlanSet::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("duplicate plan id"));
    }

    #[test]
    fn test_rejects_paid_price_without_handle() {
        let json = replace("\"price_id\": \"price_legacy_monthly\"", "\"price_id\": null");
        let err = PlanSet::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("no gateway price handle"));
    }

    #[test]
    fn test_rejects_country_map_without_default() {
        let json = replace("\"default\": \"price_pro_yearly\",", "");
        let err = PlanSet::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("no 'default' entry"));
    }

    #[test]
    fn test_rejects_blank_version() {
        let json = replace("\"version\": \"test-1\"", "\"version\": \"\"");
        assert!(PlanSet::from_json(&json).is_err());
    }

    #[test]
    fn test_price_ref_handles() {
        let set = set();
        let monthly = set.get_plan_by_id("pro").unwrap().price(BillingInterval::Monthly).unwrap();
        let handles = monthly.price_id.as_ref().unwrap().handles();
        assert!(handles.contains(&(None, "price_pro_monthly")));
        assert!(handles.contains(&(Some("IN"), "price_pro_monthly_in")));
    }
}
