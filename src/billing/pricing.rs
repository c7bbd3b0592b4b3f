//! Price resolution.
//!
//! Forward resolution turns (plan, interval, country) into the gateway price
//! handle to charge. It runs a fixed list of stages and takes the first one that
//! yields a price: the country-specific entry, then the default handle.
//! Reverse resolution maps a handle from the gateway back to its plan.

use serde::Serialize;

use super::client::StripePriceClient;
use super::error::{BillingError, Result};
use super::plans::{BillingInterval, IntervalPrice, PlanConfig, PlanSet, PriceRef};
use super::validation::normalize_country_code;

/// Home country used when no country is detected.
pub const DEFAULT_HOME_COUNTRY: &str = "US";

/// Static country to currency lookup (lowercase ISO 4217).
#[must_use]
pub fn currency_for_country(country: &str) -> Option<&'static str> {
    let currency = match country {
        "US" | "PR" | "EC" | "SV" => "usd",
        "GB" => "gbp",
        "IN" => "inr",
        "CA" => "cad",
        "AU" => "aud",
        "NZ" => "nzd",
        "JP" => "jpy",
        "CH" | "LI" => "chf",
        "SE" => "sek",
        "NO" => "nok",
        "DK" => "dkk",
        "SG" => "sgd",
        "HK" => "hkd",
        "BR" => "brl",
        "MX" => "mxn",
        "PL" => "pln",
        "CZ" => "czk",
        "HU" => "huf",
        "RO" => "ron",
        "AT" | "BE" | "CY" | "DE" | "EE" | "ES" | "FI" | "FR" | "GR" | "HR" | "IE" | "IT"
        | "LT" | "LU" | "LV" | "MT" | "NL" | "PT" | "SI" | "SK" => "eur",
        _ => return None,
    };
    Some(currency)
}

/// Outcome of forward price resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedPrice {
    /// `None` for free plans.
    pub price_id: Option<String>,
    pub product_id: Option<String>,
    /// Currency the price is expected to be billed in.
    pub currency: String,
    pub amount_cents: i64,
    /// Country whose dedicated entry was used, if any.
    pub country: Option<String>,
    /// The requested country differs from home and had no dedicated entry.
    pub used_fallback: bool,
}

impl ResolvedPrice {
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.price_id.is_none()
    }
}

/// A plan found by reverse lookup of a price handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriceMatch {
    pub plan_id: String,
    pub plan_name: String,
    pub interval: BillingInterval,
    /// `None` when the handle is the default entry.
    pub country: Option<String>,
}

struct StageInput<'a> {
    price: &'a IntervalPrice,
    price_ref: &'a PriceRef,
    requested: &'a str,
}

type Stage = fn(&StageInput<'_>) -> Option<ResolvedPrice>;

/// Country-specific entry for the requested country.
fn country_stage(input: &StageInput<'_>) -> Option<ResolvedPrice> {
    let entry = input.price_ref.country_entry(input.requested)?;
    let currency = entry
        .currency()
        .or_else(|| currency_for_country(input.requested))
        .unwrap_or(&input.price.currency);
    Some(ResolvedPrice {
        price_id: Some(entry.price_id().to_string()),
        product_id: input.price.product_id.clone(),
        currency: currency.to_ascii_lowercase(),
        amount_cents: entry.price_cents().unwrap_or(input.price.price_cents),
        country: Some(input.requested.to_string()),
        used_fallback: false,
    })
}

/// Default (home currency) handle.
fn default_stage(input: &StageInput<'_>) -> Option<ResolvedPrice> {
    let handle = input.price_ref.default_handle()?;
    Some(ResolvedPrice {
        price_id: Some(handle.to_string()),
        product_id: input.price.product_id.clone(),
        currency: input.price.currency.to_ascii_lowercase(),
        amount_cents: input.price.price_cents,
        country: None,
        used_fallback: false,
    })
}

const STAGES: [Stage; 2] = [country_stage, default_stage];

/// Resolves gateway prices for plans.
#[derive(Clone, Debug)]
pub struct PriceResolver {
    home_country: String,
}

impl Default for PriceResolver {
    fn default() -> Self {
        Self::new(DEFAULT_HOME_COUNTRY)
    }
}

impl PriceResolver {
    #[must_use]
    pub fn new(home_country: impl Into<String>) -> Self {
        let home = home_country.into();
        Self {
            home_country: normalize_country_code(Some(&home))
                .unwrap_or_else(|| DEFAULT_HOME_COUNTRY.to_string()),
        }
    }

    #[must_use]
    pub fn home_country(&self) -> &str {
        &self.home_country
    }

    /// Normalize a detected country, defaulting to the home country.
    #[must_use]
    pub fn normalize_country(&self, country: Option<&str>) -> String {
        normalize_country_code(country).unwrap_or_else(|| self.home_country.clone())
    }

    /// Resolve the price to charge for `plan` over `interval` in `country`.
    pub fn resolve(
        &self,
        plan: &PlanConfig,
        interval: BillingInterval,
        country: Option<&str>,
    ) -> Result<ResolvedPrice> {
        let price = plan.price(interval).ok_or_else(|| BillingError::PlanUnavailable {
            plan_id: plan.id.clone(),
            reason: format!("no {} pricing", interval),
        })?;

        let price_ref = match &price.price_id {
            Some(price_ref) if price.price_cents > 0 => price_ref,
            _ => {
                return Ok(ResolvedPrice {
                    price_id: None,
                    product_id: None,
                    currency: price.currency.to_ascii_lowercase(),
                    amount_cents: 0,
                    country: None,
                    used_fallback: false,
                });
            }
        };

        let requested = self.normalize_country(country);
        let input = StageInput {
            price,
            price_ref,
            requested: &requested,
        };

        let mut resolved = STAGES
            .iter()
            .find_map(|stage| stage(&input))
            .ok_or_else(|| {
                BillingError::configuration(format!(
                    "plan '{}' has no default {} price handle",
                    plan.id, interval
                ))
            })?;

        resolved.used_fallback = resolved.country.is_none() && requested != self.home_country;
        Ok(resolved)
    }

    /// Map a gateway price handle back to its plan.
    ///
    /// Scans every plan, both intervals, and every country entry.
    #[must_use]
    pub fn find_plan_by_price_handle(&self, plans: &PlanSet, price_id: &str) -> Option<PriceMatch> {
        plans.iter().find_map(|plan| {
            BillingInterval::ALL.iter().find_map(|interval| {
                let price_ref = plan.price(*interval)?.price_id.as_ref()?;
                price_ref
                    .handles()
                    .into_iter()
                    .find(|(_, handle)| *handle == price_id)
                    .map(|(country, _)| PriceMatch {
                        plan_id: plan.id.clone(),
                        plan_name: plan.name.clone(),
                        interval: *interval,
                        country: country.map(str::to_string),
                    })
            })
        })
    }
}

/// Check that the gateway bills `resolved` in the currency it was resolved for.
///
/// Free prices pass without a gateway call. The lookup is a read and may be
/// retried by the client.
pub async fn verify_currency<C>(client: &C, resolved: &ResolvedPrice) -> Result<()>
where
    C: StripePriceClient + ?Sized,
{
    let Some(price_id) = resolved.price_id.as_deref() else {
        return Ok(());
    };
    let price = client.retrieve_price(price_id).await?;
    if !price.currency.eq_ignore_ascii_case(&resolved.currency) {
        tracing::error!(
            target: "workspace_billing::billing",
            price_id = price_id,
            expected = %resolved.currency,
            actual = %price.currency,
            "Gateway price currency does not match the catalog"
        );
        return Err(BillingError::CurrencyMismatch {
            price_id: price_id.to_string(),
            expected: resolved.currency.clone(),
            actual: price.currency.to_ascii_lowercase(),
        });
    }
    Ok(())
}
