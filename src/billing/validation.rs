//! Input validation for billing operations.
//!
//! Identifiers arriving from request bodies and webhook payloads are checked
//! here before they reach the store or the gateway.

use super::error::{BillingError, Result};

/// Maximum length for user and workspace IDs.
const MAX_ENTITY_ID_LENGTH: usize = 256;

/// Maximum length for plan IDs.
const MAX_PLAN_ID_LENGTH: usize = 64;

/// ISO 4217 currency codes accepted in the plan catalog (lowercase).
const VALID_CURRENCIES: &[&str] = &[
    "usd", "eur", "gbp", "cad", "aud", "jpy", "chf", "sek", "nok", "dkk", "nzd", "sgd", "hkd",
    "inr", "brl", "mxn", "pln", "czk", "huf", "ron",
];

/// Validate a user or workspace ID.
///
/// IDs must be non-empty, at most 256 characters, and contain only
/// alphanumeric characters, underscores, and hyphens.
pub fn validate_entity_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(BillingError::invalid_input(format!("{} cannot be empty", kind)));
    }

    if id.len() > MAX_ENTITY_ID_LENGTH {
        return Err(BillingError::invalid_input(format!(
            "{} exceeds maximum length of {}",
            kind, MAX_ENTITY_ID_LENGTH
        )));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(BillingError::invalid_input(format!(
            "{} '{}' contains invalid characters",
            kind,
            sanitize_for_error(id)
        )));
    }

    Ok(())
}

/// Validate a plan ID.
///
/// Same character rules as entity IDs, capped at 64 characters.
pub fn validate_plan_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(BillingError::invalid_input("plan_id cannot be empty"));
    }

    if id.len() > MAX_PLAN_ID_LENGTH {
        return Err(BillingError::invalid_input(format!(
            "plan_id exceeds maximum length of {}",
            MAX_PLAN_ID_LENGTH
        )));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(BillingError::invalid_input(format!(
            "plan_id '{}' contains invalid characters",
            sanitize_for_error(id)
        )));
    }

    Ok(())
}

/// Whether `currency` is a supported ISO 4217 code (case-insensitive).
#[must_use]
pub fn is_valid_currency(currency: &str) -> bool {
    VALID_CURRENCIES.contains(&currency.to_ascii_lowercase().as_str())
}

/// Normalize a detected country code to upper-case ISO 3166-1 alpha-2.
///
/// Returns `None` for blank or malformed input so callers can fall back to
/// the home country.
#[must_use]
pub fn normalize_country_code(code: Option<&str>) -> Option<String> {
    let code = code?.trim();
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_ascii_uppercase())
    } else {
        None
    }
}

fn sanitize_for_error(s: &str) -> String {
    s.chars()
        .take(32)
        .map(|c| if c.is_ascii_graphic() { c } else { '?' })
        .collect()
}
