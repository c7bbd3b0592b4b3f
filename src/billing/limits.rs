//! Feature limits per plan name.
//!
//! Limits come from `PLAN_LIMIT_<PLAN>_<FEATURE>` environment variables rather
//! than the plan catalog, so editing the catalog alone cannot widen them.
//! A value is a non-negative integer or `unlimited`. Absent variables fall
//! back to built-in defaults; negative or unparseable values are fatal.

use std::collections::HashMap;

use serde::Serialize;

use super::error::{BillingError, Result};
use super::plans::split_variant_key;

/// Prefix of every limit variable.
pub const LIMIT_ENV_PREFIX: &str = "PLAN_LIMIT_";

/// A single limit dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "max", rename_all = "snake_case")]
pub enum Limit {
    Unlimited,
    Capped(u64),
}

impl Limit {
    /// Check current usage against this limit.
    #[must_use]
    pub fn check(&self, current: u64) -> LimitCheckResult {
        match *self {
            Self::Unlimited => LimitCheckResult::Unlimited,
            Self::Capped(max) if current < max => LimitCheckResult::WithinLimit { current, max },
            Self::Capped(max) => LimitCheckResult::AtLimit { current, max },
        }
    }

    /// Whether `value` fits under the limit (inclusive), for size ceilings.
    #[must_use]
    pub fn permits(&self, value: u64) -> bool {
        match *self {
            Self::Unlimited => true,
            Self::Capped(max) => value <= max,
        }
    }
}

/// Result of checking a resource limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimitCheckResult {
    /// No limit on this resource.
    Unlimited,
    /// Usage is within the limit.
    WithinLimit { current: u64, max: u64 },
    /// Usage has reached or exceeded the limit.
    AtLimit { current: u64, max: u64 },
}

impl LimitCheckResult {
    /// Whether one more unit may be added.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::AtLimit { .. })
    }

    /// Remaining capacity, `None` when unlimited.
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::WithinLimit { current, max } | Self::AtLimit { current, max } => {
                Some(max.saturating_sub(*current))
            }
        }
    }
}

/// The limit dimensions enforced by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    Workspaces,
    ProjectsPerWorkspace,
    FilesPerProject,
    StorageGb,
    FileSizeMb,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::Workspaces,
        Feature::ProjectsPerWorkspace,
        Feature::FilesPerProject,
        Feature::StorageGb,
        Feature::FileSizeMb,
    ];

    /// The variable suffix for this feature.
    #[must_use]
    pub fn env_key(&self) -> &'static str {
        match self {
            Self::Workspaces => "WORKSPACES",
            Self::ProjectsPerWorkspace => "PROJECTS_PER_WORKSPACE",
            Self::FilesPerProject => "FILES_PER_PROJECT",
            Self::StorageGb => "STORAGE_GB",
            Self::FileSizeMb => "FILE_SIZE_MB",
        }
    }
}

/// Enforceable limits for one plan name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FeatureLimits {
    pub workspaces: Limit,
    pub projects_per_workspace: Limit,
    pub files_per_project: Limit,
    pub storage_gb: Limit,
    pub file_size_mb: Limit,
}

impl FeatureLimits {
    #[must_use]
    pub fn get(&self, feature: Feature) -> Limit {
        match feature {
            Feature::Workspaces => self.workspaces,
            Feature::ProjectsPerWorkspace => self.projects_per_workspace,
            Feature::FilesPerProject => self.files_per_project,
            Feature::StorageGb => self.storage_gb,
            Feature::FileSizeMb => self.file_size_mb,
        }
    }

    fn set(&mut self, feature: Feature, limit: Limit) {
        match feature {
            Feature::Workspaces => self.workspaces = limit,
            Feature::ProjectsPerWorkspace => self.projects_per_workspace = limit,
            Feature::FilesPerProject => self.files_per_project = limit,
            Feature::StorageGb => self.storage_gb = limit,
            Feature::FileSizeMb => self.file_size_mb = limit,
        }
    }

    #[must_use]
    pub fn check(&self, feature: Feature, current: u64) -> LimitCheckResult {
        self.get(feature).check(current)
    }

    /// Built-in limits used when a variable is absent.
    #[must_use]
    pub fn defaults_for(base_plan_name: &str) -> Self {
        match base_plan_name {
            "pro" => Self {
                workspaces: Limit::Capped(10),
                projects_per_workspace: Limit::Capped(50),
                files_per_project: Limit::Capped(500),
                storage_gb: Limit::Capped(100),
                file_size_mb: Limit::Capped(250),
            },
            _ => Self::free(),
        }
    }

    fn free() -> Self {
        Self {
            workspaces: Limit::Capped(1),
            projects_per_workspace: Limit::Capped(3),
            files_per_project: Limit::Capped(25),
            storage_gb: Limit::Capped(1),
            file_size_mb: Limit::Capped(10),
        }
    }
}

/// Resolves [`FeatureLimits`] from a snapshot of limit variables.
#[derive(Clone, Debug, Default)]
pub struct LimitResolver {
    vars: HashMap<String, String>,
}

impl LimitResolver {
    /// Snapshot every `PLAN_LIMIT_*` variable from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit key/value pairs; keys without the prefix are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with(LIMIT_ENV_PREFIX))
            .collect();
        Self { vars }
    }

    /// Limits for `plan_name`. The `_annual` suffix is stripped first.
    pub fn limits_for(&self, plan_name: &str) -> Result<FeatureLimits> {
        let (base, _) = split_variant_key(plan_name);
        let base = base.to_ascii_lowercase();
        let mut limits = FeatureLimits::defaults_for(&base);

        for feature in Feature::ALL {
            let key = env_key(&base, feature);
            if let Some(raw) = self.vars.get(&key) {
                limits.set(feature, parse_limit(&key, raw)?);
            }
        }

        Ok(limits)
    }

    /// Fail at startup if any configured value is invalid.
    pub fn validate(&self) -> Result<()> {
        for (key, raw) in &self.vars {
            parse_limit(key, raw)?;
        }
        Ok(())
    }
}

fn env_key(base_plan_name: &str, feature: Feature) -> String {
    let plan: String = base_plan_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}{}_{}", LIMIT_ENV_PREFIX, plan, feature.env_key())
}

fn parse_limit(key: &str, raw: &str) -> Result<Limit> {
    let value = raw.trim();
    if value.eq_ignore_ascii_case("unlimited") {
        return Ok(Limit::Unlimited);
    }
    let parsed: i64 = value.parse().map_err(|_| {
        BillingError::configuration(format!("{} must be an integer or 'unlimited', got '{}'", key, raw))
    })?;
    if parsed < 0 {
        return Err(BillingError::configuration(format!(
            "{} must not be negative, got {}",
            key, parsed
        )));
    }
    Ok(Limit::Capped(parsed as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_absent() {
        let resolver = LimitResolver::default();
        assert_eq!(resolver.limits_for("free").unwrap(), FeatureLimits::defaults_for("free"));
        assert_eq!(resolver.limits_for("pro").unwrap().workspaces, Limit::Capped(10));
        // Unknown plans get the most conservative limits.
        assert_eq!(resolver.limits_for("mystery").unwrap(), FeatureLimits::defaults_for("free"));
    }

    #[test]
    fn test_annual_suffix_is_stripped() {
        let resolver = LimitResolver::from_vars([("PLAN_LIMIT_PRO_STORAGE_GB", "500")]);
        assert_eq!(resolver.limits_for("pro_annual").unwrap().storage_gb, Limit::Capped(500));
        assert_eq!(resolver.limits_for("pro").unwrap().storage_gb, Limit::Capped(500));
    }

    #[test]
    fn test_unlimited_value() {
        let resolver = LimitResolver::from_vars([("PLAN_LIMIT_PRO_WORKSPACES", "Unlimited")]);
        let limits = resolver.limits_for("pro").unwrap();
        assert_eq!(limits.workspaces, Limit::Unlimited);
        assert_eq!(limits.check(Feature::Workspaces, 10_000), LimitCheckResult::Unlimited);
    }

    #[test]
    fn test_negative_value_is_configuration_error() {
        let resolver = LimitResolver::from_vars([("PLAN_LIMIT_FREE_PROJECTS_PER_WORKSPACE", "-1")]);
        let err = resolver.limits_for("free").unwrap_err();
        assert!(matches!(err, BillingError::Configuration { .. }));
        assert!(resolver.validate().is_err());
        // Other plans are unaffected by the bad free value.
        assert!(resolver.limits_for("pro").is_ok());
    }

    #[test]
    fn test_garbage_value_is_configuration_error() {
        let resolver = LimitResolver::from_vars([("PLAN_LIMIT_PRO_FILE_SIZE_MB", "lots")]);
        assert!(matches!(
            resolver.limits_for("pro"),
            Err(BillingError::Configuration { .. })
        ));
    }

    #[test]
    fn test_unrelated_vars_are_ignored() {
        let resolver = LimitResolver::from_vars([("PATH", "/usr/bin"), ("HOME", "-1")]);
        assert!(resolver.validate().is_ok());
    }

    #[test]
    fn test_no_resolved_limit_is_negative_for_any_name() {
        let resolver = LimitResolver::from_vars([
            ("PLAN_LIMIT_FREE_WORKSPACES", "0"),
            ("PLAN_LIMIT_PRO_STORAGE_GB", "unlimited"),
        ]);
        for name in ["free", "free_annual", "pro", "pro_annual", "team", ""] {
            assert!(resolver.limits_for(name).is_ok(), "limits for '{}'", name);
        }
        assert_eq!(resolver.limits_for("free_annual").unwrap().workspaces, Limit::Capped(0));
    }

    #[test]
    fn test_limit_check_results() {
        let limit = Limit::Capped(3);
        assert_eq!(limit.check(2), LimitCheckResult::WithinLimit { current: 2, max: 3 });
        assert!(!limit.check(3).is_allowed());
        assert_eq!(limit.check(1).remaining(), Some(2));
        assert!(limit.permits(3));
        assert!(!limit.permits(4));
        assert!(Limit::Unlimited.permits(u64::MAX));
    }
}
