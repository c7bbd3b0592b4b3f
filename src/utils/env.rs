/// Get environment variable with BILLING_ prefix, falling back to unprefixed version
///
/// Checks `BILLING_{key}` first, then `{key}`, so platform-provided names such
/// as `PORT` and `DATABASE_URL` work unchanged.
///
/// ```rust,ignore
/// // Checks BILLING_PORT first, then PORT
/// let port = get_env_with_prefix("PORT");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("BILLING_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Parse a boolean flag (`true`/`1`/`yes`, case-insensitive).
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        unsafe {
            std::env::set_var("BILLING_ENV_TEST_VAR", "prefixed_value");
            std::env::set_var("ENV_TEST_VAR", "unprefixed_value");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_VAR"), Some("prefixed_value".to_string()));
        unsafe {
            std::env::remove_var("BILLING_ENV_TEST_VAR");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_VAR"), Some("unprefixed_value".to_string()));
        unsafe {
            std::env::remove_var("ENV_TEST_VAR");
        }

        assert_eq!(get_env_with_prefix("ENV_TEST_NON_EXISTENT"), None);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }
}
