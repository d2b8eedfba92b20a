/// Read `TIDEWAY_{key}`, falling back to the bare `{key}`.
///
/// # Examples
///
/// ```rust
/// use tideway_billing::utils::get_env_with_prefix;
///
/// // Checks TIDEWAY_BILLING_AUTO_TAX first, then BILLING_AUTO_TAX
/// let auto_tax = get_env_with_prefix("BILLING_AUTO_TAX");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TIDEWAY_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Comma-separated variant of [`get_env_with_prefix`].
///
/// Entries are trimmed and empty entries dropped, so `"a, ,b"` yields
/// `["a", "b"]`. Webhook secrets are rotated by listing the new one first.
pub fn get_env_list_with_prefix(key: &str) -> Option<Vec<String>> {
    get_env_with_prefix(key).map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_value_wins() {
        unsafe {
            std::env::set_var("TIDEWAY_ENV_TEST_MANAGED_BY", "prefixed");
            std::env::set_var("ENV_TEST_MANAGED_BY", "bare");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_MANAGED_BY"), Some("prefixed".to_string()));
        unsafe {
            std::env::remove_var("TIDEWAY_ENV_TEST_MANAGED_BY");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_MANAGED_BY"), Some("bare".to_string()));
        unsafe {
            std::env::remove_var("ENV_TEST_MANAGED_BY");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_MANAGED_BY"), None);
    }

    #[test]
    fn test_list_splits_and_trims() {
        unsafe {
            std::env::set_var("TIDEWAY_ENV_TEST_SECRETS", " whsec_new, ,whsec_old ");
        }
        assert_eq!(
            get_env_list_with_prefix("ENV_TEST_SECRETS"),
            Some(vec!["whsec_new".to_string(), "whsec_old".to_string()])
        );
        unsafe {
            std::env::remove_var("TIDEWAY_ENV_TEST_SECRETS");
        }
        assert_eq!(get_env_list_with_prefix("ENV_TEST_SECRETS"), None);
    }
}
