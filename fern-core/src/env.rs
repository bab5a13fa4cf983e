//! Small helpers for reading tunables from the process environment.

use std::str::FromStr;

/// Parse environment variable `key` as `T`, falling back to `default` if it's
/// unset or fails to parse.
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable `key` as a boolean, accepting the common
/// `1`/`true`/`yes`/`on` spellings (case-insensitive) as true.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_var_uses_default() {
        assert_eq!(env_get::<u32>("FERN_CORE_TEST_UNSET_VAR", 7), 7);
    }

    #[test]
    fn bool_spellings() {
        // SAFETY: single-threaded test, no concurrent env access.
        unsafe {
            std::env::set_var("FERN_CORE_TEST_BOOL", "YES");
        }
        assert!(env_get_bool("FERN_CORE_TEST_BOOL", false));
        unsafe {
            std::env::remove_var("FERN_CORE_TEST_BOOL");
        }
        assert!(!env_get_bool("FERN_CORE_TEST_BOOL", false));
    }
}
