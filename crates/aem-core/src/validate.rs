//! Pattern helpers shared by criteria translation and value objects.

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

use regex::Regex;

/// Operator prefix that may lead a criteria key, e.g. `>=price`.
pub const CRITERIA_PREFIX_PATTERN: &str = r"^[=%><@!]{0,3}";

/// Thread-safe cache of compiled patterns.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check if a string matches a regex pattern.
///
/// Returns `false` for an invalid pattern and logs a warning.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern, treating as non-match"
            );
            false
        }
    }
}

/// Split a criteria key into its operator prefix and field name.
///
/// ```ignore
/// assert_eq!(split_criteria_key(">=price"), (">=", "price"));
/// assert_eq!(split_criteria_key("name"), ("", "name"));
/// ```
pub fn split_criteria_key(key: &str) -> (&str, &str) {
    match regex_cache().get_or_compile(CRITERIA_PREFIX_PATTERN) {
        Ok(regex) => {
            let end = regex.find(key).map_or(0, |m| m.end());
            key.split_at(end)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Criteria prefix pattern failed to compile");
            ("", key)
        }
    }
}
