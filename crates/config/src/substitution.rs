//! `${VAR}` / `$VAR` expansion over the raw YAML text

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use std::env;
use tracing::{debug, warn};

const ENV_VAR_PATTERN: &str = r"\$\{(\w+)\}|\$(\w+)";

fn pattern() -> Result<Regex> {
    Regex::new(ENV_VAR_PATTERN).context("invalid env var pattern")
}

/// Expand environment references; unset variables keep their placeholder
/// so the validator can name them
pub fn substitute_env_vars(content: &str) -> Result<String> {
    let re = pattern()?;
    let mut missing = Vec::new();

    let expanded = re.replace_all(content, |caps: &Captures| {
        let placeholder = &caps[0];
        let Some(name) = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()) else {
            return placeholder.to_string();
        };
        match env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.push(name.to_string());
                placeholder.to_string()
            }
        }
    });

    if missing.is_empty() {
        debug!("All environment references resolved");
    } else {
        warn!(?missing, "Environment variables not set");
    }
    Ok(expanded.into_owned())
}

/// True while `content` still holds a `${VAR}` / `$VAR` reference
pub fn has_unresolved_env_vars(content: &str) -> bool {
    pattern().map(|re| re.is_match(content)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitutes_both_forms() {
        env::set_var("SPOTX_TEST_PG_HOST", "db.internal");
        env::set_var("SPOTX_TEST_PG_PORT", "6432");
        let out =
            substitute_env_vars("host: ${SPOTX_TEST_PG_HOST}\nport: $SPOTX_TEST_PG_PORT").unwrap();
        assert_eq!(out, "host: db.internal\nport: 6432");
    }

    #[test]
    fn test_keeps_missing_placeholders() {
        let out = substitute_env_vars("password: ${SPOTX_TEST_SURELY_UNSET}").unwrap();
        assert_eq!(out, "password: ${SPOTX_TEST_SURELY_UNSET}");
        assert!(has_unresolved_env_vars(&out));
        assert!(!has_unresolved_env_vars("password: plain"));
    }
}
