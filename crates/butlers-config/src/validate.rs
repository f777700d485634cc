//! Post-parse manifest validation.
//!
//! Cross-field invariants: schedule name uniqueness, parseable cron
//! expressions, a real IANA timezone, sane contract version bounds, and
//! module names drawn from the known set.

use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::{ConfigError, ConfigResult};
use crate::types::ButlerManifest;

/// Module names this build knows how to construct.
pub(crate) const KNOWN_MODULES: [&str; 6] = [
    "telegram",
    "email",
    "calendar",
    "memory",
    "approvals",
    "contacts",
];

/// Validate a parsed manifest.
///
/// # Errors
///
/// Returns the first violated invariant.
pub(crate) fn validate(manifest: &ButlerManifest) -> ConfigResult<()> {
    let butler = &manifest.butler;

    if butler.name.is_empty() {
        return Err(ConfigError::ValidationError {
            field: "butler.name".to_owned(),
            message: "butler name must not be empty".to_owned(),
        });
    }
    if !butler
        .name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(ConfigError::ValidationError {
            field: "butler.name".to_owned(),
            message: format!(
                "butler name '{}' must be lowercase ascii, digits, '-' or '_'",
                butler.name
            ),
        });
    }
    if butler.port < 1024 {
        return Err(ConfigError::ValidationError {
            field: "butler.port".to_owned(),
            message: format!("port {} is reserved; use 1024 or above", butler.port),
        });
    }
    if butler.db.schema.is_empty() {
        return Err(ConfigError::ValidationError {
            field: "butler.db.schema".to_owned(),
            message: "db schema must not be empty".to_owned(),
        });
    }

    if butler.runtime.max_concurrent_sessions == 0 {
        return Err(ConfigError::ValidationError {
            field: "butler.runtime.max_concurrent_sessions".to_owned(),
            message: "must be at least 1".to_owned(),
        });
    }
    if chrono_tz::Tz::from_str(&butler.runtime.timezone).is_err() {
        return Err(ConfigError::ValidationError {
            field: "butler.runtime.timezone".to_owned(),
            message: format!("'{}' is not a known IANA timezone", butler.runtime.timezone),
        });
    }

    let sb = &butler.switchboard;
    if sb.route_contract_min > sb.route_contract_max {
        return Err(ConfigError::ValidationError {
            field: "butler.switchboard.route_contract_min".to_owned(),
            message: format!(
                "contract range inverted: min {} > max {}",
                sb.route_contract_min, sb.route_contract_max
            ),
        });
    }

    let mut seen = BTreeSet::new();
    for entry in &butler.schedule {
        if !seen.insert(entry.name.as_str()) {
            return Err(ConfigError::ValidationError {
                field: "butler.schedule".to_owned(),
                message: format!("duplicate schedule name '{}'", entry.name),
            });
        }
        if cron::Schedule::from_str(&entry.cron).is_err() {
            return Err(ConfigError::ValidationError {
                field: format!("butler.schedule.{}", entry.name),
                message: format!("invalid cron expression '{}'", entry.cron),
            });
        }
    }

    for name in manifest.modules.keys() {
        if !KNOWN_MODULES.contains(&name.as_str()) {
            return Err(ConfigError::UnknownModule { name: name.clone() });
        }
    }

    for (model, pricing) in &manifest.pricing {
        if !pricing.input_per_million.is_finite()
            || pricing.input_per_million < 0.0
            || !pricing.output_per_million.is_finite()
            || pricing.output_per_million < 0.0
        {
            return Err(ConfigError::ValidationError {
                field: format!("pricing.{model}"),
                message: "prices must be finite and non-negative".to_owned(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_str;

    fn manifest(extra: &str) -> Result<ButlerManifest, ConfigError> {
        let content = format!(
            r#"
            [butler]
            name = "health"
            port = 8011

            [butler.db]
            name = "butlers"
            schema = "health"
            {extra}
            "#
        );
        load_str(&content, "<test>")
    }

    #[test]
    fn unknown_module_blocks_startup() {
        let err = manifest("[modules.teleportation]\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModule { name } if name == "teleportation"));
    }

    #[test]
    fn duplicate_schedule_names_rejected() {
        let err = manifest(
            r#"
            [[butler.schedule]]
            name = "digest"
            cron = "0 0 8 * * *"
            prompt = "a"

            [[butler.schedule]]
            name = "digest"
            cron = "0 0 9 * * *"
            prompt = "b"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn invalid_cron_rejected() {
        let err = manifest(
            r#"
            [[butler.schedule]]
            name = "digest"
            cron = "every tuesday"
            prompt = "a"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { field, .. } if field.contains("digest")));
    }

    #[test]
    fn bad_timezone_rejected() {
        let err = manifest("[butler.runtime]\ntimezone = \"Mars/Olympus\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { field, .. } if field.contains("timezone")));
    }

    #[test]
    fn inverted_contract_range_rejected() {
        let err = manifest(
            "[butler.switchboard]\nroute_contract_min = 3\nroute_contract_max = 1\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn low_port_rejected() {
        let content = r#"
            [butler]
            name = "health"
            port = 80

            [butler.db]
            name = "butlers"
            schema = "health"
        "#;
        let err = load_str(content, "<test>").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { field, .. } if field == "butler.port"));
    }
}
