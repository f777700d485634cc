//! Environment variable references and the credential snapshot.
//!
//! Manifest string values may reference environment variables as
//! `${NAME}`. References resolve at load time from the process
//! environment; a reference to an undeclared-or-missing variable that
//! the manifest marks required blocks startup.

use std::collections::BTreeMap;

use crate::error::{ConfigError, ConfigResult};
use crate::types::EnvSection;

/// Resolve `${NAME}` references in all string values of a TOML tree.
///
/// Missing variables leave the reference untouched; the caller decides
/// whether that is fatal via [`check_required`].
pub(crate) fn resolve_value(value: &mut toml::Value, env: &BTreeMap<String, String>) {
    match value {
        toml::Value::String(s) => {
            if let Some(resolved) = substitute(s, env) {
                *s = resolved;
            }
        },
        toml::Value::Array(items) => {
            for item in items {
                resolve_value(item, env);
            }
        },
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                resolve_value(item, env);
            }
        },
        _ => {},
    }
}

/// Substitute every `${NAME}` occurrence in `s`. Returns `None` when
/// nothing changed.
fn substitute(s: &str, env: &BTreeMap<String, String>) -> Option<String> {
    if !s.contains("${") {
        return None;
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    let mut changed = false;
    while let Some(start) = rest.find("${") {
        let after = &rest[start.saturating_add(2)..];
        let Some(end) = after.find('}') else {
            break;
        };
        let name = &after[..end];
        out.push_str(&rest[..start]);
        if let Some(value) = env.get(name) {
            out.push_str(value);
            changed = true;
        } else {
            // Leave unresolved references intact for check_required.
            out.push_str("${");
            out.push_str(name);
            out.push('}');
        }
        rest = &after[end.saturating_add(1)..];
    }
    out.push_str(rest);
    changed.then_some(out)
}

/// Resolve `${NAME}` references in-place against the process environment.
pub fn resolve_env_references(value: &mut toml::Value) {
    let env: BTreeMap<String, String> = std::env::vars().collect();
    resolve_value(value, &env);
}

/// Verify every required declared variable resolves.
///
/// # Errors
///
/// Returns [`ConfigError::UnresolvedEnvVar`] for the first missing
/// required variable.
pub(crate) fn check_required(
    section: &EnvSection,
    env: &BTreeMap<String, String>,
) -> ConfigResult<()> {
    for name in &section.required {
        if !env.contains_key(name) {
            return Err(ConfigError::UnresolvedEnvVar { name: name.clone() });
        }
    }
    Ok(())
}

/// Snapshot the credential environment for a spawned child process.
///
/// Only variables declared by the manifest (and any extra names enabled
/// modules declare) are exposed; everything else is stripped.
#[must_use]
pub fn snapshot_declared(
    section: &EnvSection,
    module_vars: &[&str],
) -> BTreeMap<String, String> {
    let mut snapshot = BTreeMap::new();
    for name in section
        .declared()
        .into_iter()
        .chain(module_vars.iter().copied())
    {
        if let Ok(value) = std::env::var(name) {
            snapshot.insert(name.to_owned(), value);
        }
    }
    snapshot
}

/// Keys whose values must be `${NAME}` references, never literals.
const SECRET_KEY_SUFFIXES: [&str; 5] = ["_token", "_password", "_api_key", "_secret", "_key"];

/// Reject secret-looking keys holding literal values.
///
/// Walks the raw (pre-resolution) tree; a key ending in a secret suffix
/// whose string value is not a pure `${NAME}` reference is a startup
/// error.
///
/// # Errors
///
/// Returns [`ConfigError::LiteralSecret`] naming the offending field.
pub(crate) fn reject_literal_secrets(value: &toml::Value, path: &str) -> ConfigResult<()> {
    if let toml::Value::Table(table) = value {
        for (key, item) in table {
            let child_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{path}.{key}")
            };
            if let toml::Value::String(s) = item {
                let is_secret_key = SECRET_KEY_SUFFIXES
                    .iter()
                    .any(|suffix| key.to_lowercase().ends_with(suffix));
                if is_secret_key && !is_pure_reference(s) && !s.is_empty() {
                    return Err(ConfigError::LiteralSecret { field: child_path });
                }
            }
            reject_literal_secrets(item, &child_path)?;
        }
    }
    Ok(())
}

fn is_pure_reference(s: &str) -> bool {
    s.starts_with("${") && s.ends_with('}') && s.matches("${").count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn substitutes_known_references() {
        let env = env(&[("BUTLER_TELEGRAM_TOKEN", "tok-123")]);
        let mut value: toml::Value =
            toml::from_str("token = \"${BUTLER_TELEGRAM_TOKEN}\"").unwrap();
        resolve_value(&mut value, &env);
        assert_eq!(
            value.get("token").and_then(toml::Value::as_str),
            Some("tok-123")
        );
    }

    #[test]
    fn leaves_unknown_references_intact() {
        let env = env(&[]);
        let mut value: toml::Value = toml::from_str("token = \"${MISSING}\"").unwrap();
        resolve_value(&mut value, &env);
        assert_eq!(
            value.get("token").and_then(toml::Value::as_str),
            Some("${MISSING}")
        );
    }

    #[test]
    fn substitutes_embedded_references() {
        let env = env(&[("POSTGRES_HOST", "db.internal")]);
        let mut value: toml::Value =
            toml::from_str("url = \"postgres://${POSTGRES_HOST}:5432/butlers\"").unwrap();
        resolve_value(&mut value, &env);
        assert_eq!(
            value.get("url").and_then(toml::Value::as_str),
            Some("postgres://db.internal:5432/butlers")
        );
    }

    #[test]
    fn required_missing_is_an_error() {
        let section = EnvSection {
            required: vec!["ANTHROPIC_API_KEY".to_owned()],
            optional: vec![],
        };
        let err = check_required(&section, &env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedEnvVar { name } if name == "ANTHROPIC_API_KEY"));
    }

    #[test]
    fn literal_secret_is_rejected() {
        let value: toml::Value =
            toml::from_str("[modules.telegram]\nbot_token = \"123456:ABCDEF\"").unwrap();
        let err = reject_literal_secrets(&value, "").unwrap_err();
        assert!(
            matches!(err, ConfigError::LiteralSecret { field } if field == "modules.telegram.bot_token")
        );
    }

    #[test]
    fn reference_secret_is_accepted() {
        let value: toml::Value =
            toml::from_str("[modules.telegram]\nbot_token = \"${BUTLER_TELEGRAM_TOKEN}\"")
                .unwrap();
        assert!(reject_literal_secrets(&value, "").is_ok());
    }

    #[test]
    fn non_secret_literals_are_fine() {
        let value: toml::Value = toml::from_str("[butler]\nname = \"health\"").unwrap();
        assert!(reject_literal_secrets(&value, "").is_ok());
    }
}
