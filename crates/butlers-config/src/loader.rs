//! Manifest discovery and loading.
//!
//! `load_dir` implements the startup path:
//! 1. Read `<dir>/butler.toml`
//! 2. Reject literal secrets (pre-resolution)
//! 3. Resolve `${VAR}` references from the process environment
//! 4. Deserialize → [`ButlerManifest`]
//! 5. Check required env declarations resolve
//! 6. Validate cross-field invariants

use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use crate::env::{check_required, reject_literal_secrets, resolve_value};
use crate::error::{ConfigError, ConfigResult};
use crate::types::ButlerManifest;
use crate::validate;

/// Manifest file name within a butler config directory.
pub const MANIFEST_FILE: &str = "butler.toml";

/// Personality document file name.
pub const PERSONALITY_FILE: &str = "CLAUDE.md";

/// Maximum allowed manifest size (1 MB).
const MAX_MANIFEST_SIZE: usize = 1_048_576;

/// Load and validate the manifest from a butler config directory.
///
/// # Errors
///
/// Returns a [`ConfigError`] when the manifest is missing, malformed,
/// carries literal secrets, references unresolvable required env vars,
/// or fails validation.
pub fn load_dir(dir: &Path) -> ConfigResult<ButlerManifest> {
    let path = dir.join(MANIFEST_FILE);
    load_file(&path)
}

/// Load and validate a manifest from an explicit file path.
///
/// # Errors
///
/// See [`load_dir`].
pub fn load_file(path: &Path) -> ConfigResult<ButlerManifest> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    let manifest = load_str(&content, &path.display().to_string())?;
    info!(
        path = %path.display(),
        butler = %manifest.butler.name,
        modules = manifest.modules.len(),
        "loaded manifest"
    );
    Ok(manifest)
}

/// Parse and validate manifest text.
///
/// `origin` is used in error messages only.
///
/// # Errors
///
/// See [`load_dir`].
pub fn load_str(content: &str, origin: &str) -> ConfigResult<ButlerManifest> {
    if content.len() > MAX_MANIFEST_SIZE {
        return Err(ConfigError::ValidationError {
            field: origin.to_owned(),
            message: format!(
                "manifest is {} bytes, exceeding the {MAX_MANIFEST_SIZE} byte limit",
                content.len()
            ),
        });
    }

    let mut raw: toml::Value = toml::from_str(content).map_err(|e| ConfigError::ParseError {
        path: origin.to_owned(),
        source: Box::new(e),
    })?;

    // Secrets must be ${NAME} references; check before resolution so a
    // resolved value is never mistaken for a literal.
    reject_literal_secrets(&raw, "")?;

    let env: BTreeMap<String, String> = std::env::vars().collect();
    resolve_value(&mut raw, &env);

    let manifest: ButlerManifest = raw.try_into().map_err(|e| ConfigError::ParseError {
        path: origin.to_owned(),
        source: Box::new(e),
    })?;

    check_required(&manifest.butler.env, &env)?;
    validate::validate(&manifest)?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [butler]
        name = "health"
        port = 8011

        [butler.db]
        name = "butlers"
        schema = "health"
    "#;

    #[test]
    fn loads_minimal_manifest() {
        let manifest = load_str(MINIMAL, "<test>").unwrap();
        assert_eq!(manifest.butler.name, "health");
        assert_eq!(manifest.butler.port, 8011);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_file(Path::new("/nonexistent/butler.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn load_dir_appends_manifest_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), MINIMAL).unwrap();
        let manifest = load_dir(dir.path()).unwrap();
        assert_eq!(manifest.butler.name, "health");
    }

    #[test]
    fn literal_secret_blocks_load() {
        let content = r#"
            [butler]
            name = "health"
            port = 8011

            [butler.db]
            name = "butlers"
            schema = "health"

            [modules.telegram]
            bot_token = "123456:ABCDEF"
        "#;
        let err = load_str(content, "<test>").unwrap_err();
        assert!(matches!(err, ConfigError::LiteralSecret { .. }));
    }

    #[test]
    fn unresolved_required_env_blocks_load() {
        let content = r#"
            [butler]
            name = "health"
            port = 8011

            [butler.db]
            name = "butlers"
            schema = "health"

            [butler.env]
            required = ["BUTLERS_TEST_SURELY_UNSET_VAR"]
        "#;
        let err = load_str(content, "<test>").unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedEnvVar { .. }));
    }

    #[test]
    fn oversized_manifest_is_rejected() {
        let mut content = MINIMAL.to_owned();
        content.push_str("\npadding = \"");
        content.push_str(&"a".repeat(1_100_000));
        content.push('"');
        let err = load_str(&content, "<test>").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }
}
