//! `butlers init` scaffolding.

use std::path::Path;

use anyhow::Context;

/// Create a starter config directory for a new butler.
pub(crate) fn scaffold(config_root: &Path, name: &str, port: u16) -> anyhow::Result<()> {
    let dir = config_root.join(name);
    if dir.exists() {
        anyhow::bail!("{} already exists", dir.display());
    }
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create {}", dir.display()))?;

    let manifest = format!(
        r#"[butler]
name = "{name}"
port = {port}
description = "The {name} butler"

[butler.db]
name = "butlers"
schema = "{name}"

[butler.runtime]
type = "claude_code"
model = "claude-sonnet-4-20250514"

[butler.switchboard]
url = "http://127.0.0.1:8001"
advertise = true

[butler.env]
required = ["ANTHROPIC_API_KEY"]

[modules.memory]

[[butler.schedule]]
name = "morning-review"
cron = "0 0 8 * * *"
prompt = "Review anything pending from overnight and summarize."
"#
    );
    std::fs::write(dir.join(butlers_config::MANIFEST_FILE), manifest)?;

    let personality = format!(
        "# {name}\n\nYou are the {name} butler. Handle requests routed to you, use your\n\
         tools deliberately, and report what you did in one short paragraph.\n"
    );
    std::fs::write(dir.join(butlers_config::PERSONALITY_FILE), personality)?;

    println!("created {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffold_writes_a_loadable_manifest() {
        let root = tempfile::tempdir().unwrap();
        scaffold(root.path(), "health", 8011).unwrap();

        let manifest = butlers_config::load_dir(&root.path().join("health")).unwrap();
        assert_eq!(manifest.butler.name, "health");
        assert_eq!(manifest.butler.port, 8011);
        assert!(manifest.module_enabled("memory"));
        assert!(root.path().join("health/CLAUDE.md").is_file());
    }

    #[test]
    fn scaffold_refuses_to_overwrite() {
        let root = tempfile::tempdir().unwrap();
        scaffold(root.path(), "health", 8011).unwrap();
        assert!(scaffold(root.path(), "health", 8011).is_err());
    }
}
