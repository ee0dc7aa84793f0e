use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as AnyhowContext, Result};
use serde::Deserialize;

use crate::logging::Level;

const ARCHIVE_ROOT_ENV: &str = "TOSCA_ARCHIVE_ROOT";

/// Compiler settings, usually read from a `tosca.toml` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub artifacts: ArtifactSettings,
    pub lifecycle: LifecycleSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    /// Archive root, laid out as `<root>/<name>/<version>/`.
    pub repository: PathBuf,
    /// Folder holding expanded archive content, relative to an archive root.
    pub expanded_folder: String,
    /// Directories searched for `classpath:` and relative refs.
    pub search_paths: Vec<PathBuf>,
    pub allow_remote: bool,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            expanded_folder: "expanded".to_string(),
            search_paths: Vec::new(),
            allow_remote: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub noop_command: String,
    /// Where file artifacts are installed on the target machine.
    pub resources_root: String,
    pub temp_root: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            noop_command: "true".to_string(),
            resources_root: "~/tosca-resources".to_string(),
            temp_root: "/tmp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Level,
    pub echo: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            echo: false,
        }
    }
}

fn default_repository() -> PathBuf {
    if let Ok(root) = env::var(ARCHIVE_ROOT_ENV) {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".tosca").join("archives"))
        .unwrap_or_else(|| PathBuf::from(".tosca").join("archives"))
}

impl CompilerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CompilerConfig =
            toml::from_str(text).with_context(|| "invalid compiler configuration")?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    /// Relative search paths are anchored on `base`, usually the config file's directory.
    pub fn anchor_paths(mut self, base: &Path) -> Self {
        if self.artifacts.repository.is_relative() {
            self.artifacts.repository = base.join(&self.artifacts.repository);
        }
        self.artifacts.search_paths = self
            .artifacts
            .search_paths
            .into_iter()
            .map(|path| if path.is_relative() { base.join(path) } else { path })
            .collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = CompilerConfig::from_toml_str("").unwrap();
        assert_eq!(config.artifacts.expanded_folder, "expanded");
        assert!(config.artifacts.allow_remote);
        assert_eq!(config.lifecycle.noop_command, "true");
        assert_eq!(config.logging.level, Level::Info);
        assert!(!config.logging.echo);
    }

    #[test]
    fn sections_override_defaults() {
        let config = CompilerConfig::from_toml_str(
            r#"
            [artifacts]
            repository = "archives"
            search_paths = ["resources", "/opt/shared"]
            allow_remote = false

            [lifecycle]
            noop_command = "/bin/true"

            [logging]
            level = "warn"
            "#,
        )
        .unwrap()
        .anchor_paths(Path::new("/etc/tosca"));
        assert_eq!(config.artifacts.repository, PathBuf::from("/etc/tosca/archives"));
        assert_eq!(
            config.artifacts.search_paths,
            vec![PathBuf::from("/etc/tosca/resources"), PathBuf::from("/opt/shared")]
        );
        assert!(!config.artifacts.allow_remote);
        assert_eq!(config.lifecycle.noop_command, "/bin/true");
        assert_eq!(config.lifecycle.temp_root, "/tmp");
        assert_eq!(config.logging.level, Level::Warn);
    }

    #[test]
    fn unknown_level_is_rejected() {
        let err = CompilerConfig::from_toml_str("[logging]\nlevel = \"loud\"").unwrap_err();
        assert!(format!("{err:#}").contains("loud"));
    }
}
