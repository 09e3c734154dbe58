// ⚙️ Configuration - app-config.toml with defaults and env overrides
//
// Every key has a default, so a missing file means "run with defaults".
// Environment overrides: ANTHROPIC_API_KEY, RECEIPTS_DATA_DIR,
// RECEIPTS_USER, RECEIPTS_LOG.

use crate::extract::ExtractionOptions;
use crate::intake::{IntakeOptions, DEFAULT_MAX_EDGE};
use crate::reconcile::ReconciliationEngine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "app-config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no Anthropic API key: set services.anthropic.key, services.anthropic.key_file or ANTHROPIC_API_KEY")]
    MissingKey,

    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("data.use_user is set but no user name was given")]
    MissingUser,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub root_dir: PathBuf,
    pub extraction_subdir: String,
    pub collation_subdir: String,
    /// Scope storage under `<root_dir>/<username>`
    pub use_user: bool,
    pub username: Option<String>,
}

impl Default for DataSettings {
    fn default() -> Self {
        DataSettings {
            root_dir: PathBuf::from("data"),
            extraction_subdir: "extraction".to_string(),
            collation_subdir: "collation".to_string(),
            use_user: true,
            username: None,
        }
    }
}

impl DataSettings {
    /// Root of one user's storage area
    pub fn user_root(&self, username: &str) -> PathBuf {
        if self.use_user {
            self.root_dir.join(username)
        } else {
            self.root_dir.clone()
        }
    }

    pub fn extraction_dir(&self, username: &str) -> PathBuf {
        self.user_root(username).join(&self.extraction_subdir)
    }

    pub fn collation_dir(&self, username: &str) -> PathBuf {
        self.user_root(username).join(&self.collation_subdir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// Daily-rolling JSON log files go here when set
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: "info".to_string(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    pub max_edge: u32,
}

impl Default for ImageSettings {
    fn default() -> Self {
        ImageSettings {
            max_edge: DEFAULT_MAX_EDGE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicSettings {
    pub model: String,
    pub max_tokens: u32,
    pub key: Option<String>,
    /// First line of this file is the key
    pub key_file: Option<PathBuf>,
    pub base_url: Option<String>,
}

impl Default for AnthropicSettings {
    fn default() -> Self {
        let defaults = ExtractionOptions::default();
        AnthropicSettings {
            model: defaults.model,
            max_tokens: defaults.max_tokens,
            key: None,
            key_file: None,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub anthropic: AnthropicSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSettings {
    pub total_tolerance: f64,
    pub major_discrepancy: f64,
    /// JSON name rules used by collation; built-in rules when unset
    pub names_file: Option<PathBuf>,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        let engine = ReconciliationEngine::new();
        ReviewSettings {
            total_tolerance: engine.tolerance,
            major_discrepancy: engine.major_discrepancy_threshold,
            names_file: None,
        }
    }
}

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data: DataSettings,
    pub logging: LoggingSettings,
    pub image: ImageSettings,
    pub services: ServiceSettings,
    pub review: ReviewSettings,
}

impl Settings {
    /// Load settings, then apply environment overrides.
    ///
    /// With no explicit path, `./app-config.toml` is used when present and
    /// defaults otherwise. An explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    tracing::debug!("no {} found, using defaults", CONFIG_FILE_NAME);
                    Settings::default()
                }
            }
        };

        settings.apply_overrides(|name| std::env::var(name).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let settings = Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!(path = %path.display(), "loaded config");
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply environment-style overrides through a lookup function
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("ANTHROPIC_API_KEY") {
            self.services.anthropic.key = Some(key.trim().to_string());
        }
        if let Some(dir) = non_empty("RECEIPTS_DATA_DIR") {
            self.data.root_dir = PathBuf::from(dir);
        }
        if let Some(user) = non_empty("RECEIPTS_USER") {
            self.data.username = Some(user.trim().to_string());
        }
        if let Some(level) = non_empty("RECEIPTS_LOG") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.extraction_subdir.trim().is_empty() || self.data.collation_subdir.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "data.extraction_subdir and data.collation_subdir must not be empty".to_string(),
            ));
        }
        if self.data.extraction_subdir == self.data.collation_subdir {
            return Err(ConfigError::Invalid(
                "data.extraction_subdir and data.collation_subdir must differ".to_string(),
            ));
        }
        if self.image.max_edge == 0 {
            return Err(ConfigError::Invalid("image.max_edge must be positive".to_string()));
        }
        if self.services.anthropic.max_tokens == 0 {
            return Err(ConfigError::Invalid(
                "services.anthropic.max_tokens must be positive".to_string(),
            ));
        }
        if !(self.review.total_tolerance >= 0.0
            && self.review.major_discrepancy >= self.review.total_tolerance)
        {
            return Err(ConfigError::Invalid(
                "review.major_discrepancy must be at least review.total_tolerance (both non-negative)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// API key from the config value, else the first line of the key file
    pub fn anthropic_key(&self) -> Result<String, ConfigError> {
        let anthropic = &self.services.anthropic;

        if let Some(key) = anthropic.key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }

        let path = anthropic.key_file.as_ref().ok_or(ConfigError::MissingKey)?;
        let content = fs::read_to_string(path).map_err(|source| ConfigError::KeyFile {
            path: path.clone(),
            source,
        })?;

        content
            .lines()
            .next()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .ok_or(ConfigError::MissingKey)
    }

    /// Effective user: explicit choice first, then the configured name
    pub fn resolve_user(&self, explicit: Option<&str>) -> Result<String, ConfigError> {
        let chosen = explicit
            .map(str::to_string)
            .or_else(|| self.data.username.clone())
            .filter(|u| !u.trim().is_empty());

        match chosen {
            Some(user) => Ok(user.trim().to_string()),
            None if self.data.use_user => Err(ConfigError::MissingUser),
            None => Ok("default".to_string()),
        }
    }

    pub fn intake_options(&self) -> IntakeOptions {
        IntakeOptions {
            max_edge: self.image.max_edge,
        }
    }

    pub fn extraction_options(&self) -> ExtractionOptions {
        ExtractionOptions {
            model: self.services.anthropic.model.clone(),
            max_tokens: self.services.anthropic.max_tokens,
        }
    }

    pub fn reconciliation_engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::with_thresholds(self.review.total_tolerance, self.review.major_discrepancy)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_file() {
        let settings = Settings::from_toml("").unwrap();

        assert_eq!(settings.data.root_dir, PathBuf::from("data"));
        assert_eq!(settings.image.max_edge, DEFAULT_MAX_EDGE);
        assert_eq!(settings.review.total_tolerance, 0.01);
        assert_eq!(settings.review.major_discrepancy, 1.0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let settings = Settings::from_toml(
            r#"
            [data]
            root_dir = "/srv/receipts"
            use_user = false

            [logging]
            level = "debug"
            directory = "logs"

            [services.anthropic]
            model = "claude-3-5-sonnet-20240620"
            max_tokens = 2048

            [review]
            total_tolerance = 0.05
            "#,
        )
        .unwrap();

        assert_eq!(settings.data.extraction_dir("bob"), PathBuf::from("/srv/receipts/extraction"));
        assert_eq!(settings.data.extraction_subdir, "extraction");
        assert_eq!(settings.logging.directory, Some(PathBuf::from("logs")));
        assert_eq!(settings.extraction_options().max_tokens, 2048);
        assert_eq!(settings.reconciliation_engine().tolerance, 0.05);
        assert_eq!(settings.reconciliation_engine().major_discrepancy_threshold, 1.0);
    }

    #[test]
    fn test_example_config_parses() {
        let settings = Settings::from_toml(include_str!("../app-config.example.toml")).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.services.anthropic.key_file, Some(PathBuf::from("anthropic-key.txt")));
    }

    #[test]
    fn test_user_scoped_dirs() {
        let data = DataSettings::default();
        assert_eq!(data.extraction_dir("alice"), PathBuf::from("data/alice/extraction"));
        assert_eq!(data.collation_dir("alice"), PathBuf::from("data/alice/collation"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("RECEIPTS_DATA_DIR", "/tmp/receipts"),
            ("RECEIPTS_USER", "carol"),
            ("RECEIPTS_LOG", ""),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(settings.anthropic_key().unwrap(), "sk-test");
        assert_eq!(settings.data.root_dir, PathBuf::from("/tmp/receipts"));
        assert_eq!(settings.resolve_user(None).unwrap(), "carol");
        assert_eq!(settings.resolve_user(Some("dave")).unwrap(), "dave");
        // Blank overrides are ignored
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_key_from_file_first_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sk-from-file").unwrap();
        writeln!(file, "ignored second line").unwrap();

        let mut settings = Settings::default();
        assert!(matches!(settings.anthropic_key(), Err(ConfigError::MissingKey)));

        settings.services.anthropic.key_file = Some(file.path().to_path_buf());
        assert_eq!(settings.anthropic_key().unwrap(), "sk-from-file");

        settings.services.anthropic.key_file = Some(PathBuf::from("/nonexistent/key"));
        assert!(matches!(settings.anthropic_key(), Err(ConfigError::KeyFile { .. })));
    }

    #[test]
    fn test_missing_user() {
        let settings = Settings::default();
        assert!(matches!(settings.resolve_user(None), Err(ConfigError::MissingUser)));

        let mut shared = Settings::default();
        shared.data.use_user = false;
        assert_eq!(shared.resolve_user(None).unwrap(), "default");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.review.major_discrepancy = 0.001;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = Settings::default();
        settings.data.collation_subdir = "extraction".to_string();
        assert!(settings.validate().is_err());

        assert!(matches!(
            Settings::from_file(Path::new("/nonexistent/app-config.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
