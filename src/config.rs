//! Leak-checking configuration
//!
//! Resolves the two repetition counts (`stab` warm-up runs, `run` tracked
//! runs) plus the optional reflog path and classifier policy.
//!
//! # Sources (lowest to highest precedence)
//!
//! 1. Built-in defaults (`stab = 5`, `run = 4`)
//! 2. TOML file (`leakhunt.toml` in the working directory, or `--config`)
//! 3. Environment (`LEAKHUNT_STAB`, `LEAKHUNT_RUN`, `LEAKHUNT_REFLOG`,
//!    `LEAKHUNT_POLICY__JITTER`, ...)
//! 4. The compact `-R stab:run[:reflog]` token
//!
//! ```toml
//! stab = 2
//! run = 3
//! reflog = "reflog.txt"
//!
//! [policy]
//! zero_numerator = 1
//! zero_denominator = 3
//! jitter = 1
//! ```

use crate::classify::ClassifierPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Default number of warm-up repetitions
pub const DEFAULT_STAB: usize = 5;

/// Default number of tracked repetitions
pub const DEFAULT_RUN: usize = 4;

/// Config file looked up in the working directory when none is given
pub const CONFIG_FILE_NAME: &str = "leakhunt.toml";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "LEAKHUNT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to load layered config: {0}")]
    LayerError(#[from] ::config::ConfigError),

    #[error("Invalid leaks token '{token}': {reason}")]
    InvalidToken { token: String, reason: String },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Missing capability: {0}")]
    MissingCapability(String),
}

/// Resolved leak-checking configuration for one test-run invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakConfig {
    /// Warm-up repetitions whose deltas are discarded
    #[serde(default = "default_stab")]
    pub stab: usize,

    /// Tracked repetitions whose deltas are classified
    #[serde(default = "default_run")]
    pub run: usize,

    /// File that leak messages are appended to
    #[serde(default)]
    pub reflog: Option<PathBuf>,

    /// Classifier thresholds
    #[serde(default)]
    pub policy: ClassifierPolicy,
}

fn default_stab() -> usize {
    DEFAULT_STAB
}

fn default_run() -> usize {
    DEFAULT_RUN
}

impl Default for LeakConfig {
    fn default() -> Self {
        Self {
            stab: DEFAULT_STAB,
            run: DEFAULT_RUN,
            reflog: None,
            policy: ClassifierPolicy::default(),
        }
    }
}

impl LeakConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: LeakConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Layer defaults, the config file and `LEAKHUNT_*` environment variables.
    ///
    /// An explicit `path` must exist; the implicit `leakhunt.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => ::config::File::from(path)
                .format(::config::FileFormat::Toml)
                .required(true),
            None => ::config::File::new(CONFIG_FILE_NAME, ::config::FileFormat::Toml).required(false),
        };

        let layered = ::config::Config::builder()
            .set_default("stab", DEFAULT_STAB as i64)?
            .set_default("run", DEFAULT_RUN as i64)?
            .add_source(file)
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: LeakConfig = layered.try_deserialize()?;
        config.validate()?;
        debug!(stab = config.stab, run = config.run, "Loaded leak configuration");
        Ok(config)
    }

    /// Apply a `stab:run[:reflog]` token on top of this configuration.
    ///
    /// On error `self` is left untouched.
    pub fn apply_token(&mut self, token: &str) -> Result<(), ConfigError> {
        let parsed = LeaksToken::parse(token)?;
        let mut updated = self.clone();
        if let Some(stab) = parsed.stab {
            updated.stab = stab;
        }
        if let Some(run) = parsed.run {
            updated.run = run;
        }
        if let Some(reflog) = parsed.reflog {
            updated.reflog = Some(reflog);
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_run(self.run)?;
        self.policy.validate()
    }

    /// Total repetitions per hunt
    pub fn repetitions(&self) -> usize {
        self.stab + self.run
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}

/// Check a tracked-repetition count, from the configuration or a per-test override.
///
/// Any warm-up count is valid, including zero.
pub fn validate_run(run: usize) -> Result<(), ConfigError> {
    if run == 0 {
        return Err(ConfigError::ValidationError(
            "run must be at least 1 tracked repetition".to_string(),
        ));
    }
    Ok(())
}

/// Parsed `-R` token; `None` fields keep the layered value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaksToken {
    pub stab: Option<usize>,
    pub run: Option<usize>,
    pub reflog: Option<PathBuf>,
}

impl LeaksToken {
    /// Parse `stab:run[:reflog]`, where every field may be empty (`":"`).
    pub fn parse(token: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidToken {
            token: token.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = token.split(':').collect();
        if parts.len() < 2 {
            return Err(invalid("expected the form stab:run[:reflog]"));
        }
        if parts.len() > 3 {
            return Err(invalid("too many ':'-separated fields"));
        }

        let count = |field: &str, name: &str| -> Result<Option<usize>, ConfigError> {
            let field = field.trim();
            if field.is_empty() {
                return Ok(None);
            }
            field
                .parse::<usize>()
                .map(Some)
                .map_err(|_| invalid(&format!("{} is not a non-negative integer", name)))
        };

        let stab = count(parts[0], "stab")?;
        let run = count(parts[1], "run")?;
        let reflog = parts
            .get(2)
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(PathBuf::from);

        Ok(Self { stab, run, reflog })
    }
}

impl std::str::FromStr for LeaksToken {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LeakConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stab, 5);
        assert_eq!(config.run, 4);
        assert_eq!(config.repetitions(), 9);
    }

    #[test]
    fn test_token_both_defaults() {
        let token = LeaksToken::parse(":").unwrap();
        assert_eq!(token, LeaksToken::default());
    }

    #[test]
    fn test_token_partial() {
        let token = LeaksToken::parse("2:").unwrap();
        assert_eq!(token.stab, Some(2));
        assert_eq!(token.run, None);

        let token = LeaksToken::parse(":7").unwrap();
        assert_eq!(token.stab, None);
        assert_eq!(token.run, Some(7));
    }

    #[test]
    fn test_token_with_reflog() {
        let token = LeaksToken::parse("1:2:reflog.txt").unwrap();
        assert_eq!(token.stab, Some(1));
        assert_eq!(token.run, Some(2));
        assert_eq!(token.reflog, Some(PathBuf::from("reflog.txt")));
    }

    #[test]
    fn test_token_malformed() {
        for bad in ["", "5", "a:1", "1:b", "-1:2", "1:2:3:4"] {
            let result = LeaksToken::parse(bad);
            assert!(
                matches!(result, Err(ConfigError::InvalidToken { .. })),
                "token {:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_apply_token_keeps_unset_fields() {
        let mut config = LeakConfig {
            stab: 2,
            run: 1,
            ..Default::default()
        };
        config.apply_token(":3").unwrap();
        assert_eq!(config.stab, 2);
        assert_eq!(config.run, 3);
    }

    #[test]
    fn test_apply_token_zero_run_rejected() {
        let mut config = LeakConfig::default();
        let result = config.apply_token("0:0");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("run must be at least 1"));
    }

    #[test]
    fn test_rejected_token_leaves_config_unchanged() {
        let mut config = LeakConfig {
            stab: 3,
            run: 2,
            ..Default::default()
        };
        assert!(config.apply_token("2:0:leaks.log").is_err());
        assert_eq!(config.stab, 3);
        assert_eq!(config.run, 2);
        assert_eq!(config.reflog, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_stab_allowed() {
        let mut config = LeakConfig::default();
        config.apply_token("0:1").unwrap();
        assert_eq!(config.repetitions(), 1);
    }

    #[test]
    fn test_from_toml() {
        let toml_str = r#"
            stab = 2
            run = 1
            reflog = "leaks.log"

            [policy]
            zero_numerator = 1
            zero_denominator = 2
            jitter = 3
        "#;

        let config = LeakConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.stab, 2);
        assert_eq!(config.run, 1);
        assert_eq!(config.reflog, Some(PathBuf::from("leaks.log")));
        assert_eq!(config.policy.zero_denominator, 2);
        assert_eq!(config.policy.jitter, 3);
    }

    #[test]
    fn test_from_toml_missing_fields_use_defaults() {
        let config = LeakConfig::from_toml("stab = 1").unwrap();
        assert_eq!(config.stab, 1);
        assert_eq!(config.run, DEFAULT_RUN);
        assert_eq!(config.policy, ClassifierPolicy::default());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = LeakConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: LeakConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, deserialized);
    }
}
