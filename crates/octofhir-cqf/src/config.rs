//! CQF service configuration

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Configuration for measure evaluation, retrieval and bulk export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CqfConfig {
    /// Maximum resources per retrieve (prevent memory exhaustion)
    #[serde(default = "default_max_retrieve_size")]
    pub max_retrieve_size: usize,

    /// Replace explicit code lists with the value set expansion on retrieve
    #[serde(default = "default_expand_value_sets")]
    pub expand_value_sets: bool,

    /// What to do when one subject's expression fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Value set expansions kept per evaluation run
    #[serde(default = "default_terminology_cache_capacity")]
    pub terminology_cache_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub bulk_export: BulkExportConfig,
}

impl Default for CqfConfig {
    fn default() -> Self {
        Self {
            max_retrieve_size: default_max_retrieve_size(),
            expand_value_sets: default_expand_value_sets(),
            failure_policy: FailurePolicy::default(),
            terminology_cache_capacity: default_terminology_cache_capacity(),
            logging: LoggingConfig::default(),
            bulk_export: BulkExportConfig::default(),
        }
    }
}

impl CqfConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retrieve_size == 0 {
            return Err("max_retrieve_size must be greater than zero".into());
        }
        if self.max_retrieve_size > u32::MAX as usize {
            return Err("max_retrieve_size does not fit a search row cap".into());
        }
        if self.terminology_cache_capacity == 0 {
            return Err("terminology_cache_capacity must be greater than zero".into());
        }
        if let Err(e) = EnvFilter::try_new(&self.logging.level) {
            return Err(format!("logging.level '{}' is not a valid filter: {e}", self.logging.level));
        }
        if let Some(types) = &self.bulk_export.default_types
            && types.iter().any(|t| t.trim().is_empty())
        {
            return Err("bulk_export.default_types must not contain empty names".into());
        }
        Ok(())
    }
}

/// Failure policy for per-subject expression faults during measure evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// The first fault aborts the whole evaluation; no partial report.
    #[default]
    Abort,
    /// Faults are recorded on the report and the subject is skipped.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkExportConfig {
    /// Overrides the patient compartment type list used when `_type` is absent
    #[serde(default)]
    pub default_types: Option<Vec<String>>,
}

fn default_max_retrieve_size() -> usize {
    10_000
}

fn default_expand_value_sets() -> bool {
    true
}

fn default_terminology_cache_capacity() -> usize {
    512
}

fn default_log_level() -> String {
    "info".into()
}

pub mod loader {
    use super::CqfConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Loads configuration from an optional TOML file (default `octofhir-cqf.toml`)
    /// with environment overrides, e.g. `OCTOFHIR_CQF__MAX_RETRIEVE_SIZE=500`.
    pub fn load_config(path: Option<&str>) -> Result<CqfConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("octofhir-cqf.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR_CQF")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CqfConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CqfConfig::default();
        assert_eq!(config.max_retrieve_size, 10_000);
        assert!(config.expand_value_sets);
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = CqfConfig {
            terminology_cache_capacity: 0,
            ..CqfConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = CqfConfig::default();
        config.logging.level = "octofhir_cqf=debug,warn".into();
        assert!(config.validate().is_ok());

        config.logging.level = "octofhir_cqf=loud".into();
        let err = config.validate().unwrap_err();
        assert!(err.contains("logging.level"), "{err}");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
max_retrieve_size = 250
failure_policy = "continue"

[logging]
level = "debug"

[bulk_export]
default_types = ["Patient", "Observation"]
"#
        )
        .unwrap();

        let config = loader::load_config(file.path().to_str()).unwrap();
        assert_eq!(config.max_retrieve_size, 250);
        assert_eq!(config.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.bulk_export.default_types,
            Some(vec!["Patient".to_string(), "Observation".to_string()])
        );
        assert!(config.expand_value_sets);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = loader::load_config(Some("/nonexistent/octofhir-cqf.toml")).unwrap();
        assert_eq!(config.terminology_cache_capacity, 512);
    }
}
