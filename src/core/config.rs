//! Configuration management

use clap::Args;
use config::{Config as ConfigBuilder, ConfigError as BuilderError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid translator configuration: {0}")]
    InvalidTranslators(String),

    #[error("Invalid I/O configuration: {0}")]
    InvalidIo(String),

    #[error("Invalid reporting configuration: {0}")]
    InvalidReporting(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl From<ConfigError> for crate::core::error::TranslateError {
    fn from(err: ConfigError) -> Self {
        crate::core::error::TranslateError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub translators: TranslatorsConfig,
    pub io: IoConfig,
    pub prefs: PrefsConfig,
    pub reporting: ReportingConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(args: &GlobalArgs) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults(ConfigBuilder::builder())?;

        if let Some(config_path) = &args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Environment variables use the BIBLIO_ prefix and __ for nesting,
        // e.g. BIBLIO_PREFS__SAVE_ATTACHMENTS=false
        builder = builder.add_source(
            Environment::with_prefix("BIBLIO")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(dir) = &args.translators_dir {
            builder = builder.set_override("translators.dir", dir.display().to_string())?;
        }
        if let Some(level) = &args.log_level {
            builder = builder.set_override("logging.level", level.clone())?;
        }

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: EngineConfig = Self::defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults only
    pub fn default_config() -> Result<Self, ConfigError> {
        let config: EngineConfig = Self::defaults(ConfigBuilder::builder())?
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(builder
            .set_default("io.default_import_charset", "UTF-8")?
            .set_default("io.export_charset", "UTF-8")?
            .set_default("io.write_bom", false)?
            .set_default("prefs.save_attachments", true)?
            .set_default("prefs.automatic_snapshots", true)?
            .set_default("prefs.download_associated_files", true)?
            .set_default("prefs.report_translation_failure", false)?
            .set_default("reporting.endpoint", "")?
            .set_default("reporting.timeout_secs", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            .set_default("logging.output", "stderr")?)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.translators.validate()?;
        self.io.validate()?;
        self.reporting.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Command-line arguments shared by every subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Directory containing translator files
    #[arg(long, value_name = "DIR", global = true)]
    pub translators_dir: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranslatorsConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl TranslatorsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(dir) = &self.dir {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::InvalidTranslators("dir cannot be empty".to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IoConfig {
    pub default_import_charset: String,
    pub export_charset: String,
    pub write_bom: bool,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            default_import_charset: "UTF-8".to_string(),
            export_charset: "UTF-8".to_string(),
            write_bom: false,
        }
    }
}

impl IoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, label) in [
            ("default_import_charset", &self.default_import_charset),
            ("export_charset", &self.export_charset),
        ] {
            if crate::io::charset::Charset::for_label(label).is_none() {
                return Err(ConfigError::InvalidIo(format!("{} is not a known charset: {}", key, label)));
            }
        }
        Ok(())
    }
}

/// User preferences that shape attachment handling and failure reporting
#[derive(Debug, Clone, Deserialize)]
pub struct PrefsConfig {
    pub save_attachments: bool,
    pub automatic_snapshots: bool,
    pub download_associated_files: bool,
    pub report_translation_failure: bool,
}

impl Default for PrefsConfig {
    fn default() -> Self {
        Self {
            save_attachments: true,
            automatic_snapshots: true,
            download_associated_files: true,
            report_translation_failure: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl ReportingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.endpoint.is_empty() && url::Url::parse(&self.endpoint).is_err() {
            return Err(ConfigError::InvalidReporting(format!("endpoint is not a valid URL: {}", self.endpoint)));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidReporting("timeout_secs must be greater than 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(format!("level must be one of: {:?}", valid_levels)));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!("format must be one of: {:?}", valid_formats)));
        }

        let valid_outputs = ["stderr", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!("output must be one of: {:?}", valid_outputs)));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default_config().unwrap();
        assert_eq!(config.io.default_import_charset, "UTF-8");
        assert!(config.prefs.save_attachments);
        assert!(!config.prefs.report_translation_failure);
        assert!(config.reporting.endpoint.is_empty());
        assert!(config.translators.dir.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[prefs]\nautomatic_snapshots = false\n[io]\nwrite_bom = true").unwrap();
        file.flush().unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert!(!config.prefs.automatic_snapshots);
        assert!(config.io.write_bom);
        assert!(config.prefs.download_associated_files);
    }

    #[test]
    fn test_invalid_logging() {
        let logging = LoggingConfig {
            level: "loud".to_string(),
            format: "text".to_string(),
            output: "stderr".to_string(),
            log_file: None,
        };
        assert!(logging.validate().is_err());

        let logging = LoggingConfig {
            level: "info".to_string(),
            format: "text".to_string(),
            output: "file".to_string(),
            log_file: None,
        };
        assert!(logging.validate().is_err());
    }

    #[test]
    fn test_invalid_charset() {
        let io = IoConfig {
            default_import_charset: "klingon-8".to_string(),
            export_charset: "UTF-8".to_string(),
            write_bom: false,
        };
        assert!(io.validate().is_err());
    }
}
