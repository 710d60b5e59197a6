use facegate_core::credential::DEFAULT_CREDENTIAL_TTL_SECS;
use facegate_core::enrollment::{DEFAULT_EXTRACT_TIMEOUT, DEFAULT_UNKNOWN_LIST_LIMIT};
use facegate_core::extractor::{
    DEFAULT_DESCRIPTOR_DIM, DEFAULT_MAX_IMAGE_BYTES, DEFAULT_MAX_IMAGE_SIDE,
};
use facegate_core::matcher::DEFAULT_MATCH_THRESHOLD;
use facegate_core::{EnrollmentSettings, ImageLimits};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/facegate/config.toml";
pub const DEFAULT_AVATAR_BASE_URL: &str = "https://ui-avatars.com/api/";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// On-disk configuration. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub db_path: Option<PathBuf>,
    pub bus: Option<BusKind>,
    pub extractor_command: Option<Vec<String>>,
    pub extract_timeout_secs: Option<u64>,
    pub descriptor_dim: Option<usize>,
    pub match_threshold: Option<f32>,
    pub duplicate_threshold: Option<f32>,
    pub credential_key: Option<String>,
    pub credential_ttl_secs: Option<i64>,
    pub avatar_base_url: Option<String>,
    pub unknown_list_limit: Option<usize>,
    pub max_image_bytes: Option<usize>,
    pub max_image_side: Option<u32>,
}

impl ConfigFile {
    /// Read a TOML config file. A missing file yields the empty config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Daemon configuration: config file, then `FACEGATE_*` environment overrides, then defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite identity database.
    pub db_path: PathBuf,
    pub bus: BusKind,
    /// Extractor program and arguments; the image is written to its stdin.
    pub extractor_command: Vec<String>,
    pub extract_timeout: Duration,
    pub descriptor_dim: usize,
    /// Euclidean distance threshold for a positive match.
    pub match_threshold: f32,
    /// Threshold for refusing a registration as an existing face.
    pub duplicate_threshold: f32,
    /// Hex-encoded 32-byte HMAC key. Random per process when unset.
    pub credential_key: Option<String>,
    pub credential_ttl: chrono::Duration,
    pub avatar_base_url: Option<String>,
    pub unknown_list_limit: usize,
    pub image_limits: ImageLimits,
}

impl Config {
    /// Load from `FACEGATE_CONFIG` (or the default path) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("FACEGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let file = ConfigFile::load(&path)?;
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge a config file with an environment lookup and validate the result.
    pub fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let db_path = env("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("identities.db"));

        let bus = match env("FACEGATE_BUS").as_deref() {
            Some("session") => BusKind::Session,
            Some("system") => BusKind::System,
            _ => file.bus.unwrap_or(BusKind::System),
        };

        let extractor_command = env("FACEGATE_EXTRACTOR_COMMAND")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .or(file.extractor_command)
            .unwrap_or_default();

        let match_threshold = parse_env(&env, "FACEGATE_MATCH_THRESHOLD")
            .or(file.match_threshold)
            .unwrap_or(DEFAULT_MATCH_THRESHOLD);
        check_threshold("match_threshold", match_threshold)?;
        let duplicate_threshold = parse_env(&env, "FACEGATE_DUPLICATE_THRESHOLD")
            .or(file.duplicate_threshold)
            .unwrap_or(match_threshold);
        check_threshold("duplicate_threshold", duplicate_threshold)?;

        let ttl_secs: i64 = parse_env(&env, "FACEGATE_CREDENTIAL_TTL_SECS")
            .or(file.credential_ttl_secs)
            .unwrap_or(DEFAULT_CREDENTIAL_TTL_SECS);
        let credential_ttl = chrono::Duration::try_seconds(ttl_secs)
            .filter(|ttl| *ttl > chrono::Duration::zero())
            .ok_or_else(|| ConfigError::Invalid {
                key: "credential_ttl_secs",
                reason: format!("{ttl_secs} is not a positive number of seconds"),
            })?;

        let image_limits = ImageLimits {
            max_bytes: parse_env(&env, "FACEGATE_MAX_IMAGE_BYTES")
                .or(file.max_image_bytes)
                .unwrap_or(DEFAULT_MAX_IMAGE_BYTES),
            max_side: parse_env(&env, "FACEGATE_MAX_IMAGE_SIDE")
                .or(file.max_image_side)
                .unwrap_or(DEFAULT_MAX_IMAGE_SIDE),
        };
        if image_limits.max_bytes == 0 || image_limits.max_side == 0 {
            return Err(ConfigError::Invalid {
                key: "max_image_bytes/max_image_side",
                reason: "image limits must be non-zero".into(),
            });
        }

        Ok(Self {
            db_path,
            bus,
            extractor_command,
            extract_timeout: parse_env(&env, "FACEGATE_EXTRACT_TIMEOUT_SECS")
                .or(file.extract_timeout_secs)
                .map(|secs: u64| Duration::from_secs(secs.max(1)))
                .unwrap_or(DEFAULT_EXTRACT_TIMEOUT),
            descriptor_dim: parse_env(&env, "FACEGATE_DESCRIPTOR_DIM")
                .or(file.descriptor_dim)
                .unwrap_or(DEFAULT_DESCRIPTOR_DIM),
            match_threshold,
            duplicate_threshold,
            credential_key: env("FACEGATE_CREDENTIAL_KEY").or(file.credential_key),
            credential_ttl,
            avatar_base_url: env("FACEGATE_AVATAR_BASE_URL")
                .or(file.avatar_base_url)
                .or_else(|| Some(DEFAULT_AVATAR_BASE_URL.to_string()))
                .filter(|url| !url.is_empty()),
            unknown_list_limit: parse_env(&env, "FACEGATE_UNKNOWN_LIST_LIMIT")
                .or(file.unknown_list_limit)
                .unwrap_or(DEFAULT_UNKNOWN_LIST_LIMIT),
            image_limits,
        })
    }

    pub fn enrollment_settings(&self) -> EnrollmentSettings {
        EnrollmentSettings {
            match_threshold: self.match_threshold,
            duplicate_threshold: self.duplicate_threshold,
            descriptor_dim: self.descriptor_dim,
            extract_timeout: self.extract_timeout,
            image_limits: self.image_limits,
            avatar_base_url: self.avatar_base_url.clone(),
            unknown_list_limit: self.unknown_list_limit,
        }
    }
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn check_threshold(key: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            reason: format!("{value} is not a finite, non-negative distance"),
        })
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(ConfigFile::default(), env_from(&[("HOME", "/home/ann")])).unwrap();
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/ann/.local/share/facegate/identities.db")
        );
        assert_eq!(config.bus, BusKind::System);
        assert!(config.extractor_command.is_empty());
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.duplicate_threshold, 0.5);
        assert_eq!(config.extract_timeout, Duration::from_secs(10));
        assert_eq!(config.credential_ttl, chrono::Duration::days(7));
        assert_eq!(config.image_limits.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.unknown_list_limit, 50);
        assert_eq!(config.avatar_base_url.as_deref(), Some(DEFAULT_AVATAR_BASE_URL));
    }

    #[test]
    fn test_file_values_apply() {
        let file: ConfigFile = toml::from_str(
            r#"
            db_path = "/var/lib/facegate/ids.db"
            bus = "session"
            extractor_command = ["/usr/libexec/facegate-extract", "--model", "/opt/models"]
            match_threshold = 0.45
            extract_timeout_secs = 3
            "#,
        )
        .unwrap();
        let config = Config::resolve(file, env_from(&[])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facegate/ids.db"));
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.extractor_command.len(), 3);
        assert_eq!(config.match_threshold, 0.45);
        // Duplicate threshold follows the match threshold unless set.
        assert_eq!(config.duplicate_threshold, 0.45);
        assert_eq!(config.extract_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = ConfigFile {
            match_threshold: Some(0.45),
            extractor_command: Some(vec!["a".into()]),
            ..ConfigFile::default()
        };
        let config = Config::resolve(
            file,
            env_from(&[
                ("FACEGATE_MATCH_THRESHOLD", "0.6"),
                ("FACEGATE_DUPLICATE_THRESHOLD", "0.3"),
                ("FACEGATE_EXTRACTOR_COMMAND", "python3 extract.py"),
                ("FACEGATE_AVATAR_BASE_URL", ""),
                ("FACEGATE_MAX_IMAGE_BYTES", "1048576"),
            ]),
        )
        .unwrap();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.duplicate_threshold, 0.3);
        assert_eq!(config.extractor_command, vec!["python3", "extract.py"]);
        assert!(config.avatar_base_url.is_none());
        assert_eq!(config.enrollment_settings().image_limits.max_bytes, 1 << 20);
    }

    #[test]
    fn test_unparseable_env_falls_back() {
        let config = Config::resolve(
            ConfigFile::default(),
            env_from(&[("FACEGATE_MATCH_THRESHOLD", "lots")]),
        )
        .unwrap();
        assert_eq!(config.match_threshold, 0.5);
    }

    #[test]
    fn test_bad_thresholds_rejected() {
        for (key, value) in [
            ("FACEGATE_MATCH_THRESHOLD", "NaN"),
            ("FACEGATE_MATCH_THRESHOLD", "-0.1"),
            ("FACEGATE_DUPLICATE_THRESHOLD", "inf"),
        ] {
            let result = Config::resolve(ConfigFile::default(), env_from(&[(key, value)]));
            assert!(
                matches!(result, Err(ConfigError::Invalid { .. })),
                "{key}={value} accepted"
            );
        }
    }

    #[test]
    fn test_credential_ttl_must_be_positive_and_in_range() {
        for value in ["0", "-60", "9223372036854775807"] {
            let result = Config::resolve(
                ConfigFile::default(),
                env_from(&[("FACEGATE_CREDENTIAL_TTL_SECS", value)]),
            );
            assert!(
                matches!(result, Err(ConfigError::Invalid { key: "credential_ttl_secs", .. })),
                "ttl {value} accepted"
            );
        }
        let config = Config::resolve(
            ConfigFile::default(),
            env_from(&[("FACEGATE_CREDENTIAL_TTL_SECS", "3600")]),
        )
        .unwrap();
        assert_eq!(config.credential_ttl, chrono::Duration::hours(1));
    }

    #[test]
    fn test_image_limits_from_file() {
        let file: ConfigFile = toml::from_str("max_image_bytes = 2048\nmax_image_side = 640").unwrap();
        let config = Config::resolve(file, env_from(&[])).unwrap();
        assert_eq!(
            config.image_limits,
            ImageLimits {
                max_bytes: 2048,
                max_side: 640
            }
        );
        let zero: ConfigFile = toml::from_str("max_image_side = 0").unwrap();
        assert!(Config::resolve(zero, env_from(&[])).is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<ConfigFile>("similarity = 0.4").is_err());
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let file = ConfigFile::load(Path::new("/nonexistent/facegate.toml")).unwrap();
        assert!(file.db_path.is_none());
    }
}
