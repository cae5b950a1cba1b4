use crate::config::{ManagerConfig, RetryPolicy};
use crate::error::Result;
use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration loaded from JSON file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_field_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_uploads: Option<usize>,
}

impl FileConfig {
    /// Load config from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        debug!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config: FileConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Load config with fallback priority:
    /// 1. Explicit path (if provided)
    /// 2. Project directory (./bgupload.json or ./.bgupload/config.json)
    /// 3. User config directory (~/.config/bgupload/config.json)
    ///
    /// # Errors
    ///
    /// Returns an error only if an explicit path is provided but cannot be read
    pub fn load_with_fallback(explicit_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load_from_path(path);
        }

        let project_paths = [
            PathBuf::from("./bgupload.json"),
            PathBuf::from("./.bgupload/config.json"),
        ];

        for path in &project_paths {
            if path.exists() {
                match Self::load_from_path(path) {
                    Ok(config) => {
                        debug!("Loaded config from project directory: {}", path.display());
                        return Ok(config);
                    }
                    Err(e) => {
                        debug!("Failed to load config from {}: {}", path.display(), e);
                    }
                }
            }
        }

        if let Some(proj_dirs) = ProjectDirs::from("", "", "bgupload") {
            let user_config_path = proj_dirs.config_dir().join("config.json");
            if user_config_path.exists() {
                match Self::load_from_path(&user_config_path) {
                    Ok(config) => {
                        debug!(
                            "Loaded config from user directory: {}",
                            user_config_path.display()
                        );
                        return Ok(config);
                    }
                    Err(e) => {
                        debug!(
                            "Failed to load config from {}: {}",
                            user_config_path.display(),
                            e
                        );
                    }
                }
            }
        }

        debug!("No config file found, using defaults");
        Ok(FileConfig::default())
    }

    /// Merge with another config, preferring values from self
    #[must_use]
    pub fn merge_with(&self, other: &FileConfig) -> Self {
        let mut headers = other.headers.clone();
        headers.extend(self.headers.clone());

        FileConfig {
            url: self.url.clone().or_else(|| other.url.clone()),
            method: self.method.clone().or_else(|| other.method.clone()),
            headers,
            file_field_name: self
                .file_field_name
                .clone()
                .or_else(|| other.file_field_name.clone()),
            connect_timeout_secs: self.connect_timeout_secs.or(other.connect_timeout_secs),
            read_timeout_secs: self.read_timeout_secs.or(other.read_timeout_secs),
            write_timeout_secs: self.write_timeout_secs.or(other.write_timeout_secs),
            max_retries: self.max_retries.or(other.max_retries),
            retry_backoff_ms: self.retry_backoff_ms.or(other.retry_backoff_ms),
            max_concurrent_uploads: self.max_concurrent_uploads.or(other.max_concurrent_uploads),
        }
    }

    /// Overlays the values set in this file onto `config`.
    #[must_use]
    pub fn apply_to(&self, mut config: ManagerConfig) -> ManagerConfig {
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.read_timeout_secs {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.write_timeout_secs {
            config.write_timeout = Duration::from_secs(secs);
        }
        if self.max_retries.is_some() || self.retry_backoff_ms.is_some() {
            config.retry = RetryPolicy {
                max_retries: self.max_retries.unwrap_or(config.retry.max_retries),
                backoff: self
                    .retry_backoff_ms
                    .map_or(config.retry.backoff, Duration::from_millis),
            };
        }
        if let Some(limit) = self.max_concurrent_uploads {
            config.max_concurrent_uploads = Some(limit);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_merge_with() {
        let config1 = FileConfig {
            url: Some("http://one".to_string()),
            max_retries: None,
            headers: BTreeMap::from([("X-Env".to_string(), "dev".to_string())]),
            ..FileConfig::default()
        };

        let config2 = FileConfig {
            url: Some("http://two".to_string()),
            max_retries: Some(3),
            headers: BTreeMap::from([
                ("X-Env".to_string(), "prod".to_string()),
                ("X-Team".to_string(), "media".to_string()),
            ]),
            ..FileConfig::default()
        };

        let merged = config1.merge_with(&config2);

        assert_eq!(merged.url, Some("http://one".to_string()));
        assert_eq!(merged.max_retries, Some(3));
        assert_eq!(merged.headers.get("X-Env").map(String::as_str), Some("dev"));
        assert_eq!(merged.headers.get("X-Team").map(String::as_str), Some("media"));
    }

    #[test]
    fn test_load_from_path_uses_camel_case_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"url": "https://uploads.example.com", "fileFieldName": "media", "maxRetries": 2, "retryBackoffMs": 100}}"#
        )
        .unwrap();

        let config = FileConfig::load_from_path(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.url.as_deref(), Some("https://uploads.example.com"));
        assert_eq!(config.file_field_name.as_deref(), Some("media"));

        let manager_config = config.apply_to(ManagerConfig::default());
        assert_eq!(manager_config.retry.max_retries, 2);
        assert_eq!(manager_config.retry.backoff, Duration::from_millis(100));
        assert_eq!(manager_config.read_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let missing = PathBuf::from("/definitely/not/a/config.json");
        assert!(FileConfig::load_with_fallback(Some(&missing)).is_err());
    }
}
