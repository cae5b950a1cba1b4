use crate::error::{Error, Result};
use reqwest::Method;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Headers the executor computes itself and callers may not override.
fn is_reserved(name: &HeaderName) -> bool {
    *name == CONTENT_TYPE || *name == CONTENT_LENGTH
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_file_field_name() -> String {
    "file".to_string()
}

fn default_show_notification() -> bool {
    true
}

/// Immutable description of a single multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub upload_id: String,
    pub file_path: PathBuf,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default = "default_file_field_name")]
    pub file_field_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_description: Option<String>,
    #[serde(default = "default_show_notification")]
    pub show_notification: bool,
}

impl UploadRequest {
    pub fn new(
        upload_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            file_path: file_path.into(),
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            fields: BTreeMap::new(),
            file_field_name: default_file_field_name(),
            notification_title: None,
            notification_description: None,
            show_notification: default_show_notification(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_file_field_name(mut self, name: impl Into<String>) -> Self {
        self.file_field_name = name.into();
        self
    }

    #[must_use]
    pub fn with_notification(mut self, title: Option<String>, description: Option<String>) -> Self {
        self.notification_title = title;
        self.notification_description = description;
        self.show_notification = true;
        self
    }

    #[must_use]
    pub fn with_show_notification(mut self, show: bool) -> Self {
        self.show_notification = show;
        self
    }

    /// Parses the untyped map a host hands across its method channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if required keys are missing or have the wrong type.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidArgument(format!("Failed to parse upload request: {e}")))
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Base name of the file, used as the multipart filename.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the path has no UTF-8 file name component.
    pub fn file_name(&self) -> Result<&str> {
        file_name_of(&self.file_path)
    }

    /// Checks everything about the request that does not touch the filesystem.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty id, path, method or file field name,
    ///   an unparseable URL or an invalid method token
    /// - `InvalidHeader` for reserved or malformed headers
    pub fn validate(&self) -> Result<()> {
        if self.upload_id.trim().is_empty() {
            return Err(Error::InvalidArgument("uploadId is required".to_string()));
        }
        if self.file_path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("filePath is required".to_string()));
        }
        if self.file_field_name.is_empty() {
            return Err(Error::InvalidArgument(
                "fileFieldName cannot be empty".to_string(),
            ));
        }
        self.file_name()?;
        self.parsed_url()?;
        self.http_method()?;
        self.header_map()?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` unless the URL is an absolute http(s) URL.
    pub fn parsed_url(&self) -> Result<Url> {
        if self.url.is_empty() {
            return Err(Error::InvalidArgument("url is required".to_string()));
        }
        let url = Url::parse(&self.url)
            .map_err(|e| Error::InvalidArgument(format!("Invalid url '{}': {e}", self.url)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(Error::InvalidArgument(format!(
                "Unsupported url scheme '{scheme}'. Valid schemes are: http, https"
            ))),
        }
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` if the method is empty or not a valid HTTP token.
    pub fn http_method(&self) -> Result<Method> {
        if self.method.is_empty() {
            return Err(Error::InvalidArgument("method cannot be empty".to_string()));
        }
        Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidArgument(format!("Invalid HTTP method: '{}'", self.method)))
    }

    /// Caller headers as a typed map. Names are case-insensitive, so two keys
    /// differing only by case are rejected rather than silently merged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeader` for reserved, duplicate or malformed headers.
    pub fn header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidHeader(format!("Invalid header name: '{name}'")))?;
            if is_reserved(&header_name) {
                return Err(Error::InvalidHeader(format!(
                    "'{name}' is computed by the uploader and cannot be overridden"
                )));
            }
            if map.contains_key(&header_name) {
                return Err(Error::InvalidHeader(format!("Duplicate header: '{name}'")));
            }
            let header_value = HeaderValue::from_str(value).map_err(|_| {
                Error::InvalidHeader(format!("Invalid value for header '{name}'"))
            })?;
            map.insert(header_name, header_value);
        }
        Ok(map)
    }
}

pub(crate) fn file_name_of(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidArgument(format!("Invalid filename: {}", path.display())))
}
