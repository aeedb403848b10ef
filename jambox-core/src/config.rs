//! Configuration types and utilities

use crate::error::JamboxError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Static Proxy Startup Configuration
/// These settings are set at startup and do not change during runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStartupConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Port to listen on
    pub listen_port: u16,
    /// Admin API port (health, metrics, event feed)
    pub admin_port: u16,
    /// Directory holding the root CA (`ca.pem`, `ca.key`)
    pub ca_dir: PathBuf,
    /// Buffered events per observer before it starts lagging
    pub event_capacity: usize,
    /// Upper bound on reading a request or response body
    pub body_timeout_secs: u64,
}

impl Default for ProxyStartupConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 9000,
            admin_port: 9001,
            ca_dir: PathBuf::from("./certs"),
            event_capacity: 1000,
            body_timeout_secs: 30,
        }
    }
}

impl ProxyStartupConfig {
    pub fn body_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.body_timeout_secs)
    }
}

/// Rule configuration, as read from the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JamboxConfig {
    #[serde(default)]
    pub block_network_requests: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub trust: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<BTreeMap<String, ForwardValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stub: Option<BTreeMap<String, StubValue>>,
}

impl JamboxConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn stage_list(&self) -> Vec<String> {
        self.cache
            .as_ref()
            .and_then(|c| c.stage.clone())
            .unwrap_or_default()
    }

    pub fn ignore_list(&self) -> Vec<String> {
        self.cache
            .as_ref()
            .and_then(|c| c.ignore.clone())
            .unwrap_or_default()
    }

    /// Normalised forward entries. Fails on the first malformed one.
    pub fn forward_rules(&self) -> Result<Vec<ForwardRule>> {
        self.forward
            .iter()
            .flatten()
            .map(|(original, value)| ForwardRule::new(original, value.clone().into()))
            .collect()
    }

    /// Normalised stub entries. Fails on the first malformed one.
    pub fn stub_rules(&self) -> Result<Vec<StubRule>> {
        self.stub
            .iter()
            .flatten()
            .map(|(path, value)| StubRule::new(path, value.clone().into()))
            .collect()
    }
}

/// `cache` section. Serialized back verbatim for matcher explanations,
/// so absent lists stay absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<Vec<String>>,
}

/// A `forward` value: either a bare target URL or a full options object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForwardValue {
    Target(String),
    Options(ForwardOptions),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardOptions {
    pub target: String,
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    #[serde(default)]
    pub websocket: bool,
}

impl From<ForwardValue> for ForwardOptions {
    fn from(value: ForwardValue) -> Self {
        match value {
            ForwardValue::Target(target) => ForwardOptions {
                target,
                paths: None,
                websocket: false,
            },
            ForwardValue::Options(options) => options,
        }
    }
}

/// A `stub` value: either a bare status code or a full options object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StubValue {
    Status(u16),
    Options(StubOptions),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StubOptions {
    pub status: u16,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub prefer_network: bool,
}

impl From<StubValue> for StubOptions {
    fn from(value: StubValue) -> Self {
        match value {
            StubValue::Status(status) => StubOptions {
                status,
                status_message: None,
                file: None,
                body: None,
                prefer_network: false,
            },
            StubValue::Options(options) => options,
        }
    }
}

/// A forward entry with its target resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRule {
    pub original: Url,
    pub target: Url,
    pub paths: Vec<String>,
    pub websocket: bool,
}

impl ForwardRule {
    pub fn new(original: &str, options: ForwardOptions) -> Result<Self> {
        let original_url =
            Url::parse(original).map_err(|e| JamboxError::invalid_url(original, e))?;
        let hostname = original_url
            .host_str()
            .ok_or_else(|| JamboxError::invalid_url(original, "missing host"))?;

        if options.target.trim().is_empty() {
            return Err(JamboxError::Configuration(format!(
                "forward entry '{}' has an empty target",
                original
            )));
        }

        // A bare path resolves against the original scheme and hostname.
        let base = format!("{}://{}", original_url.scheme(), hostname);
        let target = Url::parse(&base)
            .and_then(|base| base.join(&options.target))
            .map_err(|e| JamboxError::invalid_url(&options.target, e))?;
        if target.host_str().is_none() {
            return Err(JamboxError::invalid_url(&options.target, "missing host"));
        }

        Ok(Self {
            original: original_url,
            target,
            paths: options.paths.unwrap_or_else(|| vec!["**".to_string()]),
            websocket: options.websocket,
        })
    }

    /// Target speaks TLS: port 443 or an https scheme.
    pub fn use_ssl(&self) -> bool {
        self.target.port() == Some(443) || self.target.scheme() == "https"
    }

    /// Original and target name different hosts (ports aside).
    pub fn change_hosts(&self) -> bool {
        self.original.host_str() != self.target.host_str()
    }
}

/// Where a stub's body comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum BodySource {
    None,
    File(PathBuf),
    Inline(serde_json::Value),
}

/// A stub entry, normalised.
#[derive(Debug, Clone, PartialEq)]
pub struct StubRule {
    pub path: String,
    pub status: u16,
    pub status_message: String,
    pub body: BodySource,
    pub prefer_network: bool,
}

impl StubRule {
    pub fn new(path: &str, options: StubOptions) -> Result<Self> {
        if !(100..=999).contains(&options.status) {
            return Err(JamboxError::Configuration(format!(
                "stub '{}' has invalid status {}",
                path, options.status
            )));
        }

        let body = match (options.file, options.body) {
            (Some(file), _) => BodySource::File(file),
            (None, Some(serde_json::Value::Null)) | (None, None) => BodySource::None,
            (None, Some(value)) => BodySource::Inline(value),
        };

        let status_message = options.status_message.unwrap_or_else(|| {
            match &body {
                BodySource::File(_) => "OK",
                _ => "jambox stub",
            }
            .to_string()
        });

        Ok(Self {
            path: path.to_string(),
            status: options.status,
            status_message,
            body,
            prefer_network: options.prefer_network,
        })
    }

    /// Materialise the body. File bodies are read now, so a missing file
    /// fails rule compilation rather than the first request.
    pub fn load_body(&self) -> Result<Vec<u8>> {
        match &self.body {
            BodySource::None => Ok(Vec::new()),
            BodySource::File(path) => std::fs::read(path).map_err(|source| JamboxError::StubFile {
                path: path.clone(),
                source,
            }),
            BodySource::Inline(serde_json::Value::String(text)) => Ok(text.clone().into_bytes()),
            BodySource::Inline(value) => Ok(serde_json::to_vec(value)?),
        }
    }
}
