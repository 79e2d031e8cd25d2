use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ErrorTemplate;

/// Top-level gateway configuration, loaded from a YAML file.
///
/// All sections default to their zero value so partial configs parse; startup
/// validation decides what is actually required.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Ingress handles the api traffic.
    pub ingress: IngressConfig,
    /// Management handles the /metrics traffic.
    pub management: ManagementConfig,
    /// Openapi defines how to ingest the API definition.
    pub openapi: OpenapiConfig,
    /// Oauth2Idp defines how to connect to the OAuth2 IDP.
    pub oauth2idp: Oauth2IdpConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IngressConfig {
    /// `host:port` to listen on.
    pub bind: String,
    pub tls: TlsConfig,
    pub middleware: MiddlewareConfig,
    /// Error response template, expanded with `{{.Status}}` and `{{.Message}}`.
    #[serde(rename = "errorResponse")]
    pub error_response: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path of the key.pem file.
    pub key: String,
    /// Path of the cert.pem file.
    pub cert: String,
}

impl TlsConfig {
    pub fn enabled(&self) -> bool {
        !self.cert.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub path: PathConfig,
    pub cors: CorsConfig,
    pub proxy: ProxyConfig,
}

/// Checks like `require_prefix` are done prior to mutations like `trim_prefix`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PathConfig {
    /// How the path should start; non compliant paths result in 404.
    #[serde(rename = "requirePrefix")]
    pub require_prefix: String,
    /// What to remove from the front of the path.
    #[serde(rename = "trimPrefix")]
    pub trim_prefix: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins; `*` matches any origin.
    #[serde(rename = "allowOrigins")]
    pub allow_origins: Vec<String>,
    /// Fallback allow-list, used only when no per-path method lookup is
    /// installed.
    #[serde(rename = "allowMethods")]
    pub allow_methods: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: Vec::new(),
            allow_methods: default_allow_methods(),
        }
    }
}

fn default_allow_methods() -> Vec<String> {
    ["GET", "HEAD", "PUT", "PATCH", "POST", "DELETE"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Url(s) of upstream servers.
    pub targets: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagementConfig {
    pub bind: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OpenapiConfig {
    /// URL that serves the Swagger 2.0 API definition.
    pub url: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Oauth2IdpConfig {
    #[serde(rename = "tokeninfoUrl")]
    pub tokeninfo_url: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("no proxy targets configured")]
    NoTargets,

    #[error("invalid proxy target {0:?}: {1}")]
    InvalidTarget(String, url::ParseError),

    #[error("tls requires both key and cert")]
    IncompleteTls,

    #[error("invalid errorResponse template: {0}")]
    Template(#[from] crate::error::TemplateError),
}

/// Parse a `host:port` bind address. A bare `:port` binds all interfaces.
pub fn parse_bind(bind: &str) -> Result<std::net::SocketAddr, std::net::AddrParseError> {
    if let Some(port) = bind.strip_prefix(':') {
        format!("0.0.0.0:{port}").parse()
    } else {
        bind.parse()
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let proxy = &self.ingress.middleware.proxy;
        if proxy.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        for target in &proxy.targets {
            reqwest::Url::parse(target)
                .map_err(|e| ConfigError::InvalidTarget(target.clone(), e))?;
        }
        let tls = &self.ingress.tls;
        if tls.key.is_empty() != tls.cert.is_empty() {
            return Err(ConfigError::IncompleteTls);
        }
        if !self.ingress.error_response.is_empty() {
            ErrorTemplate::parse(&self.ingress.error_response)?;
        }
        Ok(())
    }
}
