use std::{collections::HashSet, env, fs, net::SocketAddr, path::PathBuf, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::resolver::ModelMapping;

const DEFAULT_MODEL_MAP: &str =
    "mistral:latest=mistral-7b,mistral:7b=mistral-7b,mixtral:latest=mixtral-8x7b,mixtral:8x7b=mixtral-8x7b";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address {value:?}: {reason}")]
    InvalidBindAddress { value: String, reason: String },
    #[error("invalid backend url {value:?}: {reason}")]
    InvalidBackendUrl { value: String, reason: String },
    #[error("invalid model map entry {0:?}, expected alias=backend-id")]
    InvalidModelMap(String),
    #[error("model alias {0:?} is mapped more than once")]
    DuplicateAlias(String),
    #[error("failed to read model map file {path}: {source}")]
    ModelMapFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model map file {path}: {source}")]
    ModelMapParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid CORS origin {0:?}")]
    InvalidCorsOrigin(String),
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_address: SocketAddr,
    pub backend_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub stall_timeout: Duration,
    pub connect_retries: u32,
    pub stream_window: usize,
    pub max_line_length: usize,
    pub model_map: Vec<ModelMapping>,
    pub passthrough: bool,
    pub cors_allowed_origins: Vec<String>,
    pub reported_version: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 11434)),
            backend_url: "http://localhost:8080".to_owned(),
            request_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(60),
            connect_retries: 1,
            stream_window: 8,
            max_line_length: 1_000_000,
            model_map: parse_model_map(DEFAULT_MODEL_MAP).unwrap_or_default(),
            passthrough: true,
            cors_allowed_origins: vec!["http://localhost:3000".to_owned()],
            reported_version: format!("{}-compat-proxy", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_address = match env::var("BIND_ADDRESS") {
            Ok(value) => value
                .parse::<SocketAddr>()
                .map_err(|error| ConfigError::InvalidBindAddress {
                    reason: error.to_string(),
                    value,
                })?,
            Err(_) => defaults.bind_address,
        };

        let backend_url = env::var("BACKEND_URL")
            .or_else(|_| env::var("MISTRAL_URL"))
            .unwrap_or(defaults.backend_url);
        let backend_url = normalize_backend_url(&backend_url)?;

        let model_map = match env::var("MODEL_MAP_FILE").ok().filter(|value| !value.is_empty()) {
            Some(path) => load_model_map_file(PathBuf::from(path))?,
            None => match env::var("MODEL_MAP") {
                Ok(value) => parse_model_map(&value)?,
                Err(_) => defaults.model_map,
            },
        };

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToOwned::to_owned)
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.cors_allowed_origins);

        Ok(Self {
            bind_address,
            backend_url,
            request_timeout: env_secs("REQUEST_TIMEOUT_SECS")?.unwrap_or(defaults.request_timeout),
            connect_timeout: env_secs("CONNECT_TIMEOUT_SECS")?.unwrap_or(defaults.connect_timeout),
            stall_timeout: env_secs("STALL_TIMEOUT_SECS")?.unwrap_or(defaults.stall_timeout),
            connect_retries: env_parse("CONNECT_RETRIES")?.unwrap_or(defaults.connect_retries),
            stream_window: match env_parse::<usize>("STREAM_WINDOW")? {
                Some(0) => {
                    return Err(ConfigError::InvalidValue {
                        name: "STREAM_WINDOW",
                        value: "0".to_owned(),
                    })
                }
                Some(window) => window,
                None => defaults.stream_window,
            },
            max_line_length: env_parse("MAX_LINE_LENGTH")?.unwrap_or(defaults.max_line_length),
            model_map,
            passthrough: match env_value("MODEL_PASSTHROUGH") {
                Some(value) => parse_flag("MODEL_PASSTHROUGH", &value)?,
                None => defaults.passthrough,
            },
            cors_allowed_origins,
            reported_version: env::var("REPORTED_VERSION")
                .ok()
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.reported_version),
        })
    }
}

/// Unset and blank variables fall back to the default.
fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    env_value(name)
        .map(|value| parse_value(name, &value))
        .transpose()
}

fn env_secs(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_secs))
}

fn parse_value<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_owned(),
    })
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_owned(),
        }),
    }
}

fn normalize_backend_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed = reqwest::Url::parse(trimmed).map_err(|error| ConfigError::InvalidBackendUrl {
        value: raw.to_owned(),
        reason: error.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidBackendUrl {
            value: raw.to_owned(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    Ok(trimmed.to_owned())
}

/// Parses `alias=backend-id` pairs separated by commas.
pub fn parse_model_map(raw: &str) -> Result<Vec<ModelMapping>, ConfigError> {
    let mut mappings = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        // Aliases contain ':' (mistral:7b), so '=' is the only separator.
        let Some((alias, backend_id)) = entry.split_once('=') else {
            return Err(ConfigError::InvalidModelMap(entry.to_owned()));
        };
        let (alias, backend_id) = (alias.trim(), backend_id.trim());
        if alias.is_empty() || backend_id.is_empty() {
            return Err(ConfigError::InvalidModelMap(entry.to_owned()));
        }
        mappings.push(ModelMapping::new(alias, backend_id));
    }
    reject_duplicates(&mappings)?;
    Ok(mappings)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModelMapFile {
    Entries(Vec<ModelMapping>),
    Table(serde_json::Map<String, serde_json::Value>),
}

fn load_model_map_file(path: PathBuf) -> Result<Vec<ModelMapping>, ConfigError> {
    let content = fs::read_to_string(&path).map_err(|source| ConfigError::ModelMapFile {
        path: path.clone(),
        source,
    })?;
    let parsed: ModelMapFile = serde_json::from_str(&content)
        .map_err(|source| ConfigError::ModelMapParse { path, source })?;

    let mappings = match parsed {
        ModelMapFile::Entries(entries) => entries,
        ModelMapFile::Table(table) => table
            .into_iter()
            .map(|(alias, value)| match value {
                serde_json::Value::String(backend_id) => Ok(ModelMapping::new(alias, backend_id)),
                other => Err(ConfigError::InvalidModelMap(format!("{alias}={other}"))),
            })
            .collect::<Result<Vec<_>, _>>()?,
    };
    reject_duplicates(&mappings)?;
    Ok(mappings)
}

fn reject_duplicates(mappings: &[ModelMapping]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for mapping in mappings {
        if !seen.insert(mapping.client_alias.as_str()) {
            return Err(ConfigError::DuplicateAlias(mapping.client_alias.clone()));
        }
    }
    Ok(())
}
