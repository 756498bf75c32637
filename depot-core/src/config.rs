//! Service configuration: process defaults, the TOML file model, and the
//! CLI arguments every service shares.
//!
//! Precedence is CLI/env over config file over built-in defaults.

use std::path::{Path, PathBuf};

use clap::Parser;
use once_cell::sync::Lazy;
use serde::Deserialize;
use thiserror::Error;

/// Default HTTP endpoint for the broker.
pub const BROKER_HOST_DEFAULT: &str = "localhost:8000";
/// Default HTTP endpoint for a publisher.
pub const PUB_HOST_DEFAULT: &str = "localhost:8001";
/// Default HTTP endpoint for a subscriber.
pub const SUB_HOST_DEFAULT: &str = "localhost:8002";

/// Default payload size above which fetch responses switch to the
/// container-frame transport when the client prefers it.
pub const SCHUNK_WIRE_THRESHOLD_DEFAULT: usize = 128 * 1024;

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("b2depot.toml"),
        PathBuf::from("config/b2depot.toml"),
    ]
});

/// CLI arguments common to every service binary.
#[derive(Parser, Debug, Clone, Default)]
pub struct ServiceArgs {
    /// State directory (publisher: the root directory to serve;
    /// subscriber: the cache directory)
    #[arg(long, env = "DEPOT_STATEDIR")]
    pub statedir: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(long, env = "DEPOT_CONF")]
    pub conf: Option<PathBuf>,

    /// host:port to listen on (overrides the config file)
    #[arg(long, env = "DEPOT_HTTP")]
    pub http: Option<String>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing config file: {path}")]
    Missing { path: PathBuf },

    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Contents of a `b2depot.toml` file. Every section and field is optional.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub broker: BrokerSection,
    pub publisher: PublisherSection,
    pub subscriber: SubscriberSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub http: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    pub http: Option<String>,
    pub name: Option<String>,
    pub root: Option<PathBuf>,
    pub broker: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriberSection {
    pub http: Option<String>,
    pub broker_endpoint: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub cache_quota_bytes: Option<u64>,
    /// Max age in seconds before a cached ETag is re-checked. Zero means
    /// revalidate on every slice request.
    pub etag_revalidation_interval: Option<u64>,
    pub chunk_fetch_concurrency: Option<usize>,
    pub change_subscription: Option<bool>,
    pub schunk_wire_threshold: Option<usize>,
}

impl FileConfig {
    /// Load the config file: an explicit path must exist; otherwise the
    /// first default location that exists is used, and none existing is
    /// fine.
    pub fn load(explicit: Option<&Path>) -> Result<FileConfig, ConfigError> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::Missing {
                        path: path.to_path_buf(),
                    });
                }
                path.to_path_buf()
            }
            None => match DEFAULT_CONFIG_LOCATIONS.iter().find(|p| p.exists()) {
                Some(path) => path.clone(),
                None => return Ok(FileConfig::default()),
            },
        };

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path,
            source: Box::new(source),
        })
    }
}

/// Resolved broker settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub listen: String,
}

impl BrokerSettings {
    pub fn resolve(args: &ServiceArgs, file: &FileConfig) -> BrokerSettings {
        BrokerSettings {
            listen: args
                .http
                .clone()
                .or_else(|| file.broker.http.clone())
                .unwrap_or_else(|| BROKER_HOST_DEFAULT.to_owned()),
        }
    }
}

/// Resolved publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub listen: String,
    pub name: String,
    pub root: PathBuf,
    pub broker: String,
}

impl PublisherSettings {
    pub fn resolve(
        args: &ServiceArgs,
        name: Option<String>,
        root: Option<PathBuf>,
        file: &FileConfig,
    ) -> Result<PublisherSettings, ConfigError> {
        let name = name
            .or_else(|| file.publisher.name.clone())
            .ok_or_else(|| ConfigError::Invalid("publisher needs a root name".into()))?;
        let root = root
            .or_else(|| args.statedir.clone())
            .or_else(|| file.publisher.root.clone())
            .ok_or_else(|| {
                ConfigError::Invalid("publisher needs a root directory to serve".into())
            })?;
        Ok(PublisherSettings {
            listen: args
                .http
                .clone()
                .or_else(|| file.publisher.http.clone())
                .unwrap_or_else(|| PUB_HOST_DEFAULT.to_owned()),
            name,
            root,
            broker: file
                .publisher
                .broker
                .clone()
                .unwrap_or_else(|| BROKER_HOST_DEFAULT.to_owned()),
        })
    }
}

/// Resolved subscriber settings.
#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    pub listen: String,
    pub broker_endpoint: String,
    pub cache_dir: PathBuf,
    pub cache_quota_bytes: Option<u64>,
    pub etag_revalidation_interval: u64,
    pub chunk_fetch_concurrency: usize,
    pub change_subscription: bool,
    pub schunk_wire_threshold: usize,
}

impl SubscriberSettings {
    pub fn resolve(
        args: &ServiceArgs,
        file: &FileConfig,
    ) -> Result<SubscriberSettings, ConfigError> {
        let section = &file.subscriber;
        let cache_dir = args
            .statedir
            .clone()
            .or_else(|| section.cache_dir.clone())
            .ok_or_else(|| ConfigError::Invalid("subscriber needs a cache directory".into()))?;
        Ok(SubscriberSettings {
            listen: args
                .http
                .clone()
                .or_else(|| section.http.clone())
                .unwrap_or_else(|| SUB_HOST_DEFAULT.to_owned()),
            broker_endpoint: section
                .broker_endpoint
                .clone()
                .unwrap_or_else(|| BROKER_HOST_DEFAULT.to_owned()),
            cache_dir,
            cache_quota_bytes: section.cache_quota_bytes,
            etag_revalidation_interval: section.etag_revalidation_interval.unwrap_or(0),
            chunk_fetch_concurrency: section.chunk_fetch_concurrency.unwrap_or(8),
            change_subscription: section.change_subscription.unwrap_or(true),
            schunk_wire_threshold: section
                .schunk_wire_threshold
                .unwrap_or(SCHUNK_WIRE_THRESHOLD_DEFAULT),
        })
    }
}
