//! Process configuration: disk locations, capacity limits, and the HTTP bind
//! address, loaded from an optional TOML file and overridden by environment
//! variables via the `config` crate's layered TOML+env support.

use std::path::PathBuf;

use serde::Deserialize;

use crate::errors::{Result, StoreError};

#[derive(Debug, Clone, Deserialize)]
pub struct DiskLocationConfig {
    pub directory: PathBuf,
    #[serde(default = "default_max_volumes")]
    pub max_volumes: usize,
}

fn default_max_volumes() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub locations: Vec<DiskLocationConfig>,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether a miss on every local disk location may be proxied to a
    /// remote machine via `MasterLookup` rather than answered 404.
    #[serde(default)]
    pub allow_remote_reads: bool,

    /// Whether a miss may instead be answered with a redirect to the
    /// machine holding the volume.
    #[serde(default)]
    pub redirect_on_remote: bool,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            locations: vec![DiskLocationConfig {
                directory: PathBuf::from("./data"),
                max_volumes: default_max_volumes(),
            }],
            bind_address: default_bind_address(),
            port: default_port(),
            allow_remote_reads: false,
            redirect_on_remote: false,
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl StoreConfig {
    /// Loads from `path` if given, layering `HAYSTACK_*` environment
    /// variables on top (e.g. `HAYSTACK_PORT=9090`), falling back to
    /// `StoreConfig::default()` when no file and no overriding env exists.
    pub fn load(path: Option<&std::path::Path>) -> Result<StoreConfig> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("HAYSTACK")
                .separator("_")
                .try_parsing(true),
        );

        let built = builder
            .build()
            .map_err(|e| StoreError::Corrupt(format!("config error: {e}")))?;

        match built.try_deserialize::<StoreConfig>() {
            Ok(cfg) => Ok(cfg),
            Err(_) if path.is_none() => Ok(StoreConfig::default()),
            Err(e) => Err(StoreError::Corrupt(format!("config error: {e}"))),
        }
    }

    pub fn socket_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("bad bind address: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.locations.len(), 1);
        assert!(cfg.socket_addr().is_ok());
    }
}
