use anyhow::{Error, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(version, about = "Stage-1 call routing backend")]
pub struct Cli {
    #[clap(long, default_value = "routingd.toml")]
    pub conf: Option<String>,
    /// Only start the diagnostic webserver, do not connect to the engine.
    #[clap(long, action)]
    pub web_only: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "postgres://routing@localhost/routing".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "backend")]
#[serde(rename_all = "snake_case")]
pub enum CacheConfig {
    /// In-process map, single-server installations and tests.
    Memory,
    /// Shared table reachable by every routing daemon of the site.
    Database { url: String },
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// A cooperating telephone server and how to reach it.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HomeServer {
    pub id: i32,
    pub address: String,
    #[serde(default = "default_oconnection_id")]
    pub oconnection_id: String,
}

fn default_oconnection_id() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RoutingConfig {
    /// Home server id of this daemon's telephone server.
    #[serde(default = "default_local_server_id")]
    pub local_server_id: i32,
    #[serde(default)]
    pub servers: Vec<HomeServer>,
    /// Contact address for numbers outside the PBX.
    #[serde(default = "default_outbound_gateway")]
    pub outbound_gateway: String,
    #[serde(default = "default_forward_depth_limit")]
    pub forward_depth_limit: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Must outlast any single call's ring timeout.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_local_server_id() -> i32 {
    1
}

fn default_outbound_gateway() -> String {
    "gateway".to_string()
}

fn default_forward_depth_limit() -> u32 {
    16
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl RoutingConfig {
    pub fn server(&self, id: i32) -> Option<&HomeServer> {
        self.servers.iter().find(|server| server.id == id)
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            local_server_id: default_local_server_id(),
            servers: Vec::new(),
            outbound_gateway: default_outbound_gateway(),
            forward_depth_limit: default_forward_depth_limit(),
            request_timeout_ms: default_request_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    /// External-module port of the local telephone engine.
    pub addr: String,
    pub priority: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5039".to_string(),
            priority: 90,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9042".to_string(),
            log_level: None,
            log_file: None,
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            routing: RoutingConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dump() {
        let mut config = Config::default();
        config.cache = CacheConfig::Database {
            url: "postgres://routing@localhost/routing".to_string(),
        };
        config.routing.servers = vec![
            HomeServer {
                id: 1,
                address: "dect.example.net".to_string(),
                oconnection_id: "local".to_string(),
            },
            HomeServer {
                id: 2,
                address: "sip.example.net".to_string(),
                oconnection_id: "local".to_string(),
            },
        ];
        let config_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&config_str).unwrap();
        assert_eq!(parsed.routing.servers.len(), 2);
        assert_eq!(parsed.routing.server(2).unwrap().address, "sip.example.net");
        assert!(parsed.routing.server(3).is_none());
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("http_addr = \"0.0.0.0:9042\"").unwrap();
        assert_eq!(config.routing.forward_depth_limit, 16);
        assert_eq!(config.routing.cache_ttl_secs, 300);
        assert!(matches!(config.cache, CacheConfig::Memory));
        assert_eq!(config.engine.priority, 90);
    }
}
