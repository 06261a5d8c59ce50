use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Postgres {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize)]
pub struct Http {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Network {
    /// Root used when a traversal names none. Falls back to the earliest
    /// unsponsored user when unset.
    pub anchor_user_id: Option<String>,
    #[serde(default = "default_depth")]
    pub default_depth: i64,
    #[serde(default = "default_limit_per_level")]
    pub default_limit_per_level: i64,
    #[serde(default = "default_max_limit_per_level")]
    pub max_limit_per_level: i64,
    /// Hops followed when counting a node's downline.
    #[serde(default = "default_downline_depth_cap")]
    pub downline_depth_cap: i32,
}

#[derive(Debug, Deserialize)]
pub struct ServiceSettings {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub postgres: Postgres,
    pub http: Http,
    pub network: Network,
    pub service: ServiceSettings,
}

impl Default for Network {
    fn default() -> Self {
        Network {
            anchor_user_id: None,
            default_depth: default_depth(),
            default_limit_per_level: default_limit_per_level(),
            max_limit_per_level: default_max_limit_per_level(),
            downline_depth_cap: default_downline_depth_cap(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_depth() -> i64 {
    3
}

fn default_limit_per_level() -> i64 {
    50
}

fn default_max_limit_per_level() -> i64 {
    500
}

fn default_downline_depth_cap() -> i32 {
    64
}

fn default_channel_capacity() -> usize {
    512
}

impl Settings {
    /// Loads `path` and overlays `NETWORK__SECTION__KEY` environment variables.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("http.listen", default_listen())?
            .set_default("service.channel_capacity", default_channel_capacity() as i64)?
            .set_default("network.default_depth", default_depth())?
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("NETWORK").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
