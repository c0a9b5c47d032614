use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "fieldserver.toml";
pub const ENV_PREFIX: &str = "FIELDSERVER_";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub stripe: StripeConfig,
    pub scheduling: SchedulingConfig,
    pub billing: BillingConfig,
    pub notifications: NotificationsConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StripeConfig {
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulingConfig {
    pub slot_step_minutes: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingConfig {
    pub default_deposit_percent: u32,
}

/// Without a relay URL notifications are only logged.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub webhook_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "fieldserver.db".to_string(),
                pool_size: 8,
            },
            stripe: StripeConfig::default(),
            scheduling: SchedulingConfig { slot_step_minutes: 30 },
            billing: BillingConfig {
                default_deposit_percent: 50,
            },
            notifications: NotificationsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, then `fieldserver.toml`, then `FIELDSERVER_*` variables
    /// (nested keys use `__`, e.g. `FIELDSERVER_STRIPE__API_KEY`).
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, figment::Error> {
        figment.extract()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
