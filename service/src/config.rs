use clap::builder::TypedValueParser as _;
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use hub::engine::DEFAULT_QUEUE_CAPACITY;
use hub::{ConnectionConfig, HubSettings};
use log::LevelFilter;
use std::fmt;

/// Which relay bus the hub joins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RelayBackend {
    /// Redis pub/sub, shared by every hub of the deployment.
    Redis,
    /// In-process bus; the hub relays only to itself.
    Memory,
}

impl fmt::Display for RelayBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RelayBackend::Redis => write!(f, "redis"),
            RelayBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Unique name of this hub instance, stamped on every message it publishes
    #[arg(long, env)]
    pub hub_name: String,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "0.0.0.0")]
    pub interface: String,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 8080)]
    pub port: u16,

    /// Address (host:port) of the Redis server used as relay bus
    #[arg(long, env, default_value = "redis:6379")]
    pub pub_sub_host: String,

    /// Relay topic shared by every hub of the deployment
    #[arg(long, env, default_value = "hub-messages-pub-sub-channel")]
    pub pub_sub_channel: String,

    /// Number of workers draining the broadcast queue
    #[arg(long, env, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    pub broadcast_workers: u16,

    #[arg(long, env, default_value = "redis")]
    pub redis_username: String,

    #[arg(long, env, default_value = "password")]
    redis_password: String,

    /// Relay bus implementation to use
    #[arg(long, env, value_enum, default_value_t = RelayBackend::Redis)]
    pub relay_backend: RelayBackend,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .try_map(parse_level_filter),
        )]
    pub log_level_filter: LevelFilter,
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn redis_password(&self) -> &str {
        &self.redis_password
    }

    /// Socket address string the HTTP server binds to.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.interface, self.port)
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            hub_id: self.hub_name.clone(),
            broadcast_workers: usize::from(self.broadcast_workers),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connection: ConnectionConfig::default(),
        }
    }
}

fn parse_level_filter(level: String) -> Result<LevelFilter, String> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| format!("invalid log level: {level}"))
}
