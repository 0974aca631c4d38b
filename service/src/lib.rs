use config::{Config, RelayBackend};
use hub::relay::{MemoryBus, RedisRelay, RelayBus};
use log::info;
use std::sync::Arc;

pub mod config;
pub mod logging;

/// Capacity of the in-process relay bus.
const MEMORY_RELAY_CAPACITY: usize = 1024;

/// Connects the relay bus selected by `config`. Failing to reach Redis is fatal at startup.
pub async fn init_relay(config: &Config) -> hub::Result<Arc<dyn RelayBus>> {
    info!(
        "Relay config: backend={}, host={}, channel={}",
        config.relay_backend, config.pub_sub_host, config.pub_sub_channel,
    );

    match config.relay_backend {
        RelayBackend::Redis => {
            let relay = RedisRelay::connect(
                &config.pub_sub_host,
                Some(config.redis_username.as_str()),
                Some(config.redis_password()),
                &config.pub_sub_channel,
            )
            .await?;
            Ok(Arc::new(relay))
        }
        RelayBackend::Memory => {
            let bus = MemoryBus::new(&config.pub_sub_channel, MEMORY_RELAY_CAPACITY);
            Ok(Arc::new(bus.relay()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn memory_backend_needs_no_server() {
        let config = Config::try_parse_from([
            "realtime_hub",
            "--hub-name",
            "hub-1",
            "--relay-backend",
            "memory",
            "--pub-sub-channel",
            "local-topic",
        ])
        .unwrap();

        let relay = init_relay(&config).await.unwrap();
        assert_eq!(relay.topic(), "local-topic");
    }
}
