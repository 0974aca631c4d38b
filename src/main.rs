use hub::{Hub, DEFAULT_SHUTDOWN_TIMEOUT};
use log::*;
use service::{config::Config, logging::Logger};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use web::AppState;

mod shutdown;

#[tokio::main]
async fn main() {
    let config = Config::new();
    Logger::init_logger(&config as &Config);

    info!("Starting hub [{}]...", config.hub_name);

    let relay = match service::init_relay(&config).await {
        Ok(relay) => relay,
        Err(e) => {
            error!("Failed to establish relay bus connection: {e}");
            std::process::exit(1);
        }
    };

    let hub = Arc::new(Hub::new(config.hub_settings(), relay));
    if let Err(e) = hub.start().await {
        error!("Failed to start hub: {e}");
        std::process::exit(1);
    }

    let listener = match TcpListener::bind(config.listen_address()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {e}", config.listen_address());
            let _ = hub.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
            std::process::exit(1);
        }
    };

    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let mut server = tokio::spawn(web::init_server(
        AppState::new(hub.clone()),
        listener,
        async move {
            let _ = server_stopped.await;
        },
    ));

    let mut failed = false;
    let server_exited = tokio::select! {
        signal = shutdown::wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signals: {e}");
                failed = true;
            }
            info!("Shutdown signal received, stopping hub [{}]", hub.hub_id());
            false
        }
        result = &mut server => {
            error!("Server stopped unexpectedly: {}", describe(result));
            failed = true;
            true
        }
    };

    // Clients are closed by the hub first, the listener goes last.
    if let Err(e) = hub.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await {
        error!("Hub shutdown failed: {e}");
        failed = true;
    }

    let _ = stop_server.send(());
    if !server_exited {
        if let Err(e) = flatten(server.await) {
            error!("Server shutdown failed: {e}");
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
    info!("Hub [{}] stopped", hub.hub_id());
}

type ServerResult = Result<std::io::Result<()>, tokio::task::JoinError>;

fn flatten(result: ServerResult) -> Result<(), String> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn describe(result: ServerResult) -> String {
    match flatten(result) {
        Ok(()) => "no error".to_string(),
        Err(e) => e,
    }
}
