use hub::Hub;
use log::info;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

mod controller;
mod error;
pub(crate) mod router;
mod ws;

pub use error::{Error, Result};

// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

impl AppState {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

/// Serves the hub's HTTP surface on `listener` until `shutdown` resolves.
///
/// Once `shutdown` resolves no new requests are accepted; upgraded WebSocket connections
/// belong to the hub and are closed by its own shutdown.
pub async fn init_server<F>(
    app_state: AppState,
    listener: TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Server starting... listening for connections on http://{addr}");
    }

    let router = router::define_routes(app_state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
