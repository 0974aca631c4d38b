use super::transport::WsTransport;
use crate::{AppState, Error, Result};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use hub::connection::MAX_MESSAGE_SIZE;
use hub::error::{ErrorKind, HubErrorKind};
use log::*;

/// Upgrades the request to a WebSocket and attaches it to the hub.
pub(crate) async fn ws_handler(
    State(app_state): State<AppState>,
    ws: core::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    if !app_state.hub.is_ready() {
        warn!("Rejecting WebSocket upgrade, hub is not running");
        return Err(Error::from(hub::Error::hub(HubErrorKind::NotRunning)));
    }

    let ws = ws.map_err(|rejection| {
        warn!("Rejecting WebSocket upgrade: {}", rejection.body_text());
        Error::from(hub::Error::with_source(
            ErrorKind::Upgrade,
            rejection.body_text(),
        ))
    })?;

    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {e}"))
        .on_upgrade(move |socket| attach(socket, app_state)))
}

async fn attach(socket: WebSocket, app_state: AppState) {
    match app_state.hub.attach(WsTransport::new(socket)) {
        Ok(connection) => debug!("WebSocket client attached as connection {}", connection.id()),
        // The socket is dropped here, which hangs up on the client.
        Err(e) => warn!("Failed to attach WebSocket client: {e}"),
    }
}
