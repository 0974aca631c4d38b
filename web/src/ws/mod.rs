//! WebSocket endpoint for hub clients.
//!
//! This module only adapts axum's WebSocket to the hub's transport contract. The
//! connection lifecycle, fan-out and relay live in the `hub` crate.

pub(crate) mod handler;
pub(crate) mod transport;
