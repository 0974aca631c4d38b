use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use hub::error::{Error as HubError, ErrorKind, HubErrorKind};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error(HubError);

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        write!(fmt, "{}", self.0)
    }
}

// List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self.0.error_kind {
            ErrorKind::Hub(HubErrorKind::NotRunning) | ErrorKind::Hub(HubErrorKind::ShutdownTimeout) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Upgrade => StatusCode::BAD_REQUEST,
            ErrorKind::Transport(_)
            | ErrorKind::DuplicateId
            | ErrorKind::Relay(_)
            | ErrorKind::Hub(HubErrorKind::AlreadyStarted) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let reason = status.canonical_reason().unwrap_or("UNKNOWN");
        (status, Json(json!({ "error": reason.to_uppercase() }))).into_response()
    }
}

impl<E> From<E> for Error
where
    E: Into<HubError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
