use crate::error::{ControlError, PeerError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Uniform response body: `status` is 0 on success, otherwise an error code
/// with a message in `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: i32,
    pub value: T,
}

impl<T> Envelope<T> {
    pub fn ok(value: T) -> Self {
        Self { status: 0, value }
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Debug)]
pub enum ApiError {
    Control(ControlError),
    Peer(PeerError),
    Unauthorized,
    BadRequest(String),
}

impl ApiError {
    pub fn code(&self) -> i32 {
        match self {
            ApiError::Control(err) => err.code(),
            ApiError::Peer(err) => err.code(),
            ApiError::Unauthorized => 7,
            ApiError::BadRequest(_) => 8,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Control(ControlError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Control(
                ControlError::DuplicateName(_)
                | ControlError::InvalidTransition { .. }
                | ControlError::StillRunning(_),
            ) => StatusCode::CONFLICT,
            ApiError::Control(ControlError::InvalidConfig(_)) => StatusCode::BAD_REQUEST,
            ApiError::Control(ControlError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Peer(PeerError::UnknownPeer(_)) => StatusCode::NOT_FOUND,
            ApiError::Peer(PeerError::InvalidProgram(_)) => StatusCode::BAD_REQUEST,
            ApiError::Peer(PeerError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Peer(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Control(err) => err.to_string(),
            ApiError::Peer(err) => err.to_string(),
            ApiError::Unauthorized => "unauthorized".into(),
            ApiError::BadRequest(message) => message.clone(),
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        ApiError::Control(err)
    }
}

impl From<PeerError> for ApiError {
    fn from(err: PeerError) -> Self {
        ApiError::Peer(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope {
            status: self.code(),
            value: self.message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
