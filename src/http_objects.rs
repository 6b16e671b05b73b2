use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{conversion::JobSnapshot, gateway::GatewayError, key_mapper::InvalidKey};

#[derive(Debug)]
pub struct ApiError {
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {} - {}", self.status_code, self.message);
        } else {
            debug!("API Error: {} - {}", self.status_code, self.message);
        }
        (self.status_code, self.message).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::InvalidKey(e) => Self::bad_request(&e.to_string()),
            GatewayError::NotFound(_) => Self::not_found(&e.to_string()),
            GatewayError::Conflict(_) => Self::new(StatusCode::CONFLICT, &e.to_string()),
            GatewayError::Unauthorized(_) => Self::new(StatusCode::UNAUTHORIZED, &e.to_string()),
            GatewayError::Storage(e) => {
                error!(error = ?e, "storage failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
            }
        }
    }
}

impl From<InvalidKey> for ApiError {
    fn from(e: InvalidKey) -> Self {
        Self::bad_request(&e.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WriteParams {
    #[serde(default)]
    pub fail_if_exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListKeysResponse {
    pub prefix: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ConversionsResponse {
    pub jobs: Vec<JobSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
