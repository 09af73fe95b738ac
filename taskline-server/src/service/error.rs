//! API errors
//!
//! Every error is returned as a `{"error": <message>}` JSON body. Authentication and internal
//! failures are reported with generic messages, the details are only logged.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::dispatch;
use crate::model::auth::TokenError;
use crate::model::users;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid credentials. The reason is never exposed.
    #[error("Unauthorized")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    /// Unexpected failure of the service dependencies. The reason is never exposed.
    #[error("Internal server error")]
    Upstream(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            Self::Unauthorized(reason) => info!(%reason, "Request unauthorized"),
            Self::Upstream(reason) => error!(%reason, "Request failed"),
            _ => (),
        }

        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        Self::Unauthorized(err.to_string())
    }
}

impl From<dispatch::Error> for ApiError {
    fn from(err: dispatch::Error) -> Self {
        use dispatch::Error::*;

        match err {
            EmptyMessage => Self::Validation(err.to_string()),
            ReceiverNotFound => Self::NotFound(err.to_string()),
            Forbidden(msg) => Self::Forbidden(msg.to_owned()),
            Db(err) => err.into(),
        }
    }
}

impl From<users::Error> for ApiError {
    fn from(err: users::Error) -> Self {
        use users::Error::*;

        match err {
            InvalidUserId | MissingField(_) | EmailTaken => Self::Validation(err.to_string()),
            Db(err) => err.into(),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<color_eyre::Report> for ApiError {
    fn from(err: color_eyre::Report) -> Self {
        Self::Upstream(format!("{err:?}"))
    }
}
