//! Request authentication
//!
//! Protected endpoints require the `Authorization: Bearer <token>` header. The identity derived
//! from the token is attached to the request and can be extracted by handlers.

use std::future::{Ready, ready};

use actix_web::body::MessageBody;
use actix_web::dev::{Payload, ServiceRequest, ServiceResponse};
use actix_web::http::header::{self, HeaderMap};
use actix_web::middleware::Next;
use actix_web::web::Data;
use actix_web::{Error, FromRequest, HttpMessage, HttpRequest};

use crate::model::Model;
use crate::model::auth::{Identity, TokenCodec};
use crate::service::error::ApiError;

const BEARER_SCHEME: &str = "Bearer";

/// Derives the caller identity from the request headers
pub fn authenticate(headers: &HeaderMap, codec: &TokenCodec) -> Result<Identity, ApiError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("no token".to_owned()))?
        .to_str()
        .map_err(|err| ApiError::Unauthorized(err.to_string()))?;

    let (scheme, token) = auth_header
        .split_once(' ')
        .ok_or_else(|| ApiError::Unauthorized("Invalid Authorization header".to_owned()))?;

    if scheme != BEARER_SCHEME {
        return Err(ApiError::Unauthorized(
            "Invalid Authorization token scheme".to_owned(),
        ));
    }

    Ok(codec.verify(token.trim())?)
}

/// Rejects requests without a valid session token
pub async fn middleware<B>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<B>, Error>
where
    B: MessageBody + 'static,
{
    let model: Data<Model> = req
        .app_data()
        .cloned()
        .ok_or_else(|| ApiError::Upstream("Missing model".to_owned()))?;

    let identity = authenticate(req.headers(), model.codec())?;
    req.extensions_mut().insert(identity);

    next.call(req).await
}

impl FromRequest for Identity {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let identity = req
            .extensions()
            .get::<Identity>()
            .copied()
            .ok_or_else(|| ApiError::Unauthorized("Unauthenticated request".to_owned()));

        ready(identity)
    }
}
