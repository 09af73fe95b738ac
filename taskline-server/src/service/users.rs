//! Account endpoints

use actix_web::web::{Data, Json};
use actix_web::{HttpResponse, post};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::model::Model;
use crate::model::auth::{Claims, SessionToken};
use crate::model::users::{NewUser, User};
use crate::service::error::ApiError;

/// Response for successful signup or login
#[derive(Debug, Serialize)]
struct Session {
    token: SessionToken,
    user: User,
}

impl Session {
    fn issue(model: &Model, user: User) -> Result<Self, ApiError> {
        let claims = Claims::new(user.id, user.email.clone(), user.role);
        let token = model.codec().issue(claims)?;
        Ok(Self { token, user })
    }
}

#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

/// Creates an account and opens a session for it
#[post("/signup")]
#[instrument(skip_all, fields(email = %new_user.email))]
async fn signup(model: Data<Model>, new_user: Json<NewUser>) -> Result<HttpResponse, ApiError> {
    let user = new_user.into_inner().create(model.db()).await?;
    info!(user_id = %user.id, "User signed up");

    Ok(HttpResponse::Created().json(Session::issue(&model, user)?))
}

/// Opens a session for an existing account
#[post("/login")]
#[instrument(skip_all, fields(email = %credentials.email))]
async fn login(
    model: Data<Model>,
    credentials: Json<Credentials>,
) -> Result<Json<Session>, ApiError> {
    let Credentials { email, password } = credentials.into_inner();
    if email.is_empty() || password.is_empty() {
        return Err(ApiError::Validation(
            "Email and password are required".to_owned(),
        ));
    }

    let user = User::login(model.db(), &email, &password)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".to_owned()))?;
    info!(user_id = %user.id, "User logged in");

    Ok(Json(Session::issue(&model, user)?))
}
