//! HTTP interface of the service

use actix_web::web::{self, Data, ServiceConfig};
use actix_web::middleware;


mod auth;
mod chat;
mod error;
mod socket;
mod users;

use crate::model::Model;
use crate::service::error::ApiError;

/// Returns configuration function for the ActixWeb services
pub fn configure(model: Model) -> impl Fn(&mut ServiceConfig) + Clone {
    move |cfg: &mut ServiceConfig| {
        let json_config = web::JsonConfig::default()
            .error_handler(|err, _| ApiError::Validation(err.to_string()).into());
        let query_config = web::QueryConfig::default()
            .error_handler(|err, _| ApiError::Validation(err.to_string()).into());

        let chat_scope = web::scope("/chat")
            .wrap(middleware::from_fn(auth::middleware))
            .service(chat::send)
            .service(chat::conversation)
            .service(chat::mark_read)
            .service(chat::unread);

        let api = web::scope("/api")
            .service(users::signup)
            .service(users::login)
            .service(chat_scope);

        cfg.app_data(Data::new(model.clone()))
            .app_data(json_config)
            .app_data(query_config)
            .service(api)
            .service(socket::socket);
    }
}
