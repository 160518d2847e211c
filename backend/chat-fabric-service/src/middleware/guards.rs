//! Request extractors that enforce authentication at the type level.

use crate::error::AppError;
use crate::state::AppState;
use actix_web::{dev::Payload, web, Error, FromRequest, HttpRequest};
use std::future::{ready, Ready};
use uuid::Uuid;

/// Authenticated caller of an HTTP endpoint.
#[derive(Debug, Clone, Copy)]
pub struct User {
    pub id: Uuid,
}

impl FromRequest for User {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let result = match req.app_data::<web::Data<AppState>>() {
            Some(state) => state
                .validator
                .authenticate(req)
                .map(|user| User { id: user.user_id }),
            None => Err(AppError::Internal("application state missing".into())),
        };
        ready(result.map_err(Error::from))
    }
}
