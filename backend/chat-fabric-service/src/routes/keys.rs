use crate::error::AppError;
use crate::middleware::guards::User;
use crate::state::AppState;
use actix_web::{get, post, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRequest {
    pub public_key: String,
}

/// POST /api/v1/conversations/{id}/keys
#[post("/api/v1/conversations/{conversation_id}/keys")]
pub async fn exchange_key(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<PublicKeyRequest>,
) -> Result<HttpResponse, AppError> {
    let submission = state
        .fabric
        .keys
        .exchange_key(conversation_id.into_inner(), user.id, &body.public_key)
        .await?;
    Ok(HttpResponse::Ok().json(submission))
}

/// POST /api/v1/conversations/{id}/keys/rotate
#[post("/api/v1/conversations/{conversation_id}/keys/rotate")]
pub async fn rotate_key(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<PublicKeyRequest>,
) -> Result<HttpResponse, AppError> {
    let submission = state
        .fabric
        .keys
        .rotate_key(conversation_id.into_inner(), user.id, &body.public_key)
        .await?;
    Ok(HttpResponse::Ok().json(submission))
}

/// GET /api/v1/conversations/{id}/keys
#[get("/api/v1/conversations/{conversation_id}/keys")]
pub async fn fetch_keys(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let keys = state
        .fabric
        .keys
        .fetch_keys(conversation_id.into_inner(), user.id)
        .await?;
    Ok(HttpResponse::Ok().json(keys))
}
