use crate::error::AppError;
use crate::middleware::guards::User;
use crate::state::AppState;
use actix_web::{delete, get, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// GET /api/v1/conversations/{id}/messages
#[get("/api/v1/conversations/{conversation_id}/messages")]
pub async fn get_messages(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let query = query.into_inner();
    let messages = state
        .fabric
        .messages
        .list(user.id, conversation_id.into_inner(), query.before, query.limit)
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

/// GET /api/v1/conversations/{id}/summary
#[get("/api/v1/conversations/{conversation_id}/summary")]
pub async fn get_summary(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let summary = state
        .fabric
        .messages
        .summary(user.id, conversation_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(summary))
}

/// GET /api/v1/messages/{id}
#[get("/api/v1/messages/{message_id}")]
pub async fn get_message(
    state: web::Data<AppState>,
    user: User,
    message_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let message = state
        .fabric
        .messages
        .get(user.id, message_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(message))
}

/// DELETE /api/v1/messages/{id}
///
/// Hard delete for the sender, hide-for-me for anyone else.
#[delete("/api/v1/messages/{message_id}")]
pub async fn delete_message(
    state: web::Data<AppState>,
    user: User,
    message_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let outcome = state
        .fabric
        .messages
        .delete(user.id, message_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}
