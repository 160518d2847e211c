mod common;

use actix_web::{http::StatusCode, test, web, App};
use chat_fabric_service::config::{Config, S3Config, StoreBackend};
use chat_fabric_service::middleware::CredentialValidator;
use chat_fabric_service::routes;
use chat_fabric_service::services::message_service::SendMessage;
use chat_fabric_service::state::AppState;
use chat_fabric_service::store::memory::MemoryBackend;
use chrono::Duration as TokenTtl;
use common::{conversation, fabric, user};
use crypto_core::jwt::JwtKeys;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const JWT_SECRET: &str = "http-test-secret-that-is-long-enough";

fn config() -> Config {
    Config {
        port: 0,
        redis_url: "redis://127.0.0.1:6379".into(),
        database_url: None,
        store_backend: StoreBackend::Memory,
        jwt_secret: JWT_SECRET.into(),
        key_rotation_interval: Duration::from_secs(3600),
        expiry_sweep_interval: Duration::from_secs(60),
        presence_ttl: Duration::from_secs(30),
        s3: S3Config {
            bucket: "chat-media".into(),
            region: "us-east-1".into(),
            endpoint: None,
        },
        instance_id: "http-test".into(),
    }
}

fn token_for(user_id: Uuid) -> String {
    JwtKeys::from_secret(JWT_SECRET)
        .unwrap()
        .issue_access_token(user_id, None, TokenTtl::hours(1))
        .unwrap()
}

async fn state(backend: &MemoryBackend) -> AppState {
    AppState {
        config: Arc::new(config()),
        fabric: fabric(backend, "http-test").await,
        validator: CredentialValidator::from_secret(JWT_SECRET).unwrap(),
    }
}

#[actix_web::test]
async fn test_history_without_credential_returns_401() {
    let backend = MemoryBackend::new();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(&backend).await))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/conversations/{}/messages", Uuid::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "AUTH_ERROR");
}

#[actix_web::test]
async fn test_expired_credential_returns_401() {
    let backend = MemoryBackend::new();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(&backend).await))
            .configure(routes::configure),
    )
    .await;

    let expired = JwtKeys::from_secret(JWT_SECRET)
        .unwrap()
        .issue_access_token(Uuid::new_v4(), None, TokenTtl::seconds(-60))
        .unwrap();
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/conversations/{}/summary", Uuid::new_v4()))
        .insert_header(("Authorization", format!("Bearer {expired}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn test_history_returns_plaintext_for_participant() {
    let backend = MemoryBackend::new();
    let state = state(&backend).await;
    let alice = user(&backend, "Alice").await;
    let bob = user(&backend, "Bob").await;
    let conv = conversation(&backend, &[alice, bob], 0).await;
    state
        .fabric
        .messages
        .send(
            alice,
            SendMessage {
                conversation_id: Some(conv),
                text: Some("over http".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/conversations/{conv}/messages?limit=10"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(bob))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    let page = body.as_array().unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["text"], "over http");

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/conversations/{conv}/summary"))
        .cookie(actix_web::cookie::Cookie::new("token", token_for(bob)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["unreadCount"], 1);
    assert_eq!(body["lastMessage"]["preview"], "over http");
}

#[actix_web::test]
async fn test_outsider_gets_403() {
    let backend = MemoryBackend::new();
    let state = state(&backend).await;
    let alice = user(&backend, "Alice").await;
    let mallory = user(&backend, "Mallory").await;
    let conv = conversation(&backend, &[alice], 0).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/conversations/{conv}/keys?token={}", token_for(mallory)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn test_key_submission_over_http() {
    let backend = MemoryBackend::new();
    let state = state(&backend).await;
    let alice = user(&backend, "Alice").await;
    let bob = user(&backend, "Bob").await;
    let conv = conversation(&backend, &[alice, bob], 0).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/conversations/{conv}/keys"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(alice))))
        .set_json(json!({ "publicKey": "PK-A" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["exchangeStatus"], "partial");
    assert_eq!(body["keyVersion"], 1);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/conversations/{conv}/keys"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(bob))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["keys"][0]["activeKey"]["publicKey"], "PK-A");
}

#[actix_web::test]
async fn test_health_is_public() {
    let backend = MemoryBackend::new();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(&backend).await))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}
