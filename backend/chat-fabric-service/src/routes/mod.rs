pub mod keys;
pub mod messages;
pub mod wsroute;

use actix_web::{web, HttpResponse};

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Every fabric endpoint. Shared by the server and the HTTP tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(crate::metrics::metrics_handler))
        .service(messages::get_messages)
        .service(messages::get_summary)
        .service(messages::get_message)
        .service(messages::delete_message)
        .service(keys::exchange_key)
        .service(keys::rotate_key)
        .service(keys::fetch_keys)
        .service(wsroute::ws_handler);
}
