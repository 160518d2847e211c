use crate::state::AppState;
use crate::websocket::session::WsSession;
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;

/// Upgrade to a fabric session. The credential is checked before the
/// upgrade; a rejected connection never reaches the fabric.
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let user = match state.validator.authenticate(&req) {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(peer = ?req.peer_addr(), "websocket connection rejected: invalid credential");
            return Err(e.into());
        }
    };

    tracing::debug!(user_id = %user.user_id, "websocket authentication successful");
    ws::start(WsSession::new(state.fabric.clone(), user.user_id), &req, stream)
}
