//! One websocket connection as an actix actor.
//!
//! Outbound room traffic arrives on the receiver handed out by the local
//! room table. Inbound frames go through a per-session worker so they are
//! handled strictly in arrival order; the worker sends its replies back to
//! the actor.

use crate::services::ChatFabric;
use crate::websocket::events::ServerEvent;
use crate::websocket::handlers;
use crate::websocket::registry::SessionId;
use actix::{
    Actor, ActorContext, ActorFutureExt, AsyncContext, Handler, Message as ActixMessage,
    StreamHandler, WrapFuture,
};
use actix_web_actors::ws;
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Frame owed to this session by the inbound worker.
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Deliver(String);

/// Frame pushed through the fanout bus.
struct Outbound(String);

pub struct WsSession {
    session_id: SessionId,
    user_id: Uuid,
    fabric: ChatFabric,
    hb: Instant,
    inbound: Option<mpsc::UnboundedSender<String>>,
}

impl WsSession {
    pub fn new(fabric: ChatFabric, user_id: Uuid) -> Self {
        Self {
            session_id: SessionId::new(),
            user_id,
            fabric,
            hb: Instant::now(),
            inbound: None,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(session_id = %act.session_id, "websocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn start_inbound_worker(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.inbound = Some(tx);

        let fabric = self.fabric.clone();
        let session_id = self.session_id;
        let user_id = self.user_id;
        let addr = ctx.address();

        actix::spawn(async move {
            while let Some(text) = rx.recv().await {
                for frame in handlers::handle_text(&fabric, session_id, user_id, &text).await {
                    addr.do_send(Deliver(frame));
                }
            }
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(session_id = %self.session_id, user_id = %self.user_id, "websocket session started");

        let rx = self.fabric.register_session(self.session_id, self.user_id);
        ctx.add_stream(UnboundedReceiverStream::new(rx).map(Outbound));

        self.hb(ctx);
        self.start_inbound_worker(ctx);

        // Nothing else is processed until rooms and presence are in place.
        let fabric = self.fabric.clone();
        let session_id = self.session_id;
        let user_id = self.user_id;
        ctx.wait(
            async move { fabric.attach_session(session_id, user_id).await }
                .into_actor(self)
                .map(|result, act, ctx| {
                    if let Err(e) = result {
                        tracing::error!(session_id = %act.session_id, error = %e, "session attach failed");
                        let frame = ServerEvent::Error {
                            source: "connect".into(),
                            reason: e.public_message(),
                            code: e.code(),
                            retryable: e.is_retryable(),
                        };
                        if let Ok(text) = frame.to_json() {
                            ctx.text(text);
                        }
                        ctx.stop();
                    }
                }),
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(session_id = %self.session_id, user_id = %self.user_id, "websocket session stopped");
        self.inbound = None;

        // Local cleanup is immediate; presence follows asynchronously.
        let presence_update = self.fabric.disconnect(self.session_id, self.user_id);
        let session_id = self.session_id;
        let user_id = self.user_id;
        actix::spawn(async move {
            if let Err(e) = presence_update.await {
                tracing::error!(session_id = %session_id, user_id = %user_id, error = %e, "presence disconnect failed");
            }
        });
    }
}

impl Handler<Deliver> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Outbound> for WsSession {
    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                let queued = self
                    .inbound
                    .as_ref()
                    .is_some_and(|tx| tx.send(text.to_string()).is_ok());
                if !queued {
                    tracing::warn!(session_id = %self.session_id, "inbound worker gone, closing session");
                    ctx.stop();
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!(session_id = %self.session_id, "binary websocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(session_id = %self.session_id, ?reason, "websocket close received");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}
