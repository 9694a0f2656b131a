use crate::error::AppError;
use crate::models::{SessionId, UserId};
use crate::services::MessageGateway;
use crate::state::AppState;
use crate::websocket::message_types::{WsInboundEvent, WsOutboundEvent};
use crate::websocket::{ConnectionHandle, ConnectionId};
use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: UserId,
}

// Reply to this socket only
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct TextMessage(String);

struct WsSession {
    session_id: SessionId,
    user_id: UserId,
    connection_id: ConnectionId,
    gateway: Arc<MessageGateway>,
    outbound: Option<UnboundedReceiver<String>>,
    hb: Instant,
}

impl WsSession {
    fn new(
        session_id: SessionId,
        user_id: UserId,
        connection_id: ConnectionId,
        gateway: Arc<MessageGateway>,
        outbound: UnboundedReceiver<String>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            connection_id,
            gateway,
            outbound: Some(outbound),
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(
                    session_id = %act.session_id,
                    user_id = %act.user_id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_event(&self, event: WsInboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event {
            WsInboundEvent::Message { text } => {
                if text.trim().is_empty() {
                    ctx.text(WsOutboundEvent::error("bad_request", "message text is empty").to_json());
                    return;
                }

                let gateway = self.gateway.clone();
                let session_id = self.session_id;
                let user_id = self.user_id;
                let addr = ctx.address();

                // The sender's own copy arrives through the relay like everyone else's.
                actix::spawn(async move {
                    if let Err(e) = gateway.receive(session_id, user_id, &text).await {
                        tracing::warn!(
                            session_id = %session_id,
                            user_id = %user_id,
                            error = %e,
                            "Failed to accept WebSocket message"
                        );
                        addr.do_send(TextMessage(error_event(&e).to_json()));
                    }
                });
            }
        }
    }
}

fn error_event(e: &AppError) -> WsOutboundEvent {
    match e {
        AppError::UnauthenticatedSender => {
            WsOutboundEvent::error("unauthenticated_sender", "complete a key exchange first")
        }
        AppError::StoreUnavailable(_)
        | AppError::CacheUnavailable(_)
        | AppError::RelayUnavailable(_) => {
            WsOutboundEvent::error("unavailable", "service temporarily unavailable")
        }
        other => WsOutboundEvent::error("internal", other.to_string()),
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            session_id = %self.session_id,
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            "WebSocket session started"
        );

        self.hb(ctx);

        if let Some(rx) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }
    }

    // Futures queued with `ctx.wait` are not polled once the actor is
    // stopping, so deregistration runs as a task on this arbiter. Until it
    // does, the registry skips this connection: its receiver is dropped with
    // the context, so counts ignore it and broadcasts prune it.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            session_id = %self.session_id,
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            "WebSocket session stopped"
        );

        let registry = self.gateway.registry().clone();
        let session_id = self.session_id;
        let connection_id = self.connection_id;

        actix::spawn(async move {
            registry.remove(session_id, connection_id).await;
        });
    }
}

impl Handler<TextMessage> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: TextMessage, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

// Frames fanned out by the registry. The stream ends when the registry drops
// this connection, which stops the actor.
impl StreamHandler<String> for WsSession {
    fn handle(&mut self, frame: String, ctx: &mut Self::Context) {
        ctx.text(frame);
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
                match serde_json::from_str::<WsInboundEvent>(&text) {
                    Ok(event) => self.handle_event(event, ctx),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to parse WS message");
                        ctx.text(WsOutboundEvent::error("bad_request", "unrecognised event").to_json());
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(?reason, "WebSocket close message received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// Joins the session before the upgrade so the relay subscription is live
/// by the time the socket can receive anything.
#[get("/ws/sessions/{session_id}")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<SessionId>,
    query: web::Query<WsParams>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let session_id = path.into_inner();
    let user_id = query.into_inner().user_id;

    let (handle, rx) = ConnectionHandle::new(user_id);
    let connection_id = handle.id();

    state
        .registry
        .add(session_id, handle)
        .await
        .map_err(AppError::from)?;

    let session = WsSession::new(
        session_id,
        user_id,
        connection_id,
        state.gateway.clone(),
        rx,
    );

    match ws::start(session, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            state.registry.remove(session_id, connection_id).await;
            Err(e)
        }
    }
}
