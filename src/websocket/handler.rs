use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::models::{ClientIntent, ConnId, Connect, Disconnect, Frame, Inbound, ServerEvent};
use crate::server::MatchServer;

/// One WebSocket connection. Pure transport: decodes client frames into
/// intents for the match server and writes back whatever frames the
/// server pushes. All decisions live in the server actor.
pub struct ClientSocket {
    conn: ConnId,
    server: Addr<MatchServer>,
}

impl ClientSocket {
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: String) {
        let event = ServerEvent::Error { message };
        match serde_json::to_string(&event) {
            Ok(frame) => ctx.text(frame),
            Err(error) => warn!("failed to serialize error event: {error}"),
        }
    }
}

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started: {}", self.conn);
        self.server.do_send(Connect {
            conn: self.conn,
            addr: ctx.address().recipient(),
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        info!("WebSocket connection closed: {}", self.conn);
        self.server.do_send(Disconnect { conn: self.conn });
        Running::Stop
    }
}

impl Handler<Frame> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: Frame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Text(text)) => {
                debug!("frame from {}: {}", self.conn, text);
                match serde_json::from_str::<ClientIntent>(text.as_ref()) {
                    Ok(intent) => self.server.do_send(Inbound {
                        conn: self.conn,
                        intent,
                    }),
                    Err(error) => {
                        warn!("undecodable frame from {}: {error}", self.conn);
                        self.send_error(ctx, format!("invalid message: {error}"));
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                warn!("binary frame from {}", self.conn);
                self.send_error(ctx, "binary messages are not supported".to_string());
            }
            Ok(ws::Message::Close(reason)) => {
                info!("connection {} closed: {reason:?}", self.conn);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                ctx.stop();
            }
            Ok(ws::Message::Nop) => {}
            Err(error) => {
                warn!("protocol error on {}: {error}", self.conn);
                ctx.stop();
            }
        }
    }
}

/// WebSocket connection handler
pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    server: web::Data<Addr<MatchServer>>,
) -> Result<HttpResponse, Error> {
    let conn = Uuid::new_v4();
    info!("new WebSocket connection request, assigned {conn}");
    ws::start(
        ClientSocket {
            conn,
            server: server.get_ref().clone(),
        },
        &req,
        stream,
    )
}
