//! Live reservation updates over WebSocket.
//!
//! The backend speaks socket.io v4 over a plain WebSocket: `0` opens the
//! engine session (we answer `40` to join the default namespace), `2` is a
//! heartbeat ping (answered with `3`), and `42[event, payload]` carries an
//! event. `reservation` events of type `updated` are merged into the
//! coordinator as snapshots.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::models::Reservation;
use crate::reservations::ReservationCoordinator;
use crate::session::SessionManager;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

const RESERVATION_EVENT: &str = "reservation";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A decoded socket.io text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open,
    Ping,
    Connected,
    Disconnect,
    Event { name: String, payload: Value },
    Unknown,
}

pub fn parse_packet(text: &str) -> Packet {
    match text.as_bytes().first() {
        Some(b'0') => Packet::Open,
        Some(b'1') => Packet::Disconnect,
        Some(b'2') => Packet::Ping,
        Some(b'4') => parse_message(&text[1..]),
        _ => Packet::Unknown,
    }
}

fn parse_message(text: &str) -> Packet {
    match text.as_bytes().first() {
        Some(b'0') => Packet::Connected,
        Some(b'1') => Packet::Disconnect,
        Some(b'2') => {
            // Optional ack id between the type and the array.
            let body = text[1..].trim_start_matches(|c: char| c.is_ascii_digit());
            let Ok(Value::Array(mut parts)) = serde_json::from_str::<Value>(body) else {
                return Packet::Unknown;
            };
            if parts.is_empty() {
                return Packet::Unknown;
            }
            let Value::String(name) = parts.remove(0) else {
                return Packet::Unknown;
            };
            let payload = if parts.is_empty() {
                Value::Null
            } else {
                parts.remove(0)
            };
            Packet::Event { name, payload }
        }
        _ => Packet::Unknown,
    }
}

/// The reservation carried by an `updated` event, if any.
pub fn updated_reservation(payload: &Value) -> Option<Reservation> {
    if payload.get("type").and_then(Value::as_str) != Some("updated") {
        return None;
    }
    let data = payload.get("data")?.clone();
    match serde_json::from_value(data) {
        Ok(reservation) => Some(reservation),
        Err(e) => {
            warn!(error = %e, "undecodable reservation update");
            None
        }
    }
}

pub struct RealtimeListener {
    config: Arc<ClientConfig>,
    session: Arc<SessionManager>,
    coordinator: Arc<ReservationCoordinator>,
    shutdown: CancellationToken,
}

impl RealtimeListener {
    pub fn new(
        config: Arc<ClientConfig>,
        session: Arc<SessionManager>,
        coordinator: Arc<ReservationCoordinator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            session,
            coordinator,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect, listen, and reconnect with exponential backoff until
    /// shutdown.
    pub async fn run(self) {
        info!(url = %self.config.ws_url, "realtime listener started");
        let mut delay = INITIAL_RECONNECT_DELAY;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match tokio_tungstenite::connect_async(self.config.ws_url.as_str()).await {
                Ok((ws, _response)) => {
                    info!("realtime connected");
                    delay = INITIAL_RECONNECT_DELAY;
                    self.run_session(ws).await;
                }
                Err(e) => {
                    warn!(delay_secs = delay.as_secs(), "realtime connection failed: {e}");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }

        info!("realtime listener stopped");
    }

    async fn run_session(&self, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = sink.close().await;
                    return;
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_text(text.as_str()) {
                                if let Err(e) = sink.send(Message::Text(reply.into())).await {
                                    warn!("realtime send failed: {e}");
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("realtime connection closed by server");
                            return;
                        }
                        Some(Err(e)) => {
                            warn!("realtime error: {e}");
                            return;
                        }
                        None => {
                            info!("realtime stream ended");
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// React to one text frame; returns the frame to send back, if any.
    fn handle_text(&self, text: &str) -> Option<String> {
        match parse_packet(text) {
            Packet::Open => {
                let auth = self
                    .session
                    .access_token()
                    .map(|token| json!({ "token": token.as_str() }).to_string())
                    .unwrap_or_default();
                Some(format!("40{auth}"))
            }
            Packet::Ping => Some("3".to_string()),
            Packet::Connected => {
                debug!("realtime namespace joined");
                None
            }
            Packet::Event { name, payload } if name == RESERVATION_EVENT => {
                if let Some(reservation) = updated_reservation(&payload) {
                    debug!(reservation_id = %reservation.id, "reservation pushed");
                    self.coordinator.apply_snapshot(reservation);
                }
                None
            }
            Packet::Event { name, .. } => {
                debug!(event = %name, "ignoring realtime event");
                None
            }
            Packet::Disconnect | Packet::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReservationStatus;
    use crate::testing::harness_logged_in;
    use crate::transport::testing::ScriptedTransport;
    use crate::transport::HttpResponse;

    #[test]
    fn parses_engine_and_socket_frames() {
        assert_eq!(parse_packet("0{\"sid\":\"abc\"}"), Packet::Open);
        assert_eq!(parse_packet("2"), Packet::Ping);
        assert_eq!(parse_packet("40{\"sid\":\"x\"}"), Packet::Connected);
        assert_eq!(
            parse_packet("42[\"reservation\",{\"type\":\"updated\"}]"),
            Packet::Event {
                name: "reservation".into(),
                payload: json!({ "type": "updated" })
            }
        );
        assert_eq!(
            parse_packet("4212[\"ping\"]"),
            Packet::Event {
                name: "ping".into(),
                payload: Value::Null
            }
        );
        assert_eq!(parse_packet("42not json"), Packet::Unknown);
        assert_eq!(parse_packet(""), Packet::Unknown);
    }

    #[test]
    fn only_updated_events_carry_a_reservation() {
        assert!(updated_reservation(&json!({ "type": "deleted", "data": { "_id": "r1" } })).is_none());
        assert!(updated_reservation(&json!({ "type": "updated", "data": [] })).is_none());
        assert_eq!(
            updated_reservation(&json!({ "type": "updated", "data": { "_id": "r1" } }))
                .map(|r| r.id),
            Some("r1".to_string())
        );
    }

    #[tokio::test]
    async fn frames_drive_handshake_and_snapshots() {
        let h = harness_logged_in(ScriptedTransport::new(|_| {
            Ok(HttpResponse::json(200, &json!({})))
        }));
        let coordinator = Arc::new(ReservationCoordinator::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.local),
        ));
        let listener = RealtimeListener::new(
            Arc::clone(&h.config),
            Arc::clone(&h.session),
            Arc::clone(&coordinator),
            CancellationToken::new(),
        );

        assert_eq!(
            listener.handle_text("0{\"sid\":\"abc\"}").as_deref(),
            Some("40{\"token\":\"access-0\"}")
        );
        assert_eq!(listener.handle_text("2").as_deref(), Some("3"));

        let push = json!([
            "reservation",
            { "type": "updated", "data": { "_id": "r1", "status": "ouverte" } }
        ]);
        assert_eq!(listener.handle_text(&format!("42{push}")), None);
        let record = coordinator.reservation("r1").expect("merged");
        assert_eq!(record.status, ReservationStatus::Open);
        assert_eq!(coordinator.opened().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_listener_stops_without_connecting() {
        let h = harness_logged_in(ScriptedTransport::new(|_| {
            Ok(HttpResponse::json(200, &json!({})))
        }));
        let coordinator = Arc::new(ReservationCoordinator::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.local),
        ));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let listener = RealtimeListener::new(
            Arc::clone(&h.config),
            Arc::clone(&h.session),
            coordinator,
            shutdown,
        );
        listener.spawn().await.expect("listener task");
    }
}
