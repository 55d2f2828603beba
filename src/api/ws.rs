//! Adaptateur de transport WebSocket pour le Session Hub (C10).
//!
//! Même découpage `ws.on_upgrade(move |socket| handle_websocket(...))` que
//! `main.rs` du teacher; ping toutes les 30s (`SessionConfig::ping_s`),
//! fermeture après deux pings consécutifs sans pong, à l'image de
//! `Client::is_alive(timeout)`.
//!
//! Messages entrants (§6): verbes de contrôle `{"action":"start_simulation"|
//! "stop_simulation"}` (accusés de réception immédiats, pas de traitement de
//! pipeline) et payloads de chat utilisateur, qui entrent dans le pipeline
//! complet (C3→C4→C5→C8→C7→C10) exactement comme `POST /moderate`; le
//! `ProcessedEvent` résultant revient au client via sa propre souscription
//! au Session Hub plutôt que par une réponse directe.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::api::state::AppState;
use crate::core::orchestrator::{ModerateOptions, OrchestrationOutcome};
use crate::models::IncomingMessage;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub channel_id: Option<String>,
}

/// Forme d'un message entrant sur la session (§6). Un verbe de contrôle
/// porte un champ `action`; tout le reste est traité comme un payload de
/// chat à modérer.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundSessionMessage {
    Control { action: String },
    Chat(ChatPayload),
}

#[derive(Debug, Deserialize)]
struct ChatPayload {
    user_id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    channel_id: Option<String>,
    body: String,
    #[serde(default)]
    template_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct ControlAck<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    action: &'a str,
}

const DEFAULT_MODERATE_DEADLINE: Duration = Duration::from_secs(10);

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.channel_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, channel_id: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = state.hub.subscribe(channel_id.as_deref()).await;
    let ping_interval = state.config.session.ping_interval();
    let mut missed_pings: u32 = 0;

    let mut ticker = tokio::time::interval(ping_interval);
    ticker.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let Ok(json) = serde_json::to_string(&event) else { continue };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        subscription.touch_heartbeat();
                        state.hub.record_heartbeat(subscription.id).await;
                        missed_pings = 0;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(ack) = handle_inbound_text(&state, &text, channel_id.as_deref()).await {
                            if sender.send(Message::Text(ack)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = ticker.tick() => {
                if missed_pings >= 2 {
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                missed_pings += 1;
            }
        }
    }

    state.hub.unsubscribe(subscription.id).await;
}

/// Route un message entrant texte vers un verbe de contrôle (accusé de
/// réception renvoyé au caller) ou vers le pipeline complet de modération
/// (résultat livré via la souscription au hub, pas de réponse directe ici).
async fn handle_inbound_text(
    state: &AppState,
    text: &str,
    default_channel: Option<&str>,
) -> Option<String> {
    match serde_json::from_str::<InboundSessionMessage>(text) {
        Ok(InboundSessionMessage::Control { action }) => {
            tracing::debug!(action = %action, "session control verb received");
            serde_json::to_string(&ControlAck {
                kind: "control_ack",
                action: &action,
            })
            .ok()
        }
        Ok(InboundSessionMessage::Chat(payload)) => {
            let channel_id = payload
                .channel_id
                .or_else(|| default_channel.map(str::to_string))
                .unwrap_or_else(|| "default".to_string());
            let message =
                IncomingMessage::new(payload.user_id, payload.username, channel_id, payload.body);
            let options = ModerateOptions {
                deadline: Instant::now() + DEFAULT_MODERATE_DEADLINE,
                template_name: payload
                    .template_name
                    .unwrap_or_else(|| "moderation_prompt".to_string()),
            };
            if let OrchestrationOutcome::Processed(event) =
                state.orchestrator.moderate(message, options).await
            {
                state.metrics.message_processed().await;
                let decided = state.decision.handle(event).await;
                state
                    .orchestrator
                    .finalize_dedup(&decided.message_id, &decided)
                    .await;
            }
            None
        }
        Err(_) => {
            tracing::debug!("ignoring unrecognised inbound session message");
            None
        }
    }
}
