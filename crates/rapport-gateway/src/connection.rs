use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use rapport_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;
use crate::signaling::SignalPeer;

/// Server sends a Ping every 15 seconds; two missed Pongs drop the socket.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Time a fresh socket has to send `Identify`.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

struct JoinedSession {
    peer: SignalPeer,
    forwarder: JoinHandle<()>,
}

type Sessions = Arc<Mutex<HashMap<String, JoinedSession>>>;

/// Handle one WebSocket: Identify handshake, Ready, then the event loop.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    let Some(text) = encode(&ready) else {
        return;
    };
    if sender.send(Message::Text(text.into())).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, dispatcher, user_id, username).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    user_id: Uuid,
    username: String,
) {
    let (conn_id, mut user_rx) = dispatcher.register_user_channel(user_id).await;

    // Signal forwarders and command errors are connection-local.
    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            let event = tokio::select! {
                result = user_rx.recv() => match result {
                    Some(event) => event,
                    None => break,
                },
                result = local_rx.recv() => match result {
                    Some(event) => event,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let Some(text) = encode(&event) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let dispatcher_recv = dispatcher.clone();
    let sessions_recv = sessions.clone();
    let username_recv = username.clone();
    let peer_id = signal_peer_id(user_id, conn_id);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, &peer_id, cmd, &sessions_recv, &local_tx).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    leave_all_sessions(&sessions).await;
    dispatcher.unregister_user_channel(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use rapport_types::api::Claims;

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

/// Signaling identity of one socket. Two sockets of the same user in one
/// session are separate peers, so neither filters the other as an echo.
fn signal_peer_id(user_id: Uuid, conn_id: Uuid) -> String {
    format!("{}:{}", user_id, conn_id)
}

async fn handle_command(
    dispatcher: &Dispatcher,
    peer_id: &str,
    cmd: GatewayCommand,
    sessions: &Sessions,
    local_tx: &mpsc::UnboundedSender<GatewayEvent>,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::SignalJoin { session_id, data } => {
            let mut joined = sessions.lock().await;
            if joined.contains_key(&session_id) {
                signal_error(local_tx, session_id, "already joined");
                return;
            }

            let mut peer = SignalPeer::new(dispatcher.signals().clone(), session_id.clone(), peer_id);
            match peer.connect(data).await {
                Ok(mut subscription) => {
                    let tx = local_tx.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(message) = subscription.recv().await {
                            if tx.send(GatewayEvent::Signal(message)).is_err() {
                                break;
                            }
                        }
                    });
                    info!("{} joined signal session {}", peer_id, session_id);
                    joined.insert(session_id, JoinedSession { peer, forwarder });
                }
                Err(e) => signal_error(local_tx, session_id, e.to_string()),
            }
        }

        GatewayCommand::SignalSend {
            session_id,
            kind,
            to,
            data,
        } => {
            let joined = sessions.lock().await;
            let Some(session) = joined.get(&session_id) else {
                signal_error(local_tx, session_id, "not joined");
                return;
            };
            match session.peer.send(kind, to, data).await {
                Ok(true) => trace!("{} sent {:?} in {}", peer_id, kind, session_id),
                Ok(false) => debug!("{:?} in {} reached no subscribers", kind, session_id),
                Err(e) => signal_error(local_tx, session_id, e.to_string()),
            }
        }

        GatewayCommand::SignalLeave { session_id } => {
            let removed = sessions.lock().await.remove(&session_id);
            match removed {
                Some(mut session) => {
                    session.peer.disconnect().await;
                    session.forwarder.abort();
                    info!("{} left signal session {}", peer_id, session_id);
                }
                None => signal_error(local_tx, session_id, "not joined"),
            }
        }
    }
}

/// Disconnect every session this socket joined so remaining peers see
/// `user-left`.
async fn leave_all_sessions(sessions: &Sessions) {
    let drained: Vec<JoinedSession> = sessions.lock().await.drain().map(|(_, s)| s).collect();
    for mut session in drained {
        session.peer.disconnect().await;
        session.forwarder.abort();
    }
}

fn signal_error(
    local_tx: &mpsc::UnboundedSender<GatewayEvent>,
    session_id: String,
    reason: impl Into<String>,
) {
    let _ = local_tx.send(GatewayEvent::SignalError {
        session_id,
        reason: reason.into(),
    });
}

fn encode(event: &GatewayEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("failed to encode gateway event: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalBus;
    use rapport_types::signal::SignalKind;
    use serde_json::json;

    #[tokio::test]
    async fn two_sockets_of_one_user_are_distinct_peers() {
        let bus = SignalBus::default();
        let user = Uuid::new_v4();
        let phone = signal_peer_id(user, Uuid::new_v4());
        let laptop = signal_peer_id(user, Uuid::new_v4());
        assert_ne!(phone, laptop);

        let mut other_peer = SignalPeer::new(bus.clone(), "s1", "other");
        let mut phone_peer = SignalPeer::new(bus.clone(), "s1", phone.clone());
        let mut laptop_peer = SignalPeer::new(bus.clone(), "s1", laptop.clone());
        let mut other_sub = other_peer.connect(None).await.unwrap();
        let mut phone_sub = phone_peer.connect(None).await.unwrap();
        let mut laptop_sub = laptop_peer.connect(None).await.unwrap();

        // The phone hears the laptop join instead of dropping it as an echo.
        let joined = phone_sub.recv().await.unwrap();
        assert_eq!(joined.kind, SignalKind::UserJoined);
        assert_eq!(joined.from, laptop);

        phone_peer.disconnect().await;
        drop(phone_sub);

        // The laptop stays in the roster after the phone leaves.
        loop {
            let message = other_sub.recv().await.unwrap();
            if message.kind == SignalKind::UserLeft {
                assert_eq!(message.from, phone);
                break;
            }
        }
        assert!(other_sub.peers().contains(&laptop));
        assert!(!other_sub.peers().contains(&phone));

        other_peer
            .send(SignalKind::Offer, Some(laptop.clone()), Some(json!({ "sdp": "v=0" })))
            .await
            .unwrap();
        loop {
            let message = laptop_sub.recv().await.unwrap();
            if message.kind == SignalKind::Offer {
                assert_eq!(message.from, "other");
                break;
            }
        }
    }
}
