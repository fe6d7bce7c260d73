use collaboration::{SessionId, SessionRegistry, SyncMessage, UserId};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

type Tx = mpsc::UnboundedSender<Message>;

/// Where a socket sits in a session once it has joined
struct Membership {
    session_id: SessionId,
    user_id: UserId,
    /// Ends when the session drops this subscription
    forwarder: JoinHandle<()>,
}

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, registry: SessionRegistry) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                debug!("Failed to send message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut membership: Option<Membership> = None;

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("Error receiving from {}: {}", addr, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let result = match SyncMessage::from_json(&text) {
                    Ok(message) => route(message, &registry, &tx, &mut membership).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("Rejected message from {}: {}", addr, e);
                    send_message(&tx, &SyncMessage::error(e));
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                info!("Client {} requested close", addr);
                break;
            }
            _ => {}
        }
    }

    if let Some(Membership {
        session_id,
        user_id,
        forwarder,
    }) = membership
    {
        // dropping our receiver closes our channel, so release can tell it from a newer socket's
        forwarder.abort();
        let _ = forwarder.await;
        match registry.release(session_id, user_id).await {
            Ok(true) => debug!("{} disconnected from {}", user_id, session_id),
            Ok(false) => debug!("{} kept a newer connection to {}", user_id, session_id),
            Err(e) => debug!("Release of {} from {} skipped: {}", user_id, session_id, e),
        }
    }

    send_task.abort();
    info!("Connection closed: {}", addr);
}

async fn route(
    message: SyncMessage,
    registry: &SessionRegistry,
    tx: &Tx,
    membership: &mut Option<Membership>,
) -> collaboration::Result<()> {
    if let Some(current) = membership.as_ref() {
        let leaving = matches!(message, SyncMessage::Leave);
        registry
            .handle(current.session_id, current.user_id, message)
            .await?;
        if leaving {
            *membership = None;
        }
        return Ok(());
    }

    let (session_id, user_id, updates) = match message {
        SyncMessage::Join {
            session_id,
            invite_code,
            user,
        } => {
            let user_id = user.id;
            match (session_id, invite_code) {
                (Some(session_id), _) => {
                    let updates = registry.join(session_id, user).await?;
                    (session_id, user_id, updates)
                }
                (None, Some(code)) => {
                    let (session_id, updates) = registry.join_by_invite(&code, user).await?;
                    (session_id, user_id, updates)
                }
                (None, None) => {
                    return Err(collaboration::CollaborationError::InvalidOp(
                        "join needs a session id or an invite code".to_string(),
                    ))
                }
            }
        }
        SyncMessage::Create { session, user } => {
            let user_id = user.id;
            let created = registry.create_session(session, user.clone()).await?;
            let updates = registry.join(created.id, user).await?;
            (created.id, user_id, updates)
        }
        SyncMessage::Ping => {
            send_message(tx, &SyncMessage::Pong);
            return Ok(());
        }
        _ => {
            return Err(collaboration::CollaborationError::InvalidOp(
                "join or create a session first".to_string(),
            ))
        }
    };

    info!("{} attached to session {}", user_id, session_id);
    *membership = Some(Membership {
        session_id,
        user_id,
        forwarder: tokio::spawn(forward_updates(updates, tx.clone())),
    });
    Ok(())
}

/// Relay session traffic to the socket; the session dropping us closes it
async fn forward_updates(mut updates: mpsc::UnboundedReceiver<SyncMessage>, tx: Tx) {
    while let Some(message) = updates.recv().await {
        if !send_message(&tx, &message) {
            return;
        }
    }
    let _ = tx.send(Message::Close(None));
}

fn send_message(tx: &Tx, message: &SyncMessage) -> bool {
    match message.to_json() {
        Ok(json) => tx.send(Message::Text(json)).is_ok(),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            true
        }
    }
}
