/// WebSocket synchronization protocol and the client-side sync manager
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    Backoff, ChatCommand, ChatEvent, ChatMessage, ChatStore, CollaborationError,
    CollaborationSession, CollaborationUser, DocumentClient, DocumentSnapshot, Drawing, NewSession,
    OfflineQueue, OperationId, PresenceUpdate, Result, SessionAction, SessionId, SessionStatus,
    TextOp, TextOperation, UserId, WhiteboardEvent, WhiteboardSurface,
};

/// Message types exchanged between client and server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    // Connection management
    Create {
        session: NewSession,
        user: CollaborationUser,
    },
    Join {
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        invite_code: Option<String>,
        user: CollaborationUser,
    },
    Joined {
        user_id: UserId,
        session: CollaborationSession,
        document: DocumentSnapshot,
        drawings: Vec<Drawing>,
        messages: Vec<ChatMessage>,
    },
    Leave,
    UserJoined {
        user: CollaborationUser,
    },
    UserLeft {
        user_id: UserId,
    },

    // Session lifecycle
    SessionControl {
        action: SessionAction,
        #[serde(default)]
        expected_version: Option<u64>,
    },
    SessionUpdated {
        session: CollaborationSession,
    },

    // Document synchronization
    Operation {
        operation: TextOperation,
    },
    OperationAck {
        operation_id: OperationId,
        version: u64,
    },
    /// The sender's batch was refused; `document` is the server state to resync from
    OperationRejected {
        operation_id: OperationId,
        reason: String,
        document: DocumentSnapshot,
    },
    SyncRequest {
        since_version: u64,
    },
    SyncResponse {
        operations: Vec<TextOperation>,
        version: u64,
    },

    // Presence; `user_id` is filled in by the server when relaying
    Presence {
        #[serde(default)]
        user_id: Option<UserId>,
        update: PresenceUpdate,
    },

    Whiteboard {
        event: WhiteboardEvent,
    },
    /// The sender's whiteboard event was refused; `drawings` is the authoritative board
    WhiteboardRejected {
        reason: String,
        drawings: Vec<Drawing>,
    },

    Chat {
        command: ChatCommand,
    },
    ChatEvent {
        event: ChatEvent,
    },

    Error {
        message: String,
    },

    // Heartbeat
    Ping,
    Pong,
}

impl SyncMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn error(err: impl std::fmt::Display) -> Self {
        SyncMessage::Error {
            message: err.to_string(),
        }
    }

    /// Worth keeping while offline; presence and heartbeats go stale
    fn is_queueable(&self) -> bool {
        matches!(self, SyncMessage::Chat { .. } | SyncMessage::Whiteboard { .. })
    }
}

/// Client-side sync manager
///
/// Holds the local replicas (document, whiteboard, chat) and the outbound
/// channel of the current connection, if any.
pub struct SyncClient {
    session_id: SessionId,
    user: CollaborationUser,
    session: Option<CollaborationSession>,
    document: DocumentClient,
    whiteboard: WhiteboardSurface,
    chat: ChatStore,
    outbound: Option<mpsc::UnboundedSender<SyncMessage>>,
    offline: OfflineQueue,
    /// Queued drawings replayed on reconnect, re-applied over the join snapshot
    replayed_drawings: Vec<WhiteboardEvent>,
    backoff: Backoff,
}

impl SyncClient {
    pub fn new(session_id: SessionId, user: CollaborationUser) -> Self {
        Self {
            session_id,
            document: DocumentClient::new(user.id),
            whiteboard: WhiteboardSurface::new(session_id),
            chat: ChatStore::replica(session_id),
            offline: OfflineQueue::new(session_id, user.id),
            user,
            session: None,
            outbound: None,
            replayed_drawings: Vec::new(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    pub fn session(&self) -> Option<&CollaborationSession> {
        self.session.as_ref()
    }

    pub fn document(&self) -> &DocumentClient {
        &self.document
    }

    pub fn whiteboard(&self) -> &WhiteboardSurface {
        &self.whiteboard
    }

    pub fn chat(&self) -> &ChatStore {
        &self.chat
    }

    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.offline
    }

    /// Restore a queue persisted by a previous run
    pub fn restore_offline_queue(&mut self, queue: OfflineQueue) {
        self.offline = queue;
    }

    pub fn is_connected(&self) -> bool {
        self.outbound
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Attach a fresh connection and replay everything the server may have missed:
    /// join, a sync request from our version, the in-flight batch, then queued messages.
    pub fn reconnected(&mut self, tx: mpsc::UnboundedSender<SyncMessage>) -> Result<()> {
        self.outbound = Some(tx);
        self.backoff.reset();

        self.send(SyncMessage::Join {
            session_id: Some(self.session_id),
            invite_code: None,
            user: self.user.clone(),
        })?;
        self.send(SyncMessage::SyncRequest {
            since_version: self.document.version(),
        })?;
        if let Some(operation) = self.document.in_flight().cloned() {
            self.send(SyncMessage::Operation { operation })?;
        }

        let queued = self.offline.drain_pending();
        debug!(
            "Reconnected to {} at v{}, replaying {} queued messages",
            self.session_id,
            self.document.version(),
            queued.len()
        );
        for message in queued {
            if let SyncMessage::Whiteboard { event } = &message {
                self.replayed_drawings.push(event.clone());
            }
            self.send(message)?;
        }
        Ok(())
    }

    pub fn disconnected(&mut self) {
        self.outbound = None;
        self.offline.last_known_version = self.document.version();
    }

    /// Delay before the next reconnect attempt, `None` once attempts are exhausted
    pub fn next_reconnect_delay(&mut self) -> Option<Duration> {
        self.backoff.next_delay()
    }

    /// Apply a local document edit and send it if nothing is in flight
    pub fn edit(&mut self, ops: Vec<TextOp>) -> Result<()> {
        self.require_editor("edit the document")?;
        if let Some(operation) = self.document.apply_local(ops)? {
            self.send_live(SyncMessage::Operation { operation })?;
        }
        Ok(())
    }

    pub fn update_presence(&mut self, update: PresenceUpdate) -> Result<()> {
        self.send_live(SyncMessage::Presence {
            user_id: None,
            update,
        })
    }

    /// Run a whiteboard action on the local surface and forward the resulting event
    pub fn draw<F>(&mut self, action: F) -> Result<()>
    where
        F: FnOnce(&mut WhiteboardSurface, UserId) -> session::Result<WhiteboardEvent>,
    {
        self.require_editor("draw on the whiteboard")?;
        let event = action(&mut self.whiteboard, self.user.id)?;
        self.send_or_queue(SyncMessage::Whiteboard { event })
    }

    pub fn send_chat(&mut self, command: ChatCommand) -> Result<()> {
        self.send_or_queue(SyncMessage::Chat { command })
    }

    /// Request a lifecycle change, guarded by the last session version we saw
    pub fn control(&mut self, action: SessionAction) -> Result<()> {
        let expected_version = self.session.as_ref().map(|s| s.version);
        self.send_live(SyncMessage::SessionControl {
            action,
            expected_version,
        })
    }

    pub fn request_sync(&mut self) -> Result<()> {
        self.send_live(SyncMessage::SyncRequest {
            since_version: self.document.version(),
        })
    }

    pub fn ping(&mut self) -> Result<()> {
        self.send_live(SyncMessage::Ping)
    }

    /// Incorporate a message from the server
    pub fn handle_incoming(&mut self, message: SyncMessage) -> Result<()> {
        match message {
            SyncMessage::Joined {
                session,
                document,
                drawings,
                messages,
                ..
            } => {
                if !self.document.has_pending() && document.version >= self.document.version() {
                    self.document.reset(&document)?;
                }
                self.whiteboard = WhiteboardSurface::from_drawings(self.session_id, drawings)?;
                self.chat = ChatStore::replica(self.session_id);
                for message in messages {
                    self.chat.apply_event(&ChatEvent::Sent { message });
                }
                for event in std::mem::take(&mut self.replayed_drawings) {
                    if let Err(e) = self.whiteboard.apply(&event) {
                        warn!("Could not re-apply offline drawing: {}", e);
                    }
                }
                self.session = Some(session);
            }
            SyncMessage::SessionUpdated { session } => self.session = Some(session),
            // membership changes bump the session version on the server too
            SyncMessage::UserJoined { user } => {
                if let Some(session) = self.session.as_mut() {
                    match session.participant_mut(user.id) {
                        Some(existing) => *existing = user,
                        None => {
                            session.participants.push(user);
                            session.version += 1;
                        }
                    }
                }
            }
            SyncMessage::UserLeft { user_id } => {
                if let Some(session) = self.session.as_mut() {
                    let before = session.participants.len();
                    session.participants.retain(|p| p.id != user_id);
                    if session.participants.len() < before {
                        session.version += 1;
                    }
                }
            }
            SyncMessage::Operation { operation } => {
                if let Some(next) = self.document.receive_remote(&operation)? {
                    self.send_live(SyncMessage::Operation { operation: next })?;
                }
            }
            SyncMessage::OperationAck {
                operation_id,
                version,
            } => {
                if let Some(next) = self.document.receive_ack(operation_id, version)? {
                    self.send_live(SyncMessage::Operation { operation: next })?;
                }
            }
            SyncMessage::OperationRejected {
                operation_id,
                reason,
                document,
            } => {
                let dropped = self.document.reject(operation_id, &document)?;
                if dropped > 0 {
                    warn!(
                        "Edit rejected in {} ({}), discarded {} pending ops and resynced at v{}",
                        self.session_id,
                        reason,
                        dropped,
                        document.version
                    );
                }
            }
            SyncMessage::SyncResponse { operations, .. } => {
                for operation in &operations {
                    if let Some(next) = self.document.receive_remote(operation)? {
                        self.send_live(SyncMessage::Operation { operation: next })?;
                    }
                }
            }
            SyncMessage::Presence {
                user_id: Some(user_id),
                update,
            } => {
                if let Some(participant) = self
                    .session
                    .as_mut()
                    .and_then(|s| s.participant_mut(user_id))
                {
                    update.apply_to(&mut participant.presence);
                }
            }
            SyncMessage::Whiteboard { event } => self.whiteboard.apply(&event)?,
            SyncMessage::WhiteboardRejected { reason, drawings } => {
                warn!("Drawing rejected in {}: {}", self.session_id, reason);
                self.whiteboard = WhiteboardSurface::from_drawings(self.session_id, drawings)?;
            }
            SyncMessage::ChatEvent { event } => self.chat.apply_event(&event),
            SyncMessage::Error { message } => warn!("Server error in {}: {}", self.session_id, message),
            SyncMessage::Pong => trace!("pong from {}", self.session_id),
            other => debug!("Ignoring unexpected message {:?}", other),
        }
        Ok(())
    }

    /// Mirror of the server's edit gate, checked against the last session state we saw
    fn require_editor(&self, what: &str) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        if session.status != SessionStatus::Active {
            return Err(CollaborationError::InvalidOp(format!(
                "cannot {} while the session is {:?}",
                what, session.status
            )));
        }
        let can_edit = session
            .permission_of(self.user.id)
            .map(|p| p.can_edit())
            .unwrap_or(false);
        if !can_edit {
            return Err(CollaborationError::PermissionDenied(format!(
                "view-only participants may not {}",
                what
            )));
        }
        Ok(())
    }

    fn send(&self, message: SyncMessage) -> Result<()> {
        let tx = self
            .outbound
            .as_ref()
            .ok_or_else(|| CollaborationError::NetworkError("not connected".to_string()))?;
        tx.send(message)
            .map_err(|e| CollaborationError::NetworkError(e.to_string()))
    }

    /// Send now or drop; used for state the next sync supersedes
    fn send_live(&mut self, message: SyncMessage) -> Result<()> {
        if !self.is_connected() {
            trace!("Offline, dropping {:?}", message);
            return Ok(());
        }
        self.send(message)
    }

    fn send_or_queue(&mut self, message: SyncMessage) -> Result<()> {
        if self.is_connected() {
            return self.send(message);
        }
        if message.is_queueable() {
            self.offline.enqueue(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DrawingPoint, DrawingTool, NewMessage, SessionType};

    fn client() -> SyncClient {
        SyncClient::new(
            SessionId::new(),
            CollaborationUser::new(UserId::new(), "Alice"),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SyncMessage>) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_wire_format_is_tagged_snake_case() {
        let json = SyncMessage::SyncRequest { since_version: 3 }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"sync_request","since_version":3}"#);

        let parsed = SyncMessage::from_json(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(parsed, SyncMessage::Ping);

        let parsed = SyncMessage::from_json(
            r#"{"type":"session_control","action":"start"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            SyncMessage::SessionControl {
                action: SessionAction::Start,
                expected_version: None
            }
        );
        assert!(SyncMessage::from_json(r#"{"type":"nope"}"#).is_err());
    }

    #[test]
    fn test_offline_queues_chat_and_whiteboard_only() {
        let mut client = client();

        client.update_presence(PresenceUpdate::Heartbeat).unwrap();
        client
            .send_chat(ChatCommand::Send {
                message: NewMessage::text("are you there?"),
            })
            .unwrap();
        client
            .draw(|board, me| {
                board.add_text(me, "todo", "#000", 12.0, DrawingPoint::new(0.0, 0.0))
            })
            .unwrap();
        client.edit(vec![TextOp::insert(0, "x")]).unwrap();

        assert_eq!(client.offline_queue().len(), 2);
        assert_eq!(client.whiteboard().len(), 1);
        assert!(client.document().has_pending());
    }

    #[test]
    fn test_reconnect_replays_in_order() {
        let mut client = client();
        client.edit(vec![TextOp::insert(0, "draft")]).unwrap();
        client
            .send_chat(ChatCommand::Send {
                message: NewMessage::text("back soon"),
            })
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.reconnected(tx).unwrap();
        let sent = drain(&mut rx);

        assert_eq!(sent.len(), 4);
        assert!(matches!(sent[0], SyncMessage::Join { .. }));
        assert!(matches!(sent[1], SyncMessage::SyncRequest { since_version: 0 }));
        assert!(matches!(sent[2], SyncMessage::Operation { .. }));
        assert!(matches!(sent[3], SyncMessage::Chat { .. }));
        assert!(client.offline_queue().is_empty());
    }

    #[test]
    fn test_ack_releases_buffered_edit() {
        let mut client = client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.reconnected(tx).unwrap();
        drain(&mut rx);

        client.edit(vec![TextOp::insert(0, "a")]).unwrap();
        client.edit(vec![TextOp::insert(1, "b")]).unwrap();
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        let SyncMessage::Operation { operation } = &sent[0] else {
            panic!("expected operation");
        };

        client
            .handle_incoming(SyncMessage::OperationAck {
                operation_id: operation.id,
                version: 1,
            })
            .unwrap();
        let sent = drain(&mut rx);
        assert!(matches!(
            &sent[..],
            [SyncMessage::Operation { operation }] if operation.ops == vec![TextOp::insert(1, "b")]
        ));
    }

    #[test]
    fn test_remote_whiteboard_event_applied() {
        let mut client = client();
        let other = UserId::new();
        let mut remote = WhiteboardSurface::new(client.session_id);
        let event = remote
            .begin_stroke(other, DrawingTool::Pen, "#111", 2.0, DrawingPoint::new(1.0, 1.0))
            .unwrap();

        client
            .handle_incoming(SyncMessage::Whiteboard { event })
            .unwrap();
        assert!(client.whiteboard().active_stroke(other).is_some());
    }

    #[tokio::test]
    async fn test_closed_channel_counts_as_disconnected() {
        let mut client = client();
        let (tx, rx) = mpsc::unbounded_channel();
        client.reconnected(tx).unwrap();
        assert!(client.is_connected());

        drop(rx);
        assert!(!client.is_connected());
        client
            .send_chat(ChatCommand::Send {
                message: NewMessage::text("queued"),
            })
            .unwrap();
        assert_eq!(client.offline_queue().len(), 1);
    }

    #[test]
    fn test_local_gate_follows_session_state() {
        let mut client = client();
        let me = client.user.clone();
        let mut session = CollaborationSession::new(
            NewSession::new("Pairing", SessionType::PairProgramming, 2),
            me.clone(),
        )
        .unwrap();
        session.start(me.id).unwrap();
        session.pause(me.id).unwrap();
        client
            .handle_incoming(SyncMessage::SessionUpdated {
                session: session.clone(),
            })
            .unwrap();

        assert!(matches!(
            client.edit(vec![TextOp::insert(0, "x")]),
            Err(CollaborationError::InvalidOp(_))
        ));
        assert!(client
            .draw(|board, me| board.add_text(me, "x", "#000", 12.0, DrawingPoint::new(0.0, 0.0)))
            .is_err());
        assert!(client.whiteboard().is_empty());
        assert!(!client.document().has_pending());

        session.resume(me.id).unwrap();
        client
            .handle_incoming(SyncMessage::SessionUpdated { session })
            .unwrap();
        client.edit(vec![TextOp::insert(0, "x")]).unwrap();
        assert!(client.document().has_pending());
    }

    #[test]
    fn test_rejected_edit_resyncs_and_unblocks_sending() {
        let mut client = client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.reconnected(tx).unwrap();
        drain(&mut rx);

        client.edit(vec![TextOp::insert(0, "lost")]).unwrap();
        client.edit(vec![TextOp::insert(0, "more ")]).unwrap();
        let sent = drain(&mut rx);
        let [SyncMessage::Operation { operation }] = &sent[..] else {
            panic!("expected one operation, got {:?}", sent);
        };

        client
            .handle_incoming(SyncMessage::OperationRejected {
                operation_id: operation.id,
                reason: "session is paused".to_string(),
                document: DocumentSnapshot {
                    content: String::new(),
                    version: 0,
                    last_modified_by: None,
                    last_modified_at: None,
                },
            })
            .unwrap();
        assert_eq!(client.document().content(), "");
        assert!(!client.document().has_pending());

        client.edit(vec![TextOp::insert(0, "again")]).unwrap();
        assert!(matches!(
            &drain(&mut rx)[..],
            [SyncMessage::Operation { operation }] if operation.ops == vec![TextOp::insert(0, "again")]
        ));
    }

    #[test]
    fn test_rejected_drawing_restores_server_board() {
        let mut client = client();
        client
            .draw(|board, me| board.add_text(me, "mine", "#000", 12.0, DrawingPoint::new(0.0, 0.0)))
            .unwrap();
        assert_eq!(client.whiteboard().len(), 1);

        client
            .handle_incoming(SyncMessage::WhiteboardRejected {
                reason: "view-only participants may not draw on the whiteboard".to_string(),
                drawings: Vec::new(),
            })
            .unwrap();
        assert!(client.whiteboard().is_empty());
    }
}
