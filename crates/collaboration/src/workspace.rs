/// Authoritative state of one live session and its connected subscribers
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    transform_presence, ChatStore, CollaborationConfig, CollaborationError, CollaborationSession,
    CollaborationUser, ConnectionStatus, DocumentState, PresenceTracker, PresenceUpdate, Result,
    SessionAction, SessionId, SessionStatus, SyncMessage, TextOperation, UserId, WhiteboardEvent,
    WhiteboardSurface,
};

pub struct SessionWorkspace {
    session: CollaborationSession,
    document: DocumentState,
    whiteboard: WhiteboardSurface,
    chat: ChatStore,
    presence: PresenceTracker,
    subscribers: HashMap<UserId, mpsc::UnboundedSender<SyncMessage>>,
}

impl SessionWorkspace {
    pub fn new(session: CollaborationSession, config: &CollaborationConfig) -> Self {
        Self {
            document: DocumentState::new(),
            whiteboard: WhiteboardSurface::new(session.id),
            chat: ChatStore::new(session.id, config.max_message_len),
            presence: PresenceTracker::from_config(config),
            subscribers: HashMap::new(),
            session,
        }
    }

    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn session(&self) -> &CollaborationSession {
        &self.session
    }

    pub fn document(&self) -> &DocumentState {
        &self.document
    }

    pub fn whiteboard(&self) -> &WhiteboardSurface {
        &self.whiteboard
    }

    pub fn chat(&self) -> &ChatStore {
        &self.chat
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_subscribed(&self, user_id: UserId) -> bool {
        self.subscribers.contains_key(&user_id)
    }

    /// Join as a new participant, or reconnect a participant who still holds a seat.
    ///
    /// The returned receiver starts with a `Joined` snapshot.
    pub fn join(&mut self, user: CollaborationUser) -> Result<mpsc::UnboundedReceiver<SyncMessage>> {
        let user_id = user.id;
        if self.session.status.is_terminal() {
            return Err(CollaborationError::InvalidOp(format!(
                "session {} is {:?}",
                self.session.id, self.session.status
            )));
        }

        if self.session.is_participant(user_id) {
            self.presence
                .mark_connected(&mut self.session, user_id, Utc::now())?;
            info!("{} reconnected to {}", user_id, self.session.id);
        } else {
            self.session.add_participant(user)?;
            info!(
                "{} joined {} ({}/{})",
                user_id,
                self.session.id,
                self.session.participants.len(),
                self.session.max_participants
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SyncMessage::Joined {
            user_id,
            session: self.session.clone(),
            document: self.document.snapshot(),
            drawings: self.whiteboard.drawings().cloned().collect(),
            messages: self.chat.messages().to_vec(),
        })
        .map_err(|e| CollaborationError::NetworkError(e.to_string()))?;

        if let Some(participant) = self.session.participant(user_id).cloned() {
            self.broadcast(SyncMessage::UserJoined { user: participant }, Some(user_id));
        }
        self.subscribers.insert(user_id, tx);
        Ok(rx)
    }

    /// Give up the seat
    pub fn leave(&mut self, user_id: UserId) -> Result<()> {
        self.session.remove_participant(user_id)?;
        self.subscribers.remove(&user_id);
        info!("{} left {}", user_id, self.session.id);
        self.broadcast(SyncMessage::UserLeft { user_id }, None);
        Ok(())
    }

    /// A socket closed. Only marks the user disconnected when the channel the
    /// session holds for them is the closed one; a newer connection keeps the seat live.
    pub fn release(&mut self, user_id: UserId) -> Result<bool> {
        match self.subscribers.get(&user_id) {
            Some(tx) if tx.is_closed() => {
                self.disconnect(user_id)?;
                Ok(true)
            }
            Some(_) => {
                debug!("{} still has a live connection to {}", user_id, self.session.id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Connection dropped; the seat is kept for a reconnect
    pub fn disconnect(&mut self, user_id: UserId) -> Result<()> {
        self.subscribers.remove(&user_id);
        let presence = self
            .presence
            .mark_disconnected(&mut self.session, user_id, Utc::now())?;
        self.broadcast(
            SyncMessage::Presence {
                user_id: Some(user_id),
                update: PresenceUpdate::Connection {
                    status: presence.connection,
                },
            },
            Some(user_id),
        );
        Ok(())
    }

    /// Dispatch one client message from `user_id`
    pub fn handle(&mut self, user_id: UserId, message: SyncMessage) -> Result<()> {
        let participant = self
            .session
            .participant_mut(user_id)
            .ok_or(CollaborationError::NotJoined(user_id))?;
        participant.presence.touch();

        match message {
            SyncMessage::Leave => self.leave(user_id),
            SyncMessage::SessionControl {
                action,
                expected_version,
            } => self.control(user_id, action, expected_version),
            SyncMessage::Operation { operation } => {
                let operation_id = operation.id;
                let result = self.submit_operation(user_id, operation);
                if let Err(e) = &result {
                    self.send_to(
                        user_id,
                        SyncMessage::OperationRejected {
                            operation_id,
                            reason: e.to_string(),
                            document: self.document.snapshot(),
                        },
                    );
                }
                result
            }
            SyncMessage::SyncRequest { since_version } => {
                let operations = self.document.operations_since(since_version)?.to_vec();
                self.send_to(
                    user_id,
                    SyncMessage::SyncResponse {
                        operations,
                        version: self.document.version(),
                    },
                );
                Ok(())
            }
            SyncMessage::Presence { update, .. } => self.update_presence(user_id, update),
            SyncMessage::Whiteboard { event } => {
                let result = self.draw(user_id, event);
                if let Err(e) = &result {
                    self.send_to(
                        user_id,
                        SyncMessage::WhiteboardRejected {
                            reason: e.to_string(),
                            drawings: self.whiteboard.drawings().cloned().collect(),
                        },
                    );
                }
                result
            }
            SyncMessage::Chat { command } => {
                if self.session.status.is_terminal() {
                    return Err(CollaborationError::InvalidOp(
                        "chat is closed for this session".to_string(),
                    ));
                }
                let event = self
                    .chat
                    .execute(user_id, command, &self.session.participants)?;
                self.broadcast(SyncMessage::ChatEvent { event }, None);
                Ok(())
            }
            SyncMessage::Ping => {
                self.send_to(user_id, SyncMessage::Pong);
                Ok(())
            }
            SyncMessage::Join { .. } | SyncMessage::Create { .. } => Err(
                CollaborationError::InvalidOp("already joined".to_string()),
            ),
            other => Err(CollaborationError::InvalidOp(format!(
                "unexpected client message: {:?}",
                other
            ))),
        }
    }

    /// Disconnect participants that have gone silent
    pub fn sweep(&mut self) -> Vec<UserId> {
        let stale = self.presence.sweep(&mut self.session, Utc::now());
        for user_id in &stale {
            self.subscribers.remove(user_id);
            self.broadcast(
                SyncMessage::Presence {
                    user_id: Some(*user_id),
                    update: PresenceUpdate::Connection {
                        status: ConnectionStatus::Disconnected,
                    },
                },
                None,
            );
        }
        stale
    }

    fn control(
        &mut self,
        user_id: UserId,
        action: SessionAction,
        expected_version: Option<u64>,
    ) -> Result<()> {
        self.session.apply(user_id, action, expected_version)?;
        info!(
            "Session {} is now {:?} (v{})",
            self.session.id, self.session.status, self.session.version
        );
        self.broadcast(
            SyncMessage::SessionUpdated {
                session: self.session.clone(),
            },
            None,
        );

        if self.session.status == SessionStatus::Ended {
            // dropping the senders closes every client stream
            debug!(
                "Closing {} subscribers of {}",
                self.subscribers.len(),
                self.session.id
            );
            self.subscribers.clear();
        }
        Ok(())
    }

    fn submit_operation(&mut self, user_id: UserId, mut operation: TextOperation) -> Result<()> {
        // a retry of an accepted batch is acked again whatever the session state
        let already_accepted = self.document.contains(operation.id);
        if !already_accepted {
            self.require_editor(user_id, "edit the document")?;
        }
        operation.author = user_id;

        let accepted = self.document.submit(operation)?;
        self.send_to(
            user_id,
            SyncMessage::OperationAck {
                operation_id: accepted.id,
                version: accepted.version,
            },
        );
        if already_accepted {
            return Ok(());
        }

        for participant in self.session.participants.iter_mut() {
            if participant.id != user_id {
                transform_presence(&mut participant.presence, &accepted.ops);
            }
        }
        self.broadcast(SyncMessage::Operation { operation: accepted }, Some(user_id));
        Ok(())
    }

    fn update_presence(&mut self, user_id: UserId, update: PresenceUpdate) -> Result<()> {
        if !update.is_client_update() {
            return Err(CollaborationError::InvalidOp(
                "connection state is managed by the server".to_string(),
            ));
        }
        let update = update.clamped(self.document.len());
        self.presence
            .apply(&mut self.session, user_id, &update, Utc::now())?;
        self.broadcast(
            SyncMessage::Presence {
                user_id: Some(user_id),
                update,
            },
            Some(user_id),
        );
        Ok(())
    }

    fn draw(&mut self, user_id: UserId, event: WhiteboardEvent) -> Result<()> {
        if matches!(event, WhiteboardEvent::Cleared { .. }) && user_id != self.session.owner {
            return Err(CollaborationError::PermissionDenied(
                "only the owner may clear the whiteboard".to_string(),
            ));
        }
        self.require_editor(user_id, "draw on the whiteboard")?;

        let event = event.with_user(user_id);
        self.whiteboard.apply(&event)?;
        self.broadcast(SyncMessage::Whiteboard { event }, Some(user_id));
        Ok(())
    }

    /// Live editing needs an active session and edit rights
    fn require_editor(&self, user_id: UserId, what: &str) -> Result<()> {
        if self.session.status != SessionStatus::Active {
            return Err(CollaborationError::InvalidOp(format!(
                "cannot {} while the session is {:?}",
                what, self.session.status
            )));
        }
        let can_edit = self
            .session
            .permission_of(user_id)
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

    fn send_to(&mut self, user_id: UserId, message: SyncMessage) {
        let closed = match self.subscribers.get(&user_id) {
            Some(tx) => tx.send(message).is_err(),
            None => false,
        };
        if closed {
            warn!("Dropping closed channel for {} in {}", user_id, self.session.id);
            self.subscribers.remove(&user_id);
        }
    }

    fn broadcast(&mut self, message: SyncMessage, exclude: Option<UserId>) {
        let session_id = self.session.id;
        self.subscribers.retain(|user_id, tx| {
            if exclude == Some(*user_id) {
                return true;
            }
            let delivered = tx.send(message.clone()).is_ok();
            if !delivered {
                warn!("Dropping closed channel for {} in {}", user_id, session_id);
            }
            delivered
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CursorPosition, DrawingId, LamportClock, NewSession, Permission, SessionType, TextOp,
    };

    struct Fixture {
        workspace: SessionWorkspace,
        owner: UserId,
        owner_rx: mpsc::UnboundedReceiver<SyncMessage>,
    }

    fn fixture(max: usize) -> Fixture {
        let owner = CollaborationUser::new(UserId::new(), "Owner");
        let owner_id = owner.id;
        let session = CollaborationSession::new(
            NewSession::new("Review", SessionType::CodeReview, max),
            owner.clone(),
        )
        .unwrap();
        let mut workspace = SessionWorkspace::new(session, &CollaborationConfig::default());
        let owner_rx = workspace.join(owner).unwrap();
        Fixture {
            workspace,
            owner: owner_id,
            owner_rx,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SyncMessage>) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn insert(author: UserId, base: u64, at: usize, text: &str) -> SyncMessage {
        SyncMessage::Operation {
            operation: TextOperation::new(
                author,
                base,
                LamportClock::new(),
                vec![TextOp::insert(at, text)],
            ),
        }
    }

    #[test]
    fn test_join_sends_snapshot_and_notifies_others() {
        let mut fx = fixture(3);
        let joined = drain(&mut fx.owner_rx);
        assert!(matches!(joined[..], [SyncMessage::Joined { .. }]));

        let guest = CollaborationUser::new(UserId::new(), "Guest");
        let mut guest_rx = fx.workspace.join(guest).unwrap();

        assert!(matches!(
            drain(&mut guest_rx)[..],
            [SyncMessage::Joined { .. }]
        ));
        assert!(matches!(
            drain(&mut fx.owner_rx)[..],
            [SyncMessage::UserJoined { .. }]
        ));
    }

    #[test]
    fn test_capacity_enforced_on_join() {
        let mut fx = fixture(2);
        fx.workspace
            .join(CollaborationUser::new(UserId::new(), "Second"))
            .unwrap();
        let err = fx
            .workspace
            .join(CollaborationUser::new(UserId::new(), "Third"))
            .unwrap_err();
        assert!(matches!(
            err,
            CollaborationError::Session(crate::SessionError::SessionFull { max: 2 })
        ));
    }

    #[test]
    fn test_edits_require_active_session() {
        let mut fx = fixture(3);
        let owner = fx.owner;
        let err = fx
            .workspace
            .handle(owner, insert(owner, 0, 0, "x"))
            .unwrap_err();
        assert!(matches!(err, CollaborationError::InvalidOp(_)));

        fx.workspace
            .handle(
                owner,
                SyncMessage::SessionControl {
                    action: SessionAction::Start,
                    expected_version: Some(0),
                },
            )
            .unwrap();
        fx.workspace.handle(owner, insert(owner, 0, 0, "x")).unwrap();
        assert_eq!(fx.workspace.document().content(), "x");
    }

    #[test]
    fn test_operation_acked_to_sender_and_relayed_to_others() {
        let mut fx = fixture(3);
        let owner = fx.owner;
        fx.workspace.session.start(owner).unwrap();

        let guest = CollaborationUser::new(UserId::new(), "Guest");
        let guest_id = guest.id;
        let mut guest_rx = fx.workspace.join(guest).unwrap();
        fx.workspace
            .handle(
                guest_id,
                SyncMessage::Presence {
                    user_id: None,
                    update: PresenceUpdate::Cursor {
                        cursor: Some(CursorPosition::new(0)),
                    },
                },
            )
            .unwrap();
        drain(&mut fx.owner_rx);
        drain(&mut guest_rx);

        let message = insert(owner, 0, 0, "hello");
        fx.workspace.handle(owner, message.clone()).unwrap();

        assert!(matches!(
            drain(&mut fx.owner_rx)[..],
            [SyncMessage::OperationAck { version: 1, .. }]
        ));
        assert!(matches!(
            drain(&mut guest_rx)[..],
            [SyncMessage::Operation { .. }]
        ));
        let cursor = fx.workspace.session().participant(guest_id).unwrap().presence.cursor;
        assert_eq!(cursor, Some(CursorPosition::new(5)));

        // retry of the same operation is acked again, not re-applied
        fx.workspace.handle(owner, message).unwrap();
        assert_eq!(fx.workspace.document().version(), 1);
        assert!(drain(&mut guest_rx).is_empty());
    }

    #[test]
    fn test_view_only_participant_cannot_draw_or_edit() {
        let mut fx = fixture(3);
        let owner = fx.owner;
        let viewer = CollaborationUser::new(UserId::new(), "Viewer");
        let viewer_id = viewer.id;
        fx.workspace.join(viewer).unwrap();
        fx.workspace
            .session
            .set_permission(owner, viewer_id, Permission::View)
            .unwrap();
        fx.workspace.session.start(owner).unwrap();

        assert!(matches!(
            fx.workspace.handle(viewer_id, insert(viewer_id, 0, 0, "x")),
            Err(CollaborationError::PermissionDenied(_))
        ));
        assert!(matches!(
            fx.workspace.handle(
                viewer_id,
                SyncMessage::Whiteboard {
                    event: WhiteboardEvent::Undone {
                        user_id: viewer_id,
                        drawing_id: DrawingId::new(),
                    }
                }
            ),
            Err(CollaborationError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_rejected_operation_returns_snapshot_to_sender() {
        let mut fx = fixture(3);
        let owner = fx.owner;
        fx.workspace.session.start(owner).unwrap();
        fx.workspace.handle(owner, insert(owner, 0, 0, "kept")).unwrap();
        fx.workspace.session.pause(owner).unwrap();
        drain(&mut fx.owner_rx);

        let message = insert(owner, 1, 0, "lost");
        let SyncMessage::Operation { operation } = &message else {
            unreachable!()
        };
        let rejected_id = operation.id;
        assert!(fx.workspace.handle(owner, message).is_err());

        match &drain(&mut fx.owner_rx)[..] {
            [SyncMessage::OperationRejected {
                operation_id,
                document,
                ..
            }] => {
                assert_eq!(*operation_id, rejected_id);
                assert_eq!(document.content, "kept");
                assert_eq!(document.version, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_retry_of_accepted_operation_acked_while_paused() {
        let mut fx = fixture(3);
        let owner = fx.owner;
        fx.workspace.session.start(owner).unwrap();
        let message = insert(owner, 0, 0, "x");
        fx.workspace.handle(owner, message.clone()).unwrap();
        fx.workspace.session.pause(owner).unwrap();
        drain(&mut fx.owner_rx);

        fx.workspace.handle(owner, message).unwrap();
        assert!(matches!(
            drain(&mut fx.owner_rx)[..],
            [SyncMessage::OperationAck { version: 1, .. }]
        ));
    }

    #[test]
    fn test_rejected_drawing_returns_board_to_sender() {
        let mut fx = fixture(3);
        let owner = fx.owner;
        let guest = CollaborationUser::new(UserId::new(), "Guest");
        let guest_id = guest.id;
        let mut guest_rx = fx.workspace.join(guest).unwrap();
        fx.workspace.session.start(owner).unwrap();
        drain(&mut guest_rx);

        let mut board = WhiteboardSurface::new(fx.workspace.id());
        let event = board.clear(guest_id).unwrap();
        assert!(fx
            .workspace
            .handle(guest_id, SyncMessage::Whiteboard { event })
            .is_err());
        assert!(matches!(
            &drain(&mut guest_rx)[..],
            [SyncMessage::WhiteboardRejected { drawings, .. }] if drawings.is_empty()
        ));
    }

    #[test]
    fn test_release_spares_newer_connection() {
        let mut fx = fixture(3);
        let guest = CollaborationUser::new(UserId::new(), "Guest");
        let guest_id = guest.id;
        let old_rx = fx.workspace.join(guest.clone()).unwrap();
        let new_rx = fx.workspace.join(guest).unwrap();

        // the old socket tears down after the new one joined
        drop(old_rx);
        assert!(!fx.workspace.release(guest_id).unwrap());
        assert!(fx.workspace.is_subscribed(guest_id));
        let presence = &fx.workspace.session().participant(guest_id).unwrap().presence;
        assert!(presence.is_connected());

        drop(new_rx);
        assert!(fx.workspace.release(guest_id).unwrap());
        assert!(!fx.workspace.is_subscribed(guest_id));
        assert!(fx.workspace.session().is_participant(guest_id));
    }

    #[test]
    fn test_only_owner_clears_whiteboard() {
        let mut fx = fixture(3);
        let owner = fx.owner;
        let guest = CollaborationUser::new(UserId::new(), "Guest");
        let guest_id = guest.id;
        fx.workspace.join(guest).unwrap();
        fx.workspace.session.start(owner).unwrap();

        let clear = |user_id| SyncMessage::Whiteboard {
            event: WhiteboardEvent::Cleared { user_id },
        };
        assert!(fx.workspace.handle(guest_id, clear(guest_id)).is_err());
        fx.workspace.handle(owner, clear(owner)).unwrap();
    }

    #[test]
    fn test_end_drops_subscribers_after_final_update() {
        let mut fx = fixture(3);
        let owner = fx.owner;
        drain(&mut fx.owner_rx);

        fx.workspace
            .handle(
                owner,
                SyncMessage::SessionControl {
                    action: SessionAction::End,
                    expected_version: None,
                },
            )
            .unwrap();

        assert!(matches!(
            fx.owner_rx.try_recv(),
            Ok(SyncMessage::SessionUpdated { .. })
        ));
        assert!(matches!(
            fx.owner_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(fx.workspace.subscriber_count(), 0);
    }

    #[test]
    fn test_disconnect_keeps_seat_and_reconnect_restores() {
        let mut fx = fixture(3);
        let guest = CollaborationUser::new(UserId::new(), "Guest");
        let guest_id = guest.id;
        fx.workspace.join(guest.clone()).unwrap();

        fx.workspace.disconnect(guest_id).unwrap();
        assert!(fx.workspace.session().is_participant(guest_id));
        assert!(!fx.workspace.is_subscribed(guest_id));

        fx.workspace.join(guest).unwrap();
        assert!(fx.workspace.is_subscribed(guest_id));
        assert_eq!(fx.workspace.session().participants.len(), 2);
        assert!(fx
            .workspace
            .session()
            .participant(guest_id)
            .unwrap()
            .presence
            .is_connected());
    }

    #[test]
    fn test_ping_and_unknown_user() {
        let mut fx = fixture(3);
        let owner = fx.owner;
        drain(&mut fx.owner_rx);

        fx.workspace.handle(owner, SyncMessage::Ping).unwrap();
        assert_eq!(fx.owner_rx.try_recv().unwrap(), SyncMessage::Pong);

        assert!(matches!(
            fx.workspace.handle(UserId::new(), SyncMessage::Ping),
            Err(CollaborationError::NotJoined(_))
        ));
    }
}
