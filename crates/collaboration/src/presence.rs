/// Participant presence: cursor, selection, media flags and liveness
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    CollaborationConfig, CollaborationSession, ConnectionStatus, CursorPosition, NetworkQuality,
    PresenceState, Result, SessionError, TextSelection, UserId,
};

/// Presence change reported by a client, or by the server for connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceUpdate {
    Cursor { cursor: Option<CursorPosition> },
    Selection { selection: Option<TextSelection> },
    Muted { muted: bool },
    Video { enabled: bool },
    ScreenShare { active: bool },
    Typing { typing: bool },
    NetworkQuality { quality: NetworkQuality },
    Connection { status: ConnectionStatus },
    Heartbeat,
}

impl PresenceUpdate {
    /// Updates a client may send; connection state is owned by the server
    pub fn is_client_update(&self) -> bool {
        !matches!(self, PresenceUpdate::Connection { .. })
    }

    /// Clamp cursor and selection offsets to a document of `len` characters
    pub fn clamped(self, len: usize) -> Self {
        match self {
            PresenceUpdate::Cursor {
                cursor: Some(cursor),
            } => PresenceUpdate::Cursor {
                cursor: Some(CursorPosition::new(cursor.offset.min(len))),
            },
            PresenceUpdate::Selection {
                selection: Some(selection),
            } => PresenceUpdate::Selection {
                selection: Some(TextSelection::new(
                    selection.anchor.min(len),
                    selection.head.min(len),
                )),
            },
            other => other,
        }
    }

    pub fn apply_to(&self, state: &mut PresenceState) {
        match self {
            PresenceUpdate::Cursor { cursor } => state.cursor = *cursor,
            PresenceUpdate::Selection { selection } => state.selection = *selection,
            PresenceUpdate::Muted { muted } => state.flags.muted = *muted,
            PresenceUpdate::Video { enabled } => state.flags.video = *enabled,
            PresenceUpdate::ScreenShare { active } => state.flags.screen_sharing = *active,
            PresenceUpdate::Typing { typing } => state.flags.typing = *typing,
            PresenceUpdate::NetworkQuality { quality } => state.network_quality = *quality,
            PresenceUpdate::Connection { status } => state.connection = *status,
            PresenceUpdate::Heartbeat => {}
        }
    }
}

/// Applies presence updates to a session's participants and detects idleness
#[derive(Debug, Clone, Copy)]
pub struct PresenceTracker {
    idle_after: Duration,
    disconnect_after: Duration,
}

impl PresenceTracker {
    pub fn new(idle_after: Duration, disconnect_after: Duration) -> Self {
        Self {
            idle_after,
            disconnect_after,
        }
    }

    pub fn from_config(config: &CollaborationConfig) -> Self {
        let convert =
            |d: std::time::Duration| Duration::from_std(d).unwrap_or_else(|_| Duration::weeks(52));
        Self::new(convert(config.idle_after), convert(config.disconnect_after))
    }

    /// Any client update counts as activity and revives a reconnecting user
    pub fn apply(
        &self,
        session: &mut CollaborationSession,
        user_id: UserId,
        update: &PresenceUpdate,
        now: DateTime<Utc>,
    ) -> Result<PresenceState> {
        let participant = session
            .participant_mut(user_id)
            .ok_or(SessionError::ParticipantNotFound(user_id))?;

        update.apply_to(&mut participant.presence);
        if update.is_client_update() {
            participant.presence.connection = ConnectionStatus::Connected;
            participant.presence.last_activity = now;
        }
        Ok(participant.presence.clone())
    }

    pub fn mark_connected(
        &self,
        session: &mut CollaborationSession,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<PresenceState> {
        let participant = session
            .participant_mut(user_id)
            .ok_or(SessionError::ParticipantNotFound(user_id))?;
        participant.presence.connection = ConnectionStatus::Connected;
        participant.presence.last_activity = now;
        Ok(participant.presence.clone())
    }

    pub fn mark_disconnected(
        &self,
        session: &mut CollaborationSession,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<PresenceState> {
        let session_id = session.id;
        let participant = session
            .participant_mut(user_id)
            .ok_or(SessionError::ParticipantNotFound(user_id))?;
        let presence = &mut participant.presence;
        presence.connection = ConnectionStatus::Disconnected;
        presence.flags.typing = false;
        presence.cursor = None;
        presence.selection = None;
        debug!("{} disconnected from {} at {}", user_id, session_id, now);
        Ok(participant.presence.clone())
    }

    /// Connected participants with recent activity
    pub fn active_users(&self, session: &CollaborationSession, now: DateTime<Utc>) -> Vec<UserId> {
        session
            .participants
            .iter()
            .filter(|p| p.presence.is_connected() && !p.is_idle(now, self.idle_after))
            .map(|p| p.id)
            .collect()
    }

    /// Connected participants without recent activity
    pub fn idle_users(&self, session: &CollaborationSession, now: DateTime<Utc>) -> Vec<UserId> {
        session
            .participants
            .iter()
            .filter(|p| p.presence.is_connected() && p.is_idle(now, self.idle_after))
            .map(|p| p.id)
            .collect()
    }

    /// Mark participants silent for longer than `disconnect_after` as disconnected
    pub fn sweep(&self, session: &mut CollaborationSession, now: DateTime<Utc>) -> Vec<UserId> {
        let stale: Vec<UserId> = session
            .participants
            .iter()
            .filter(|p| p.presence.connection != ConnectionStatus::Disconnected)
            .filter(|p| p.is_idle(now, self.disconnect_after))
            .map(|p| p.id)
            .collect();

        for user_id in &stale {
            if let Some(participant) = session.participant_mut(*user_id) {
                participant.presence.connection = ConnectionStatus::Disconnected;
                participant.presence.flags.typing = false;
            }
        }
        if !stale.is_empty() {
            info!("Swept {} stale participants from {}", stale.len(), session.id);
        }
        stale
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::from_config(&CollaborationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollaborationUser, NewSession, SessionType};

    fn session_with_guest() -> (CollaborationSession, UserId, UserId) {
        let owner = CollaborationUser::new(UserId::new(), "Owner");
        let guest = CollaborationUser::new(UserId::new(), "Guest");
        let (owner_id, guest_id) = (owner.id, guest.id);
        let mut session = CollaborationSession::new(
            NewSession::new("Pairing", SessionType::PairProgramming, 4),
            owner,
        )
        .unwrap();
        session.add_participant(guest).unwrap();
        (session, owner_id, guest_id)
    }

    #[test]
    fn test_apply_updates_state_and_activity() {
        let (mut session, _, guest) = session_with_guest();
        let tracker = PresenceTracker::default();
        let now = Utc::now();

        tracker
            .apply(&mut session, guest, &PresenceUpdate::Muted { muted: true }, now)
            .unwrap();
        let state = tracker
            .apply(
                &mut session,
                guest,
                &PresenceUpdate::Cursor {
                    cursor: Some(CursorPosition::new(12)),
                },
                now,
            )
            .unwrap();

        assert!(state.flags.muted);
        assert_eq!(state.cursor, Some(CursorPosition::new(12)));
        assert_eq!(state.last_activity, now);
    }

    #[test]
    fn test_unknown_participant_rejected() {
        let (mut session, _, _) = session_with_guest();
        let tracker = PresenceTracker::default();
        assert!(tracker
            .apply(&mut session, UserId::new(), &PresenceUpdate::Heartbeat, Utc::now())
            .is_err());
    }

    #[test]
    fn test_idle_and_sweep() {
        let (mut session, owner, guest) = session_with_guest();
        let tracker = PresenceTracker::new(Duration::seconds(60), Duration::seconds(300));
        let now = Utc::now();

        session.participant_mut(owner).unwrap().presence.last_activity = now;
        session.participant_mut(guest).unwrap().presence.last_activity =
            now - Duration::seconds(90);

        assert_eq!(tracker.active_users(&session, now), vec![owner]);
        assert_eq!(tracker.idle_users(&session, now), vec![guest]);
        assert!(tracker.sweep(&mut session, now).is_empty());

        let later = now + Duration::seconds(400);
        tracker
            .apply(&mut session, owner, &PresenceUpdate::Heartbeat, later)
            .unwrap();
        assert_eq!(tracker.sweep(&mut session, later), vec![guest]);
        assert!(!session.participant(guest).unwrap().presence.is_connected());
        assert!(tracker.sweep(&mut session, later).is_empty());
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let (mut session, _, guest) = session_with_guest();
        let tracker = PresenceTracker::default();
        let now = Utc::now();

        let state = tracker.mark_disconnected(&mut session, guest, now).unwrap();
        assert_eq!(state.connection, ConnectionStatus::Disconnected);
        assert!(tracker.active_users(&session, now).len() == 1);

        let state = tracker.mark_connected(&mut session, guest, now).unwrap();
        assert!(state.is_connected());
    }

    #[test]
    fn test_clamp_offsets() {
        let update = PresenceUpdate::Selection {
            selection: Some(TextSelection::new(3, 50)),
        }
        .clamped(10);
        assert_eq!(
            update,
            PresenceUpdate::Selection {
                selection: Some(TextSelection::new(3, 10))
            }
        );
        assert!(!PresenceUpdate::Connection {
            status: ConnectionStatus::Connected
        }
        .is_client_update());
    }
}
