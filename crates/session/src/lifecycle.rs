/// Collaboration session record and its lifecycle state machine
///
/// CREATED -> WAITING -> ACTIVE <-> PAUSED -> ENDED -> ARCHIVED
///
/// Every accepted transition or membership change bumps `version`. Callers may
/// guard an action with the version they last saw.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CollaborationUser, Permission, Result, SessionError, SessionId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    PairProgramming,
    GroupProject,
    CodeReview,
    LiveDemo,
    DebuggingSession,
    InterviewPractice,
    HackathonTeam,
    StudyGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    Waiting,
    Active,
    Paused,
    Ended,
    Archived,
}

impl SessionStatus {
    /// Ended and archived sessions accept no further work
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Archived)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        matches!(
            (self, next),
            (Created, Waiting)
                | (Created, Active)
                | (Waiting, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Created, Ended)
                | (Waiting, Ended)
                | (Active, Ended)
                | (Paused, Ended)
                | (Ended, Archived)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

impl Default for Difficulty {
    fn default() -> Self {
        Self::Beginner
    }
}

/// Lifecycle commands, each mapping to one target status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    Open,
    Start,
    Pause,
    Resume,
    End,
    Archive,
}

impl SessionAction {
    pub fn target(&self) -> SessionStatus {
        match self {
            SessionAction::Open => SessionStatus::Waiting,
            SessionAction::Start | SessionAction::Resume => SessionStatus::Active,
            SessionAction::Pause => SessionStatus::Paused,
            SessionAction::End => SessionStatus::Ended,
            SessionAction::Archive => SessionStatus::Archived,
        }
    }

    fn requires_owner(&self) -> bool {
        matches!(
            self,
            SessionAction::Open | SessionAction::Start | SessionAction::Archive
        )
    }
}

/// Parameters for a new session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    pub title: String,
    pub session_type: SessionType,
    pub max_participants: usize,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub difficulty: Difficulty,
}

impl NewSession {
    pub fn new(title: impl Into<String>, session_type: SessionType, max_participants: usize) -> Self {
        Self {
            title: title.into(),
            session_type,
            max_participants,
            language: None,
            difficulty: Difficulty::default(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = difficulty;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationSession {
    pub id: SessionId,
    pub title: String,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub owner: UserId,
    /// Unique by id, kept in join order
    pub participants: Vec<CollaborationUser>,
    pub max_participants: usize,
    pub language: Option<String>,
    pub difficulty: Difficulty,
    pub invite_code: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub version: u64,
}

impl CollaborationSession {
    pub fn new(params: NewSession, owner: CollaborationUser) -> Result<Self> {
        if params.max_participants == 0 {
            return Err(SessionError::InvalidOp(
                "max_participants must be at least 1".to_string(),
            ));
        }
        if params.title.trim().is_empty() {
            return Err(SessionError::InvalidOp("title is required".to_string()));
        }

        let id = SessionId::new();
        let owner = owner.with_permission(Permission::Owner);

        Ok(Self {
            id,
            title: params.title,
            session_type: params.session_type,
            status: SessionStatus::Created,
            owner: owner.id,
            participants: vec![owner],
            max_participants: params.max_participants,
            language: params.language,
            difficulty: params.difficulty,
            invite_code: generate_invite_code(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_secs: None,
            version: 0,
        })
    }

    pub fn participant(&self, user_id: UserId) -> Option<&CollaborationUser> {
        self.participants.iter().find(|p| p.id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: UserId) -> Option<&mut CollaborationUser> {
        self.participants.iter_mut().find(|p| p.id == user_id)
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participant(user_id).is_some()
    }

    pub fn permission_of(&self, user_id: UserId) -> Option<Permission> {
        self.participant(user_id).map(|p| p.permission)
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }

    pub fn invite_link(&self, base_url: &str) -> String {
        format!(
            "{}/collaborate/join/{}",
            base_url.trim_end_matches('/'),
            self.invite_code
        )
    }

    pub fn add_participant(&mut self, user: CollaborationUser) -> Result<()> {
        if self.status.is_terminal() {
            return Err(SessionError::InvalidOp(format!(
                "session is {:?}",
                self.status
            )));
        }
        if self.is_participant(user.id) {
            return Err(SessionError::ParticipantExists(user.id));
        }
        if self.is_full() {
            return Err(SessionError::SessionFull {
                max: self.max_participants,
            });
        }

        // Only `new` hands out ownership
        let user = if user.permission.is_owner() {
            user.with_permission(Permission::Edit)
        } else {
            user
        };
        self.participants.push(user);
        self.version += 1;
        Ok(())
    }

    pub fn remove_participant(&mut self, user_id: UserId) -> Result<CollaborationUser> {
        if user_id == self.owner {
            return Err(SessionError::InvalidOp(
                "the owner cannot leave; end the session instead".to_string(),
            ));
        }
        let idx = self
            .participants
            .iter()
            .position(|p| p.id == user_id)
            .ok_or(SessionError::ParticipantNotFound(user_id))?;
        self.version += 1;
        Ok(self.participants.remove(idx))
    }

    pub fn set_permission(
        &mut self,
        actor: UserId,
        target: UserId,
        permission: Permission,
    ) -> Result<()> {
        self.require_owner(actor, "change permissions")?;
        if target == self.owner || permission.is_owner() {
            return Err(SessionError::InvalidOp(
                "ownership cannot be reassigned".to_string(),
            ));
        }
        let participant = self
            .participant_mut(target)
            .ok_or(SessionError::ParticipantNotFound(target))?;
        participant.permission = permission;
        self.version += 1;
        Ok(())
    }

    pub fn open(&mut self, actor: UserId) -> Result<()> {
        self.apply(actor, SessionAction::Open, None)
    }

    pub fn start(&mut self, actor: UserId) -> Result<()> {
        self.apply(actor, SessionAction::Start, None)
    }

    pub fn pause(&mut self, actor: UserId) -> Result<()> {
        self.apply(actor, SessionAction::Pause, None)
    }

    pub fn resume(&mut self, actor: UserId) -> Result<()> {
        self.apply(actor, SessionAction::Resume, None)
    }

    pub fn end(&mut self, actor: UserId) -> Result<()> {
        self.apply(actor, SessionAction::End, None)
    }

    pub fn archive(&mut self, actor: UserId) -> Result<()> {
        self.apply(actor, SessionAction::Archive, None)
    }

    /// Run a lifecycle action, optionally guarded by the version the caller last saw
    pub fn apply(
        &mut self,
        actor: UserId,
        action: SessionAction,
        expected_version: Option<u64>,
    ) -> Result<()> {
        if let Some(expected) = expected_version {
            if expected != self.version {
                return Err(SessionError::VersionMismatch {
                    expected,
                    actual: self.version,
                });
            }
        }

        let permission = self
            .permission_of(actor)
            .ok_or(SessionError::ParticipantNotFound(actor))?;
        if action.requires_owner() && !permission.is_owner() {
            return Err(SessionError::PermissionDenied(format!(
                "only the owner may {:?} the session",
                action
            )));
        }
        if !permission.can_edit() {
            return Err(SessionError::PermissionDenied(format!(
                "view-only participants may not {:?} the session",
                action
            )));
        }

        let target = action.target();
        // resume only leaves PAUSED, start never does
        let allowed = match action {
            SessionAction::Start => self.status != SessionStatus::Paused,
            SessionAction::Resume => self.status == SessionStatus::Paused,
            _ => true,
        };
        if !allowed || !self.status.can_transition_to(target) {
            return Err(SessionError::InvalidTransition {
                from: self.status,
                to: target,
            });
        }

        let now = Utc::now();
        match action {
            SessionAction::Start => self.started_at = Some(now),
            SessionAction::End => {
                self.ended_at = Some(now);
                self.duration_secs = Some(
                    self.started_at
                        .map(|started| (now - started).num_seconds().max(0))
                        .unwrap_or(0),
                );
            }
            _ => {}
        }

        self.status = target;
        self.version += 1;
        Ok(())
    }

    fn require_owner(&self, actor: UserId, what: &str) -> Result<()> {
        if actor == self.owner {
            Ok(())
        } else {
            Err(SessionError::PermissionDenied(format!(
                "only the owner may {}",
                what
            )))
        }
    }
}

fn generate_invite_code() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase()
}
