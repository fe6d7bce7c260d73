/// Server-side registry of live sessions
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::{
    CollaborationConfig, CollaborationError, CollaborationSession, CollaborationUser, NewSession,
    Result, SessionId, SessionStatus, SessionType, SessionWorkspace, SyncMessage, UserId,
};

/// Listing entry for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub participants: usize,
    pub max_participants: usize,
}

impl From<&CollaborationSession> for SessionSummary {
    fn from(session: &CollaborationSession) -> Self {
        Self {
            id: session.id,
            title: session.title.clone(),
            session_type: session.session_type,
            status: session.status,
            participants: session.participants.len(),
            max_participants: session.max_participants,
        }
    }
}

/// Cheap to clone; clones share the same sessions
#[derive(Clone)]
pub struct SessionRegistry {
    config: Arc<CollaborationConfig>,
    sessions: Arc<RwLock<HashMap<SessionId, SessionWorkspace>>>,
}

impl SessionRegistry {
    pub fn new(config: CollaborationConfig) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CollaborationConfig {
        &self.config
    }

    /// Register a new session owned by `owner`. A zero participant limit picks the default.
    pub async fn create_session(
        &self,
        mut params: NewSession,
        owner: CollaborationUser,
    ) -> Result<CollaborationSession> {
        if params.max_participants == 0 {
            params.max_participants = self.config.default_max_participants;
        }
        if params.max_participants > self.config.max_participants_limit {
            return Err(CollaborationError::InvalidOp(format!(
                "at most {} participants allowed",
                self.config.max_participants_limit
            )));
        }

        let session = CollaborationSession::new(params, owner)?;
        info!(
            "Created session {} '{}' ({:?}, invite {})",
            session.id, session.title, session.session_type, session.invite_code
        );

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id, SessionWorkspace::new(session.clone(), &self.config));
        Ok(session)
    }

    pub async fn get(&self, session_id: SessionId) -> Option<CollaborationSession> {
        let sessions = self.sessions.read().await;
        sessions.get(&session_id).map(|w| w.session().clone())
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .map(|w| SessionSummary::from(w.session()))
            .collect();
        summaries.sort_by(|a, b| a.title.cmp(&b.title));
        summaries
    }

    /// Invite codes compare case-insensitively
    pub async fn find_by_invite(&self, code: &str) -> Option<SessionId> {
        let code = code.trim();
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .find(|w| w.session().invite_code.eq_ignore_ascii_case(code))
            .map(|w| w.id())
    }

    pub async fn invite_link(&self, session_id: SessionId) -> Option<String> {
        self.get(session_id)
            .await
            .map(|s| s.invite_link(&self.config.invite_base_url))
    }

    pub async fn join(
        &self,
        session_id: SessionId,
        user: CollaborationUser,
    ) -> Result<mpsc::UnboundedReceiver<SyncMessage>> {
        let mut sessions = self.sessions.write().await;
        let workspace = sessions
            .get_mut(&session_id)
            .ok_or(CollaborationError::SessionNotFound(session_id))?;
        workspace.join(user)
    }

    pub async fn join_by_invite(
        &self,
        code: &str,
        user: CollaborationUser,
    ) -> Result<(SessionId, mpsc::UnboundedReceiver<SyncMessage>)> {
        let session_id = self
            .find_by_invite(code)
            .await
            .ok_or_else(|| CollaborationError::InviteNotFound(code.to_string()))?;
        let rx = self.join(session_id, user).await?;
        Ok((session_id, rx))
    }

    pub async fn leave(&self, session_id: SessionId, user_id: UserId) -> Result<()> {
        self.with_workspace(session_id, |w| w.leave(user_id)).await
    }

    pub async fn disconnect(&self, session_id: SessionId, user_id: UserId) -> Result<()> {
        self.with_workspace(session_id, |w| w.disconnect(user_id))
            .await
    }

    /// Socket teardown; true when the user was marked disconnected
    pub async fn release(&self, session_id: SessionId, user_id: UserId) -> Result<bool> {
        self.with_workspace(session_id, |w| w.release(user_id))
            .await
    }

    pub async fn handle(
        &self,
        session_id: SessionId,
        user_id: UserId,
        message: SyncMessage,
    ) -> Result<()> {
        self.with_workspace(session_id, |w| w.handle(user_id, message))
            .await
    }

    /// Disconnect silent participants across all sessions
    pub async fn sweep_idle(&self) -> Vec<(SessionId, UserId)> {
        let mut sessions = self.sessions.write().await;
        let swept: Vec<(SessionId, UserId)> = sessions
            .values_mut()
            .flat_map(|w| {
                let session_id = w.id();
                w.sweep().into_iter().map(move |user_id| (session_id, user_id))
            })
            .collect();
        if !swept.is_empty() {
            debug!("Idle sweep disconnected {} participants", swept.len());
        }
        swept
    }

    /// Forget archived sessions, returning how many were dropped
    pub async fn prune_archived(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, w| w.session().status != SessionStatus::Archived);
        let pruned = before - sessions.len();
        if pruned > 0 {
            info!("Pruned {} archived sessions", pruned);
        }
        pruned
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn with_workspace<T>(
        &self,
        session_id: SessionId,
        f: impl FnOnce(&mut SessionWorkspace) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self.sessions.write().await;
        let workspace = sessions
            .get_mut(&session_id)
            .ok_or(CollaborationError::SessionNotFound(session_id))?;
        f(workspace)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(CollaborationConfig::default())
    }
}
