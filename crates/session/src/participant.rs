/// Participants of a collaboration session and their live presence
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Platform role, used to gate which sessions a user may own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Default for Role {
    fn default() -> Self {
        Self::Student
    }
}

/// Per-session permission level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    Owner,
    Edit,
    View,
}

impl Permission {
    pub fn is_owner(&self) -> bool {
        matches!(self, Permission::Owner)
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, Permission::Owner | Permission::Edit)
    }
}

impl Default for Permission {
    fn default() -> Self {
        Self::Edit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Audio/video/typing flags shown next to a participant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    pub muted: bool,
    pub video: bool,
    pub screen_sharing: bool,
    pub typing: bool,
}

/// Cursor in the shared document, counted in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub offset: usize,
}

impl CursorPosition {
    pub fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Zero-based (line, column) of this offset within `content`
    pub fn line_column(&self, content: &str) -> (usize, usize) {
        let mut line = 0;
        let mut column = 0;
        for ch in content.chars().take(self.offset) {
            if ch == '\n' {
                line += 1;
                column = 0;
            } else {
                column += 1;
            }
        }
        (line, column)
    }
}

/// Selected range; `anchor` may sit after `head`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSelection {
    pub anchor: usize,
    pub head: usize,
}

impl TextSelection {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn start(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn end(&self) -> usize {
        self.anchor.max(self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.anchor == self.head
    }
}

/// Ephemeral state of a participant, never persisted past the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub connection: ConnectionStatus,
    #[serde(default)]
    pub flags: MediaFlags,
    pub network_quality: NetworkQuality,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<TextSelection>,
    pub last_activity: DateTime<Utc>,
}

impl PresenceState {
    pub fn connected() -> Self {
        Self {
            connection: ConnectionStatus::Connected,
            flags: MediaFlags::default(),
            network_quality: NetworkQuality::Good,
            cursor: None,
            selection: None,
            last_activity: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionStatus::Connected
    }
}

impl Default for PresenceState {
    fn default() -> Self {
        Self::connected()
    }
}

/// Color assigned to a participant for cursor/selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Deterministic color derived from the user id
    pub fn from_user_id(user_id: UserId) -> Self {
        let bytes = user_id.0.as_bytes();
        Self {
            r: bytes[0],
            g: bytes[1],
            b: bytes[2],
        }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationUser {
    pub id: UserId,
    pub name: String,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub permission: Permission,
    pub color: UserColor,
    #[serde(default)]
    pub presence: PresenceState,
}

impl CollaborationUser {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            avatar_url: None,
            role: Role::default(),
            permission: Permission::default(),
            color: UserColor::from_user_id(id),
            presence: PresenceState::connected(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    /// Name used for `@mentions`: the display name without whitespace
    pub fn handle(&self) -> String {
        self.name.split_whitespace().collect()
    }

    pub fn is_idle(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.presence.last_activity > threshold
    }
}
