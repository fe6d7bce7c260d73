/// Chat messages exchanged inside a session
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::{CollaborationUser, MessageId, SessionId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    CodeSnippet,
    FileShare,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnippet {
    pub language: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub code_snippet: Option<CodeSnippet>,
    #[serde(default)]
    pub file_attachment: Option<FileAttachment>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn is_edited(&self) -> bool {
        self.edited_at.is_some()
    }

    /// Reactions grouped by emoji, in first-use order
    pub fn reaction_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for reaction in &self.reactions {
            match counts.iter_mut().find(|(emoji, _)| *emoji == reaction.emoji) {
                Some((_, count)) => *count += 1,
                None => counts.push((reaction.emoji.clone(), 1)),
            }
        }
        counts
    }
}

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|[^\w@])@([A-Za-z0-9_.\-]+)").expect("mention pattern is valid")
    })
}

/// Resolve `@handle` mentions in `content` against the session participants.
///
/// A handle matches a participant when it equals their whitespace-free name,
/// ignoring case, and no other participant shares that handle. Unknown,
/// partial and ambiguous handles resolve to nobody.
pub fn resolve_mentions(content: &str, participants: &[CollaborationUser]) -> Vec<UserId> {
    let handles: Vec<(UserId, String)> = participants
        .iter()
        .map(|p| (p.id, p.handle().to_lowercase()))
        .collect();

    let mut mentions = Vec::new();
    for capture in mention_pattern().captures_iter(content) {
        let token = capture[1].trim_end_matches('.').to_lowercase();
        let mut matches = handles.iter().filter(|(_, handle)| *handle == token);
        let (Some((user_id, _)), None) = (matches.next(), matches.next()) else {
            continue;
        };
        if !mentions.contains(user_id) {
            mentions.push(*user_id);
        }
    }
    mentions
}
