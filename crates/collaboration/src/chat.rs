/// Session chat: ordered message store and the commands that mutate it
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    resolve_mentions, ChatMessage, CodeSnippet, CollaborationError, CollaborationUser,
    FileAttachment, MessageId, MessageType, Reaction, Result, SessionError, SessionId, UserId,
};

/// Message as submitted by a client, before the server assigns id and mentions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub code_snippet: Option<CodeSnippet>,
    #[serde(default)]
    pub file_attachment: Option<FileAttachment>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Text,
            content: content.into(),
            reply_to: None,
            code_snippet: None,
            file_attachment: None,
        }
    }

    pub fn code(content: impl Into<String>, language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::CodeSnippet,
            code_snippet: Some(CodeSnippet {
                language: language.into(),
                code: code.into(),
            }),
            ..Self::text(content)
        }
    }

    pub fn file(content: impl Into<String>, attachment: FileAttachment) -> Self {
        Self {
            message_type: MessageType::FileShare,
            file_attachment: Some(attachment),
            ..Self::text(content)
        }
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

/// Client request against the chat store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChatCommand {
    Send { message: NewMessage },
    Edit { message_id: MessageId, content: String },
    Delete { message_id: MessageId },
    React { message_id: MessageId, emoji: String },
    Unreact { message_id: MessageId, emoji: String },
}

/// Change broadcast to every participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChatEvent {
    Sent { message: ChatMessage },
    Edited { message: ChatMessage },
    Deleted { message_id: MessageId },
    Reactions {
        message_id: MessageId,
        reactions: Vec<Reaction>,
    },
}

#[derive(Debug, Clone)]
pub struct ChatStore {
    session_id: SessionId,
    messages: Vec<ChatMessage>,
    max_len: usize,
}

impl ChatStore {
    pub fn new(session_id: SessionId, max_len: usize) -> Self {
        Self {
            session_id,
            messages: Vec::new(),
            max_len,
        }
    }

    /// Client-side copy fed by server events; limits are the server's to enforce
    pub fn replica(session_id: SessionId) -> Self {
        Self::new(session_id, usize::MAX)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, id: MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn replies_to(&self, id: MessageId) -> Vec<&ChatMessage> {
        self.messages
            .iter()
            .filter(|m| m.reply_to == Some(id))
            .collect()
    }

    pub fn mentioning(&self, user_id: UserId) -> Vec<&ChatMessage> {
        self.messages
            .iter()
            .filter(|m| m.mentions.contains(&user_id))
            .collect()
    }

    pub fn send(
        &mut self,
        sender: UserId,
        message: NewMessage,
        participants: &[CollaborationUser],
    ) -> Result<ChatMessage> {
        self.check_content(&message.content, message.message_type)?;
        match message.message_type {
            MessageType::CodeSnippet if message.code_snippet.is_none() => {
                return Err(CollaborationError::InvalidOp(
                    "code snippet message without code".to_string(),
                ))
            }
            MessageType::FileShare if message.file_attachment.is_none() => {
                return Err(CollaborationError::InvalidOp(
                    "file share message without attachment".to_string(),
                ))
            }
            _ => {}
        }
        if let Some(parent) = message.reply_to {
            if self.get(parent).is_none() {
                return Err(SessionError::MessageNotFound(parent).into());
            }
        }

        let chat_message = ChatMessage {
            id: MessageId::new(),
            session_id: self.session_id,
            user_id: sender,
            message_type: message.message_type,
            mentions: resolve_mentions(&message.content, participants),
            content: message.content,
            reactions: Vec::new(),
            reply_to: message.reply_to,
            code_snippet: message.code_snippet,
            file_attachment: message.file_attachment,
            timestamp: Utc::now(),
            edited_at: None,
        };
        self.messages.push(chat_message.clone());
        Ok(chat_message)
    }

    pub fn edit(
        &mut self,
        user_id: UserId,
        id: MessageId,
        content: String,
        participants: &[CollaborationUser],
    ) -> Result<ChatMessage> {
        let message_type = self.owned(user_id, id)?.message_type;
        self.check_content(&content, message_type)?;

        let mentions = resolve_mentions(&content, participants);
        let message = self.message_mut(id)?;
        message.content = content;
        message.mentions = mentions;
        message.edited_at = Some(Utc::now());
        Ok(message.clone())
    }

    pub fn delete(&mut self, user_id: UserId, id: MessageId) -> Result<()> {
        self.owned(user_id, id)?;
        self.messages.retain(|m| m.id != id);
        Ok(())
    }

    /// Add a reaction; reacting twice with the same emoji is a no-op
    pub fn react(&mut self, user_id: UserId, id: MessageId, emoji: &str) -> Result<&[Reaction]> {
        if emoji.trim().is_empty() {
            return Err(CollaborationError::InvalidOp("empty emoji".to_string()));
        }
        let message = self.message_mut(id)?;
        let exists = message
            .reactions
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji);
        if !exists {
            message.reactions.push(Reaction {
                emoji: emoji.to_string(),
                user_id,
                timestamp: Utc::now(),
            });
        }
        Ok(&message.reactions)
    }

    pub fn unreact(&mut self, user_id: UserId, id: MessageId, emoji: &str) -> Result<&[Reaction]> {
        let message = self.message_mut(id)?;
        message
            .reactions
            .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        Ok(&message.reactions)
    }

    /// Run a client command and describe the change for broadcast
    pub fn execute(
        &mut self,
        user_id: UserId,
        command: ChatCommand,
        participants: &[CollaborationUser],
    ) -> Result<ChatEvent> {
        let event = match command {
            ChatCommand::Send { message } => ChatEvent::Sent {
                message: self.send(user_id, message, participants)?,
            },
            ChatCommand::Edit {
                message_id,
                content,
            } => ChatEvent::Edited {
                message: self.edit(user_id, message_id, content, participants)?,
            },
            ChatCommand::Delete { message_id } => {
                self.delete(user_id, message_id)?;
                ChatEvent::Deleted { message_id }
            }
            ChatCommand::React { message_id, emoji } => ChatEvent::Reactions {
                message_id,
                reactions: self.react(user_id, message_id, &emoji)?.to_vec(),
            },
            ChatCommand::Unreact { message_id, emoji } => ChatEvent::Reactions {
                message_id,
                reactions: self.unreact(user_id, message_id, &emoji)?.to_vec(),
            },
        };
        Ok(event)
    }

    /// Apply a broadcast event to a client-side copy of the store
    pub fn apply_event(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::Sent { message } => {
                if self.get(message.id).is_none() {
                    self.messages.push(message.clone());
                }
            }
            ChatEvent::Edited { message } => {
                if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
                    *existing = message.clone();
                }
            }
            ChatEvent::Deleted { message_id } => self.messages.retain(|m| m.id != *message_id),
            ChatEvent::Reactions {
                message_id,
                reactions,
            } => {
                if let Some(existing) = self.messages.iter_mut().find(|m| m.id == *message_id) {
                    existing.reactions = reactions.clone();
                }
            }
        }
    }

    fn check_content(&self, content: &str, message_type: MessageType) -> Result<()> {
        if message_type == MessageType::Text && content.trim().is_empty() {
            return Err(CollaborationError::InvalidOp("empty message".to_string()));
        }
        let len = content.chars().count();
        if len > self.max_len {
            return Err(CollaborationError::InvalidOp(format!(
                "message is {} characters, limit is {}",
                len, self.max_len
            )));
        }
        Ok(())
    }

    fn owned(&self, user_id: UserId, id: MessageId) -> Result<&ChatMessage> {
        let message = self
            .get(id)
            .ok_or(SessionError::MessageNotFound(id))?;
        if message.user_id != user_id {
            return Err(CollaborationError::PermissionDenied(
                "only the sender may change a message".to_string(),
            ));
        }
        Ok(message)
    }

    fn message_mut(&mut self, id: MessageId) -> Result<&mut ChatMessage> {
        Ok(self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(SessionError::MessageNotFound(id))?)
    }
}
