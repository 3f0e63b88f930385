use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// Opaque numeric identity of an end user (the chat id on the transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Token counts reported by a completion. Cost is never stored alongside;
/// it is derived from these counts and the price table on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn is_empty(self) -> bool {
        self.total() == 0
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens.saturating_add(rhs.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(rhs.completion_tokens),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Response from a completion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Reference to a file hosted by the transport (e.g. a voice note).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: String,
}

impl FileRef {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
        }
    }
}

/// What the user sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPayload {
    Text(String),
    Voice(FileRef),
    /// Inline keyboard button press; the data is treated as command text.
    Callback(String),
}

/// An inbound event from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub user: UserId,
    pub payload: InboundPayload,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn text(user: UserId, text: impl Into<String>) -> Self {
        Self {
            user,
            payload: InboundPayload::Text(text.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn voice(user: UserId, file: FileRef) -> Self {
        Self {
            user,
            payload: InboundPayload::Voice(file),
            timestamp: Utc::now(),
        }
    }

    pub fn callback(user: UserId, data: impl Into<String>) -> Self {
        Self {
            user,
            payload: InboundPayload::Callback(data.into()),
            timestamp: Utc::now(),
        }
    }

    /// Textual content used for command matching. Voice events carry none.
    pub fn content(&self) -> &str {
        match &self.payload {
            InboundPayload::Text(text) | InboundPayload::Callback(text) => text,
            InboundPayload::Voice(_) => "",
        }
    }

    pub fn voice_file(&self) -> Option<&FileRef> {
        match &self.payload {
            InboundPayload::Voice(file) => Some(file),
            _ => None,
        }
    }
}

/// Identifies a message previously delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat: UserId,
    pub message_id: i64,
}

/// A button on an inline keyboard. Pressing it sends `data` back as a callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: data.into(),
        }
    }
}

/// Keyboard attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMarkup {
    /// Persistent reply keyboard; each button sends its label as text.
    Keyboard(Vec<Vec<String>>),
    Inline(Vec<Vec<InlineButton>>),
}

/// Formatting options for outbound text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub markdown: bool,
    pub markup: Option<ReplyMarkup>,
}

impl SendOptions {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn markdown() -> Self {
        Self {
            markdown: true,
            markup: None,
        }
    }

    #[must_use]
    pub fn with_markup(mut self, markup: ReplyMarkup) -> Self {
        self.markup = Some(markup);
        self
    }
}

/// A binary payload sent as a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub caption: Option<String>,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_adds_componentwise() {
        let mut usage = TokenUsage::new(10, 5);
        usage += TokenUsage::new(1, 2);
        assert_eq!(usage, TokenUsage::new(11, 7));
        assert_eq!(usage.total(), 18);
    }

    #[test]
    fn user_id_parses_with_whitespace() {
        assert_eq!(" 42 ".parse::<UserId>().unwrap(), UserId(42));
        assert!("abc".parse::<UserId>().is_err());
    }

    #[test]
    fn voice_event_has_no_content() {
        let event = InboundEvent::voice(UserId(1), FileRef::new("f1"));
        assert_eq!(event.content(), "");
        assert_eq!(event.voice_file().unwrap().file_id, "f1");
    }

    #[test]
    fn callback_content_is_command_text() {
        let event = InboundEvent::callback(UserId(1), "/whitelist 42");
        assert_eq!(event.content(), "/whitelist 42");
        assert!(event.voice_file().is_none());
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }
}
