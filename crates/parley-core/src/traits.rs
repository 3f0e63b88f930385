//! Core trait definitions for parley.
//!
//! These define the contracts between the session manager and its external
//! collaborators. Implementations live in other crates (parley-channels for
//! transports, parley-agent for the completion and speech services).

use crate::types::{Attachment, Completion, FileRef, InboundEvent, Message, MessageRef, SendOptions, UserId};
use anyhow::Result;
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Source of inbound events (long poll, terminal input, etc.).
#[async_trait]
pub trait Inbound: Send {
    /// Receive the next inbound event (blocks until available).
    async fn recv(&mut self) -> Result<InboundEvent>;
}

/// Outbound side of a chat platform.
///
/// Every failure is returned to the caller. Callers decide whether it is
/// fatal; the per-user mailbox treats all of them as log-only.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Unique identifier for this transport.
    fn id(&self) -> &str;

    async fn send_message(
        &self,
        chat: UserId,
        text: &str,
        options: &SendOptions,
    ) -> Result<MessageRef>;

    async fn edit_message(
        &self,
        target: &MessageRef,
        text: &str,
        options: &SendOptions,
    ) -> Result<()>;

    async fn delete_message(&self, target: &MessageRef) -> Result<()>;

    async fn send_voice(&self, chat: UserId, voice: Attachment) -> Result<MessageRef>;

    async fn send_document(&self, chat: UserId, document: Attachment) -> Result<MessageRef>;

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// A large-language-model completion service.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name (e.g., "openai").
    fn name(&self) -> &str;

    /// Complete the given system + history messages with `model`.
    async fn complete(&self, model: &str, messages: &[Message]) -> Result<Completion>;
}

/// Speech-to-text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String>;
}

/// Text-to-speech. Returns encoded audio bytes.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}
