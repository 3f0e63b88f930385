//! Fake implementations for testing.
#![allow(clippy::unwrap_used)]

use crate::traits::{CompletionProvider, Inbound, SpeechSynthesizer, Transcriber, Transport};
use crate::types::{
    Attachment, Completion, FileRef, InboundEvent, Message, MessageRef, SendOptions, TokenUsage,
    UserId,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

// ---------------------------------------------------------------------------
// FakeInbound
// ---------------------------------------------------------------------------

/// Inbound source replaying a fixed list of events.
#[derive(Debug, Default)]
pub struct FakeInbound {
    events: VecDeque<InboundEvent>,
}

impl FakeInbound {
    pub fn new(events: impl IntoIterator<Item = InboundEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Inbound for FakeInbound {
    async fn recv(&mut self) -> Result<InboundEvent> {
        self.events
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no inbound events"))
    }
}

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

/// One observed transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent {
        target: MessageRef,
        text: String,
        options: SendOptions,
    },
    Edited {
        target: MessageRef,
        text: String,
    },
    Deleted {
        target: MessageRef,
    },
    Voice {
        target: MessageRef,
        caption: Option<String>,
    },
    Document {
        target: MessageRef,
        file_name: String,
        caption: Option<String>,
        body: String,
    },
}

impl Delivery {
    pub fn chat(&self) -> UserId {
        match self {
            Delivery::Sent { target, .. }
            | Delivery::Edited { target, .. }
            | Delivery::Deleted { target }
            | Delivery::Voice { target, .. }
            | Delivery::Document { target, .. } => target.chat,
        }
    }

    /// Text shown by this delivery, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Delivery::Sent { text, .. } | Delivery::Edited { text, .. } => Some(text),
            Delivery::Voice { caption, .. } | Delivery::Document { caption, .. } => {
                caption.as_deref()
            }
            Delivery::Deleted { .. } => None,
        }
    }
}

/// Transport that records every call in order.
#[derive(Debug)]
pub struct FakeTransport {
    deliveries: Mutex<Vec<Delivery>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    next_id: AtomicI64,
    fail_sends: AtomicBool,
    fail_voice: AtomicBool,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            fail_sends: AtomicBool::new(false),
            fail_voice: AtomicBool::new(false),
        }
    }

    /// Make every send/edit call fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_voice(&self, fail: bool) {
        self.fail_voice.store(fail, Ordering::SeqCst);
    }

    pub fn add_file(&self, file_id: impl Into<String>, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(file_id.into(), bytes);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn deliveries_for(&self, chat: UserId) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.chat() == chat)
            .collect()
    }

    /// All texts shown to `chat`, in delivery order.
    pub fn texts_for(&self, chat: UserId) -> Vec<String> {
        self.deliveries_for(chat)
            .iter()
            .filter_map(|d| d.text().map(ToOwned::to_owned))
            .collect()
    }

    pub fn last_text_for(&self, chat: UserId) -> Option<String> {
        self.texts_for(chat).pop()
    }

    fn next_ref(&self, chat: UserId) -> MessageRef {
        MessageRef {
            chat,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        }
    }

    fn check_sends(&self) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("fake transport send failure");
        }
        Ok(())
    }

    fn record(&self, delivery: Delivery) {
        self.deliveries.lock().unwrap().push(delivery);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn id(&self) -> &str {
        "fake"
    }

    async fn send_message(
        &self,
        chat: UserId,
        text: &str,
        options: &SendOptions,
    ) -> Result<MessageRef> {
        self.check_sends()?;
        let target = self.next_ref(chat);
        self.record(Delivery::Sent {
            target,
            text: text.to_owned(),
            options: options.clone(),
        });
        Ok(target)
    }

    async fn edit_message(
        &self,
        target: &MessageRef,
        text: &str,
        _options: &SendOptions,
    ) -> Result<()> {
        self.check_sends()?;
        self.record(Delivery::Edited {
            target: *target,
            text: text.to_owned(),
        });
        Ok(())
    }

    async fn delete_message(&self, target: &MessageRef) -> Result<()> {
        self.record(Delivery::Deleted { target: *target });
        Ok(())
    }

    async fn send_voice(&self, chat: UserId, voice: Attachment) -> Result<MessageRef> {
        if self.fail_voice.load(Ordering::SeqCst) {
            anyhow::bail!("fake transport voice failure");
        }
        let target = self.next_ref(chat);
        self.record(Delivery::Voice {
            target,
            caption: voice.caption,
        });
        Ok(target)
    }

    async fn send_document(&self, chat: UserId, document: Attachment) -> Result<MessageRef> {
        self.check_sends()?;
        let target = self.next_ref(chat);
        self.record(Delivery::Document {
            target,
            file_name: document.file_name,
            caption: document.caption,
            body: String::from_utf8_lossy(&document.bytes).into_owned(),
        });
        Ok(target)
    }

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&file.file_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown file: {}", file.file_id))
    }
}

// ---------------------------------------------------------------------------
// FakeProvider
// ---------------------------------------------------------------------------

/// Fake provider that returns canned responses.
///
/// Queued responses are returned first, then the default response. Every
/// request is recorded.
#[derive(Debug)]
pub struct FakeProvider {
    pub response: Mutex<String>,
    queued: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<(String, Vec<Message>)>>,
    usage: TokenUsage,
}

impl FakeProvider {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: Mutex::new(response.into()),
            queued: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            usage: TokenUsage::new(100, 50),
        }
    }

    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn set_response(&self, response: impl Into<String>) {
        *self.response.lock().unwrap() = response.into();
    }

    pub fn queue(&self, response: impl Into<String>) {
        self.queued.lock().unwrap().push_back(response.into());
    }

    pub fn requests(&self) -> Vec<(String, Vec<Message>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn complete(&self, model: &str, messages: &[Message]) -> Result<Completion> {
        self.requests
            .lock()
            .unwrap()
            .push((model.to_owned(), messages.to_vec()));
        let text = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.response.lock().unwrap().clone());
        Ok(Completion {
            text,
            usage: self.usage,
        })
    }
}

/// Provider whose every call fails.
#[derive(Debug)]
pub struct FailingProvider {
    message: String,
}

impl FailingProvider {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl CompletionProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _model: &str, _messages: &[Message]) -> Result<Completion> {
        anyhow::bail!("{}", self.message)
    }
}

/// Fake provider that sleeps before returning, simulating slow API calls.
#[derive(Debug)]
pub struct SlowFakeProvider {
    inner: FakeProvider,
    delay: std::time::Duration,
}

impl SlowFakeProvider {
    pub fn new(response: impl Into<String>, delay: std::time::Duration) -> Self {
        Self {
            inner: FakeProvider::new(response),
            delay,
        }
    }
}

#[async_trait]
impl CompletionProvider for SlowFakeProvider {
    fn name(&self) -> &str {
        "slow-fake"
    }

    async fn complete(&self, model: &str, messages: &[Message]) -> Result<Completion> {
        tokio::time::sleep(self.delay).await;
        self.inner.complete(model, messages).await
    }
}

// ---------------------------------------------------------------------------
// Speech
// ---------------------------------------------------------------------------

/// Transcriber returning a fixed transcript, or failing when `None`.
#[derive(Debug)]
pub struct FakeTranscriber {
    transcript: Option<String>,
}

impl FakeTranscriber {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: Some(transcript.into()),
        }
    }

    pub fn failing() -> Self {
        Self { transcript: None }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _audio: Vec<u8>) -> Result<String> {
        self.transcript
            .clone()
            .ok_or_else(|| anyhow::anyhow!("fake transcription failure"))
    }
}

/// Synthesizer echoing the text as bytes, or failing.
#[derive(Debug, Default)]
pub struct FakeSynthesizer {
    fail: bool,
}

impl FakeSynthesizer {
    pub fn new() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        if self.fail {
            anyhow::bail!("unexpected status code: 401 Unauthorized");
        }
        Ok(text.as_bytes().to_vec())
    }
}
