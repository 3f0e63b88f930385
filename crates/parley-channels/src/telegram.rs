//! Telegram Bot API transport.
//!
//! [`TelegramApi`] implements the outbound side; [`TelegramUpdates`] long-polls
//! `getUpdates` and yields [`InboundEvent`]s.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{
    Attachment, FileRef, Inbound, InboundEvent, InboundPayload, MessageRef, ReplyMarkup,
    SendOptions, Transport, UserId,
};
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects longer media captions.
const MAX_CAPTION_CHARS: usize = 1024;

pub struct TelegramApi {
    client: Client,
    api_base: String,
    token: String,
}

impl TelegramApi {
    pub fn new(token: String, api_base: &str, poll_timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(poll_timeout_secs.saturating_add(30)))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base: api_base.trim().trim_end_matches('/').to_owned(),
            token,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{file_path}", self.api_base, self.token)
    }

    async fn call(&self, method: &str, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to send telegram {method}"))?;
        unwrap_result(method, response).await
    }

    async fn call_multipart(&self, method: &str, form: Form) -> Result<Value> {
        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("failed to send telegram {method}"))?;
        unwrap_result(method, response).await
    }

    /// Fetch pending updates starting at `offset`, waiting up to `timeout_secs`.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Value>> {
        let result = self
            .call(
                "getUpdates",
                &json!({
                    "offset": offset,
                    "timeout": timeout_secs,
                    "allowed_updates": ["message", "edited_message", "callback_query"],
                }),
            )
            .await?;

        match result {
            Value::Array(updates) => Ok(updates),
            _ => anyhow::bail!("telegram getUpdates response missing result[]"),
        }
    }

    pub async fn answer_callback_query(&self, callback_query_id: &str) -> Result<()> {
        self.call(
            "answerCallbackQuery",
            &json!({ "callback_query_id": callback_query_id }),
        )
        .await?;
        Ok(())
    }

    async fn send_attachment(
        &self,
        method: &str,
        field: &'static str,
        chat: UserId,
        attachment: Attachment,
    ) -> Result<MessageRef> {
        let mut form = Form::new().text("chat_id", chat.to_string()).part(
            field,
            Part::bytes(attachment.bytes).file_name(attachment.file_name),
        );
        if let Some(caption) = attachment.caption {
            form = form.text("caption", truncate_chars(&caption, MAX_CAPTION_CHARS));
        }

        let result = self.call_multipart(method, form).await?;
        message_ref(chat, &result)
    }
}

impl std::fmt::Debug for TelegramApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramApi")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for TelegramApi {
    fn id(&self) -> &'static str {
        "telegram"
    }

    async fn send_message(
        &self,
        chat: UserId,
        text: &str,
        options: &SendOptions,
    ) -> Result<MessageRef> {
        let body = message_body(chat, text, options);
        match self.call("sendMessage", &body).await {
            Ok(result) => message_ref(chat, &result),
            Err(error) if options.markdown && is_entity_error(&error) => {
                debug!(chat = %chat, "markdown rejected, resending as plain text");
                let plain = SendOptions {
                    markdown: false,
                    markup: options.markup.clone(),
                };
                let result = self
                    .call("sendMessage", &message_body(chat, text, &plain))
                    .await?;
                message_ref(chat, &result)
            }
            Err(error) => Err(error),
        }
    }

    async fn edit_message(
        &self,
        target: &MessageRef,
        text: &str,
        options: &SendOptions,
    ) -> Result<()> {
        let mut body = json!({
            "chat_id": target.chat.0,
            "message_id": target.message_id,
            "text": text,
        });
        if options.markdown {
            body["parse_mode"] = json!("Markdown");
        }
        // Only inline keyboards can be attached to an edited message.
        if let Some(markup @ ReplyMarkup::Inline(_)) = &options.markup {
            body["reply_markup"] = markup_json(markup);
        }

        match self.call("editMessageText", &body).await {
            Ok(_) => Ok(()),
            Err(error) if options.markdown && is_entity_error(&error) => {
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("parse_mode");
                }
                self.call("editMessageText", &body).await?;
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn delete_message(&self, target: &MessageRef) -> Result<()> {
        self.call(
            "deleteMessage",
            &json!({
                "chat_id": target.chat.0,
                "message_id": target.message_id,
            }),
        )
        .await?;
        Ok(())
    }

    async fn send_voice(&self, chat: UserId, voice: Attachment) -> Result<MessageRef> {
        self.send_attachment("sendVoice", "voice", chat, voice).await
    }

    async fn send_document(&self, chat: UserId, document: Attachment) -> Result<MessageRef> {
        self.send_attachment("sendDocument", "document", chat, document)
            .await
    }

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>> {
        let result = self
            .call("getFile", &json!({ "file_id": file.file_id }))
            .await
            .context("error getting file metadata")?;
        let file_path = result
            .get("file_path")
            .and_then(Value::as_str)
            .context("telegram getFile response missing file_path")?;

        let response = self
            .client
            .get(self.file_url(file_path))
            .send()
            .await
            .context("error downloading file from telegram")?;
        let status = response.status();
        anyhow::ensure!(
            status.is_success(),
            "error downloading file from telegram: {status}"
        );

        let bytes = response
            .bytes()
            .await
            .context("error reading telegram file body")?;
        Ok(bytes.to_vec())
    }
}

async fn unwrap_result(method: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .with_context(|| format!("failed to parse telegram {method} response ({status})"))?;

    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(body.get("result").cloned().unwrap_or(Value::Null));
    }

    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description");
    anyhow::bail!("telegram {method} failed: {status} - {description}")
}

fn is_entity_error(error: &anyhow::Error) -> bool {
    error.to_string().contains("can't parse entities")
}

fn message_ref(chat: UserId, result: &Value) -> Result<MessageRef> {
    let message_id = result
        .get("message_id")
        .and_then(Value::as_i64)
        .context("telegram response missing message_id")?;
    Ok(MessageRef { chat, message_id })
}

fn message_body(chat: UserId, text: &str, options: &SendOptions) -> Value {
    let mut body = json!({
        "chat_id": chat.0,
        "text": text,
    });
    if options.markdown {
        body["parse_mode"] = json!("Markdown");
    }
    if let Some(markup) = &options.markup {
        body["reply_markup"] = markup_json(markup);
    }
    body
}

fn markup_json(markup: &ReplyMarkup) -> Value {
    match markup {
        ReplyMarkup::Keyboard(rows) => {
            let keyboard: Vec<Vec<Value>> = rows
                .iter()
                .map(|row| row.iter().map(|label| json!({ "text": label })).collect())
                .collect();
            json!({
                "keyboard": keyboard,
                "resize_keyboard": true,
                "one_time_keyboard": false,
            })
        }
        ReplyMarkup::Inline(rows) => {
            let inline_keyboard: Vec<Vec<Value>> = rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| json!({ "text": b.text, "callback_data": b.data }))
                        .collect()
                })
                .collect();
            json!({ "inline_keyboard": inline_keyboard })
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_owned(),
        None => text.to_owned(),
    }
}

fn from_unix(value: Option<&Value>) -> DateTime<Utc> {
    value
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

/// Map a raw update to an inbound event. Updates carrying nothing the
/// session manager understands (stickers, photos, joins) yield `None`.
pub fn parse_update(update: &Value) -> Option<InboundEvent> {
    if let Some(message) = update.get("message") {
        let chat = message.pointer("/chat/id").and_then(Value::as_i64)?;
        let payload = if let Some(text) = message.get("text").and_then(Value::as_str) {
            InboundPayload::Text(text.to_owned())
        } else if let Some(file_id) = message.pointer("/voice/file_id").and_then(Value::as_str) {
            InboundPayload::Voice(FileRef::new(file_id))
        } else {
            return None;
        };
        return Some(InboundEvent {
            user: UserId(chat),
            payload,
            timestamp: from_unix(message.get("date")),
        });
    }

    if let Some(message) = update.get("edited_message") {
        let chat = message.pointer("/chat/id").and_then(Value::as_i64)?;
        let text = message.get("text").and_then(Value::as_str)?;
        return Some(InboundEvent {
            user: UserId(chat),
            payload: InboundPayload::Text(text.to_owned()),
            timestamp: from_unix(message.get("edit_date")),
        });
    }

    if let Some(query) = update.get("callback_query") {
        let chat = query
            .pointer("/message/chat/id")
            .or_else(|| query.pointer("/from/id"))
            .and_then(Value::as_i64)?;
        let data = query.get("data").and_then(Value::as_str)?;
        return Some(InboundEvent {
            user: UserId(chat),
            payload: InboundPayload::Callback(data.to_owned()),
            timestamp: Utc::now(),
        });
    }

    None
}

fn callback_query_id(update: &Value) -> Option<&str> {
    update.pointer("/callback_query/id").and_then(Value::as_str)
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Long-poll receiver over `getUpdates`.
pub struct TelegramUpdates {
    api: Arc<TelegramApi>,
    offset: i64,
    poll_timeout_secs: u64,
    pending: VecDeque<InboundEvent>,
}

impl TelegramUpdates {
    pub fn new(api: Arc<TelegramApi>, poll_timeout_secs: u64) -> Self {
        Self {
            api,
            offset: 0,
            poll_timeout_secs,
            pending: VecDeque::new(),
        }
    }

    /// Poll once and queue every understood update. Returns the number queued.
    async fn poll(&mut self) -> Result<usize> {
        let updates = self
            .api
            .get_updates(self.offset, self.poll_timeout_secs)
            .await?;

        let mut queued = 0;
        for update in &updates {
            if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                self.offset = self.offset.max(update_id.saturating_add(1));
            }

            if let Some(id) = callback_query_id(update)
                && let Err(error) = self.api.answer_callback_query(id).await
            {
                warn!(error = %error, "failed to answer callback query");
            }

            match parse_update(update) {
                Some(event) => {
                    self.pending.push_back(event);
                    queued += 1;
                }
                None => debug!(update = %update, "ignoring unsupported telegram update"),
            }
        }
        Ok(queued)
    }
}

impl std::fmt::Debug for TelegramUpdates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramUpdates")
            .field("offset", &self.offset)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Inbound for TelegramUpdates {
    async fn recv(&mut self) -> Result<InboundEvent> {
        let mut backoff = Duration::from_secs(1);

        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            match self.poll().await {
                Ok(_) => backoff = Duration::from_secs(1),
                Err(error) => {
                    warn!(error = %error, backoff_secs = backoff.as_secs(), "telegram poll failed");
                    tokio::time::sleep(backoff).await;
                    let next_secs = backoff.as_secs().saturating_mul(2).min(30);
                    backoff = Duration::from_secs(next_secs.max(1));
                }
            }
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use parley_core::InlineButton;

    fn api(server: &MockServer) -> TelegramApi {
        TelegramApi::new("test-token".into(), &server.base_url(), 0).unwrap()
    }

    #[test]
    fn parse_text_message() {
        let update = json!({
            "update_id": 10,
            "message": {"message_id": 1, "date": 1_700_000_000, "chat": {"id": 42}, "text": "/list"}
        });
        let event = parse_update(&update).unwrap();
        assert_eq!(event.user, UserId(42));
        assert_eq!(event.content(), "/list");
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn parse_voice_message() {
        let update = json!({
            "update_id": 11,
            "message": {"chat": {"id": 42}, "voice": {"file_id": "abc", "duration": 3}}
        });
        let event = parse_update(&update).unwrap();
        assert_eq!(event.voice_file().unwrap().file_id, "abc");
    }

    #[test]
    fn parse_edited_and_callback() {
        let edited = json!({"edited_message": {"chat": {"id": 7}, "text": "fixed"}});
        assert_eq!(parse_update(&edited).unwrap().content(), "fixed");

        let callback = json!({
            "callback_query": {
                "id": "cb1",
                "from": {"id": 1},
                "message": {"chat": {"id": 1}},
                "data": "/whitelist 42"
            }
        });
        let event = parse_update(&callback).unwrap();
        assert_eq!(
            event.payload,
            InboundPayload::Callback("/whitelist 42".into())
        );
        assert_eq!(callback_query_id(&callback), Some("cb1"));
    }

    #[test]
    fn ignore_unsupported_updates() {
        let sticker = json!({"message": {"chat": {"id": 1}, "sticker": {"file_id": "s"}}});
        assert!(parse_update(&sticker).is_none());
        assert!(parse_update(&json!({"my_chat_member": {}})).is_none());
    }

    #[test]
    fn keyboards_render_as_bot_api_markup() {
        let keyboard = markup_json(&ReplyMarkup::Keyboard(vec![vec![
            "/list".into(),
            "/new".into(),
        ]]));
        assert_eq!(keyboard["keyboard"][0][1]["text"], "/new");
        assert_eq!(keyboard["resize_keyboard"], true);

        let inline = markup_json(&ReplyMarkup::Inline(vec![vec![InlineButton::new(
            "Whitelist",
            "/whitelist 42",
        )]]));
        assert_eq!(inline["inline_keyboard"][0][0]["callback_data"], "/whitelist 42");
    }

    #[test]
    fn captions_truncate_on_char_boundary() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[tokio::test]
    async fn send_message_returns_message_ref() {
        let server = MockServer::start();
        let sent = server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/sendMessage")
                .body_includes("\"parse_mode\":\"Markdown\"")
                .body_includes("Main Menu");
            then.status(200)
                .json_body(json!({"ok": true, "result": {"message_id": 99}}));
        });

        let target = api(&server)
            .send_message(UserId(42), "Main Menu", &SendOptions::markdown())
            .await
            .unwrap();

        sent.assert();
        assert_eq!(
            target,
            MessageRef {
                chat: UserId(42),
                message_id: 99
            }
        );
    }

    #[tokio::test]
    async fn api_error_carries_description() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/deleteMessage");
            then.status(400).json_body(
                json!({"ok": false, "description": "Bad Request: message to delete not found"}),
            );
        });

        let err = api(&server)
            .delete_message(&MessageRef {
                chat: UserId(1),
                message_id: 5,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("message to delete not found"));
    }

    #[tokio::test]
    async fn download_resolves_file_path() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getFile");
            then.status(200)
                .json_body(json!({"ok": true, "result": {"file_id": "abc", "file_path": "voice/file_1.oga"}}));
        });
        let file = server.mock(|when, then| {
            when.method(GET).path("/file/bottest-token/voice/file_1.oga");
            then.status(200).body("OGGDATA");
        });

        let bytes = api(&server)
            .download_file(&FileRef::new("abc"))
            .await
            .unwrap();

        file.assert();
        assert_eq!(bytes, b"OGGDATA");
    }

    #[tokio::test]
    async fn updates_advance_offset_and_answer_callbacks() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getUpdates");
            then.status(200).json_body(json!({
                "ok": true,
                "result": [
                    {"update_id": 5, "message": {"chat": {"id": 42}, "text": "hello"}},
                    {"update_id": 6, "callback_query": {
                        "id": "cb", "from": {"id": 1}, "data": "/whitelist 42"
                    }}
                ]
            }));
        });
        let answered = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/answerCallbackQuery");
            then.status(200).json_body(json!({"ok": true, "result": true}));
        });

        let mut updates = TelegramUpdates::new(Arc::new(api(&server)), 0);
        let first = updates.recv().await.unwrap();
        let second = updates.recv().await.unwrap();

        assert_eq!(first.content(), "hello");
        assert_eq!(second.user, UserId(1));
        assert_eq!(updates.offset, 7);
        answered.assert_calls(1);
    }
}
