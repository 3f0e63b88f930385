use anyhow::Result;
use async_trait::async_trait;
use parley_core::{
    Attachment, FileRef, Inbound, InboundEvent, MessageRef, ReplyMarkup, SendOptions, Transport,
    UserId,
};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;

/// What the gateway asks the terminal to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutput {
    Message {
        id: i64,
        text: String,
        buttons: Vec<String>,
    },
    Edit {
        id: i64,
        text: String,
    },
    Delete {
        id: i64,
    },
    File {
        name: String,
        caption: Option<String>,
        bytes: Vec<u8>,
    },
}

/// Inbound half: lines typed by the local user.
#[allow(missing_debug_implementations)] // contains mpsc channels
pub struct TerminalInbound {
    user: UserId,
    rx: mpsc::Receiver<String>,
}

/// Outbound half: everything the gateway sends goes to the handle.
#[allow(missing_debug_implementations)] // contains mpsc channels
pub struct TerminalTransport {
    tx: mpsc::Sender<TerminalOutput>,
    next_id: AtomicI64,
}

/// Handle for the terminal side to send lines and receive output.
#[allow(missing_debug_implementations)] // contains mpsc channels
pub struct TerminalHandle {
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<TerminalOutput>,
}

/// Create a linked (inbound, transport, handle) triple for one local user.
/// Lines sent via `TerminalHandle.tx` arrive as text events from `user`.
/// Everything sent through the transport arrives on `TerminalHandle.rx`.
pub fn terminal_pair(
    buffer: usize,
    user: UserId,
) -> (TerminalInbound, TerminalTransport, TerminalHandle) {
    let (term_to_gw_tx, term_to_gw_rx) = mpsc::channel(buffer);
    let (gw_to_term_tx, gw_to_term_rx) = mpsc::channel(buffer);

    let inbound = TerminalInbound {
        user,
        rx: term_to_gw_rx,
    };

    let transport = TerminalTransport {
        tx: gw_to_term_tx,
        next_id: AtomicI64::new(1),
    };

    let handle = TerminalHandle {
        tx: term_to_gw_tx,
        rx: gw_to_term_rx,
    };

    (inbound, transport, handle)
}

#[async_trait]
impl Inbound for TerminalInbound {
    async fn recv(&mut self) -> Result<InboundEvent> {
        let line = self
            .rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("terminal channel closed"))?;
        Ok(InboundEvent::text(self.user, line))
    }
}

impl TerminalTransport {
    async fn emit(&self, output: TerminalOutput) -> Result<()> {
        self.tx
            .send(output)
            .await
            .map_err(|_send_err| anyhow::anyhow!("terminal channel receiver dropped"))
    }

    fn next_ref(&self, chat: UserId) -> MessageRef {
        MessageRef {
            chat,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        }
    }
}

fn button_labels(options: &SendOptions) -> Vec<String> {
    match &options.markup {
        Some(ReplyMarkup::Keyboard(rows)) => rows.iter().flatten().cloned().collect(),
        Some(ReplyMarkup::Inline(rows)) => rows.iter().flatten().map(|b| b.data.clone()).collect(),
        None => Vec::new(),
    }
}

#[async_trait]
impl Transport for TerminalTransport {
    fn id(&self) -> &'static str {
        "terminal"
    }

    async fn send_message(
        &self,
        chat: UserId,
        text: &str,
        options: &SendOptions,
    ) -> Result<MessageRef> {
        let target = self.next_ref(chat);
        self.emit(TerminalOutput::Message {
            id: target.message_id,
            text: text.to_owned(),
            buttons: button_labels(options),
        })
        .await?;
        Ok(target)
    }

    async fn edit_message(
        &self,
        target: &MessageRef,
        text: &str,
        _options: &SendOptions,
    ) -> Result<()> {
        self.emit(TerminalOutput::Edit {
            id: target.message_id,
            text: text.to_owned(),
        })
        .await
    }

    async fn delete_message(&self, target: &MessageRef) -> Result<()> {
        self.emit(TerminalOutput::Delete {
            id: target.message_id,
        })
        .await
    }

    async fn send_voice(&self, chat: UserId, voice: Attachment) -> Result<MessageRef> {
        self.send_document(chat, voice).await
    }

    async fn send_document(&self, chat: UserId, document: Attachment) -> Result<MessageRef> {
        let target = self.next_ref(chat);
        self.emit(TerminalOutput::File {
            name: document.file_name,
            caption: document.caption,
            bytes: document.bytes,
        })
        .await?;
        Ok(target)
    }

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>> {
        anyhow::bail!("terminal has no hosted files ({})", file.file_id)
    }
}
