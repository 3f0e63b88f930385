//! Per-user serialized outbound delivery.
//!
//! The orchestrator only enqueues effects; a single worker task per user
//! performs the transport calls strictly in enqueue order. Transport
//! failures are logged and never reach the caller.

use anyhow::Result;
use parley_core::{Attachment, MessageRef, SendOptions, Transport, UserId};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug)]
enum Effect {
    /// Send a new message; it becomes the edit target.
    Send { text: String, options: SendOptions },
    /// Replace the text of the most recently sent message.
    Edit { text: String, options: SendOptions },
    /// Send audio. On success the progress message is removed; on failure
    /// it is edited to `fallback` plus the error.
    Voice {
        attachment: Attachment,
        fallback: String,
    },
    Document { attachment: Attachment },
    /// Resolves once every earlier effect has been attempted.
    Flush(oneshot::Sender<()>),
}

impl Effect {
    fn kind(&self) -> &'static str {
        match self {
            Effect::Send { .. } => "send",
            Effect::Edit { .. } => "edit",
            Effect::Voice { .. } => "voice",
            Effect::Document { .. } => "document",
            Effect::Flush(_) => "flush",
        }
    }
}

/// Handle to one user's delivery queue. Enqueueing never blocks.
#[derive(Debug, Clone)]
pub(crate) struct Mailbox {
    user: UserId,
    tx: mpsc::UnboundedSender<Effect>,
}

impl Mailbox {
    /// Start the delivery worker for `user`. Must be called inside a Tokio runtime.
    pub(crate) fn spawn(user: UserId, transport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            user,
            transport,
            last_sent: None,
        };
        tokio::spawn(worker.run(rx));
        Self { user, tx }
    }

    fn enqueue(&self, effect: Effect) {
        if let Err(err) = self.tx.send(effect) {
            warn!(user = %self.user, kind = err.0.kind(), "mailbox worker gone, dropping effect");
        }
    }

    pub(crate) fn send(&self, text: impl Into<String>, options: SendOptions) {
        self.enqueue(Effect::Send {
            text: text.into(),
            options,
        });
    }

    pub(crate) fn edit(&self, text: impl Into<String>, options: SendOptions) {
        self.enqueue(Effect::Edit {
            text: text.into(),
            options,
        });
    }

    pub(crate) fn voice(&self, attachment: Attachment, fallback: impl Into<String>) {
        self.enqueue(Effect::Voice {
            attachment,
            fallback: fallback.into(),
        });
    }

    pub(crate) fn document(&self, attachment: Attachment) {
        self.enqueue(Effect::Document { attachment });
    }

    /// Wait until everything enqueued so far has been delivered or has failed.
    pub(crate) async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(Effect::Flush(done_tx));
        // A dropped sender means the worker is gone; nothing left to wait for.
        let _ = done_rx.await;
    }
}

struct Worker {
    user: UserId,
    transport: Arc<dyn Transport>,
    last_sent: Option<MessageRef>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Effect>) {
        debug!(user = %self.user, transport = self.transport.id(), "mailbox worker started");
        while let Some(effect) = rx.recv().await {
            let kind = effect.kind();
            if let Err(error) = self.deliver(effect).await {
                warn!(user = %self.user, kind, error = %error, "outbound delivery failed");
            }
        }
        debug!(user = %self.user, "mailbox worker stopped");
    }

    async fn deliver(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::Send { text, options } => self.send(&text, &options).await,
            Effect::Edit { text, options } => self.edit(&text, &options).await,
            Effect::Voice {
                attachment,
                fallback,
            } => match self.transport.send_voice(self.user, attachment).await {
                Ok(_) => {
                    if let Some(progress) = self.last_sent.take() {
                        self.transport.delete_message(&progress).await?;
                    }
                    Ok(())
                }
                Err(error) => {
                    let text = format!("{fallback}\n\nError sending audio response:\n{error}");
                    self.edit(&text, &SendOptions::markdown()).await?;
                    Err(error)
                }
            },
            Effect::Document { attachment } => {
                self.transport.send_document(self.user, attachment).await?;
                Ok(())
            }
            Effect::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        }
    }

    async fn send(&mut self, text: &str, options: &SendOptions) -> Result<()> {
        match self.transport.send_message(self.user, text, options).await {
            Ok(sent) => {
                self.last_sent = Some(sent);
                Ok(())
            }
            Err(error) => {
                self.last_sent = None;
                Err(error)
            }
        }
    }

    /// Edit the last sent message, or send a new one when there is none.
    async fn edit(&mut self, text: &str, options: &SendOptions) -> Result<()> {
        match self.last_sent {
            Some(target) => self.transport.edit_message(&target, text, options).await,
            None => self.send(text, options).await,
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::fakes::{Delivery, FakeTransport};
    use std::sync::Mutex;

    fn attachment(name: &str) -> Attachment {
        Attachment {
            file_name: name.into(),
            bytes: b"data".to_vec(),
            caption: Some("answer".into()),
        }
    }

    #[tokio::test]
    async fn concurrent_enqueues_are_delivered_in_order() {
        let transport = Arc::new(FakeTransport::new());
        let mailbox = Mailbox::spawn(UserId(1), Arc::<FakeTransport>::clone(&transport));
        let enqueued = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for task in 0..8 {
            let mailbox = mailbox.clone();
            let enqueued = Arc::clone(&enqueued);
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let label = format!("task {task} message {i}");
                    {
                        let mut log = enqueued.lock().unwrap();
                        mailbox.send(label.clone(), SendOptions::plain());
                        log.push(label);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        mailbox.flush().await;

        let expected = enqueued.lock().unwrap().clone();
        assert_eq!(expected.len(), 80);
        assert_eq!(transport.texts_for(UserId(1)), expected);
    }

    #[tokio::test]
    async fn edits_target_last_sent_message() {
        let transport = Arc::new(FakeTransport::new());
        let mailbox = Mailbox::spawn(UserId(1), Arc::<FakeTransport>::clone(&transport));

        mailbox.send("Analyzing message...", SendOptions::plain());
        mailbox.edit("Sending message to the model...", SendOptions::plain());
        mailbox.edit("the answer", SendOptions::markdown());
        mailbox.flush().await;

        let deliveries = transport.deliveries();
        let Delivery::Sent { target, .. } = &deliveries[0] else {
            panic!("expected a send first");
        };
        for delivery in &deliveries[1..] {
            assert!(matches!(delivery, Delivery::Edited { target: t, .. } if t == target));
        }
        assert_eq!(transport.last_text_for(UserId(1)).unwrap(), "the answer");
    }

    #[tokio::test]
    async fn edit_without_prior_send_sends() {
        let transport = Arc::new(FakeTransport::new());
        let mailbox = Mailbox::spawn(UserId(1), Arc::<FakeTransport>::clone(&transport));

        mailbox.edit("hello", SendOptions::plain());
        mailbox.flush().await;

        assert!(matches!(transport.deliveries()[0], Delivery::Sent { .. }));
    }

    #[tokio::test]
    async fn voice_replaces_progress_message() {
        let transport = Arc::new(FakeTransport::new());
        let mailbox = Mailbox::spawn(UserId(1), Arc::<FakeTransport>::clone(&transport));

        mailbox.send("Obtaining audio...", SendOptions::plain());
        mailbox.voice(attachment("answer.mp3"), "answer");
        mailbox.flush().await;

        let deliveries = transport.deliveries();
        assert!(matches!(deliveries[1], Delivery::Voice { .. }));
        assert!(matches!(deliveries[2], Delivery::Deleted { target } if target.message_id == 1));
    }

    #[tokio::test]
    async fn voice_failure_edits_progress_with_error() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_voice(true);
        let mailbox = Mailbox::spawn(UserId(1), Arc::<FakeTransport>::clone(&transport));

        mailbox.send("Obtaining audio...", SendOptions::plain());
        mailbox.voice(attachment("answer.mp3"), "answer");
        mailbox.flush().await;

        let last = transport.last_text_for(UserId(1)).unwrap();
        assert!(last.starts_with("answer\n\nError sending audio response:\n"));
        assert!(last.contains("fake transport voice failure"));
    }

    #[tokio::test]
    async fn transport_failures_do_not_stop_the_worker() {
        let transport = Arc::new(FakeTransport::new());
        let mailbox = Mailbox::spawn(UserId(1), Arc::<FakeTransport>::clone(&transport));

        transport.fail_sends(true);
        mailbox.send("lost", SendOptions::plain());
        mailbox.flush().await;
        transport.fail_sends(false);
        mailbox.send("delivered", SendOptions::plain());
        mailbox.flush().await;

        assert_eq!(transport.texts_for(UserId(1)), vec!["delivered"]);
    }
}
