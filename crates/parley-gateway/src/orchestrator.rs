use anyhow::{Context, Result};
use parley_core::{
    Attachment, CompletionProvider, FileRef, InboundEvent, InboundPayload, Message, Personality,
    SendOptions, SessionError, SpeechSynthesizer, Transcriber, Transport, UserId,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::access::{self, Access, Approval, Status, StatusChange};
use crate::keyboard;
use crate::ledger::UsageLedger;
use crate::mailbox::Mailbox;
use crate::menu::{Command, MenuState};
use crate::registry::SessionRegistry;
use crate::stats;
use crate::user::{User, UserTable};
use crate::user_store::UserStore;

/// External services consulted while handling an event.
#[allow(missing_debug_implementations)] // contains trait objects
pub(crate) struct Services {
    pub completion: Arc<dyn CompletionProvider>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub admin: UserId,
    /// Number of trailing messages sent with `/summarize`.
    pub summary_window: usize,
    /// Upper bound for every external call.
    pub service_timeout: Duration,
}

/// What the user said in a conversational turn.
enum Input {
    Text(String),
    Voice(FileRef),
}

/// Outbound handles touched while handling one event.
struct Turn {
    user: UserId,
    mailbox: Mailbox,
    notified: Vec<Mailbox>,
}

impl Turn {
    fn reply(&self, text: impl Into<String>) {
        self.mailbox.send(text, SendOptions::plain());
    }

    fn reply_with(&self, text: impl Into<String>, options: SendOptions) {
        self.mailbox.send(text, options);
    }
}

/// Decides what to do with each inbound event.
///
/// Owns the user table. The table mutex is only held for synchronous
/// sections and never across an await; event processing for one user is
/// serialized by the user's turn lock.
#[allow(missing_debug_implementations)] // contains trait objects
pub(crate) struct Orchestrator {
    users: Mutex<UserTable>,
    registry: SessionRegistry,
    store: Arc<dyn UserStore>,
    transport: Arc<dyn Transport>,
    services: Services,
    ledger: UsageLedger,
    settings: Settings,
    persist_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub(crate) fn new(
        store: Arc<dyn UserStore>,
        transport: Arc<dyn Transport>,
        services: Services,
        ledger: UsageLedger,
        settings: Settings,
    ) -> Result<Self> {
        let users = store.load_all().context("failed to load users")?;
        info!(users = users.len(), admin = %settings.admin, "user table loaded");
        Ok(Self {
            users: Mutex::new(users),
            registry: SessionRegistry::new(Arc::clone(&transport)),
            store,
            transport,
            services,
            ledger,
            settings,
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock_users(&self) -> MutexGuard<'_, UserTable> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_user<R>(
        &self,
        id: UserId,
        f: impl FnOnce(&mut User) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let mut users = self.lock_users();
        let user = users.get_mut(&id).ok_or(SessionError::UserNotFound(id))?;
        f(user)
    }

    /// Handle one inbound event to completion: dispatch, persist, then wait
    /// for every queued reply to be delivered.
    pub(crate) async fn handle_event(&self, event: InboundEvent) {
        let span = info_span!(
            "handle_event",
            user = %event.user,
            kind = payload_kind(&event.payload),
        );

        async move {
            let session = self.registry.session(event.user);
            let _turn_guard = session.begin_turn().await;
            let mut turn = Turn {
                user: event.user,
                mailbox: session.mailbox.clone(),
                notified: Vec::new(),
            };

            if let Err(err) = self.dispatch(event, &mut turn).await {
                if err.is_transient() {
                    warn!(error = %err, "service call failed");
                    // Replaces the progress message.
                    turn.mailbox.edit(err.user_message(), SendOptions::plain());
                } else {
                    info!(error = %err, "event rejected");
                    turn.reply(err.user_message());
                }
            }

            if let Err(err) = self.persist().await {
                error!(error = %format!("{err:#}"), "failed to save users");
                turn.reply(SessionError::Persistence(err).user_message());
            }

            turn.mailbox.flush().await;
            for mailbox in &turn.notified {
                mailbox.flush().await;
            }
        }
        .instrument(span)
        .await;
    }

    /// Snapshot the table and write it out. Snapshots are taken and written
    /// in the same order.
    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.lock_users().clone();
        self.store.save_all(&snapshot)
    }

    async fn dispatch(&self, event: InboundEvent, turn: &mut Turn) -> Result<(), SessionError> {
        let status = self.lock_users().get(&event.user).map(|u| u.status);
        let access = access::classify(status);
        if !access.admits() {
            return match access {
                Access::NotFound => {
                    self.register(turn);
                    Ok(())
                }
                Access::Blacklisted => self.reject(turn, "💀"),
                _ => self.reject(turn, "👀"),
            };
        }

        let (command, input) = match event.payload {
            InboundPayload::Voice(file) => (Command::Text(String::new()), Input::Voice(file)),
            InboundPayload::Text(text) | InboundPayload::Callback(text) => {
                let command = Command::parse(&text);
                (command, Input::Text(text))
            }
        };
        debug!(command = command.name(), "dispatching");

        match command {
            Command::Ping => {
                turn.reply("pong");
                Ok(())
            }
            Command::Whitelist(arg) => self.approve(turn, Approval::Whitelist, &arg),
            Command::Blacklist(arg) => self.approve(turn, Approval::Blacklist, &arg),
            Command::UsersList => self.admin_report(turn, stats::users_list),
            Command::GlobalStats => self.admin_report(turn, stats::global_stats),
            Command::List => self.with_user(turn.user, |user| {
                if user.active_conversations().is_empty() {
                    turn.reply("No conversations found, start a new one");
                } else {
                    self.show_menu(turn, user, MenuState::List);
                }
                Ok(())
            }),
            Command::Select(arg) => self.select(turn, &arg),
            Command::Back => self.with_user(turn.user, |user| {
                let parent = user.menu.parent();
                self.show_menu(turn, user, parent);
                Ok(())
            }),
            Command::Home => self.with_user(turn.user, |user| {
                self.show_menu(turn, user, MenuState::Main);
                Ok(())
            }),
            Command::New => self.with_user(turn.user, |user| {
                if self.ledger.has_reached_usage_limit(user) {
                    return Err(SessionError::UsageLimitReached);
                }
                let id = user.new_conversation();
                user.select(id)?;
                user.menu = MenuState::Selected;
                info!(conversation = %id, "conversation created");
                self.show_refined_menu(turn, user);
                Ok(())
            }),
            Command::Stats => self.with_user(turn.user, |user| {
                let text = match user.menu {
                    MenuState::Main => Some(stats::user_stats(user, &self.ledger)),
                    MenuState::Selected => user
                        .selected()
                        .map(|conv| stats::conversation_stats(conv, &self.ledger)),
                    _ => None,
                };
                match text {
                    Some(text) => turn.reply_with(text, SendOptions::markdown()),
                    None => self.show_refined_menu(turn, user),
                }
                Ok(())
            }),
            Command::Summarize => self.summarize(turn).await,
            Command::Ask(arg) => self.choose_personality(turn, &arg),
            Command::Model(arg) => self.choose_model(turn, &arg),
            Command::Delete => self.deliver_report(turn, true),
            Command::GenerateReport => self.deliver_report(turn, false),
            Command::Text(_) => {
                let in_conversation =
                    self.with_user(turn.user, |user| Ok(user.menu == MenuState::Selected))?;
                if in_conversation {
                    self.exchange(turn, input).await
                } else {
                    self.with_user(turn.user, |user| {
                        let markup = keyboard::markup(user.menu, user, self.ledger.catalog());
                        turn.reply_with(
                            "Select an action from the available ones",
                            SendOptions::plain().with_markup(markup),
                        );
                        Ok(())
                    })
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    fn register(&self, turn: &mut Turn) {
        let status = Status::initial(turn.user, self.settings.admin);
        let user = User::new(turn.user, status);
        info!(status = %status, "new user");

        if user.is_privileged() {
            let markup = keyboard::markup(MenuState::Main, &user, self.ledger.catalog());
            turn.reply_with("Welcome back", SendOptions::plain().with_markup(markup));
        } else {
            turn.reply(
                "Your request to be whitelisted has been received, please wait for an admin to review it",
            );
        }
        self.lock_users().insert(turn.user, user);

        if status != Status::Privileged {
            self.notify(
                turn,
                self.settings.admin,
                format!("New unreviewed user: {}", turn.user),
                SendOptions::plain().with_markup(keyboard::approval(turn.user)),
            );
        }
    }

    fn reject(&self, turn: &Turn, reply: &str) -> Result<(), SessionError> {
        let strikes = self.with_user(turn.user, |user| {
            user.strikes += 1;
            user.touch();
            Ok(user.strikes)
        })?;
        info!(strikes, "event from unapproved user ignored");
        turn.reply(reply);
        Ok(())
    }

    fn approve(&self, turn: &mut Turn, approval: Approval, arg: &str) -> Result<(), SessionError> {
        let target_status = approval.target();
        let change = {
            let mut users = self.lock_users();
            if !users.get(&turn.user).is_some_and(User::is_privileged) {
                return Err(SessionError::AccessDenied);
            }
            let target: UserId = arg.parse().map_err(|err| {
                SessionError::InvalidInput(format!("invalid chat id {arg:?}: {err}"))
            })?;
            let user = users
                .get_mut(&target)
                .ok_or(SessionError::UserNotFound(target))?;
            if user.is_privileged() {
                return Err(SessionError::InvalidInput(
                    "the admin status cannot be changed".to_owned(),
                ));
            }
            let change = access::change_status(&mut user.status, target_status);
            if change == StatusChange::Changed {
                user.touch();
            }
            (target, change)
        };

        match change {
            (target, StatusChange::Already) => {
                turn.reply(format!("User {target} already {target_status}"));
            }
            (target, StatusChange::Changed) => {
                info!(target = %target, status = %target_status, "user status changed");
                self.notify(
                    turn,
                    target,
                    format!("You have been {target_status}"),
                    SendOptions::plain(),
                );
                turn.reply(format!("User {target} has been {target_status}"));
            }
        }
        Ok(())
    }

    fn admin_report(
        &self,
        turn: &Turn,
        render: fn(&UserTable, &UsageLedger) -> String,
    ) -> Result<(), SessionError> {
        let users = self.lock_users();
        if !users.get(&turn.user).is_some_and(User::is_privileged) {
            return Err(SessionError::AccessDenied);
        }
        turn.reply_with(render(&users, &self.ledger), SendOptions::markdown());
        Ok(())
    }

    fn notify(&self, turn: &mut Turn, target: UserId, text: String, options: SendOptions) {
        if target == turn.user {
            turn.reply_with(text, options);
            return;
        }
        let mailbox = self.registry.session(target).mailbox.clone();
        mailbox.send(text, options);
        turn.notified.push(mailbox);
    }

    // -----------------------------------------------------------------------
    // Menus
    // -----------------------------------------------------------------------

    fn show_menu(&self, turn: &Turn, user: &mut User, state: MenuState) {
        user.menu = state;
        let markup = keyboard::markup(state, user, self.ledger.catalog());
        turn.reply_with(
            keyboard::prompt(state),
            SendOptions::plain().with_markup(markup),
        );
    }

    /// Re-display the current screen, resolving `Selected` into whatever
    /// the bound conversation still needs.
    fn show_refined_menu(&self, turn: &Turn, user: &mut User) {
        let state = user.menu.refine(user.selected());
        self.show_menu(turn, user, state);
    }

    fn select(&self, turn: &Turn, arg: &str) -> Result<(), SessionError> {
        self.with_user(turn.user, |user| {
            if self.ledger.has_reached_usage_limit(user) {
                return Err(SessionError::UsageLimitReached);
            }
            let token = arg.split_whitespace().next_back().unwrap_or_default();
            let id = Uuid::parse_str(token).map_err(|err| {
                SessionError::InvalidInput(format!("invalid conversation id {token:?}: {err}"))
            })?;
            user.select(id)?;
            user.menu = MenuState::Selected;
            info!(conversation = %id, "conversation selected");
            turn.reply(format!("Switched to conversation {id}"));
            self.show_refined_menu(turn, user);
            Ok(())
        })
    }

    fn choose_model(&self, turn: &Turn, arg: &str) -> Result<(), SessionError> {
        self.with_user(turn.user, |user| {
            if user.menu != MenuState::SelectModel {
                self.show_refined_menu(turn, user);
                return Ok(());
            }
            let name = single_argument(arg)?;
            let privileged = user.is_privileged();
            let model = self.ledger.catalog().resolve(name, privileged)?;
            let conv = user
                .selected_mut()
                .ok_or_else(|| SessionError::InvalidInput("no conversation selected".to_owned()))?;
            conv.set_model(&model.name);
            info!(conversation = %conv.id, model = %model.name, "model selected");
            turn.reply(format!("Selected model {}", model.name));
            user.menu = MenuState::Selected;
            self.show_refined_menu(turn, user);
            Ok(())
        })
    }

    fn choose_personality(&self, turn: &Turn, arg: &str) -> Result<(), SessionError> {
        self.with_user(turn.user, |user| {
            if user.menu != MenuState::SelectPersonality {
                self.show_refined_menu(turn, user);
                return Ok(());
            }
            let personality: Personality = single_argument(arg)?.parse()?;
            let conv = user
                .selected_mut()
                .ok_or_else(|| SessionError::InvalidInput("no conversation selected".to_owned()))?;
            conv.set_personality(personality)?;
            info!(conversation = %conv.id, personality = %personality, "personality selected");

            let state = MenuState::Selected.refine(user.selected());
            user.menu = state;
            let markup = keyboard::markup(state, user, self.ledger.catalog());
            turn.reply_with(
                format!("Selected personality {personality}\nYou may now start talking."),
                SendOptions::plain().with_markup(markup),
            );
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Conversation commands
    // -----------------------------------------------------------------------

    /// Send the selected conversation's report as a document, optionally
    /// soft-deleting it afterwards.
    fn deliver_report(&self, turn: &Turn, delete: bool) -> Result<(), SessionError> {
        self.with_user(turn.user, |user| {
            let Some(conv) = user.selected().filter(|_| user.menu == MenuState::Selected) else {
                self.show_refined_menu(turn, user);
                return Ok(());
            };
            let id = conv.id;
            turn.mailbox.document(Attachment {
                file_name: format!("{id}_summary.md"),
                bytes: conv.generate_report(self.ledger.catalog()).into_bytes(),
                caption: Some(format!("Summary of conversation {id}")),
            });
            if !delete {
                return Ok(());
            }

            user.delete_conversation(id)?;
            user.menu = MenuState::Main;
            info!(conversation = %id, "conversation deleted");
            let markup = keyboard::markup(MenuState::Main, user, self.ledger.catalog());
            turn.reply_with(
                format!("Conversation {id} has been deleted\nGoing back to the Main Menu"),
                SendOptions::plain().with_markup(markup),
            );
            Ok(())
        })
    }

    async fn summarize(&self, turn: &Turn) -> Result<(), SessionError> {
        let request = self.with_user(turn.user, |user| {
            let ready = user
                .selected()
                .filter(|c| user.menu == MenuState::Selected && c.is_ready());
            let Some(conv) = ready else {
                self.show_refined_menu(turn, user);
                return Ok(None);
            };
            let model = conv.model.clone().unwrap_or_default();
            Ok(Some((
                conv.id,
                model,
                conv.summary_request(self.settings.summary_window),
            )))
        })?;
        let Some((id, model, messages)) = request else {
            return Ok(());
        };

        turn.mailbox
            .send("Summarizing conversation...", SendOptions::plain());
        let completion = self
            .bounded(self.services.completion.complete(&model, &messages))
            .await
            .map_err(|err| SessionError::service("completion", err))?;
        self.with_user(turn.user, |user| {
            self.ledger.record(user, id, completion.usage);
            Ok(())
        })?;
        turn.mailbox.edit(completion.text, SendOptions::markdown());
        Ok(())
    }

    /// One conversational exchange: transcribe if needed, ask the model,
    /// append both messages, title the conversation on its first exchange
    /// and answer with text or synthesized speech.
    async fn exchange(&self, turn: &Turn, input: Input) -> Result<(), SessionError> {
        let prepared = self.with_user(turn.user, |user| {
            let state = user.menu.refine(user.selected());
            if state != MenuState::Selected {
                self.show_menu(turn, user, state);
                return Ok(None);
            }
            if self.ledger.has_reached_usage_limit(user) {
                return Err(SessionError::UsageLimitReached);
            }
            Ok(user
                .selected()
                .map(|c| (c.id, c.model.clone().unwrap_or_default(), c.title.is_none())))
        })?;
        let Some((id, model, needs_title)) = prepared else {
            return Ok(());
        };

        let mailbox = &turn.mailbox;
        mailbox.send("Analyzing message...", SendOptions::plain());

        let voice = matches!(input, Input::Voice(_));
        let text = match input {
            Input::Text(text) => text,
            Input::Voice(file) => {
                mailbox.edit("Transcribing message...", SendOptions::plain());
                self.transcribe(&file)
                    .await
                    .map_err(|err| SessionError::service("transcription", err))?
            }
        };

        mailbox.edit("Sending message to the model...", SendOptions::plain());
        let question = Message::user(text);
        let request = self.with_user(turn.user, |user| {
            let conv = user
                .conversation(id)
                .ok_or(SessionError::ConversationNotFound(id))?;
            Ok(conv.exchange_request(&question))
        })?;
        let completion = self
            .bounded(self.services.completion.complete(&model, &request))
            .await
            .map_err(|err| SessionError::service("completion", err))?;
        let answer = completion.text;

        self.with_user(turn.user, |user| {
            let conv = user
                .conversation_mut(id)
                .ok_or(SessionError::ConversationNotFound(id))?;
            conv.append(question)?;
            conv.append(Message::assistant(answer.clone()))?;
            self.ledger.record(user, id, completion.usage);
            Ok(())
        })?;
        debug!(conversation = %id, tokens = completion.usage.total(), "exchange recorded");

        if needs_title {
            mailbox.edit("Generating title...", SendOptions::plain());
            self.generate_title(turn.user, id, &model).await?;
        }

        if voice {
            mailbox.edit("Obtaining audio...", SendOptions::plain());
            match self.bounded(self.services.synthesizer.synthesize(&answer)).await {
                Ok(audio) => mailbox.voice(
                    Attachment {
                        file_name: "answer.mp3".to_owned(),
                        bytes: audio,
                        caption: Some(answer.clone()),
                    },
                    answer,
                ),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "speech synthesis failed");
                    mailbox.edit(
                        format!("{answer}\n\nError generating speech from text:\n{err}"),
                        SendOptions::markdown(),
                    );
                }
            }
        } else {
            mailbox.edit(answer, SendOptions::markdown());
        }
        Ok(())
    }

    async fn transcribe(&self, file: &FileRef) -> Result<String> {
        let audio = self
            .bounded(self.transport.download_file(file))
            .await
            .context("failed to download voice message")?;
        self.bounded(self.services.transcriber.transcribe(audio))
            .await
    }

    /// Title the conversation from its dialogue. A failed request falls back
    /// to a name derived from the personality.
    async fn generate_title(&self, owner: UserId, id: Uuid, model: &str) -> Result<(), SessionError> {
        let request = self.with_user(owner, |user| {
            let conv = user
                .conversation(id)
                .ok_or(SessionError::ConversationNotFound(id))?;
            Ok(conv.title_request())
        })?;
        let generated = self
            .bounded(self.services.completion.complete(model, &request))
            .await;

        self.with_user(owner, |user| {
            let title = match generated {
                Ok(completion) => {
                    self.ledger.record(user, id, completion.usage);
                    clean_title(&completion.text)
                }
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "title generation failed");
                    None
                }
            };
            let conv = user
                .conversation_mut(id)
                .ok_or(SessionError::ConversationNotFound(id))?;
            let title = title.unwrap_or_else(|| conv.fallback_title());
            debug!(conversation = %id, title = %title, "conversation titled");
            conv.title = Some(title);
            Ok(())
        })
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.settings.service_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|elapsed| anyhow::anyhow!("no response within {limit:?} ({elapsed})"))?
    }
}

fn payload_kind(payload: &InboundPayload) -> &'static str {
    match payload {
        InboundPayload::Text(_) => "text",
        InboundPayload::Voice(_) => "voice",
        InboundPayload::Callback(_) => "callback",
    }
}

fn single_argument(arg: &str) -> Result<&str, SessionError> {
    if arg.is_empty() || arg.contains(char::is_whitespace) {
        return Err(SessionError::InvalidInput(format!(
            "expected exactly one name, got {arg:?}"
        )));
    }
    Ok(arg)
}

fn clean_title(raw: &str) -> Option<String> {
    let title = raw.trim().trim_matches('"').trim();
    (!title.is_empty()).then(|| title.to_owned())
}
