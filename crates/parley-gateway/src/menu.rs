use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;

/// UI screen a user is on. Re-entered on every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum MenuState {
    #[default]
    Main,
    List,
    Selected,
    SelectModel,
    SelectPersonality,
}

impl MenuState {
    /// Screen reached by `/back`.
    pub(crate) fn parent(self) -> Self {
        match self {
            MenuState::Selected => MenuState::List,
            MenuState::Main
            | MenuState::List
            | MenuState::SelectModel
            | MenuState::SelectPersonality => MenuState::Main,
        }
    }

    /// Resolve `Selected` into the screen that still needs input: a model
    /// first, then a personality. Other states are returned unchanged.
    pub(crate) fn refine(self, conversation: Option<&Conversation>) -> Self {
        match (self, conversation) {
            (MenuState::Selected, Some(conv)) if conv.model.is_none() => MenuState::SelectModel,
            (MenuState::Selected, Some(conv)) if conv.personality.is_none() => {
                MenuState::SelectPersonality
            }
            (MenuState::Selected, None) => MenuState::Main,
            (state, _) => state,
        }
    }
}

/// A parsed inbound text. Matching is a case-sensitive prefix test; the
/// argument is whatever follows the command word, trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Ping,
    Whitelist(String),
    Blacklist(String),
    UsersList,
    GlobalStats,
    List,
    Select(String),
    Back,
    Home,
    New,
    Stats,
    Summarize,
    Ask(String),
    Model(String),
    Delete,
    GenerateReport,
    /// Anything else, including unknown slash commands.
    Text(String),
}

impl Command {
    pub(crate) fn parse(input: &str) -> Self {
        let arg = |prefix: &str| input[prefix.len()..].trim().to_owned();

        // Longer commands first where one is a prefix of another.
        if input.starts_with("/ping") {
            Command::Ping
        } else if input.starts_with("/whitelist") {
            Command::Whitelist(arg("/whitelist"))
        } else if input.starts_with("/blacklist") {
            Command::Blacklist(arg("/blacklist"))
        } else if input.starts_with("/users_list") {
            Command::UsersList
        } else if input.starts_with("/global_stats") {
            Command::GlobalStats
        } else if input.starts_with("/list") {
            Command::List
        } else if input.starts_with("/select") {
            Command::Select(arg("/select"))
        } else if input.starts_with("/back") {
            Command::Back
        } else if input.starts_with("/home") {
            Command::Home
        } else if input.starts_with("/new") {
            Command::New
        } else if input.starts_with("/stats") {
            Command::Stats
        } else if input.starts_with("/summarize") {
            Command::Summarize
        } else if input.starts_with("/ask") {
            Command::Ask(arg("/ask"))
        } else if input.starts_with("/model") {
            Command::Model(arg("/model"))
        } else if input.starts_with("/delete") {
            Command::Delete
        } else if input.starts_with("/generate_report") {
            Command::GenerateReport
        } else {
            Command::Text(input.to_owned())
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Whitelist(_) => "whitelist",
            Command::Blacklist(_) => "blacklist",
            Command::UsersList => "users_list",
            Command::GlobalStats => "global_stats",
            Command::List => "list",
            Command::Select(_) => "select",
            Command::Back => "back",
            Command::Home => "home",
            Command::New => "new",
            Command::Stats => "stats",
            Command::Summarize => "summarize",
            Command::Ask(_) => "ask",
            Command::Model(_) => "model",
            Command::Delete => "delete",
            Command::GenerateReport => "generate_report",
            Command::Text(_) => "text",
        }
    }
}
