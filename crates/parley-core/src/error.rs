use crate::types::UserId;
use uuid::Uuid;

/// Failures surfaced to the user while handling an event.
///
/// The `Display` text is what the user sees. None of these is fatal to the
/// user's worker; processing of the current event simply stops.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Only admins can use this command")]
    AccessDenied,

    #[error("Conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("I'm afraid the model {0} is not available")]
    UnknownModel(String),

    #[error("Personality {0} not found")]
    UnknownPersonality(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("I'm sorry, I can't do that.\n(You have reached your usage limit)")]
    UsageLimitReached,

    /// Completion, transcription or synthesis failure (network, quota, timeout).
    #[error("Error contacting the {service} service:\n{source}")]
    Service {
        service: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The user table could not be saved. In-memory state is kept.
    #[error("Failed to save users: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl SessionError {
    pub fn service(service: &'static str, source: anyhow::Error) -> Self {
        Self::Service { service, source }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Service { .. })
    }

    /// Reply text shown to the user for this failure.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}
