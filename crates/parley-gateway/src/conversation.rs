use chrono::{DateTime, Utc};
use parley_core::{
    Cost, Message, ModelCatalog, Personality, Role, SYNTHESIZER_PROMPT, SessionError, TITLE_PROMPT,
    TokenUsage,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Lifecycle of a conversation. Messages exist only while active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub(crate) enum ConversationState {
    Active { messages: Vec<Message> },
    Deleted { at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Conversation {
    pub id: Uuid,
    pub title: Option<String>,
    pub state: ConversationState,
    pub model: Option<String>,
    pub personality: Option<Personality>,
    /// Tokens consumed on `model` by this conversation, including titles and summaries.
    #[serde(default)]
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub(crate) fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: None,
            state: ConversationState::Active {
                messages: Vec::new(),
            },
            model: None,
            personality: None,
            usage: TokenUsage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        matches!(self.state, ConversationState::Deleted { .. })
    }

    pub(crate) fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            ConversationState::Deleted { at } => Some(at),
            ConversationState::Active { .. } => None,
        }
    }

    pub(crate) fn messages(&self) -> &[Message] {
        match &self.state {
            ConversationState::Active { messages } => messages,
            ConversationState::Deleted { .. } => &[],
        }
    }

    /// Model and personality are both chosen.
    pub(crate) fn is_ready(&self) -> bool {
        self.model.is_some() && self.personality.is_some()
    }

    pub(crate) fn append(&mut self, message: Message) -> Result<(), SessionError> {
        match &mut self.state {
            ConversationState::Active { messages } => {
                messages.push(message);
                self.updated_at = Utc::now();
                Ok(())
            }
            ConversationState::Deleted { .. } => Err(SessionError::ConversationNotFound(self.id)),
        }
    }

    pub(crate) fn set_model(&mut self, model: &str) {
        self.model = Some(model.to_owned());
        self.updated_at = Utc::now();
    }

    /// Bind the personality and append its system message. Only the first
    /// call has an effect.
    pub(crate) fn set_personality(&mut self, personality: Personality) -> Result<(), SessionError> {
        if let Some(current) = self.personality {
            return Err(SessionError::InvalidInput(format!(
                "this conversation already talks to {current}"
            )));
        }
        self.append(Message::system(personality.system_prompt()))?;
        self.personality = Some(personality);
        Ok(())
    }

    /// Soft delete: drop messages and title, keep identity, usage and timestamps.
    pub(crate) fn delete(&mut self) {
        if self.is_deleted() {
            return;
        }
        let now = Utc::now();
        self.state = ConversationState::Deleted { at: now };
        self.title = None;
        self.updated_at = now;
    }

    pub(crate) fn fallback_title(&self) -> String {
        let personality = self
            .personality
            .map_or("Unknown", Personality::name);
        format!("New Chat with {personality}")
    }

    /// Messages sent to the model for the next exchange.
    pub(crate) fn exchange_request(&self, user_message: &Message) -> Vec<Message> {
        let mut request = self.messages().to_vec();
        request.push(user_message.clone());
        request
    }

    /// Synthesizer prompt followed by the last `n` messages (all if fewer).
    pub(crate) fn summary_request(&self, n: usize) -> Vec<Message> {
        let messages = self.messages();
        let start = messages.len().saturating_sub(n);
        std::iter::once(Message::system(SYNTHESIZER_PROMPT))
            .chain(messages[start..].iter().cloned())
            .collect()
    }

    /// Title-generator prompt followed by the dialogue so far.
    pub(crate) fn title_request(&self) -> Vec<Message> {
        std::iter::once(Message::system(TITLE_PROMPT))
            .chain(
                self.messages()
                    .iter()
                    .filter(|m| m.role != Role::System)
                    .cloned(),
            )
            .collect()
    }

    pub(crate) fn cost(&self, catalog: &ModelCatalog) -> Cost {
        self.model
            .as_deref()
            .map(|model| catalog.cost(model, self.usage))
            .unwrap_or_default()
    }

    /// Deterministic markdown report of the conversation.
    pub(crate) fn generate_report(&self, catalog: &ModelCatalog) -> String {
        let mut report = String::from("## Conversation Report\n");
        let _ = writeln!(report, "- **Conversation ID:** {}", self.id);
        let _ = writeln!(report, "- **Title:** {}", self.title.as_deref().unwrap_or(""));
        let _ = writeln!(
            report,
            "- **Personality:** {}",
            self.personality.map_or("", Personality::name)
        );
        let _ = writeln!(
            report,
            "- **Creation Time:** {}",
            self.created_at.format(TIMESTAMP_FORMAT)
        );
        let _ = writeln!(
            report,
            "- **Last Update:** {}\n",
            self.updated_at.format(TIMESTAMP_FORMAT)
        );

        let _ = writeln!(report, "- **Model:** {}", self.model.as_deref().unwrap_or(""));
        let _ = writeln!(
            report,
            "- **Prompt tokens:** {}",
            self.usage.prompt_tokens
        );
        let _ = writeln!(
            report,
            "- **Completion tokens:** {}",
            self.usage.completion_tokens
        );
        let _ = writeln!(
            report,
            "- **Total tokens:** {} (${:.6})\n",
            self.usage.total(),
            self.cost(catalog).total()
        );

        report.push_str("### Messages\n\n");
        let messages = self.messages();
        for (i, message) in messages.iter().enumerate() {
            let _ = write!(
                report,
                "**{}** - **{}**:\n\n{}\n\n",
                message.timestamp.format(TIMESTAMP_FORMAT),
                message.role,
                message.content
            );
            if i + 1 != messages.len() {
                report.push_str("---\n\n");
            }
        }

        if let Some(at) = self.deleted_at() {
            let _ = write!(
                report,
                "### Deletion Details\n\nThe conversation was deleted at: {}\n",
                at.format(TIMESTAMP_FORMAT)
            );
        }

        report
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn ready_conversation() -> Conversation {
        let mut conv = Conversation::new();
        conv.set_model("gpt-3.5-turbo");
        conv.set_personality(Personality::Neutral).unwrap();
        conv
    }

    #[test]
    fn personality_appends_system_message_once() {
        let mut conv = ready_conversation();
        assert_eq!(conv.messages().len(), 1);
        assert_eq!(conv.messages()[0].role, Role::System);

        let err = conv.set_personality(Personality::Programmer).unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
        assert_eq!(conv.personality, Some(Personality::Neutral));
        assert_eq!(conv.messages().len(), 1);
    }

    #[test]
    fn delete_clears_content_but_keeps_metrics() {
        let mut conv = ready_conversation();
        conv.append(Message::user("hello")).unwrap();
        conv.title = Some("Greetings".into());
        conv.usage = TokenUsage::new(100, 50);
        let id = conv.id;
        let created = conv.created_at;

        conv.delete();

        assert!(conv.is_deleted());
        assert!(conv.messages().is_empty());
        assert!(conv.title.is_none());
        assert_eq!(conv.id, id);
        assert_eq!(conv.created_at, created);
        assert_eq!(conv.usage, TokenUsage::new(100, 50));
        assert!(conv.append(Message::user("late")).is_err());
    }

    #[test]
    fn delete_twice_keeps_first_timestamp() {
        let mut conv = Conversation::new();
        conv.delete();
        let first = conv.deleted_at().unwrap();
        conv.delete();
        assert_eq!(conv.deleted_at().unwrap(), first);
    }

    #[test]
    fn summary_takes_last_n_messages() {
        let mut conv = ready_conversation();
        for i in 0..5 {
            conv.append(Message::user(format!("m{i}"))).unwrap();
        }

        let request = conv.summary_request(2);
        assert_eq!(request.len(), 3);
        assert_eq!(request[0].content, SYNTHESIZER_PROMPT);
        assert_eq!(request[1].content, "m3");
        assert_eq!(request[2].content, "m4");

        // Fewer messages than requested: everything is used.
        assert_eq!(conv.summary_request(100).len(), 1 + 6);
        // Summaries never touch the conversation.
        assert_eq!(conv.messages().len(), 6);
    }

    #[test]
    fn title_request_skips_system_messages() {
        let mut conv = ready_conversation();
        conv.append(Message::user("Hello")).unwrap();
        conv.append(Message::assistant("Hi!")).unwrap();

        let request = conv.title_request();
        let roles: Vec<_> = request.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(request[0].content, TITLE_PROMPT);
    }

    #[test]
    fn fallback_title_names_personality() {
        let conv = ready_conversation();
        assert_eq!(conv.fallback_title(), "New Chat with Neutral");
    }

    #[test]
    fn report_lists_messages_in_order() {
        let mut conv = ready_conversation();
        conv.append(Message::user("first")).unwrap();
        conv.append(Message::assistant("second")).unwrap();
        conv.usage = TokenUsage::new(1000, 1000);

        let report = conv.generate_report(&ModelCatalog::default());
        let first = report.find("first").unwrap();
        let second = report.find("second").unwrap();
        assert!(first < second);
        assert!(report.contains(&conv.id.to_string()));
        assert!(report.contains("- **Total tokens:** 2000 ($0.003000)"));
        assert!(!report.contains("Deletion Details"));
    }

    #[test]
    fn report_of_deleted_conversation_keeps_audit_fields() {
        let mut conv = ready_conversation();
        conv.usage = TokenUsage::new(10, 20);
        conv.delete();

        let report = conv.generate_report(&ModelCatalog::default());
        assert!(report.contains(&conv.id.to_string()));
        assert!(report.contains("- **Prompt tokens:** 10"));
        assert!(report.contains("- **Completion tokens:** 20"));
        assert!(report.contains("The conversation was deleted at:"));
    }

    #[test]
    fn state_serializes_as_tagged_variant() {
        let mut conv = Conversation::new();
        conv.delete();
        let json = serde_json::to_value(&conv).unwrap();
        assert_eq!(json["state"]["state"], "deleted");
        let back: Conversation = serde_json::from_value(json).unwrap();
        assert_eq!(back, conv);
    }
}
