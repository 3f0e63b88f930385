use chrono::{DateTime, Utc};
use parley_core::{SessionError, TokenUsage, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::access::Status;
use crate::conversation::Conversation;
use crate::menu::MenuState;

/// Every known user, keyed by id. Persisted as a whole.
pub(crate) type UserTable = BTreeMap<UserId, User>;

/// Everything the bot remembers about one end user.
///
/// `selected`, when set, always names a non-deleted conversation in
/// `conversations`. All mutation goes through methods that keep it so.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct User {
    pub id: UserId,
    pub status: Status,
    #[serde(default)]
    pub menu: MenuState,
    #[serde(default)]
    conversations: BTreeMap<Uuid, Conversation>,
    #[serde(default)]
    selected: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Aggregate usage per model name across all conversations.
    #[serde(default)]
    pub usage_by_model: BTreeMap<String, TokenUsage>,
    #[serde(default)]
    pub strikes: u32,
}

impl User {
    pub(crate) fn new(id: UserId, status: Status) -> Self {
        let now = Utc::now();
        Self {
            id,
            status,
            menu: MenuState::Main,
            conversations: BTreeMap::new(),
            selected: None,
            created_at: now,
            updated_at: now,
            usage_by_model: BTreeMap::new(),
            strikes: 0,
        }
    }

    pub(crate) fn is_privileged(&self) -> bool {
        self.status == Status::Privileged
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Create an empty conversation. It is not selected.
    pub(crate) fn new_conversation(&mut self) -> Uuid {
        let conversation = Conversation::new();
        let id = conversation.id;
        self.conversations.insert(id, conversation);
        id
    }

    pub(crate) fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    pub(crate) fn conversation(&self, id: Uuid) -> Option<&Conversation> {
        self.conversations.get(&id)
    }

    pub(crate) fn conversation_mut(&mut self, id: Uuid) -> Option<&mut Conversation> {
        self.conversations.get_mut(&id)
    }

    /// Non-deleted conversations, newest first.
    pub(crate) fn active_conversations(&self) -> Vec<&Conversation> {
        let mut active: Vec<_> = self
            .conversations
            .values()
            .filter(|c| !c.is_deleted())
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        active
    }

    /// Bind `id` as the selected conversation. Unknown or deleted ids leave
    /// the selection untouched.
    pub(crate) fn select(&mut self, id: Uuid) -> Result<(), SessionError> {
        match self.conversations.get(&id) {
            Some(conversation) if !conversation.is_deleted() => {
                self.selected = Some(id);
                Ok(())
            }
            _ => Err(SessionError::ConversationNotFound(id)),
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn selected_id(&self) -> Option<Uuid> {
        self.selected
    }

    pub(crate) fn selected(&self) -> Option<&Conversation> {
        self.selected.and_then(|id| self.conversations.get(&id))
    }

    pub(crate) fn selected_mut(&mut self) -> Option<&mut Conversation> {
        self.selected.and_then(|id| self.conversations.get_mut(&id))
    }

    pub(crate) fn clear_selection(&mut self) {
        self.selected = None;
    }

    /// Soft-delete a conversation and drop it from the selection.
    pub(crate) fn delete_conversation(&mut self, id: Uuid) -> Result<(), SessionError> {
        let conversation = self
            .conversations
            .get_mut(&id)
            .ok_or(SessionError::ConversationNotFound(id))?;
        conversation.delete();
        if self.selected == Some(id) {
            self.clear_selection();
        }
        Ok(())
    }

    /// Drop a selection that no longer points at a live conversation.
    /// Applied to records loaded from disk.
    pub(crate) fn repair_selection(&mut self) {
        if let Some(id) = self.selected
            && self.conversations.get(&id).is_none_or(Conversation::is_deleted)
        {
            self.clear_selection();
        }
    }
}
