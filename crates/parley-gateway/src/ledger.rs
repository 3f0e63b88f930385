use parley_core::{Cost, ModelCatalog, TokenUsage};
use uuid::Uuid;

use crate::user::User;

/// Token accounting and the per-user cost ceiling.
#[derive(Debug, Clone)]
pub(crate) struct UsageLedger {
    catalog: ModelCatalog,
    ceiling: f64,
}

impl UsageLedger {
    pub(crate) fn new(catalog: ModelCatalog, ceiling: f64) -> Self {
        Self { catalog, ceiling }
    }

    pub(crate) fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Add `usage` to the conversation and to the user's per-model aggregate.
    /// Both updates happen under the same `&mut User`, so they land together.
    pub(crate) fn record(&self, user: &mut User, conversation: Uuid, usage: TokenUsage) {
        let Some(conv) = user.conversation_mut(conversation) else {
            return;
        };
        conv.usage += usage;
        let Some(model) = conv.model.clone() else {
            return;
        };
        *user.usage_by_model.entry(model).or_default() += usage;
        user.touch();
    }

    pub(crate) fn total_tokens(user: &User) -> TokenUsage {
        user.usage_by_model
            .values()
            .fold(TokenUsage::default(), |acc, usage| acc + *usage)
    }

    /// Cost across every conversation, deleted ones included.
    pub(crate) fn total_cost(&self, user: &User) -> Cost {
        let mut total = Cost::default();
        for conv in user.conversations() {
            total += conv.cost(&self.catalog);
        }
        total
    }

    pub(crate) fn has_reached_usage_limit(&self, user: &User) -> bool {
        !user.is_privileged() && self.total_cost(user).total() >= self.ceiling
    }
}
