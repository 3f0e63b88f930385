//! Text reports for `/stats`, `/users_list` and `/global_stats`.

use parley_core::{Cost, Personality, TokenUsage};
use std::fmt::Write as _;

use crate::access::Status;
use crate::conversation::Conversation;
use crate::ledger::UsageLedger;
use crate::user::{User, UserTable};

fn tokens_line(label: &str, tokens: u64, cost: f64) -> String {
    format!("{label}: {tokens} (${cost:.6})\n")
}

fn title_of(conv: &Conversation) -> &str {
    conv.title.as_deref().unwrap_or("Untitled")
}

pub(crate) fn conversation_stats(conv: &Conversation, ledger: &UsageLedger) -> String {
    let cost = conv.cost(ledger.catalog());
    let mut out = String::new();
    let _ = writeln!(out, "Conversation: {}", title_of(conv));
    let _ = writeln!(
        out,
        "Personality: {}\n",
        conv.personality.map_or("", Personality::name)
    );
    let _ = writeln!(out, "Model: {}", conv.model.as_deref().unwrap_or(""));
    out.push_str(&tokens_line("Prompt tokens", conv.usage.prompt_tokens, cost.prompt));
    out.push_str(&tokens_line(
        "Completion tokens",
        conv.usage.completion_tokens,
        cost.completion,
    ));
    out.push('\n');
    out.push_str(&tokens_line("Total tokens", conv.usage.total(), cost.total()));
    out
}

fn conversation_line(label: &str, conv: &Conversation, ledger: &UsageLedger) -> String {
    format!(
        "{label}: {}\n{} tokens (${:.6})\n\n",
        title_of(conv),
        conv.usage.total(),
        conv.cost(ledger.catalog()).total()
    )
}

pub(crate) fn user_stats(user: &User, ledger: &UsageLedger) -> String {
    let mut out = String::from("Global Statistics:\n");

    for (model, usage) in &user.usage_by_model {
        let cost = ledger.catalog().cost(model, *usage);
        let _ = writeln!(out, "\nModel: {model}");
        out.push_str(&tokens_line("Prompt tokens", usage.prompt_tokens, cost.prompt));
        out.push_str(&tokens_line(
            "Completion tokens",
            usage.completion_tokens,
            cost.completion,
        ));
        out.push_str(&tokens_line("Total tokens", usage.total(), cost.total()));
    }

    out.push_str("\n---\n\n");

    let tokens = UsageLedger::total_tokens(user);
    let cost = ledger.total_cost(user);
    out.push_str(&tokens_line("Total prompt tokens", tokens.prompt_tokens, cost.prompt));
    out.push_str(&tokens_line(
        "Total completion tokens",
        tokens.completion_tokens,
        cost.completion,
    ));
    out.push('\n');
    out.push_str(&tokens_line("Total tokens", tokens.total(), cost.total()));
    out.push('\n');

    let conversations: Vec<&Conversation> = user.conversations().collect();
    let longest = conversations.iter().max_by_key(|c| c.usage.total());
    let shortest = conversations.iter().min_by_key(|c| c.usage.total());
    let newest = conversations.iter().max_by_key(|c| c.created_at);
    let oldest = conversations.iter().min_by_key(|c| c.created_at);

    for (label, conv) in [
        ("Longest conversation", longest),
        ("Shortest conversation", shortest),
        ("Newest conversation", newest),
        ("Oldest conversation", oldest),
    ] {
        if let Some(conv) = conv {
            out.push_str(&conversation_line(label, conv, ledger));
        }
    }

    out
}

pub(crate) fn users_list(users: &UserTable, ledger: &UsageLedger) -> String {
    if users.is_empty() {
        return "No users found".to_owned();
    }
    let mut out = String::from("Users list:\n\n");
    for user in users.values() {
        let _ = write!(
            out,
            "User: {}, Status: {}\nTokens: {}\nCost: ${:.6}\nStrikes: {}\n\n",
            user.id,
            user.status,
            UsageLedger::total_tokens(user).total(),
            ledger.total_cost(user).total(),
            user.strikes
        );
    }
    out
}

pub(crate) fn global_stats(users: &UserTable, ledger: &UsageLedger) -> String {
    if users.is_empty() {
        return "No users found".to_owned();
    }

    let mut tokens = TokenUsage::default();
    let mut cost = Cost::default();
    let count = |status: Status| users.values().filter(|u| u.status == status).count();

    for user in users.values() {
        tokens += UsageLedger::total_tokens(user);
        cost += ledger.total_cost(user);
    }

    let mut out = String::from("Admin stats:\n\n");
    let _ = writeln!(out, "Total users: {}", users.len());
    let _ = writeln!(out, "Admins: {}", count(Status::Privileged));
    let _ = writeln!(out, "Whitelisted: {}", count(Status::Whitelisted));
    let _ = writeln!(out, "Unreviewed: {}", count(Status::Unreviewed));
    let _ = writeln!(out, "Blacklisted: {}\n", count(Status::Blacklisted));
    out.push_str(&tokens_line("Total input tokens", tokens.prompt_tokens, cost.prompt));
    out.push_str(&tokens_line(
        "Total output tokens",
        tokens.completion_tokens,
        cost.completion,
    ));
    out.push_str(&tokens_line("Total tokens", tokens.total(), cost.total()));
    out
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{ModelCatalog, UserId};

    fn ledger() -> UsageLedger {
        UsageLedger::new(ModelCatalog::default(), 1.0)
    }

    fn user_with_usage(id: i64, status: Status, usage: TokenUsage) -> User {
        let ledger = ledger();
        let mut user = User::new(UserId(id), status);
        let conv = user.new_conversation();
        user.conversation_mut(conv).unwrap().set_model("gpt-3.5-turbo");
        ledger.record(&mut user, conv, usage);
        user
    }

    #[test]
    fn conversation_stats_show_derived_cost() {
        let user = user_with_usage(1, Status::Whitelisted, TokenUsage::new(1000, 1000));
        let conv = user.conversations().next().unwrap();
        let text = conversation_stats(conv, &ledger());
        assert!(text.contains("Model: gpt-3.5-turbo"));
        assert!(text.contains("Prompt tokens: 1000 ($0.001000)"));
        assert!(text.contains("Total tokens: 2000 ($0.003000)"));
    }

    #[test]
    fn user_stats_name_extremes() {
        let ledger = ledger();
        let mut user = User::new(UserId(1), Status::Whitelisted);
        let small = user.new_conversation();
        let big = user.new_conversation();
        for (id, title, usage) in [(small, "Small", 10), (big, "Big", 5000)] {
            let conv = user.conversation_mut(id).unwrap();
            conv.set_model("gpt-3.5-turbo");
            conv.title = Some(title.into());
            ledger.record(&mut user, id, TokenUsage::new(usage, 0));
        }

        let text = user_stats(&user, &ledger);
        assert!(text.contains("Model: gpt-3.5-turbo"));
        assert!(text.contains("Longest conversation: Big\n5000 tokens"));
        assert!(text.contains("Shortest conversation: Small\n10 tokens"));
        assert!(text.contains("Total tokens: 5010"));
    }

    #[test]
    fn users_list_includes_strikes() {
        let mut users = UserTable::new();
        let mut user = user_with_usage(42, Status::Blacklisted, TokenUsage::new(10, 10));
        user.strikes = 3;
        users.insert(user.id, user);

        let text = users_list(&users, &ledger());
        assert!(text.contains("User: 42, Status: blacklisted"));
        assert!(text.contains("Tokens: 20"));
        assert!(text.contains("Strikes: 3"));
    }

    #[test]
    fn global_stats_count_by_status() {
        let mut users = UserTable::new();
        for (id, status) in [
            (1, Status::Privileged),
            (2, Status::Whitelisted),
            (3, Status::Whitelisted),
            (4, Status::Unreviewed),
        ] {
            users.insert(
                UserId(id),
                user_with_usage(id, status, TokenUsage::new(100, 100)),
            );
        }

        let text = global_stats(&users, &ledger());
        assert!(text.contains("Total users: 4"));
        assert!(text.contains("Admins: 1"));
        assert!(text.contains("Whitelisted: 2"));
        assert!(text.contains("Blacklisted: 0"));
        assert!(text.contains("Total tokens: 800"));
    }

    #[test]
    fn empty_table_reports_no_users() {
        assert_eq!(global_stats(&UserTable::new(), &ledger()), "No users found");
        assert_eq!(users_list(&UserTable::new(), &ledger()), "No users found");
    }
}
