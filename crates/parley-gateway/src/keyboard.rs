//! Prompt text and reply keyboard for each menu screen.

use parley_core::{InlineButton, ModelCatalog, Personality, ReplyMarkup, UserId};

use crate::menu::MenuState;
use crate::user::User;

pub(crate) fn prompt(state: MenuState) -> &'static str {
    match state {
        MenuState::Main => "Main Menu",
        MenuState::List => "Select a conversation from the list",
        MenuState::Selected => "Conversation Menu",
        MenuState::SelectModel => "Select a model from the list",
        MenuState::SelectPersonality => "Select a personality from the list",
    }
}

fn row(buttons: &[&str]) -> Vec<String> {
    buttons.iter().map(|b| (*b).to_owned()).collect()
}

pub(crate) fn markup(state: MenuState, user: &User, catalog: &ModelCatalog) -> ReplyMarkup {
    let rows = match state {
        MenuState::Main => {
            let mut rows = vec![row(&["/list", "/new"]), row(&["/stats"])];
            if user.is_privileged() {
                rows.push(row(&["/users_list", "/global_stats"]));
            }
            rows
        }
        MenuState::List => std::iter::once(row(&["/back"]))
            .chain(user.active_conversations().into_iter().map(|conv| {
                let label = match &conv.title {
                    Some(title) => format!("/select {title} {}", conv.id),
                    None => format!("/select {}", conv.id),
                };
                vec![label]
            }))
            .collect(),
        MenuState::Selected => vec![
            row(&["/back", "/stats"]),
            row(&["/summarize", "/delete"]),
            row(&["/generate_report"]),
        ],
        MenuState::SelectModel => std::iter::once(row(&["/back"]))
            .chain(
                catalog
                    .available(user.is_privileged())
                    .map(|model| vec![format!("/model {}", model.name)]),
            )
            .collect(),
        MenuState::SelectPersonality => std::iter::once(row(&["/back"]))
            .chain(
                Personality::ALL
                    .iter()
                    .map(|p| vec![format!("/ask {}", p.name())]),
            )
            .collect(),
    };
    ReplyMarkup::Keyboard(rows)
}

/// Inline approval buttons attached to the new-user notification.
pub(crate) fn approval(user: UserId) -> ReplyMarkup {
    ReplyMarkup::Inline(vec![vec![
        InlineButton::new("Whitelist", format!("/whitelist {user}")),
        InlineButton::new("Blacklist", format!("/blacklist {user}")),
    ]])
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Status;

    fn rows(markup: ReplyMarkup) -> Vec<Vec<String>> {
        match markup {
            ReplyMarkup::Keyboard(rows) => rows,
            ReplyMarkup::Inline(_) => panic!("expected a reply keyboard"),
        }
    }

    #[test]
    fn main_menu_shows_admin_row_only_to_admin() {
        let catalog = ModelCatalog::default();
        let regular = User::new(UserId(2), Status::Whitelisted);
        let admin = User::new(UserId(1), Status::Privileged);

        assert_eq!(rows(markup(MenuState::Main, &regular, &catalog)).len(), 2);
        let admin_rows = rows(markup(MenuState::Main, &admin, &catalog));
        assert_eq!(admin_rows[2], vec!["/users_list", "/global_stats"]);
    }

    #[test]
    fn list_menu_shows_titles_and_skips_deleted() {
        let catalog = ModelCatalog::default();
        let mut user = User::new(UserId(2), Status::Whitelisted);
        let titled = user.new_conversation();
        let untitled = user.new_conversation();
        let deleted = user.new_conversation();
        user.conversation_mut(titled).unwrap().title = Some("Rust talk".into());
        user.delete_conversation(deleted).unwrap();

        let labels: Vec<String> = rows(markup(MenuState::List, &user, &catalog))
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(labels[0], "/back");
        assert!(labels.contains(&format!("/select Rust talk {titled}")));
        assert!(labels.contains(&format!("/select {untitled}")));
        assert!(!labels.iter().any(|l| l.contains(&deleted.to_string())));
    }

    #[test]
    fn model_menu_respects_restrictions() {
        let catalog = ModelCatalog::default();
        let regular = User::new(UserId(2), Status::Whitelisted);
        let labels: Vec<String> = rows(markup(MenuState::SelectModel, &regular, &catalog))
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(labels, vec!["/back", "/model gpt-3.5-turbo"]);
    }

    #[test]
    fn personality_menu_lists_every_preset() {
        let catalog = ModelCatalog::default();
        let user = User::new(UserId(2), Status::Whitelisted);
        let labels = rows(markup(MenuState::SelectPersonality, &user, &catalog));
        assert_eq!(labels.len(), 1 + Personality::ALL.len());
        assert_eq!(labels[1], vec!["/ask Programmer"]);
    }

    #[test]
    fn approval_buttons_carry_commands() {
        let ReplyMarkup::Inline(rows) = approval(UserId(42)) else {
            panic!("expected inline markup");
        };
        assert_eq!(rows[0][0].data, "/whitelist 42");
        assert_eq!(rows[0][1].data, "/blacklist 42");
    }
}
