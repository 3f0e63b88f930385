use parley_core::{Transport, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::mailbox::Mailbox;

/// Runtime half of a user: the outbound mailbox and the turn lock that
/// serializes event processing. Not persisted.
#[derive(Debug)]
pub(crate) struct UserSession {
    pub mailbox: Mailbox,
    turn: Arc<AsyncMutex<()>>,
}

impl UserSession {
    /// Wait for this user's previous event to finish, then hold the turn
    /// until the guard drops.
    pub(crate) async fn begin_turn(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.turn).lock_owned().await
    }
}

/// Lookup-or-create of per-user sessions. Sessions live for the process
/// lifetime.
#[allow(missing_debug_implementations)] // contains dyn Transport
pub(crate) struct SessionRegistry {
    transport: Arc<dyn Transport>,
    sessions: Mutex<HashMap<UserId, Arc<UserSession>>>,
}

impl SessionRegistry {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Session for `user`, starting its mailbox worker on first contact.
    pub(crate) fn session(&self, user: UserId) -> Arc<UserSession> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let session = sessions.entry(user).or_insert_with(|| {
            Arc::new(UserSession {
                mailbox: Mailbox::spawn(user, Arc::clone(&self.transport)),
                turn: Arc::new(AsyncMutex::new(())),
            })
        });
        Arc::clone(session)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::SendOptions;
    use parley_core::fakes::FakeTransport;
    use std::time::Duration;

    #[tokio::test]
    async fn session_is_created_once_per_user() {
        let registry = SessionRegistry::new(Arc::new(FakeTransport::new()));
        let first = registry.session(UserId(1));
        let again = registry.session(UserId(1));
        let other = registry.session(UserId(2));

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn mailbox_delivers_to_its_user() {
        let transport = Arc::new(FakeTransport::new());
        let registry = SessionRegistry::new(Arc::clone(&transport) as Arc<dyn Transport>);
        let session = registry.session(UserId(7));

        session.mailbox.send("hi", SendOptions::plain());
        session.mailbox.flush().await;

        assert_eq!(transport.texts_for(UserId(7)), vec!["hi"]);
    }

    #[tokio::test]
    async fn turns_are_exclusive_per_user() {
        let registry = SessionRegistry::new(Arc::new(FakeTransport::new()));
        let session = registry.session(UserId(1));
        let guard = session.begin_turn().await;

        let waiting = registry.session(UserId(1));
        let second = tokio::spawn(async move {
            let _turn = waiting.begin_turn().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        // Another user is not blocked.
        let _other = registry.session(UserId(2)).begin_turn().await;

        drop(guard);
        second.await.unwrap();
    }
}
