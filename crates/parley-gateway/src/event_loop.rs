use anyhow::Result;
use parley_core::{Inbound, InboundEvent, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;

/// Per-user event queue. Events for one user are handled in arrival order,
/// one at a time; different users run concurrently.
struct UserWorker {
    tx: mpsc::UnboundedSender<InboundEvent>,
    task: JoinHandle<()>,
}

impl UserWorker {
    fn spawn(user: UserId, orchestrator: Arc<Orchestrator>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundEvent>();
        let task = tokio::spawn(async move {
            debug!(user = %user, "user worker started");
            while let Some(event) = rx.recv().await {
                orchestrator.handle_event(event).await;
            }
        });
        Self { tx, task }
    }
}

/// Pull events from `inbound` until it fails, fanning them out to per-user
/// workers. On a receive error the queued events are drained before the
/// error is returned.
pub(crate) async fn run_event_loop(
    mut inbound: impl Inbound,
    orchestrator: Arc<Orchestrator>,
) -> Result<()> {
    info!("event loop listening");
    let mut workers: HashMap<UserId, UserWorker> = HashMap::new();

    loop {
        let event = match inbound.recv().await {
            Ok(event) => event,
            Err(err) => {
                info!(error = %err, workers = workers.len(), "inbound closed, draining");
                drain(workers).await;
                return Err(err);
            }
        };

        let user = event.user;
        let worker = workers
            .entry(user)
            .or_insert_with(|| UserWorker::spawn(user, Arc::clone(&orchestrator)));
        if let Err(err) = worker.tx.send(event) {
            // Only happens if the worker task panicked.
            warn!(user = %user, "user worker gone, restarting");
            let worker = UserWorker::spawn(user, Arc::clone(&orchestrator));
            if worker.tx.send(err.0).is_err() {
                warn!(user = %user, "dropping event");
            }
            workers.insert(user, worker);
        }
    }
}

async fn drain(workers: HashMap<UserId, UserWorker>) {
    for (user, worker) in workers {
        drop(worker.tx);
        if let Err(err) = worker.task.await {
            warn!(user = %user, error = %err, "user worker failed");
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Status;
    use crate::ledger::UsageLedger;
    use crate::orchestrator::{Services, Settings};
    use crate::user::User;
    use crate::user_store::{MemoryUserStore, UserStore};
    use parley_core::fakes::{FakeInbound, FakeProvider, FakeSynthesizer, FakeTranscriber, FakeTransport};
    use parley_core::{ModelCatalog, Transport};
    use std::time::Duration;

    fn orchestrator(store: Arc<MemoryUserStore>, transport: Arc<FakeTransport>) -> Arc<Orchestrator> {
        Arc::new(
            Orchestrator::new(
                store,
                transport as Arc<dyn Transport>,
                Services {
                    completion: Arc::new(FakeProvider::new("ok")),
                    transcriber: Arc::new(FakeTranscriber::new("words")),
                    synthesizer: Arc::new(FakeSynthesizer::new()),
                },
                UsageLedger::new(ModelCatalog::default(), 1.0),
                Settings {
                    admin: UserId(1),
                    summary_window: 10,
                    service_timeout: Duration::from_secs(5),
                },
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn events_for_one_user_are_handled_in_order() {
        let store = Arc::new(MemoryUserStore::default());
        let mut seeded = crate::user::UserTable::new();
        seeded.insert(UserId(42), User::new(UserId(42), Status::Whitelisted));
        store.save_all(&seeded).unwrap();

        let transport = Arc::new(FakeTransport::new());
        let inbound = FakeInbound::new([
            InboundEvent::text(UserId(42), "/ping"),
            InboundEvent::text(UserId(7), "hello"),
            InboundEvent::text(UserId(42), "/list"),
            InboundEvent::text(UserId(42), "/new"),
            InboundEvent::text(UserId(42), "/model gpt-3.5-turbo"),
        ]);

        let err = run_event_loop(inbound, orchestrator(Arc::clone(&store), Arc::clone(&transport)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no inbound events"));

        let texts = transport.texts_for(UserId(42));
        assert_eq!(
            texts,
            vec![
                "pong",
                "No conversations found, start a new one",
                "Select a model from the list",
                "Selected model gpt-3.5-turbo",
                "Select a personality from the list",
            ]
        );
        // The unknown user was registered and persisted.
        assert_eq!(
            store.load_all().unwrap()[&UserId(7)].status,
            Status::Unreviewed
        );
    }
}
