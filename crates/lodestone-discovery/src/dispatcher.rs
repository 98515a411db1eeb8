//! Routes change events to one handler per entity kind.
//!
//! Each kind gets its own loop: events of one kind are handled strictly in
//! arrival order, different kinds run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use lodestone_core::{Action, ChangeEvent, ChangeListener, EntityKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::metrics as m;

pub trait EventHandler: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Failures are logged by the handler and the event is dropped.
    fn on_event(&self, event: &ChangeEvent);
}

/// Per-kind queues are unbounded. `dispatch` runs inside the store's commit,
/// so it must never wait, and a dropped Delete would leak quota and index
/// entries. Backlog behind a slow handler is visible in the
/// `lodestone_dispatch_backlog` gauge.
pub struct EventDispatcher {
    senders: HashMap<EntityKind, mpsc::UnboundedSender<ChangeEvent>>,
}

impl EventDispatcher {
    /// Spawns one loop per handler. A second handler for the same kind replaces the first.
    pub fn start(
        handlers: Vec<Arc<dyn EventHandler>>,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let mut by_kind: HashMap<EntityKind, Arc<dyn EventHandler>> = HashMap::new();
        for handler in handlers {
            if by_kind.insert(handler.kind(), handler).is_some() {
                warn!("duplicate event handler registered, keeping the last one");
            }
        }

        let mut senders = HashMap::with_capacity(by_kind.len());
        for (kind, handler) in by_kind {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(kind, tx);
            tracker.spawn(run_loop(kind, handler, rx, shutdown.clone()));
        }
        Self { senders }
    }

    pub fn dispatch(&self, event: ChangeEvent) {
        let kind = event.kind();
        match self.senders.get(&kind) {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("dispatch loop for {} stopped, drop event", kind);
                    return;
                }
                m::dispatch_queued(kind.as_str());
            }
            None => warn!("no handler for {} events", kind),
        }
    }
}

impl ChangeListener for EventDispatcher {
    fn on_change(&self, event: ChangeEvent) {
        self.dispatch(event);
    }
}

async fn run_loop(
    kind: EntityKind,
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    shutdown: CancellationToken,
) {
    debug!("{} event loop started", kind);
    let mut last_revision: Option<i64> = None;
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if event.action != Action::Init {
            if let Some(last) = last_revision {
                if event.revision <= last {
                    warn!(
                        "{} event revision {} did not increase (last {}), handling anyway",
                        kind, event.revision, last
                    );
                }
            }
            last_revision = Some(event.revision);
        }

        m::dispatch_handled(kind.as_str());
        // handlers hit the store synchronously
        let handler = Arc::clone(&handler);
        let job = tokio::task::spawn_blocking(move || handler.on_event(&event));
        if let Err(e) = job.await {
            error!("{} event handler failed: {}", kind, e);
        }
    }
    debug!("{} event loop stopped", kind);
}
