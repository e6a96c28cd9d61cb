//! # Slipstream Worker
//!
//! The offline delivery worker for the Slipstream layer: it sits between
//! the application and the network, serving snapshot content when it can,
//! queueing mutations while offline, and migrating cached content across
//! deployments without breaking an open session.
//!
//! ## Architecture
//!
//! ```text
//! WorkerContext
//!     ├── GenerationStore (snapshots, one current generation)
//!     ├── DurableQueue (offline mutations, timestamp-keyed)
//!     ├── NetworkClient (transport)
//!     └── ClientRegistry (connected pages, control channel)
//!
//! events: install / activate / fetch / message / sync / online / offline
//! ```
//!
//! Every platform event is dispatched through [`WorkerContext::handle_event`]
//! and produces an explicit [`EventOutcome`]; no handler path escapes as an
//! unhandled error.

pub mod config;
pub mod control;
pub mod migrate;
pub mod policy;
pub mod replay;

pub use config::WorkerConfig;
pub use control::{ClientId, ClientRegistry, ControlMessage, RETRY_SYNC_TAG};
pub use migrate::MigrationReport;
pub use replay::ReplayReport;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slipstream_cache::{capture_generation, GenerationStore, InstallReport};
use slipstream_fetch::{FetchedResponse, NetworkClient, Request};
use slipstream_queue::{DurableQueue, QueueError, RecordStore};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

// ==================== Errors ====================

/// Errors surfaced by worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid control message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

// ==================== Worker state ====================

/// Lifecycle state of one worker process.
///
/// Not persisted; rebuilt from platform signals on every start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Snapshot capture in progress.
    Installing,
    /// Captured and waiting for activation.
    Installed,
    /// Taking over: stale generations being discarded.
    Activating,
    /// Controlling clients.
    Activated,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::Installing
    }
}

// ==================== Registration ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// One worker instance as seen by the registration.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub version: u32,
    pub state: WorkerState,
}

/// The page-side view of worker instances: at most one installing, one
/// waiting, and one active worker at a time.
#[derive(Debug, Default)]
pub struct Registration {
    pub installing: Option<WorkerHandle>,
    pub waiting: Option<WorkerHandle>,
    pub active: Option<WorkerHandle>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new build starts installing.
    pub fn update(&mut self, version: u32) {
        self.installing = Some(WorkerHandle {
            id: WorkerId::new(),
            version,
            state: WorkerState::Installing,
        });
    }

    /// Installing worker finished capturing and is now waiting.
    pub fn install_complete(&mut self) {
        if let Some(mut worker) = self.installing.take() {
            worker.state = WorkerState::Installed;
            self.waiting = Some(worker);
        }
    }

    /// Waiting worker takes over; the previous active worker is dropped.
    pub fn activate(&mut self) {
        if let Some(mut worker) = self.waiting.take() {
            worker.state = WorkerState::Activated;
            self.active = Some(worker);
        }
    }

    /// A new build is waiting while an older one still controls clients.
    ///
    /// This is the window where the page should ask for cache preparation
    /// and then skip-waiting.
    pub fn update_ready(&self) -> bool {
        self.waiting.is_some() && self.active.is_some()
    }
}

// ==================== Events ====================

/// Platform and page events delivered to the worker.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Capture a new generation.
    Install,
    /// Take over from older generations.
    Activate,
    /// An intercepted request.
    Fetch(Request),
    /// A control channel message from a page.
    Message(ControlMessage),
    /// A platform background-retry signal.
    Sync { tag: String },
    /// Connectivity restored.
    Online,
    /// Connectivity lost.
    Offline,
}

/// Explicit result of handling one event.
#[derive(Debug)]
pub enum EventOutcome {
    /// Generation captured (possibly partially).
    Installed(InstallReport),
    /// Worker took over; stale generation names listed.
    Activated { removed: Vec<String> },
    /// Response for an intercepted request.
    Response(FetchedResponse),
    /// Migration engine ran.
    Migrated(MigrationReport),
    /// Queue replay ran.
    Replayed(ReplayReport),
    /// Notification relayed to this many clients.
    Notified(usize),
    /// Skip-wait refused because too many clients are connected.
    SkipRefused { clients: usize },
    /// Event noted; no state-machine effect.
    Acknowledged,
}

// ==================== Worker context ====================

/// Process-scoped state for one worker, created at worker start and passed
/// to every handler; there are no ambient globals.
pub struct WorkerContext {
    config: WorkerConfig,
    state: RwLock<WorkerState>,
    store: Arc<RwLock<GenerationStore>>,
    queue: DurableQueue,
    network: Arc<dyn NetworkClient>,
    clients: RwLock<ClientRegistry>,
    online: AtomicBool,
    /// Set when a skip-wait was refused; honored once the client count
    /// drops low enough.
    skip_pending: AtomicBool,
}

impl WorkerContext {
    /// Create the context for one worker process.
    pub fn new(
        config: WorkerConfig,
        network: Arc<dyn NetworkClient>,
        queue_store: Arc<dyn RecordStore>,
    ) -> Self {
        info!(
            generation = %config.generation_name(),
            origin = %config.origin,
            "worker context created"
        );
        Self {
            config,
            state: RwLock::new(WorkerState::Installing),
            store: Arc::new(RwLock::new(GenerationStore::new())),
            queue: DurableQueue::new(queue_store),
            network,
            clients: RwLock::new(ClientRegistry::new()),
            online: AtomicBool::new(true),
            skip_pending: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RwLock<GenerationStore>> {
        &self.store
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    pub fn network(&self) -> &dyn NetworkClient {
        self.network.as_ref()
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of queued offline mutations.
    pub async fn queue_len(&self) -> Result<usize, WorkerError> {
        Ok(self.queue.len().await?)
    }

    // ==================== Clients ====================

    /// Register a connected page.
    pub async fn connect_client(
        &self,
    ) -> (ClientId, mpsc::UnboundedReceiver<ControlMessage>) {
        self.clients.write().await.connect()
    }

    /// Remove a disconnected page.
    ///
    /// A pending skip-wait is honored as soon as the count allows it; the
    /// resulting activation outcome is returned when that happens.
    pub async fn disconnect_client(&self, id: ClientId) -> Option<EventOutcome> {
        let remaining = {
            let mut clients = self.clients.write().await;
            clients.disconnect(id);
            clients.count()
        };

        if remaining <= 1
            && self.skip_pending.load(Ordering::SeqCst)
            && self.state().await == WorkerState::Installed
        {
            debug!(remaining, "honoring pending skip-wait");
            return Some(self.skip_waiting(false).await);
        }
        None
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.count()
    }

    // ==================== Event dispatch ====================

    /// Dispatch one platform event to its handler.
    pub async fn handle_event(&self, event: WorkerEvent) -> Result<EventOutcome, WorkerError> {
        match event {
            WorkerEvent::Install => Ok(EventOutcome::Installed(self.install().await)),
            WorkerEvent::Activate => Ok(self.activate().await),
            WorkerEvent::Fetch(request) => {
                Ok(EventOutcome::Response(policy::respond(self, request).await))
            }
            WorkerEvent::Message(message) => self.handle_message(message).await,
            WorkerEvent::Sync { tag } => {
                if tag == RETRY_SYNC_TAG {
                    Ok(EventOutcome::Replayed(self.replay().await))
                } else {
                    debug!(tag = %tag, "ignoring unknown sync tag");
                    Ok(EventOutcome::Acknowledged)
                }
            }
            WorkerEvent::Online => {
                self.set_online(true);
                Ok(EventOutcome::Replayed(self.replay().await))
            }
            WorkerEvent::Offline => {
                self.set_online(false);
                Ok(EventOutcome::Acknowledged)
            }
        }
    }

    /// Handle a control channel message.
    pub async fn handle_message(
        &self,
        message: ControlMessage,
    ) -> Result<EventOutcome, WorkerError> {
        match message {
            ControlMessage::SkipWaiting => Ok(self.skip_waiting(false).await),
            ControlMessage::PrepareCachesForUpdate => {
                Ok(EventOutcome::Migrated(self.migrate().await))
            }
            ControlMessage::RetryRequests => {
                if self.config.background_retry {
                    // The platform signal owns draining on this build.
                    debug!("drain request ignored, background retry is available");
                    Ok(EventOutcome::Acknowledged)
                } else {
                    Ok(EventOutcome::Replayed(self.replay().await))
                }
            }
            ControlMessage::Notify { payload } => {
                let delivered = self
                    .clients
                    .write()
                    .await
                    .broadcast(&ControlMessage::Notify { payload });
                Ok(EventOutcome::Notified(delivered))
            }
        }
    }

    /// Handle a control channel message in its wire form.
    pub async fn handle_message_json(&self, raw: &str) -> Result<EventOutcome, WorkerError> {
        let message = ControlMessage::from_json(raw)?;
        self.handle_message(message).await
    }

    // ==================== Lifecycle ====================

    /// Capture this build's generation.
    ///
    /// Capture is best-effort: failed resources are reported, not fatal,
    /// and the worker still reaches the waiting state.
    pub async fn install(&self) -> InstallReport {
        *self.state.write().await = WorkerState::Installing;

        let name = self.config.generation_name();
        let manifest = self.config.capture_manifest();
        let (generation, report) = capture_generation(
            &self.config.origin,
            &name,
            &manifest,
            self.network.as_ref(),
        )
        .await;

        self.store.write().await.insert(generation);
        *self.state.write().await = WorkerState::Installed;

        info!(
            generation = %name,
            captured = report.captured.len(),
            failed = report.failed.len(),
            "worker installed"
        );
        report
    }

    /// Take over: discard stale generations and claim connected clients.
    pub async fn activate(&self) -> EventOutcome {
        *self.state.write().await = WorkerState::Activating;
        self.skip_pending.store(false, Ordering::SeqCst);

        let current = self.config.generation_name();
        let removed = self.store.write().await.delete_generations_except(&current);
        let claimed = self.clients.write().await.claim();

        *self.state.write().await = WorkerState::Activated;
        info!(
            generation = %current,
            removed = removed.len(),
            claimed,
            "worker activated"
        );
        EventOutcome::Activated { removed }
    }

    /// Activate immediately when it is safe to do so.
    ///
    /// Yanking cached content out from under two or more mid-session pages
    /// is refused unless `force` is set; a refusal leaves a pending flag
    /// honored at the next disconnect.
    pub async fn skip_waiting(&self, force: bool) -> EventOutcome {
        let clients = self.client_count().await;
        if !force && clients > 1 {
            warn!(clients, "skip-wait refused");
            self.skip_pending.store(true, Ordering::SeqCst);
            return EventOutcome::SkipRefused { clients };
        }
        self.activate().await
    }

    /// Run the migration engine.
    pub async fn migrate(&self) -> MigrationReport {
        migrate::migrate_generations(
            &self.store,
            &self.config.generation_name(),
            &self.config.root_document_paths(),
        )
        .await
    }

    /// Drain the queue against the network.
    pub async fn replay(&self) -> ReplayReport {
        replay::replay(&self.queue, self.network.as_ref()).await
    }
}
