//! Process-wide composition root.
//!
//! [`Infrastructure`] owns every long-lived piece (connections, queues,
//! workers, scheduler, telemetry). The entry point builds it once, hands
//! references to whoever needs them, and calls [`Infrastructure::shutdown`]
//! on the way out. Shutdown walks the pieces in reverse construction order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use orderflow_observability::{DEFAULT_FLUSH_TIMEOUT, TelemetryGuard};

use crate::cache::{Cache, CacheStats};
use crate::clock::{self, SharedClock};
use crate::config::Settings;
use crate::jobs::{
    ChatSender, EmailHandler, FileCleanupHandler, FileRemover, ImageStore, ImageUploadHandler,
    JobHandler, JobQueue, LocalFileRemover, LocalImageStore, Mailer, Producers, QueueCounts,
    QueueError, QueueName, ReportGenerator, ReportHandler, WhatsappHandler, Worker, WorkerHandle,
    WorkerStats,
};
use crate::rate_limit::RateLimiter;
use crate::scheduler::{self, Scheduler};
use crate::store::{Connection, ConnectionManager, Purpose, StoreBackend, StoreHealth, StoreStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Ready,
    /// The store was unreachable at startup: cache and rate limiting are
    /// no-ops, enqueues fail, no workers or cron jobs run.
    Degraded,
}

/// External side-effect implementations, one per queue. A queue whose
/// collaborator is missing gets no worker; its jobs wait until one exists.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub image_store: Option<Arc<dyn ImageStore>>,
    pub mailer: Option<Arc<dyn Mailer>>,
    pub chat_sender: Option<Arc<dyn ChatSender>>,
    pub report_generator: Option<Arc<dyn ReportGenerator>>,
    pub file_remover: Option<Arc<dyn FileRemover>>,
}

impl Collaborators {
    /// Filesystem-backed image storage and cleanup under `root`.
    pub fn local(root: impl Into<std::path::PathBuf>) -> Self {
        let root = root.into();
        Self {
            image_store: Some(Arc::new(LocalImageStore::new(&root))),
            file_remover: Some(Arc::new(LocalFileRemover::new(&root))),
            ..Self::default()
        }
    }

    fn handler_for(&self, queue: QueueName) -> Option<Arc<dyn JobHandler>> {
        match queue {
            QueueName::ImageUpload => self
                .image_store
                .clone()
                .map(|store| Arc::new(ImageUploadHandler { store }) as Arc<dyn JobHandler>),
            QueueName::EmailNotification => self
                .mailer
                .clone()
                .map(|mailer| Arc::new(EmailHandler { mailer }) as Arc<dyn JobHandler>),
            QueueName::WhatsappNotification => self
                .chat_sender
                .clone()
                .map(|sender| Arc::new(WhatsappHandler { sender }) as Arc<dyn JobHandler>),
            QueueName::ReportGeneration => self
                .report_generator
                .clone()
                .map(|generator| Arc::new(ReportHandler { generator }) as Arc<dyn JobHandler>),
            QueueName::FileCleanup => self
                .file_remover
                .clone()
                .map(|remover| Arc::new(FileCleanupHandler { remover }) as Arc<dyn JobHandler>),
        }
    }
}

pub struct Infrastructure {
    mode: Mode,
    connections: Arc<ConnectionManager>,
    producers: Producers,
    cache: Cache,
    rate_limiter: RateLimiter,
    scheduler: Scheduler,
    workers_cancel: CancellationToken,
    workers: Mutex<Vec<WorkerHandle>>,
    telemetry: Mutex<Option<TelemetryGuard>>,
}

struct Connections {
    queue: Connection,
    cache: Connection,
    rate_limit: Connection,
}

async fn connect_all(manager: &ConnectionManager) -> Option<Connections> {
    let mut open = BTreeMap::new();
    for purpose in Purpose::ALL {
        match manager.connect(purpose).await {
            Ok(conn) => {
                open.insert(purpose, conn);
            }
            Err(e) => {
                error!(purpose = %purpose, error = %e, "store connection failed");
                return None;
            }
        }
    }
    if !manager.health_check().await {
        error!("store health check failed at startup");
        return None;
    }
    Some(Connections {
        queue: open.remove(&Purpose::Queue)?,
        cache: open.remove(&Purpose::Cache)?,
        rate_limit: open.remove(&Purpose::RateLimit)?,
    })
}

impl Infrastructure {
    /// Bring everything up. Never fails: an unreachable store yields a
    /// [`Mode::Degraded`] instance instead.
    pub async fn initialize(
        settings: &Settings,
        backend: StoreBackend,
        collaborators: Collaborators,
    ) -> Self {
        Self::initialize_with_clock(settings, backend, collaborators, clock::system()).await
    }

    pub async fn initialize_with_clock(
        settings: &Settings,
        backend: StoreBackend,
        collaborators: Collaborators,
        clock: SharedClock,
    ) -> Self {
        // 1. telemetry
        let telemetry = orderflow_observability::init(&settings.telemetry);

        // 2. store
        let health = StoreHealth::new();
        let connections = Arc::new(ConnectionManager::new(backend, health.clone()));
        let (mode, conns) = match connect_all(&connections).await {
            Some(conns) => (Mode::Ready, conns),
            None => {
                error!("store unreachable, infrastructure running degraded");
                health.record(false);
                (
                    Mode::Degraded,
                    Connections {
                        queue: Connection::disconnected(Purpose::Queue),
                        cache: Connection::disconnected(Purpose::Cache),
                        rate_limit: Connection::disconnected(Purpose::RateLimit),
                    },
                )
            }
        };

        let queues: Vec<Arc<JobQueue>> = settings
            .queues
            .iter()
            .map(|(name, policy)| {
                JobQueue::new(*name, policy.clone(), conns.queue.clone(), clock.clone()).arc()
            })
            .collect();
        let producers = Producers::new(queues.iter().cloned());
        let cache = Cache::new(conns.cache, health.clone());
        let rate_limiter = RateLimiter::new(conns.rate_limit, health.clone(), clock.clone());
        let scheduler = Scheduler::new(clock);
        let workers_cancel = CancellationToken::new();
        let mut workers = Vec::new();

        if mode == Mode::Ready {
            // 3. workers
            for queue in queues {
                let name = queue.name();
                match collaborators.handler_for(name) {
                    Some(handler) => {
                        workers.push(Worker::spawn(queue, handler, workers_cancel.child_token()))
                    }
                    None => warn!(queue = %name, "no collaborator configured, worker not started"),
                }
            }

            // 4. cron
            scheduler::register_defaults(
                &scheduler,
                &settings.cron,
                producers.clone(),
                connections.clone(),
            );
            scheduler.start();
        }

        info!(
            mode = ?mode,
            workers = workers.len(),
            error_tracking = telemetry.error_tracking_enabled(),
            "infrastructure initialized"
        );

        Self {
            mode,
            connections,
            producers,
            cache,
            rate_limiter,
            scheduler,
            workers_cancel,
            workers: Mutex::new(workers),
            telemetry: Mutex::new(Some(telemetry)),
        }
    }

    /// Stop in reverse order: cron, workers, connections, telemetry.
    ///
    /// Workers get until `grace` to finish the jobs they hold; anything still
    /// running after that is abandoned and later recovered as stalled.
    /// Calling this twice is harmless.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        info!(grace_secs = grace.as_secs(), "infrastructure shutting down");

        if tokio::time::timeout_at(deadline, self.scheduler.stop())
            .await
            .is_err()
        {
            warn!("cron jobs still running at shutdown deadline");
        }

        self.workers_cancel.cancel();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in workers {
            let queue = handle.queue();
            match tokio::time::timeout_at(deadline, handle.join()).await {
                Ok(stats) => info!(
                    queue = %queue,
                    succeeded = stats.jobs_succeeded,
                    retried = stats.jobs_retried,
                    failed = stats.jobs_failed,
                    "worker stopped"
                ),
                Err(_) => warn!(queue = %queue, "worker abandoned at shutdown deadline"),
            }
        }

        self.connections.close_all().await;

        let telemetry = self
            .telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(guard) = telemetry {
            info!("infrastructure stopped");
            guard.flush(DEFAULT_FLUSH_TIMEOUT);
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn store_status(&self) -> StoreStatus {
        self.connections.health().status()
    }

    pub fn producers(&self) -> &Producers {
        &self.producers
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub async fn queue_stats(&self) -> Result<BTreeMap<QueueName, QueueCounts>, QueueError> {
        let mut stats = BTreeMap::new();
        for name in QueueName::ALL {
            if let Some(queue) = self.producers.queue(name) {
                stats.insert(name, queue.counts().await?);
            }
        }
        Ok(stats)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub fn cron_status(&self) -> BTreeMap<String, bool> {
        self.scheduler.status()
    }

    /// Statistics of the running workers, keyed by queue.
    pub fn worker_stats(&self) -> BTreeMap<QueueName, WorkerStats> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|handle| (handle.queue(), handle.stats()))
            .collect()
    }
}

impl std::fmt::Debug for Infrastructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Infrastructure")
            .field("mode", &self.mode)
            .field("connections", &self.connections)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
