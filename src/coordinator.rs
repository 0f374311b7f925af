//! Session lifecycle and the bounded worker pool.
//!
//! One session runs at a time. `start` spawns exactly `concurrency` workers
//! that pull targets from a FIFO queue; a supervisor waits for all of them and
//! then flips the session to `Completed` and broadcasts `scanning: false`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ScanError;
use crate::probe::{probe_target, CredentialPolicy, Prober};
use crate::publisher::{EventPublisher, Subscription};
use crate::reconciler::CanonicalTable;
use crate::targets::Target;
use crate::types::{
    FailureReason, ProbeStatus, ResultRecord, ScanEvent, SessionSnapshot, SessionState,
};

/// Engine knobs that are not part of a single start request.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound applied to the requested concurrency.
    pub max_concurrency: usize,
    /// Hard deadline for one target's whole connect + credential sequence.
    pub attempt_timeout: Duration,
    /// Publish a `pending` row as soon as a worker picks a target.
    pub emit_pending: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1000,
            attempt_timeout: Duration::from_secs(30),
            emit_pending: true,
        }
    }
}

/// Returned by a successful `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub session_id: u64,
    pub targets: usize,
    pub workers: usize,
}

#[derive(Clone)]
pub struct ScanCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: EngineConfig,
    publisher: EventPublisher,
    prober: Arc<dyn Prober>,
    credentials: Arc<dyn CredentialPolicy>,
    next_session_id: AtomicU64,
    slot: Mutex<SessionSlot>,
    /// Id of the most recently completed session, 0 before the first.
    completed: watch::Sender<u64>,
}

#[derive(Default)]
struct SessionSlot {
    session_id: u64,
    state: SessionState,
    concurrency: usize,
    started_at: Option<String>,
    cancel: Option<CancellationToken>,
    results: Arc<SessionResults>,
}

/// Result sink for one session. Workers only ever talk to this.
#[derive(Default)]
struct SessionResults {
    total: u64,
    next_id: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    table: Mutex<CanonicalTable>,
}

impl SessionResults {
    fn new(total: usize) -> Self {
        Self {
            total: total as u64,
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    fn table(&self) -> MutexGuard<'_, CanonicalTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A worker's handle for publishing rows of its session.
#[derive(Clone)]
struct Emitter {
    results: Arc<SessionResults>,
    publisher: EventPublisher,
}

impl Emitter {
    /// Allocate an id for `target` and publish its pending row.
    fn open(&self, target: &Target) -> u64 {
        let mut table = self.results.table();
        let id = self.results.allocate_id();
        let record = ResultRecord::pending(id, target.as_str());
        table.upsert(record.clone());
        self.publisher.publish(ScanEvent::Result(record));
        id
    }

    /// Publish a terminal row. Rows without a pending predecessor get their
    /// id here so ids still increase in emission order.
    fn finish(&self, id: Option<u64>, mut record: ResultRecord) {
        let mut table = self.results.table();
        record.id = id.unwrap_or_else(|| self.results.allocate_id());
        match record.status {
            ProbeStatus::Success => self.results.succeeded.fetch_add(1, Ordering::Relaxed),
            _ => self.results.failed.fetch_add(1, Ordering::Relaxed),
        };
        table.upsert(record.clone());
        self.publisher.publish(ScanEvent::Result(record));
    }
}

impl ScanCoordinator {
    pub fn new(
        config: EngineConfig,
        publisher: EventPublisher,
        prober: Arc<dyn Prober>,
        credentials: Arc<dyn CredentialPolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                publisher,
                prober,
                credentials,
                next_session_id: AtomicU64::new(1),
                slot: Mutex::new(SessionSlot::default()),
                completed: watch::channel(0).0,
            }),
        }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.inner.publisher
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.publisher.subscribe()
    }

    /// Start a new session over `targets` with `concurrency` workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, targets: Vec<Target>, concurrency: usize) -> Result<SessionTicket, ScanError> {
        if targets.is_empty() {
            return Err(ScanError::InvalidInput("no valid targets provided".into()));
        }
        if concurrency < 1 {
            return Err(ScanError::InvalidInput("concurrency must be at least 1".into()));
        }

        let mut slot = self.inner.slot();
        match slot.state {
            SessionState::Running => return Err(ScanError::SessionBusy("running")),
            SessionState::Stopping => return Err(ScanError::SessionBusy("stopping")),
            SessionState::Idle | SessionState::Completed => {}
        }

        let workers = concurrency
            .min(self.inner.config.max_concurrency.max(1))
            .min(targets.len());
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let results = Arc::new(SessionResults::new(targets.len()));

        *slot = SessionSlot {
            session_id,
            state: SessionState::Running,
            concurrency: workers,
            started_at: Some(now_rfc3339()),
            cancel: Some(cancel.clone()),
            results: results.clone(),
        };
        // Published under the slot lock so it precedes every row of the session.
        self.inner
            .publisher
            .publish(ScanEvent::session_status(session_id, true));
        drop(slot);

        info!(session = session_id, targets = targets.len(), workers, "scan session started");
        let ticket = SessionTicket {
            session_id,
            targets: targets.len(),
            workers,
        };

        let queue = Arc::new(Mutex::new(VecDeque::from(targets)));
        let emitter = Emitter {
            results,
            publisher: self.inner.publisher.clone(),
        };
        tokio::spawn(supervise(
            self.inner.clone(),
            session_id,
            workers,
            queue,
            emitter,
            cancel,
        ));

        Ok(ticket)
    }

    /// Request cancellation of the running session. Returns the state after
    /// the call; calling it when nothing is running is a no-op.
    pub fn stop(&self) -> SessionState {
        let mut slot = self.inner.slot();
        if slot.state == SessionState::Running {
            if let Some(cancel) = &slot.cancel {
                cancel.cancel();
            }
            slot.state = SessionState::Stopping;
            info!(session = slot.session_id, "scan session stopping");
        }
        slot.state
    }

    pub fn state(&self) -> SessionState {
        self.inner.slot().state
    }

    pub fn is_scanning(&self) -> bool {
        self.state().is_active()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let slot = self.inner.slot();
        let results = &slot.results;
        let succeeded = results.succeeded.load(Ordering::Relaxed);
        let failed = results.failed.load(Ordering::Relaxed);
        SessionSnapshot {
            session_id: slot.session_id,
            state: slot.state,
            scanning: slot.state.is_active(),
            concurrency: slot.concurrency,
            total: results.total,
            finalized: succeeded + failed,
            succeeded,
            failed,
            started_at: slot.started_at.clone(),
        }
    }

    /// Resolves once session `session_id` has completed. Independent of the
    /// event stream, so a subscriber whose final status was dropped still
    /// learns that the session is over.
    pub async fn wait_completed(&self, session_id: u64) {
        let mut rx = self.inner.completed.subscribe();
        // The sender lives in `inner`, so the channel cannot close under us.
        let _ = rx.wait_for(|&done| done >= session_id).await;
    }

    /// Rows of the current (or last) session in id order.
    pub fn results(&self) -> Vec<ResultRecord> {
        let results = self.inner.slot().results.clone();
        let mut rows = results.table().rows().to_vec();
        rows.sort_by_key(|r| r.id);
        rows
    }
}

impl CoordinatorInner {
    fn slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, session_id: u64) {
        let mut slot = self.slot();
        if slot.session_id != session_id {
            return;
        }
        slot.state = SessionState::Completed;
        slot.cancel = None;
        self.publisher.publish(ScanEvent::session_status(session_id, false));
        self.completed.send_replace(session_id);
        info!(
            session = session_id,
            succeeded = slot.results.succeeded.load(Ordering::Relaxed),
            failed = slot.results.failed.load(Ordering::Relaxed),
            "scan session completed"
        );
    }
}

async fn supervise(
    inner: Arc<CoordinatorInner>,
    session_id: u64,
    workers: usize,
    queue: Arc<Mutex<VecDeque<Target>>>,
    emitter: Emitter,
    cancel: CancellationToken,
) {
    let mut set = JoinSet::new();
    for worker in 0..workers {
        set.spawn(run_worker(
            worker,
            inner.clone(),
            queue.clone(),
            emitter.clone(),
            cancel.clone(),
        ));
    }
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(session = session_id, error = %e, "worker task failed");
        }
    }
    inner.complete(session_id);
}

async fn run_worker(
    worker: usize,
    inner: Arc<CoordinatorInner>,
    queue: Arc<Mutex<VecDeque<Target>>>,
    emitter: Emitter,
    cancel: CancellationToken,
) {
    let emit_pending = inner.config.emit_pending;
    loop {
        // Pop and open under the queue lock so pending ids follow queue order.
        let next = {
            let mut q = queue.lock().unwrap_or_else(PoisonError::into_inner);
            q.pop_front().map(|target| {
                let id = (emit_pending && !cancel.is_cancelled()).then(|| emitter.open(&target));
                (target, id)
            })
        };
        let Some((target, id)) = next else {
            break;
        };

        let record = if cancel.is_cancelled() {
            ResultRecord::failed(0, target.as_str(), FailureReason::Cancelled)
        } else {
            debug!(worker, host = %target, "probing");
            probe_target(
                inner.prober.as_ref(),
                inner.credentials.as_ref(),
                &target,
                id.unwrap_or(0),
                &cancel,
                inner.config.attempt_timeout,
            )
            .await
        };
        emitter.finish(id, record);
    }
    debug!(worker, "worker drained");
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
