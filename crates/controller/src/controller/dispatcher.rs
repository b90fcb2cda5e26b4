//! # Dispatcher
//!
//! Turns a stream of desired-state events into reconciles.
//!
//! - At most one reconcile or cleanup per identity runs at a time; events that
//!   arrive meanwhile are coalesced (the latest desired state wins) and run
//!   once the in-flight work finishes.
//! - A bounded worker pool (semaphore) caps concurrent work across identities.
//! - After a successful reconcile a timer fires at the renewal deadline.
//! - Transient failures are retried with per-identity Fibonacci backoff;
//!   configuration failures wait for the desired state to change.
//! - Every finished run is published as a [`ReconcileCompleted`] on a
//!   broadcast channel (status writer, tests).
//!
//! All scheduling state lives in a single task that owns it; workers and
//! timers talk to it over a channel, so no lock guards the per-key slots.

use crate::config::ControllerConfig;
use crate::constants::{
    COMPLETION_CHANNEL_CAPACITY, DEFAULT_BACKOFF_MAX_SECS, DEFAULT_BACKOFF_MIN_SECS,
    DEFAULT_MAX_CONCURRENT_RECONCILIATIONS, MIN_REQUEUE_MS,
};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::reconciler::{
    CleanupOutcome, ErrorKind, ReconcileOutcome, Reconciler, ReconcilerError, TriggerSource,
};
use crate::crd::{DesiredCertificate, ResourceKey};
use crate::observability::metrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// The work the dispatcher schedules. Implemented by [`Reconciler`].
#[async_trait]
pub trait ReconcileHandler: Send + Sync {
    async fn reconcile(
        &self,
        desired: &DesiredCertificate,
    ) -> Result<ReconcileOutcome, ReconcilerError>;

    async fn cleanup(&self, desired: &DesiredCertificate)
        -> Result<CleanupOutcome, ReconcilerError>;
}

#[async_trait]
impl ReconcileHandler for Reconciler {
    async fn reconcile(
        &self,
        desired: &DesiredCertificate,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        Reconciler::reconcile(self, desired).await
    }

    async fn cleanup(
        &self,
        desired: &DesiredCertificate,
    ) -> Result<CleanupOutcome, ReconcilerError> {
        Reconciler::cleanup(self, desired).await
    }
}

/// A change to the desired state of one identity
#[derive(Debug, Clone)]
pub enum DesiredEvent {
    /// Created or updated
    Applied(DesiredCertificate),
    /// Removed; carries the last known desired state so its flags can be honored
    Deleted(DesiredCertificate),
}

impl DesiredEvent {
    pub fn key(&self) -> &ResourceKey {
        match self {
            DesiredEvent::Applied(desired) | DesiredEvent::Deleted(desired) => &desired.key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Size of the worker pool
    pub max_concurrent: usize,
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            backoff_min_secs: DEFAULT_BACKOFF_MIN_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
        }
    }
}

impl DispatcherOptions {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_reconciliations,
            backoff_min_secs: config.backoff_min_secs,
            backoff_max_secs: config.backoff_max_secs,
        }
    }
}

/// Published after every reconcile or cleanup
#[derive(Debug, Clone)]
pub struct ReconcileCompleted {
    pub key: ResourceKey,
    /// UID of the resource object the run worked from
    pub uid: Option<String>,
    /// Generation of the desired state the run worked from
    pub generation: Option<i64>,
    pub trigger: TriggerSource,
    pub result: ReconcileResult,
}

#[derive(Debug, Clone)]
pub enum ReconcileResult {
    /// The destination holds the current certificate
    Synced(ReconcileOutcome),
    /// Cleanup finished and the identity is forgotten
    Deleted(CleanupOutcome),
    Failed {
        kind: ErrorKind,
        operation: &'static str,
        message: String,
        /// Set when a retry has been scheduled
        retry_after: Option<Duration>,
    },
}

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("dispatcher has shut down")]
    Closed,
}

/// Handle to a running dispatcher. Clones share the same scheduler.
#[derive(Clone)]
pub struct Dispatcher {
    commands: UnboundedSender<Command>,
    completions: broadcast::Sender<ReconcileCompleted>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("closed", &self.commands.is_closed())
            .field("subscribers", &self.completions.receiver_count())
            .finish()
    }
}

impl Dispatcher {
    /// Start the scheduler task. Must be called inside a Tokio runtime.
    pub fn spawn(handler: Arc<dyn ReconcileHandler>, options: DispatcherOptions) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);

        let scheduler = Scheduler {
            semaphore: Arc::new(Semaphore::new(options.max_concurrent.max(1))),
            handler,
            options,
            commands: commands.downgrade(),
            completions: completions.clone(),
            slots: HashMap::new(),
            in_flight: 0,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
        };
        tokio::spawn(scheduler.run(receiver));

        Self {
            commands,
            completions,
        }
    }

    /// Queue a desired-state change
    ///
    /// # Errors
    ///
    /// [`DispatcherError::Closed`] after [`shutdown`](Self::shutdown) completed.
    pub fn submit(&self, event: DesiredEvent) -> Result<(), DispatcherError> {
        self.commands
            .send(Command::Event(event))
            .map_err(|_unsent| DispatcherError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileCompleted> {
        self.completions.subscribe()
    }

    /// Stop accepting work, cancel timers and wait for in-flight runs to finish
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

enum Command {
    Event(DesiredEvent),
    Finished {
        key: ResourceKey,
        uid: Option<String>,
        generation: Option<i64>,
        trigger: TriggerSource,
        result: WorkResult,
    },
    Timer {
        key: ResourceKey,
        seq: u64,
        trigger: TriggerSource,
    },
    Shutdown(oneshot::Sender<()>),
}

enum WorkResult {
    Reconciled(Result<ReconcileOutcome, ReconcilerError>),
    Cleaned(Result<CleanupOutcome, ReconcilerError>),
}

/// Scheduling state for one identity
struct Slot {
    /// Latest desired state; the next run always works from this snapshot
    desired: DesiredCertificate,
    deleted: bool,
    /// Why the next run was requested; `None` when nothing is queued
    pending: Option<TriggerSource>,
    in_flight: bool,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer changes so stale firings are ignored
    timer_seq: u64,
    backoff: FibonacciBackoff,
}

impl Slot {
    fn new(desired: DesiredCertificate, options: &DispatcherOptions) -> Self {
        Self {
            desired,
            deleted: false,
            pending: None,
            in_flight: false,
            timer: None,
            timer_seq: 0,
            backoff: FibonacciBackoff::new(options.backoff_min_secs, options.backoff_max_secs),
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_seq = self.timer_seq.wrapping_add(1);
    }

    fn schedule_timer(
        &mut self,
        commands: &WeakUnboundedSender<Command>,
        delay: Duration,
        trigger: TriggerSource,
    ) {
        self.cancel_timer();
        let seq = self.timer_seq;
        let key = self.desired.key.clone();
        let commands = commands.clone();
        metrics::increment_requeues_total(trigger.as_str());

        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Timer { key, seq, trigger });
            }
        }));
    }

    /// Same resource object at the same generation: a status or metadata-only update
    fn is_unchanged(&self, desired: &DesiredCertificate) -> bool {
        !self.deleted
            && self.desired.generation.is_some()
            && self.desired.generation == desired.generation
            && self.desired.uid == desired.uid
    }
}

struct Scheduler {
    handler: Arc<dyn ReconcileHandler>,
    options: DispatcherOptions,
    /// Weak so that dropping every [`Dispatcher`] handle stops the scheduler
    commands: WeakUnboundedSender<Command>,
    completions: broadcast::Sender<ReconcileCompleted>,
    semaphore: Arc<Semaphore>,
    slots: HashMap<ResourceKey, Slot>,
    in_flight: usize,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Scheduler {
    async fn run(mut self, mut receiver: UnboundedReceiver<Command>) {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::Event(event) => self.handle_event(event),
                Command::Finished {
                    key,
                    uid,
                    generation,
                    trigger,
                    result,
                } => self.handle_finished(key, uid, generation, trigger, result),
                Command::Timer { key, seq, trigger } => self.handle_timer(&key, seq, trigger),
                Command::Shutdown(done) => self.begin_shutdown(done),
            }

            if self.shutting_down && self.in_flight == 0 {
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                break;
            }
        }
        info!("Dispatcher stopped");
    }

    fn handle_event(&mut self, event: DesiredEvent) {
        if self.shutting_down {
            debug!(resource = %event.key(), "Ignoring event during shutdown");
            return;
        }

        match event {
            DesiredEvent::Applied(desired) => {
                let key = desired.key.clone();
                let options = &self.options;
                let is_new = !self.slots.contains_key(&key);
                let slot = self
                    .slots
                    .entry(key.clone())
                    .or_insert_with(|| Slot::new(desired.clone(), options));

                if !is_new && slot.is_unchanged(&desired) {
                    slot.desired = desired;
                    return;
                }

                let trigger = if is_new || slot.deleted || slot.pending == Some(TriggerSource::Created) {
                    TriggerSource::Created
                } else {
                    TriggerSource::Updated
                };
                slot.desired = desired;
                slot.deleted = false;
                slot.backoff.reset();
                slot.cancel_timer();
                slot.pending = Some(trigger);
                self.try_start(&key);
            }
            DesiredEvent::Deleted(desired) => {
                let key = desired.key.clone();
                let options = &self.options;
                let slot = self
                    .slots
                    .entry(key.clone())
                    .or_insert_with(|| Slot::new(desired.clone(), options));

                slot.desired = desired;
                slot.deleted = true;
                slot.backoff.reset();
                slot.cancel_timer();
                slot.pending = Some(TriggerSource::Deleted);
                self.try_start(&key);
            }
        }
    }

    fn handle_timer(&mut self, key: &ResourceKey, seq: u64, trigger: TriggerSource) {
        if self.shutting_down {
            return;
        }
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        if slot.timer_seq != seq {
            debug!(resource = %key, "Ignoring stale timer");
            return;
        }
        slot.timer = None;
        if slot.pending.is_none() {
            slot.pending = Some(trigger);
        }
        self.try_start(key);
    }

    fn try_start(&mut self, key: &ResourceKey) {
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        if slot.in_flight {
            return;
        }
        let Some(trigger) = slot.pending.take() else {
            return;
        };
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        slot.in_flight = true;
        self.in_flight += 1;

        let cleanup = slot.deleted;
        let desired = slot.desired.clone();
        let handler = Arc::clone(&self.handler);
        let semaphore = Arc::clone(&self.semaphore);

        tokio::spawn(async move {
            // A closed semaphore is never expected; run unbounded rather than drop the work
            let permit = semaphore.acquire_owned().await.ok();
            let result = run_work(handler.as_ref(), &desired, trigger, cleanup).await;
            drop(permit);

            let _ = commands.send(Command::Finished {
                key: desired.key.clone(),
                uid: desired.uid.clone(),
                generation: desired.generation,
                trigger,
                result,
            });
        });
    }

    fn handle_finished(
        &mut self,
        key: ResourceKey,
        uid: Option<String>,
        generation: Option<i64>,
        trigger: TriggerSource,
        result: WorkResult,
    ) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let accepting = !self.shutting_down;

        let Some(slot) = self.slots.get_mut(&key) else {
            return;
        };
        slot.in_flight = false;
        let idle = accepting && slot.pending.is_none();

        let (result, remove) = match result {
            WorkResult::Reconciled(Ok(outcome)) => {
                slot.backoff.reset();
                if idle && !slot.deleted {
                    let delay = outcome
                        .requeue_after
                        .max(Duration::from_millis(MIN_REQUEUE_MS));
                    slot.schedule_timer(&self.commands, delay, TriggerSource::RenewalDeadline);
                    debug!(
                        resource = %key,
                        next_renewal = %outcome.next_renewal,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Scheduled renewal"
                    );
                }
                (ReconcileResult::Synced(outcome), false)
            }
            WorkResult::Cleaned(Ok(outcome)) => {
                let remove = slot.deleted && slot.pending.is_none();
                (ReconcileResult::Deleted(outcome), remove)
            }
            WorkResult::Reconciled(Err(e)) | WorkResult::Cleaned(Err(e)) => {
                let kind = e.kind();
                // Cleanup is always retried: the resource cannot go away until it succeeds
                let retry = kind == ErrorKind::Transient || slot.deleted;
                let retry_after = (retry && idle).then(|| {
                    let delay = slot.backoff.next_backoff();
                    slot.schedule_timer(&self.commands, delay, TriggerSource::ErrorBackoff);
                    delay
                });
                (
                    ReconcileResult::Failed {
                        kind,
                        operation: e.operation(),
                        message: e.to_string(),
                        retry_after,
                    },
                    false,
                )
            }
        };

        if remove {
            slot.cancel_timer();
            self.slots.remove(&key);
        }

        let _ = self.completions.send(ReconcileCompleted {
            key: key.clone(),
            uid,
            generation,
            trigger,
            result,
        });

        self.try_start(&key);
    }

    fn begin_shutdown(&mut self, done: oneshot::Sender<()>) {
        if !self.shutting_down {
            info!(
                in_flight = self.in_flight,
                tracked = self.slots.len(),
                "Dispatcher shutting down"
            );
        }
        self.shutting_down = true;
        for slot in self.slots.values_mut() {
            slot.cancel_timer();
            slot.pending = None;
        }
        self.shutdown_waiters.push(done);
    }
}

async fn run_work(
    handler: &dyn ReconcileHandler,
    desired: &DesiredCertificate,
    trigger: TriggerSource,
    cleanup: bool,
) -> WorkResult {
    let span = info_span!(
        "pki.reconcile",
        resource.name = %desired.key.name,
        resource.namespace = %desired.key.namespace,
        resource.generation = desired.generation.unwrap_or(0),
        trigger = trigger.as_str(),
        cleanup,
    );

    async move {
        let start = Instant::now();
        metrics::increment_reconciliations(trigger.as_str());

        let result = if cleanup {
            WorkResult::Cleaned(handler.cleanup(desired).await)
        } else {
            WorkResult::Reconciled(handler.reconcile(desired).await)
        };
        metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

        let failure = match &result {
            WorkResult::Reconciled(Err(e)) | WorkResult::Cleaned(Err(e)) => Some(e),
            WorkResult::Reconciled(Ok(_)) | WorkResult::Cleaned(Ok(_)) => None,
        };
        if let Some(e) = failure {
            metrics::increment_reconciliation_errors(e.kind().as_str());
            match e.kind() {
                ErrorKind::Transient => warn!(error = %e, "Reconciliation failed, will retry"),
                ErrorKind::Configuration => {
                    error!(error = %e, "Reconciliation failed, waiting for the resource to change");
                }
            }
        }
        result
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::reconciler::ReconcileAction;
    use crate::crd::{CertificateFormat, DestinationRef, PkiSecretSpec};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Records every desired state it sees; the first reconcile blocks until released
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(String, bool)>>,
        calls: AtomicUsize,
        gate: Notify,
        gated: bool,
    }

    #[async_trait]
    impl ReconcileHandler for RecordingHandler {
        async fn reconcile(
            &self,
            desired: &DesiredCertificate,
        ) -> Result<ReconcileOutcome, ReconcilerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.gated && call == 0 {
                self.gate.notified().await;
            }
            self.seen
                .lock()
                .unwrap()
                .push((desired.spec.common_name.clone(), false));
            Ok(ReconcileOutcome {
                serial_number: format!("s{call}"),
                action: ReconcileAction::Issued,
                issued_at: Utc::now(),
                expiration: Utc::now(),
                next_renewal: Utc::now(),
                requeue_after: Duration::from_secs(3600),
                revocations_pending: 0,
            })
        }

        async fn cleanup(
            &self,
            desired: &DesiredCertificate,
        ) -> Result<CleanupOutcome, ReconcilerError> {
            self.seen
                .lock()
                .unwrap()
                .push((desired.spec.common_name.clone(), true));
            Ok(CleanupOutcome::default())
        }
    }

    fn desired(common_name: &str, generation: i64) -> DesiredCertificate {
        let mut desired = DesiredCertificate::new(
            "ns",
            "web",
            PkiSecretSpec {
                auth_ref: None,
                namespace: None,
                mount: "pki".to_string(),
                role: "secret".to_string(),
                common_name: common_name.to_string(),
                alt_names: Vec::new(),
                ip_sans: Vec::new(),
                uri_sans: Vec::new(),
                exclude_cn_from_sans: false,
                format: CertificateFormat::Pem,
                revoke: false,
                clear: false,
                expiry_offset: None,
                ttl: None,
                destination: DestinationRef {
                    name: "tls".to_string(),
                    ..DestinationRef::default()
                },
            },
        );
        desired.generation = Some(generation);
        desired
    }

    async fn next(receiver: &mut broadcast::Receiver<ReconcileCompleted>) -> ReconcileCompleted {
        tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("completion within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_updates_during_flight_are_coalesced() {
        let handler = Arc::new(RecordingHandler {
            gated: true,
            ..RecordingHandler::default()
        });
        let dispatcher = Dispatcher::spawn(
            Arc::clone(&handler) as Arc<dyn ReconcileHandler>,
            DispatcherOptions::default(),
        );
        let mut completions = dispatcher.subscribe();

        dispatcher
            .submit(DesiredEvent::Applied(desired("v1", 1)))
            .unwrap();
        tokio::task::yield_now().await;
        dispatcher
            .submit(DesiredEvent::Applied(desired("v2", 2)))
            .unwrap();
        dispatcher
            .submit(DesiredEvent::Applied(desired("v3", 3)))
            .unwrap();
        // Let the scheduler take the queued events before releasing the first run
        tokio::time::sleep(Duration::from_millis(50)).await;
        handler.gate.notify_one();

        let first = next(&mut completions).await;
        assert_eq!(first.trigger, TriggerSource::Created);
        let second = next(&mut completions).await;
        assert_eq!(second.trigger, TriggerSource::Updated);
        assert_eq!(second.generation, Some(3));

        dispatcher.shutdown().await;
        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![("v1".to_string(), false), ("v3".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_same_generation_is_not_reconciled_again() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::spawn(
            Arc::clone(&handler) as Arc<dyn ReconcileHandler>,
            DispatcherOptions::default(),
        );
        let mut completions = dispatcher.subscribe();

        dispatcher
            .submit(DesiredEvent::Applied(desired("v1", 1)))
            .unwrap();
        next(&mut completions).await;
        dispatcher
            .submit(DesiredEvent::Applied(desired("v1", 1)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        dispatcher.shutdown().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_of_unknown_identity_runs_cleanup() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::spawn(
            Arc::clone(&handler) as Arc<dyn ReconcileHandler>,
            DispatcherOptions::default(),
        );
        let mut completions = dispatcher.subscribe();

        dispatcher
            .submit(DesiredEvent::Deleted(desired("gone", 4)))
            .unwrap();
        let completed = next(&mut completions).await;
        assert_eq!(completed.trigger, TriggerSource::Deleted);
        assert!(matches!(completed.result, ReconcileResult::Deleted(_)));

        dispatcher.shutdown().await;
        assert_eq!(
            handler.seen.lock().unwrap().clone(),
            vec![("gone".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let dispatcher = Dispatcher::spawn(
            Arc::new(RecordingHandler::default()),
            DispatcherOptions::default(),
        );
        dispatcher.shutdown().await;
        // Scheduler task has exited and dropped the receiver
        tokio::task::yield_now().await;
        assert!(matches!(
            dispatcher.submit(DesiredEvent::Applied(desired("late", 1))),
            Err(DispatcherError::Closed)
        ));
    }
}
