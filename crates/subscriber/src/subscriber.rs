//! Subscriber: polling loop, dispatch and lifecycle
//!
//! Manages polling, admission and shutdown for one queue backend.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{AcknowledgingAdapter, QueueAdapter};
use crate::config::SubscriberConfig;
use crate::error::SubscriberError;
use crate::events::{EventCallback, EventKind, EventListeners, SubscriberEvent};
use crate::message::{Delivery, Message};
use crate::signal::SignalBus;
use crate::worker::{AdmissionPlanner, LeaseRefresher, WorkerPool};

/// Message handler function type
pub type MessageHandler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Runs message handlers and fires `finished`
struct Dispatcher {
    handlers: RwLock<Vec<MessageHandler>>,
    signals: Arc<SignalBus>,
    events: Arc<EventListeners>,
}

impl Dispatcher {
    fn has_handlers(&self) -> bool {
        !self.handlers.read().is_empty()
    }

    /// Pool worker: completes only once `finished` is observed on the bus
    async fn process(&self, delivery: Delivery) {
        let Some(signals) = self.signals.signals(delivery.delivery_id()) else {
            debug!(delivery_id = %delivery.delivery_id(), "Delivery released before dispatch");
            return;
        };

        tokio::join!(self.dispatch(delivery), signals.finished());
    }

    async fn dispatch(&self, delivery: Delivery) {
        let handlers = self.handlers.read().clone();
        let delivery_id = delivery.delivery_id();
        let message_id = delivery.id.clone();

        debug!(%message_id, %delivery_id, handlers = handlers.len(), "Dispatching message");

        let results = join_all(handlers.into_iter().map(|handler| {
            let delivery = delivery.clone();
            AssertUnwindSafe(async move { handler(delivery).await }).catch_unwind()
        }))
        .await;

        // Settle first so pool accounting and lease refresh unwind before errors surface
        if self.signals.fire_finished(delivery_id) {
            self.events.emit(SubscriberEvent::Finished {
                message_id: message_id.clone(),
                delivery_id,
            });
        }

        for result in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => self.events.emit_error(SubscriberError::Handler {
                    message_id: message_id.clone(),
                    error,
                }),
                Err(_) => self.events.emit_error(SubscriberError::HandlerPanicked {
                    message_id: message_id.clone(),
                }),
            }
        }
    }
}

struct SubscriberInner {
    config: SubscriberConfig,
    adapter: Arc<dyn QueueAdapter>,
    dispatcher: Arc<Dispatcher>,
    signals: Arc<SignalBus>,
    events: Arc<EventListeners>,
    pool: WorkerPool<Delivery>,
    refresher: LeaseRefresher,
    planner: AdmissionPlanner,
    running: AtomicBool,
    paused: AtomicBool,
    // Set by stop/graceful_shutdown under the `poll_loop` lock; start refuses afterwards
    closing: AtomicBool,
    stopped: watch::Sender<bool>,
    halt: CancellationToken,
    wake: Notify,
    poll_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Queue subscriber
///
/// Polls the adapter for exactly as many messages as the pool has room
/// for, runs every registered message handler for each of them under the
/// configured parallelism, and refreshes leases while handlers run.
///
/// Cheap to clone; clones control the same subscriber.
///
/// # Example
///
/// ```ignore
/// use drover_subscriber::{InMemoryQueue, Subscriber, SubscriberConfig};
///
/// let queue = Arc::new(InMemoryQueue::default());
/// let subscriber = Subscriber::new(queue, SubscriberConfig::new(5));
///
/// subscriber.on_message(|delivery| async move {
///     process(&delivery.payload).await?;
///     delivery.ack().await?;
///     Ok(())
/// });
/// subscriber.on_error(|err| tracing::warn!(error = %err, "subscriber error"));
///
/// subscriber.start()?;
///
/// // ... later
/// subscriber.graceful_shutdown().await;
/// ```
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    /// Create a subscriber over a queue backend
    pub fn new(adapter: Arc<dyn QueueAdapter>, config: SubscriberConfig) -> Self {
        let signals = Arc::new(SignalBus::new());
        let events = Arc::new(EventListeners::new());
        let planner = AdmissionPlanner::new(config.parallelism, adapter.max_batch_size());

        let adapter: Arc<dyn QueueAdapter> = Arc::new(AcknowledgingAdapter::new(
            adapter,
            Arc::clone(&signals),
            Arc::clone(&events),
        ));

        let dispatcher = Arc::new(Dispatcher {
            handlers: RwLock::new(Vec::new()),
            signals: Arc::clone(&signals),
            events: Arc::clone(&events),
        });

        let worker = Arc::clone(&dispatcher);
        let pool = WorkerPool::new(config.parallelism, move |delivery: Delivery| {
            let worker = Arc::clone(&worker);
            async move { worker.process(delivery).await }
        });

        let refresher = LeaseRefresher::new(
            config.refresh_interval_secs,
            Arc::clone(&adapter),
            Arc::clone(&events),
        );

        let (stopped, _) = watch::channel(false);

        Self {
            inner: Arc::new(SubscriberInner {
                config,
                adapter,
                dispatcher,
                signals,
                events,
                pool,
                refresher,
                planner,
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                stopped,
                halt: CancellationToken::new(),
                wake: Notify::new(),
                poll_loop: Mutex::new(None),
            }),
        }
    }

    /// Register a message handler
    ///
    /// Every registered handler runs for every message. An error or panic
    /// in one handler does not prevent the others from running.
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |delivery| Box::pin(handler(delivery)));
        self.inner.dispatcher.handlers.write().push(handler);
    }

    /// Called whenever a receive returns no messages
    pub fn on_empty<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_kind(EventKind::Empty, callback);
    }

    /// Called for every non-fatal error
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&SubscriberError) + Send + Sync + 'static,
    {
        self.on_event(EventKind::Error, move |event| {
            if let SubscriberEvent::Error(err) = event {
                callback(err);
            }
        });
    }

    /// Called when the subscriber is paused
    pub fn on_paused<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_kind(EventKind::Paused, callback);
    }

    /// Called when the subscriber is resumed
    pub fn on_resumed<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_kind(EventKind::Resumed, callback);
    }

    /// Called once the polling loop has exited
    pub fn on_stopped<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_kind(EventKind::Stopped, callback);
    }

    /// Called when graceful shutdown has drained all admitted work
    pub fn on_drained<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_kind(EventKind::Drained, callback);
    }

    /// Called with the message id and lease token of every acknowledged message
    pub fn on_acknowledged<F>(&self, callback: F)
    where
        F: Fn(&str, Option<&str>) + Send + Sync + 'static,
    {
        self.on_event(EventKind::Acknowledged, move |event| {
            if let SubscriberEvent::Acknowledged {
                message_id,
                lease_token,
            } = event
            {
                callback(message_id, lease_token.as_deref());
            }
        });
    }

    /// Called with the message id once all handlers for a delivery settled
    pub fn on_finished<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_event(EventKind::Finished, move |event| {
            if let SubscriberEvent::Finished { message_id, .. } = event {
                callback(message_id);
            }
        });
    }

    /// Register a raw event callback
    pub fn on_event<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&SubscriberEvent) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        self.inner.events.on(kind, callback);
    }

    fn on_kind<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_event(kind, move |_| callback());
    }

    /// Start the polling loop
    ///
    /// Must be called within a Tokio runtime. Fails before any I/O when no
    /// message handler is registered or the subscriber was stopped. The
    /// first polling round is committed when this returns.
    pub fn start(&self) -> Result<(), SubscriberError> {
        if !self.inner.dispatcher.has_handlers() {
            return Err(SubscriberError::MissingHandler);
        }

        let mut poll_loop = self.inner.poll_loop.lock();
        if self.inner.closing.load(Ordering::SeqCst) || self.is_stopped() {
            return Err(SubscriberError::Stopped);
        }
        if poll_loop.is_some() {
            return Err(SubscriberError::AlreadyRunning);
        }

        info!(
            adapter = self.inner.adapter.name(),
            parallelism = self.inner.config.parallelism,
            in_flight_ceiling = self.inner.planner.ceiling(),
            refresh_interval_secs = self.inner.config.refresh_interval_secs,
            "Starting subscriber"
        );

        self.inner.running.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        *poll_loop = Some(tokio::spawn(inner.run()));
        Ok(())
    }

    /// Hard stop
    ///
    /// Discards queued and running work, cancels every lease refresher and
    /// ends the polling loop. Unfinished messages are not acknowledged, so
    /// the backend redelivers them once their leases lapse.
    pub fn stop(&self) {
        let inner = &self.inner;
        info!("Stopping subscriber");

        let started = inner.close(|| inner.halt.cancel());

        let discarded = inner.pool.stop();
        let timers = inner.refresher.cancel_all();
        let released = inner.signals.clear();
        inner.wake.notify_waiters();

        debug!(discarded, timers, released, "Subscriber work discarded");

        if !started {
            inner.mark_stopped();
        }
    }

    /// Stop polling for more work; running handlers continue
    ///
    /// Emits `paused` only when the subscriber was not already paused.
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            self.inner.pool.pause();
            info!("Subscriber paused");
            self.inner.events.emit(SubscriberEvent::Paused);
        }
    }

    /// Resume polling
    ///
    /// Emits `resumed` only when the subscriber was paused.
    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            self.inner.pool.resume();
            self.inner.wake.notify_waiters();
            info!("Subscriber resumed");
            self.inner.events.emit(SubscriberEvent::Resumed);
        }
    }

    /// Stop polling and wait for all admitted work to complete
    ///
    /// Waits for the polling loop to exit (which marks the subscriber
    /// stopped), then drains the pool and emits `drained`. A paused
    /// subscriber's pool is resumed first, so messages admitted but held
    /// back by the pause still run to completion.
    #[instrument(skip(self))]
    pub async fn graceful_shutdown(&self) {
        let inner = &self.inner;
        info!("Initiating graceful shutdown");

        let started = inner.close(|| {});
        inner.wake.notify_waiters();

        if started {
            let mut stopped = inner.stopped.subscribe();
            // The sender lives in `inner`, so this only returns Ok
            let _ = stopped.wait_for(|stopped| *stopped).await;
        } else {
            inner.mark_stopped();
        }

        if inner.pool.is_paused() {
            debug!(queued = inner.pool.queued_count(), "Releasing paused work for drain");
            inner.pool.resume();
        }
        inner.pool.drain().await;

        info!("Subscriber drained");
        inner.events.emit(SubscriberEvent::Drained);
    }

    /// Wait until the polling loop has exited
    pub async fn stopped(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    /// Admitted messages: queued plus running
    pub fn len(&self) -> usize {
        self.inner.pool.len()
    }

    /// Whether no admitted message is queued or running
    pub fn is_empty(&self) -> bool {
        self.inner.pool.is_empty()
    }

    /// Whether the polling loop is (still) meant to run
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether the subscriber is paused
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Whether the subscriber reached its terminal stopped state
    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.borrow()
    }

    /// The acknowledging adapter handed to deliveries
    ///
    /// Acknowledging through this adapter fires `acknowledged`, even for
    /// code that only holds a [`Message`].
    pub fn adapter(&self) -> Arc<dyn QueueAdapter> {
        Arc::clone(&self.inner.adapter)
    }

    /// The subscriber configuration
    pub fn config(&self) -> &SubscriberConfig {
        &self.inner.config
    }

    /// Target number of admitted messages
    pub fn in_flight_ceiling(&self) -> usize {
        self.inner.planner.ceiling()
    }

    /// Number of live lease refresh timers
    pub fn active_refreshers(&self) -> usize {
        self.inner.refresher.active_count()
    }

    /// Number of deliveries whose `finished` signal has not fired
    pub fn outstanding_deliveries(&self) -> usize {
        self.inner.signals.len()
    }
}

impl SubscriberInner {
    /// Mark the subscriber as closing and the loop as no longer running
    ///
    /// Runs under the `poll_loop` lock so it cannot interleave with
    /// `start`. Returns whether a polling loop was spawned.
    fn close(&self, on_close: impl FnOnce()) -> bool {
        let poll_loop = self.poll_loop.lock();
        self.closing.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        on_close();
        poll_loop.is_some()
    }

    /// The polling loop
    ///
    /// Rounds never overlap. The loop checks `running` after each round,
    /// so the round in progress when `start` returns always completes.
    async fn run(self: Arc<Self>) {
        debug!("Polling loop started");
        loop {
            self.poll_round().await;
            if !self.running.load(Ordering::SeqCst) || self.halt.is_cancelled() {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Polling loop exited");
        self.mark_stopped();
    }

    async fn poll_round(&self) {
        if self.paused.load(Ordering::SeqCst) {
            self.idle_wait().await;
            return;
        }

        let batches = self.planner.plan(self.pool.len());
        if batches.is_empty() {
            self.idle_wait().await;
            return;
        }

        debug!(
            requests = batches.len(),
            capacity = batches.iter().sum::<usize>(),
            "Requesting messages"
        );

        let receives = join_all(batches.iter().map(|&size| async move {
            (size, self.adapter.receive(size).await)
        }));

        let results = tokio::select! {
            biased;
            _ = self.halt.cancelled() => {
                debug!("Receive abandoned on stop");
                return;
            }
            results = receives => results,
        };

        let mut admitted = 0;
        for (requested, result) in results {
            match result {
                Ok(messages) if messages.is_empty() => {
                    self.events.emit(SubscriberEvent::Empty);
                }
                Ok(mut messages) => {
                    if messages.len() > requested {
                        warn!(
                            requested,
                            received = messages.len(),
                            "Adapter returned more messages than requested, dropping extras"
                        );
                        messages.truncate(requested);
                    }
                    admitted += self.admit(messages);
                }
                Err(e) => self.events.emit_error(SubscriberError::Receive(e)),
            }
        }

        if admitted == 0 {
            self.idle_wait().await;
        }
    }

    /// Register, start lease refresh for, and enqueue one batch
    fn admit(&self, messages: Vec<Message>) -> usize {
        if self.halt.is_cancelled() {
            debug!(count = messages.len(), "Dropping batch received after stop");
            return 0;
        }

        let deliveries: Vec<Delivery> = messages
            .into_iter()
            .map(|message| {
                let message = Arc::new(message);
                let signals = self.signals.register(&message);
                let id = signals.id();
                self.refresher.start(Arc::clone(&message), signals);
                Delivery::new(id, message, Arc::clone(&self.adapter))
            })
            .collect();
        let ids: Vec<_> = deliveries.iter().map(Delivery::delivery_id).collect();

        match self.pool.push(deliveries) {
            Ok(count) => {
                debug!(count, length = self.pool.len(), "Admitted messages");
                count
            }
            Err(e) => {
                warn!(error = %e, count = ids.len(), "Pool rejected batch");
                for id in ids {
                    self.refresher.cancel(id);
                    self.signals.fire_finished(id);
                }
                0
            }
        }
    }

    /// Suspend until the back-off elapses or something worth re-checking happens
    async fn idle_wait(&self) {
        let mut length = self.pool.subscribe_length();
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_idle_backoff) => {}
            _ = self.wake.notified() => {}
            _ = self.halt.cancelled() => {}
            _ = length.changed() => {}
        }
    }

    /// Enter the terminal state, emitting `stopped` exactly once
    fn mark_stopped(&self) {
        let changed = self.stopped.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if changed {
            self.events.emit(SubscriberEvent::Stopped);
        }
    }
}
