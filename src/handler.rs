//! Delivery of records to one destination.
//!
//! A handler renders and writes either on the caller's thread under a
//! mutex, or on a dedicated worker thread fed by a FIFO queue. Record-time
//! failures are contained according to the `catch` setting.

use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Filter, HandlerConfig, Overflow, Plan, QueueOptions, SinkPlan};
use crate::error::{ConfigurationError, DeliveryError, DeliveryErrorKind, SinkError};
use crate::fallback::{self, ErrorCallback};
use crate::file_sink::FileSink;
use crate::format::Renderer;
use crate::metrics::HandlerMetrics;
use crate::record::{Level, Record};
use crate::rotation::{Reporter, RotationManager};
use crate::sink::{Message, Sink};

/// How pending queued records are treated on removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopMode {
    /// Deliver everything already queued, then stop.
    #[default]
    Graceful,
    /// Stop immediately; queued records are discarded.
    Force,
}

/// Released by the worker once everything queued before it was delivered.
#[derive(Default)]
pub(crate) struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn released() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(true),
            cond: Condvar::new(),
        })
    }

    fn release(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    /// `true` if released before `deadline`.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut done = self.done.lock();
        while !*done {
            match deadline {
                None => self.cond.wait(&mut done),
                Some(deadline) => {
                    if self.cond.wait_until(&mut done, deadline).timed_out() {
                        return *done;
                    }
                }
            }
        }
        true
    }
}

enum Job {
    Record(Arc<Record>),
    Flush(Arc<Latch>),
}

/// Longest sleep between attempts to queue a completion marker.
const MAX_SEND_PAUSE: Duration = Duration::from_millis(10);

enum Sent {
    Queued,
    Closed,
    TimedOut,
}

/// Queue `job`, waiting for room until `deadline`.
fn send_until(tx: &Sender<Job>, job: Job, deadline: Option<Instant>) -> Sent {
    let Some(deadline) = deadline else {
        return match tx.send_blocking(job) {
            Ok(()) => Sent::Queued,
            Err(_) => Sent::Closed,
        };
    };
    let mut job = job;
    let mut pause = Duration::from_micros(100);
    loop {
        match tx.try_send(job) {
            Ok(()) => return Sent::Queued,
            Err(TrySendError::Closed(_)) => return Sent::Closed,
            Err(TrySendError::Full(back)) => {
                let now = Instant::now();
                if now >= deadline {
                    return Sent::TimedOut;
                }
                thread::sleep(pause.min(deadline - now));
                pause = (pause * 2).min(MAX_SEND_PAUSE);
                job = back;
            }
        }
    }
}

thread_local! {
    /// Handlers whose sink is running on this thread.
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a handler as busy on the current thread until dropped.
struct Delivering(usize);

impl Delivering {
    fn enter(key: usize) -> Self {
        DELIVERING.with(|active| active.borrow_mut().push(key));
        Delivering(key)
    }

    fn active(key: usize) -> bool {
        DELIVERING.with(|active| active.borrow().contains(&key))
    }
}

impl Drop for Delivering {
    fn drop(&mut self) {
        DELIVERING.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(position) = active.iter().rposition(|&key| key == self.0) {
                active.remove(position);
            }
        });
    }
}

/// State shared between the handler and its worker.
struct Core {
    id: usize,
    name: String,
    renderer: Renderer,
    catch: bool,
    on_error: Option<ErrorCallback>,
    metrics: Arc<HandlerMetrics>,
}

impl Core {
    /// Identifies this handler across dispatchers, unlike `id`.
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    fn deliver(&self, sink: &mut dyn Sink, record: &Record) -> Result<(), DeliveryError> {
        let text = self
            .renderer
            .render(record)
            .map_err(|kind| DeliveryError::new(self.id, &self.name, kind))?;
        sink.write(&Message {
            text: &text,
            record,
        })
        .map_err(|e| DeliveryError::new(self.id, &self.name, e))?;
        self.metrics.inc_write_count();
        Ok(())
    }

    /// Sync delivery failure: reported when caught, returned otherwise.
    fn contain(&self, error: DeliveryError, record: &Record) -> Result<(), DeliveryError> {
        self.metrics.inc_failure_count();
        if self.catch {
            fallback::report(self.on_error.as_ref(), &error, Some(record));
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Queued failures have no caller to go back to.
    fn report(&self, error: DeliveryError, record: Option<&Record>) {
        if record.is_some() {
            self.metrics.inc_failure_count();
        }
        fallback::report(self.on_error.as_ref(), &error, record);
    }

    fn sink_error(&self, error: SinkError) -> DeliveryError {
        DeliveryError::new(self.id, &self.name, error)
    }
}

struct Queue {
    tx: Sender<Job>,
    overflow: Overflow,
    discard: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

enum Mode {
    Sync(Mutex<Option<Box<dyn Sink>>>),
    Queued(Queue),
}

/// One registered destination.
pub(crate) struct Handler {
    core: Arc<Core>,
    level: Level,
    filter: Option<Filter>,
    mode: Mode,
    closed: AtomicBool,
}

impl Handler {
    /// Validate `config`, open its destination and start delivering.
    pub(crate) fn start(id: usize, config: HandlerConfig) -> Result<Self, ConfigurationError> {
        let Plan {
            name,
            level,
            filter,
            renderer,
            catch,
            queue,
            on_error,
            target,
        } = config.validate()?;

        let metrics = Arc::new(HandlerMetrics::new());
        let sink: Box<dyn Sink> = match target {
            SinkPlan::Ready(sink) => sink,
            SinkPlan::File {
                pattern,
                policy,
                utc,
                multiprocess,
            } => {
                let report: Reporter = {
                    let name = name.clone();
                    let on_error = on_error.clone();
                    Arc::new(move |e: SinkError| {
                        fallback::report(on_error.as_ref(), &DeliveryError::new(id, &name, e), None)
                    })
                };
                let manager = RotationManager::open(pattern, policy, utc, multiprocess, report)?;
                Box::new(FileSink::new(manager).with_metrics(metrics.clone()))
            }
        };

        let core = Arc::new(Core {
            id,
            name,
            renderer,
            catch,
            on_error,
            metrics,
        });
        let mode = match queue {
            None => Mode::Sync(Mutex::new(Some(sink))),
            Some(options) => Mode::Queued(spawn_worker(core.clone(), sink, options)?),
        };

        info!(
            handler_id = id,
            handler = %core.name,
            level = %level,
            queued = matches!(mode, Mode::Queued(_)),
            "handler started"
        );
        Ok(Self {
            core,
            level,
            filter,
            mode,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.core.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.core.name
    }

    pub(crate) fn level(&self) -> Level {
        self.level
    }

    pub(crate) fn metrics(&self) -> &HandlerMetrics {
        &self.core.metrics
    }

    pub(crate) fn accepts(&self, record: &Record) -> bool {
        record.level >= self.level && self.filter.as_ref().map_or(true, |f| f.accepts(record))
    }

    /// Deliver (sync) or enqueue (queued) one record.
    ///
    /// **Returns**
    /// - `Err(..)` only for synchronous handlers with `catch` disabled,
    ///   including a sink that logs back into its own handler (locking
    ///   again would deadlock).
    pub(crate) fn emit(&self, record: &Arc<Record>) -> Result<(), DeliveryError> {
        let key = self.core.key();
        if Delivering::active(key) {
            let error = DeliveryError::new(self.core.id, &self.core.name, DeliveryErrorKind::Reentrant);
            self.core.metrics.inc_failure_count();
            if !self.core.catch && matches!(self.mode, Mode::Sync(_)) {
                return Err(error);
            }
            // Skips the error callback, which may be what logged.
            fallback::report(None, &error, Some(&**record));
            return Ok(());
        }
        match &self.mode {
            Mode::Sync(slot) => {
                let _delivering = Delivering::enter(key);
                let mut slot = slot.lock();
                let Some(sink) = slot.as_mut() else {
                    return Ok(());
                };
                match self.core.deliver(sink.as_mut(), record) {
                    Ok(()) => Ok(()),
                    Err(e) => self.core.contain(e, record),
                }
            }
            Mode::Queued(queue) => {
                self.enqueue(queue, Job::Record(record.clone()));
                Ok(())
            }
        }
    }

    fn enqueue(&self, queue: &Queue, job: Job) {
        let metrics = &self.core.metrics;
        match queue.overflow {
            Overflow::Drop => match queue.tx.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    metrics.inc_dropped_count();
                    warn!(handler_id = self.core.id, "queue full, record dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            },
            Overflow::Block => {
                // Closed means the handler is being removed.
                let _ = queue.tx.send_blocking(job);
            }
        }
        metrics.set_queue_len(queue.tx.len());
    }

    /// Start waiting for everything submitted so far. Synchronous handlers
    /// are already delivered and only flush their sink.
    ///
    /// **Returns**
    /// - `None` if `deadline` passed before the wait could even start: the
    ///   sink lock stayed busy, or the queue stayed full.
    pub(crate) fn begin_completion(&self, deadline: Option<Instant>) -> Option<Arc<Latch>> {
        if Delivering::active(self.core.key()) {
            debug!(handler_id = self.core.id, "completion requested from inside the sink");
            return Some(Latch::released());
        }
        match &self.mode {
            Mode::Sync(slot) => {
                let mut slot = match deadline {
                    None => slot.lock(),
                    Some(deadline) => slot.try_lock_until(deadline)?,
                };
                if let Some(sink) = slot.as_mut() {
                    if let Err(e) = sink.flush() {
                        self.core.report(self.core.sink_error(e), None);
                    }
                }
                Some(Latch::released())
            }
            Mode::Queued(queue) => {
                let latch = Arc::new(Latch::default());
                // The marker is never dropped, whatever the overflow policy.
                match send_until(&queue.tx, Job::Flush(latch.clone()), deadline) {
                    Sent::Queued => Some(latch),
                    Sent::Closed => Some(Latch::released()),
                    Sent::TimedOut => None,
                }
            }
        }
    }

    /// Close the handler: no write happens once this returns.
    pub(crate) fn stop(&self, mode: StopMode) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.mode {
            Mode::Sync(slot) => {
                let sink = slot.lock().take();
                if let Some(mut sink) = sink {
                    if let Err(e) = sink.close() {
                        self.core.report(self.core.sink_error(e), None);
                    }
                }
            }
            Mode::Queued(queue) => {
                if mode == StopMode::Force {
                    queue.discard.store(true, Ordering::Release);
                }
                queue.tx.close();
                if let Some(worker) = queue.worker.lock().take() {
                    if worker.join().is_err() {
                        error!(handler_id = self.core.id, "handler worker panicked");
                    }
                }
            }
        }
        info!(handler_id = self.core.id, handler = %self.core.name, ?mode, "handler stopped");
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.stop(StopMode::Graceful);
    }
}

fn spawn_worker(
    core: Arc<Core>,
    sink: Box<dyn Sink>,
    options: QueueOptions,
) -> Result<Queue, ConfigurationError> {
    let (tx, rx) = match options.capacity {
        Some(capacity) => async_channel::bounded(capacity),
        None => async_channel::unbounded(),
    };
    let discard = Arc::new(AtomicBool::new(false));
    let worker_discard = discard.clone();
    let worker = thread::Builder::new()
        .name(format!("log-pipeline-handler-{}", core.id))
        .spawn(move || worker_loop(core, sink, rx, worker_discard))
        .map_err(|e| ConfigurationError::InvalidDestination(format!("cannot start worker thread: {e}")))?;

    Ok(Queue {
        tx,
        overflow: options.overflow,
        discard,
        worker: Mutex::new(Some(worker)),
    })
}

fn worker_loop(core: Arc<Core>, mut sink: Box<dyn Sink>, rx: Receiver<Job>, discard: Arc<AtomicBool>) {
    debug!(handler_id = core.id, "handler worker started");
    let _delivering = Delivering::enter(core.key());

    while let Ok(job) = rx.recv_blocking() {
        core.metrics.set_queue_len(rx.len());
        match job {
            Job::Record(record) => {
                if discard.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(e) = core.deliver(sink.as_mut(), &record) {
                    core.report(e, Some(&*record));
                }
            }
            Job::Flush(latch) => {
                if let Err(e) = sink.flush() {
                    core.report(core.sink_error(e), None);
                }
                latch.release();
            }
        }
    }

    if let Err(e) = sink.close() {
        core.report(core.sink_error(e), None);
    }
    debug!(handler_id = core.id, "handler worker stopped");
}
