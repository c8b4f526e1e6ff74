//! Registry of handlers and routing of records.
//!
//! The handler list is copy-on-write: `dispatch` clones an `Arc` to the
//! current list and never holds the registry lock while delivering, so
//! registration and removal never wait for a slow handler.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::HandlerConfig;
use crate::error::{ConfigurationError, DeliveryError};
use crate::handler::{Handler, StopMode};
use crate::metrics::MetricsSnapshot;
use crate::record::{Level, Record};

/// Identifier returned by [`Dispatcher::register`].
pub type HandlerId = usize;

const NO_HANDLERS: u32 = u32::MAX;

/// Which handlers [`Dispatcher::complete`] waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Handler(HandlerId),
}

/// Outcome of [`Dispatcher::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every record submitted before the call reached its sink.
    Done,
    /// The timeout elapsed first. Delivery continues in the background.
    TimedOut,
}

/// Routes records to registered handlers.
///
/// Owned by the application (usually behind an `Arc`); tests create as
/// many independent dispatchers as they need.
pub struct Dispatcher {
    handlers: RwLock<Arc<Vec<Arc<Handler>>>>,
    /// Lowest severity accepted by any handler.
    floor: AtomicU32,
    next_id: AtomicUsize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Arc::new(Vec::new())),
            floor: AtomicU32::new(NO_HANDLERS),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Validate `config` and start a handler for it.
    ///
    /// **Returns**
    /// - `Ok(id)` once the handler accepts records.
    /// - `Err(ConfigurationError)` if any option is invalid, or the
    ///   destination cannot be opened. No handler is created.
    pub fn register(&self, config: HandlerConfig) -> Result<HandlerId, ConfigurationError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::new(Handler::start(id, config)?);

        let mut handlers = self.handlers.write();
        let mut next = Vec::with_capacity(handlers.len() + 1);
        next.extend(handlers.iter().cloned());
        next.push(handler);
        self.publish(&mut handlers, next);
        Ok(id)
    }

    /// Stop a handler, delivering what it has queued first.
    ///
    /// Returns `false` if no handler has this id.
    pub fn remove(&self, id: HandlerId) -> bool {
        self.remove_with(id, StopMode::Graceful)
    }

    /// Stop a handler. Records dispatched concurrently are either delivered
    /// before this returns or not at all.
    pub fn remove_with(&self, id: HandlerId, mode: StopMode) -> bool {
        let removed = {
            let mut handlers = self.handlers.write();
            let Some(position) = handlers.iter().position(|h| h.id() == id) else {
                return false;
            };
            let removed = handlers[position].clone();
            let next = handlers
                .iter()
                .filter(|h| h.id() != id)
                .cloned()
                .collect();
            self.publish(&mut handlers, next);
            removed
        };
        removed.stop(mode);
        true
    }

    /// Stop every handler.
    pub fn remove_all(&self, mode: StopMode) {
        let removed = {
            let mut handlers = self.handlers.write();
            let removed = handlers.clone();
            self.publish(&mut handlers, Vec::new());
            removed
        };
        for handler in removed.iter() {
            handler.stop(mode);
        }
    }

    /// Route `record` to every handler whose level and filter accept it.
    ///
    /// **Returns**
    /// - `Err(..)` with the first failure of a synchronous handler that has
    ///   `catch` disabled. The other handlers still receive the record.
    pub fn dispatch(&self, record: Record) -> Result<(), DeliveryError> {
        if record.level.severity() < self.floor.load(Ordering::Acquire) {
            return Ok(());
        }
        let snapshot = self.handlers.read().clone();
        let record = Arc::new(record);

        let mut first_error = None;
        for handler in snapshot.iter().filter(|h| h.accepts(&record)) {
            if let Err(e) = handler.emit(&record) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Block until records submitted so far have reached their sinks.
    ///
    /// **Parameters**
    /// - `target`: one handler, or all of them.
    /// - `timeout`: give up after this long. `None` waits indefinitely.
    ///
    /// An unknown handler id completes immediately. The timeout also bounds
    /// the wait for a busy synchronous sink or a full queue.
    pub fn complete(&self, target: Target, timeout: Option<Duration>) -> Completion {
        let deadline = timeout.map(|t| Instant::now() + t);
        let snapshot = self.handlers.read().clone();
        let mut latches = Vec::new();
        for handler in snapshot.iter().filter(|h| match target {
            Target::All => true,
            Target::Handler(id) => h.id() == id,
        }) {
            match handler.begin_completion(deadline) {
                Some(latch) => latches.push((handler.id(), latch)),
                None => {
                    warn!(handler_id = handler.id(), ?timeout, "timed out before records could be flushed");
                    return Completion::TimedOut;
                }
            }
        }

        for (id, latch) in latches {
            if !latch.wait(deadline) {
                warn!(handler_id = id, ?timeout, "timed out waiting for queued records");
                return Completion::TimedOut;
            }
        }
        Completion::Done
    }

    pub fn metrics(&self, id: HandlerId) -> Option<MetricsSnapshot> {
        self.handlers
            .read()
            .iter()
            .find(|h| h.id() == id)
            .map(|h| h.metrics().snapshot())
    }

    /// Registered handlers in registration order.
    pub fn handlers(&self) -> Vec<(HandlerId, String)> {
        self.handlers
            .read()
            .iter()
            .map(|h| (h.id(), h.name().to_string()))
            .collect()
    }

    /// Lowest level any handler accepts, `None` without handlers.
    pub fn min_level(&self) -> Option<Level> {
        let floor = self.floor.load(Ordering::Acquire);
        Level::ALL.into_iter().find(|level| level.severity() == floor)
    }

    fn publish(&self, current: &mut Arc<Vec<Arc<Handler>>>, next: Vec<Arc<Handler>>) {
        let floor = next
            .iter()
            .map(|h| h.level().severity())
            .min()
            .unwrap_or(NO_HANDLERS);
        self.floor.store(floor, Ordering::Release);
        debug!(handlers = next.len(), floor, "handler set changed");
        *current = Arc::new(next);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.remove_all(StopMode::Graceful);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Destination, Overflow};
    use crate::error::DeliveryErrorKind;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::{OnceLock, Weak};
    use std::thread;

    fn collecting(level: Level) -> (HandlerConfig, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let config = HandlerConfig::new(Destination::callable(move |m| {
            sink.lock().push(m.text.to_string());
            Ok(())
        }))
        .format("{level}:{message}")
        .level(level);
        (config, lines)
    }

    fn record(level: Level, message: &str) -> Record {
        Record::builder(level, message).build().unwrap()
    }

    #[test]
    fn floor_tracks_registrations() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.min_level(), None);

        let (info, _) = collecting(Level::Info);
        let (error, _) = collecting(Level::Error);
        let a = dispatcher.register(info).unwrap();
        let b = dispatcher.register(error).unwrap();
        assert_eq!(dispatcher.min_level(), Some(Level::Info));

        assert!(dispatcher.remove(a));
        assert_eq!(dispatcher.min_level(), Some(Level::Error));
        assert!(!dispatcher.remove(a));
        assert!(dispatcher.remove(b));
        assert_eq!(dispatcher.min_level(), None);
    }

    #[test]
    fn records_reach_only_accepting_handlers() {
        let dispatcher = Dispatcher::new();
        let (info, info_lines) = collecting(Level::Info);
        let (warn, warn_lines) = collecting(Level::Warning);
        dispatcher.register(info).unwrap();
        dispatcher.register(warn).unwrap();

        dispatcher.dispatch(record(Level::Debug, "dropped")).unwrap();
        dispatcher.dispatch(record(Level::Info, "hello")).unwrap();
        dispatcher.dispatch(record(Level::Error, "bad")).unwrap();

        assert_eq!(*info_lines.lock(), vec!["INFO:hello\n", "ERROR:bad\n"]);
        assert_eq!(*warn_lines.lock(), vec!["ERROR:bad\n"]);
    }

    #[test]
    fn handlers_are_listed_with_names() {
        let dispatcher = Dispatcher::new();
        let id = dispatcher
            .register(HandlerConfig::new(Destination::Stderr).name("console"))
            .unwrap();
        assert_eq!(dispatcher.handlers(), vec![(id, "console".to_string())]);
        assert_eq!(dispatcher.metrics(id), Some(MetricsSnapshot::default()));
        assert_eq!(dispatcher.metrics(id + 1), None);
    }

    #[test]
    fn failed_registration_creates_nothing() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher.register(HandlerConfig::new(Destination::Stdout).level("LOUDEST"));
        assert!(err.is_err());
        assert!(dispatcher.handlers().is_empty());
    }

    #[test]
    fn complete_waits_for_queued_records() {
        let dispatcher = Dispatcher::new();
        let (config, lines) = collecting(Level::Trace);
        let id = dispatcher.register(config.enqueue(true)).unwrap();
        for i in 0..50 {
            dispatcher.dispatch(record(Level::Info, &format!("m{i}"))).unwrap();
        }
        assert_eq!(
            dispatcher.complete(Target::Handler(id), Some(Duration::from_secs(10))),
            Completion::Done
        );
        assert_eq!(lines.lock().len(), 50);
        assert_eq!(dispatcher.complete(Target::Handler(id + 7), None), Completion::Done);
    }

    #[test]
    fn complete_times_out_on_stuck_handler() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let worker_gate = gate.clone();
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(
                HandlerConfig::new(Destination::callable(move |_| {
                    let _open = worker_gate.lock();
                    Ok(())
                }))
                .enqueue(true),
            )
            .unwrap();
        dispatcher.dispatch(record(Level::Info, "stuck")).unwrap();

        assert_eq!(
            dispatcher.complete(Target::All, Some(Duration::from_millis(50))),
            Completion::TimedOut
        );
        drop(held);
        assert_eq!(dispatcher.complete(Target::All, None), Completion::Done);
    }

    #[test]
    fn complete_times_out_while_bounded_queue_is_full() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let worker_gate = gate.clone();
        let dispatcher = Dispatcher::new();
        let id = dispatcher
            .register(
                HandlerConfig::new(Destination::callable(move |_| {
                    let _open = worker_gate.lock();
                    Ok(())
                }))
                .enqueue(true)
                .queue_capacity(1, Overflow::Drop),
            )
            .unwrap();
        for i in 0..5 {
            dispatcher.dispatch(record(Level::Info, &format!("m{i}"))).unwrap();
        }
        assert!(dispatcher.metrics(id).unwrap().dropped_count >= 3);

        let started = Instant::now();
        assert_eq!(
            dispatcher.complete(Target::All, Some(Duration::from_millis(100))),
            Completion::TimedOut
        );
        assert!(started.elapsed() < Duration::from_secs(2));

        drop(held);
        assert_eq!(dispatcher.complete(Target::All, None), Completion::Done);
    }

    #[test]
    fn complete_times_out_while_sync_sink_is_busy() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let sink_gate = gate.clone();
        let entered = Arc::new(AtomicBool::new(false));
        let flag = entered.clone();
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher
            .register(HandlerConfig::new(Destination::callable(move |_| {
                flag.store(true, Ordering::SeqCst);
                let _open = sink_gate.lock();
                Ok(())
            })))
            .unwrap();

        let writer = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.dispatch(record(Level::Info, "slow")).unwrap())
        };
        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        let started = Instant::now();
        assert_eq!(
            dispatcher.complete(Target::All, Some(Duration::from_millis(50))),
            Completion::TimedOut
        );
        assert!(started.elapsed() < Duration::from_secs(2));

        drop(held);
        writer.join().unwrap();
        assert_eq!(dispatcher.complete(Target::All, None), Completion::Done);
    }

    #[test]
    fn sink_logging_into_its_own_handler_is_rejected() {
        let dispatcher = Arc::new(Dispatcher::new());
        let slot: Arc<OnceLock<Weak<Dispatcher>>> = Arc::new(OnceLock::new());
        let inner_results = Arc::new(Mutex::new(Vec::new()));

        let owner = slot.clone();
        let results = inner_results.clone();
        let first_call = Arc::new(AtomicBool::new(true));
        let looping = dispatcher
            .register(
                HandlerConfig::new(Destination::callable(move |_| {
                    if first_call.swap(false, Ordering::SeqCst) {
                        if let Some(dispatcher) = owner.get().and_then(Weak::upgrade) {
                            let result = dispatcher.dispatch(record(Level::Info, "from the sink"));
                            results.lock().push(result.map_err(|e| e.kind));
                        }
                    }
                    Ok(())
                }))
                .catch(false),
            )
            .unwrap();
        let (other, other_lines) = collecting(Level::Trace);
        dispatcher.register(other).unwrap();
        slot.set(Arc::downgrade(&dispatcher)).unwrap();

        dispatcher.dispatch(record(Level::Info, "outer")).unwrap();

        let results = inner_results.lock();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(DeliveryErrorKind::Reentrant)));
        assert_eq!(dispatcher.metrics(looping).unwrap().failure_count, 1);
        // Other handlers still see the nested record.
        assert_eq!(*other_lines.lock(), vec!["INFO:from the sink\n", "INFO:outer\n"]);
    }
}
