//! Publish/subscribe event bus
//!
//! One dispatch thread drains an unbounded queue strictly in publish order.
//! Synchronous subscribers run on that thread, in subscription order, and all
//! of them finish before the next event is dispatched. Asynchronous
//! subscribers are handed to a fixed-size rayon pool and may overlap with each
//! other and with later events.
//!
//! Subscriber errors and panics are caught and logged at the bus boundary;
//! they never reach the publisher or the other subscribers.

use crate::config::EventBusConfig;
use crate::error::{panic_message, PolcamError, Result};
use crate::events::{Event, EventKind, EventPayload};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// Subscriber callback; identity is the `Arc` allocation
pub type Callback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Callback`]
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Where a subscriber runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Inline on the dispatch thread
    #[default]
    Sync,
    /// On the async worker pool
    Async,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventBusStats {
    pub published: u64,
    pub dispatched: u64,
    pub callback_failures: u64,
}

#[derive(Default)]
struct Subscribers {
    sync: Vec<Callback>,
    asynchronous: Vec<Callback>,
}

enum BusCommand {
    Dispatch(Arc<Event>),
    Flush(Sender<()>),
    Shutdown,
}

struct Shared {
    subscribers: RwLock<HashMap<EventKind, Subscribers>>,
    pool: rayon::ThreadPool,
    dispatched: AtomicU64,
    failures: Arc<AtomicU64>,
}

pub struct EventBus {
    shared: Arc<Shared>,
    sender: Sender<BusCommand>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_id: ThreadId,
    published: AtomicU64,
    stopped: AtomicBool,
}

fn same_callback(a: &Callback, b: &Callback) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Result<Self> {
        if config.async_workers == 0 {
            return Err(PolcamError::config("event bus needs at least one async worker"));
        }

        let prefix = config.thread_name_prefix.clone();
        let failures = Arc::new(AtomicU64::new(0));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.async_workers)
            .thread_name(move |i| format!("{prefix}-async-{i}"))
            .panic_handler(|payload| {
                log::error!(
                    "Async subscriber task panicked: {}",
                    panic_message(payload.as_ref())
                );
            })
            .build()
            .map_err(|e| PolcamError::other(format!("failed to build async pool: {e}")))?;

        let shared = Arc::new(Shared {
            subscribers: RwLock::new(HashMap::new()),
            pool,
            dispatched: AtomicU64::new(0),
            failures,
        });

        let (sender, receiver) = unbounded::<BusCommand>();
        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-dispatch", config.thread_name_prefix))
                .spawn(move || Self::dispatch_loop(shared, receiver))?
        };
        let dispatcher_id = dispatcher.thread().id();

        log::debug!(
            "Event bus started with {} async workers",
            config.async_workers
        );

        Ok(Self {
            shared,
            sender,
            dispatcher: Mutex::new(Some(dispatcher)),
            dispatcher_id,
            published: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    /// Register `callback` for `kind`; false if it is already registered there
    pub fn subscribe(&self, kind: EventKind, callback: Callback, delivery: Delivery) -> bool {
        let mut subscribers = self.shared.subscribers.write();
        let entry = subscribers.entry(kind).or_default();
        let list = match delivery {
            Delivery::Sync => &mut entry.sync,
            Delivery::Async => &mut entry.asynchronous,
        };
        if list.iter().any(|c| same_callback(c, &callback)) {
            return false;
        }
        list.push(callback);
        true
    }

    /// Remove `callback` from `kind`; a callback that is not registered is ignored
    pub fn unsubscribe(&self, kind: EventKind, callback: &Callback) -> bool {
        let mut subscribers = self.shared.subscribers.write();
        let Some(entry) = subscribers.get_mut(&kind) else {
            return false;
        };
        let before = entry.sync.len() + entry.asynchronous.len();
        entry.sync.retain(|c| !same_callback(c, callback));
        entry.asynchronous.retain(|c| !same_callback(c, callback));
        before != entry.sync.len() + entry.asynchronous.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.shared
            .subscribers
            .read()
            .get(&kind)
            .map_or(0, |s| s.sync.len() + s.asynchronous.len())
    }

    /// Enqueue an event without waiting for subscribers; false once stopped
    pub fn publish(&self, event: Event) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            log::debug!("Event bus stopped, dropping {:?}", event.kind());
            return false;
        }
        match self.sender.send(BusCommand::Dispatch(Arc::new(event))) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                log::error!("❌ Event bus dispatcher disconnected");
                false
            }
        }
    }

    /// Publish a payload stamped with the current time
    pub fn emit(&self, payload: EventPayload) -> bool {
        self.publish(Event::new(payload))
    }

    /// Block until every event published before this call has been handed to
    /// its synchronous subscribers
    ///
    /// Returns immediately when called from the dispatch thread itself.
    pub fn flush(&self) {
        if thread::current().id() == self.dispatcher_id {
            return;
        }
        let (done_tx, done_rx) = bounded(1);
        if self.sender.send(BusCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            callback_failures: self.shared.failures.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    /// Dispatch what is already queued, then stop the dispatch thread
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(BusCommand::Shutdown);
        if thread::current().id() == self.dispatcher_id {
            // Joining ourselves would deadlock; the loop exits after this callback
            return;
        }
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                log::error!("Event bus dispatch thread panicked");
            }
        }
    }

    fn dispatch_loop(shared: Arc<Shared>, receiver: Receiver<BusCommand>) {
        log::debug!("Event bus dispatcher started");

        while let Ok(command) = receiver.recv() {
            match command {
                BusCommand::Dispatch(event) => Self::dispatch(&shared, event),
                BusCommand::Flush(done) => {
                    let _ = done.send(());
                }
                BusCommand::Shutdown => break,
            }
        }

        log::debug!(
            "Event bus dispatcher stopped: {} dispatched, {} callback failures",
            shared.dispatched.load(Ordering::Relaxed),
            shared.failures.load(Ordering::Relaxed)
        );
    }

    fn dispatch(shared: &Arc<Shared>, event: Arc<Event>) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let (sync, asynchronous) = match shared.subscribers.read().get(&event.kind()) {
            Some(s) => (s.sync.clone(), s.asynchronous.clone()),
            None => (Vec::new(), Vec::new()),
        };

        for callback in &sync {
            invoke(callback, &event, &shared.failures);
        }

        for callback in asynchronous {
            let event = Arc::clone(&event);
            let failures = Arc::clone(&shared.failures);
            shared
                .pool
                .spawn(move || invoke(&callback, &event, &failures));
        }

        shared.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

fn invoke(callback: &Callback, event: &Event, failures: &AtomicU64) {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Subscriber for {:?} failed: {:#}", event.kind(), e);
        }
        Err(payload) => {
            failures.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "Subscriber for {:?} panicked: {}",
                event.kind(),
                panic_message(payload.as_ref())
            );
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}
