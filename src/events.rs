//! Reconfiguration events and the per-interface watcher thread.
//!
//! Producers push events through an [`EventSender`]; the queue is bounded
//! and drops the oldest entry instead of blocking when full. One
//! [`EventWatcher`] thread per interface drains it until the interface
//! closes.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::adapter::MtuControl;
use crate::error::{Error, Result};

/// Queue depth between producers and the watcher.
pub const EVENT_QUEUE_CAPACITY: usize = 5;

/// Raw code for "no event".
pub const RAW_EVENT_NONE: u32 = 0;

/// Raw code for an MTU update, matching the bit used by wireguard-style TUN event masks.
pub const RAW_EVENT_MTU_UPDATE: u32 = 1 << 2;

/// Asynchronous reconfiguration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Nothing to do.
    None,
    /// Apply a new MTU to the interface.
    MtuUpdate(u32),
    /// A code this version does not know; ignored.
    Unrecognized(u32),
}

impl Event {
    /// Decode a raw event code; `value` is the payload for codes that carry one.
    pub fn from_raw(code: u32, value: u32) -> Self {
        match code {
            RAW_EVENT_NONE => Event::None,
            RAW_EVENT_MTU_UPDATE => Event::MtuUpdate(value),
            other => Event::Unrecognized(other),
        }
    }
}

/// Producer handle for an interface's event queue.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<Event>,
    /// Kept to evict the oldest entry when the queue is full.
    rx: Receiver<Event>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Queue an event without blocking.
    ///
    /// When the queue is full the oldest pending event is discarded to make
    /// room. Fails with [`Error::Closed`] once the interface is closed.
    pub fn send(&self, event: Event) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let mut event = event;
        for _ in 0..=EVENT_QUEUE_CAPACITY {
            match self.tx.try_send(event) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    if let Ok(old) = self.rx.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("Event queue full, dropped {:?}", old);
                    }
                    event = back;
                }
                Err(TrySendError::Disconnected(_)) => return Err(Error::Closed),
            }
        }

        // Other producers kept refilling the queue; give up on this one.
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!("Event queue contended, dropped {:?}", event);
        Ok(())
    }

    /// Number of events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of events waiting for the watcher.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// Create a bounded event queue tied to an interface's closed flag.
pub(crate) fn queue(closed: Arc<AtomicBool>) -> (EventSender, Receiver<Event>) {
    let (tx, rx) = bounded(EVENT_QUEUE_CAPACITY);
    let sender = EventSender {
        tx,
        rx: rx.clone(),
        closed,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

/// Background thread applying events to one interface.
pub struct EventWatcher {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl EventWatcher {
    /// Spawn the watcher for interface `name`.
    pub fn spawn(
        name: String,
        events: Receiver<Event>,
        control: Arc<dyn MtuControl>,
    ) -> io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(format!("vnic-events-{}", name))
            .spawn(move || run(&name, &events, &shutdown_rx, control.as_ref()))?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Signal the thread to exit and wait for it.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        // Dropping the sender disconnects the shutdown channel.
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Event watcher thread panicked");
            }
        }
    }
}

impl Drop for EventWatcher {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn run(name: &str, events: &Receiver<Event>, shutdown: &Receiver<()>, control: &dyn MtuControl) {
    debug!("Event watcher started for {}", name);
    loop {
        crossbeam::select! {
            recv(events) -> event => match event {
                Ok(event) => apply(name, event, control),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!("Event watcher stopped for {}", name);
}

/// Apply one event. MTU failures are logged and otherwise ignored.
pub(crate) fn apply(name: &str, event: Event, control: &dyn MtuControl) {
    match event {
        Event::MtuUpdate(mtu) => match control.set_mtu(name, mtu) {
            Ok(()) => debug!("Applied MTU update {} on {}", mtu, name),
            Err(e) => warn!("Failed to apply MTU {} on {}: {}", mtu, name, e),
        },
        Event::None => trace!("Ignoring empty event on {}", name),
        Event::Unrecognized(code) => debug!("Ignoring unrecognized event {:#x} on {}", code, name),
    }
}
