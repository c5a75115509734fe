//! Per-consumer vsync delivery thread.
//!
//! The distributor fires `on_vsync` at the consumer's phase; the consumer
//! thread forwards the event only when someone asked for it. While the
//! screen is off the distributor is silent, so the consumer synthesizes
//! ticks at a fixed interval to keep waiters moving.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use crate::clock::{Nsecs, now_nanos};
use crate::sync::{lock, wait, wait_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsyncEvent {
    pub timestamp: Nsecs,
    pub count: u64,
}

pub type VsyncSink = Arc<dyn Fn(VsyncEvent) + Send + Sync>;

struct ConsumerState {
    pending: Option<VsyncEvent>,
    requested: bool,
    continuous: bool,
    screen_on: bool,
    count: u64,
    stop: bool,
}

impl ConsumerState {
    fn wants_event(&self) -> bool {
        self.requested || self.continuous
    }
}

pub struct VsyncConsumer {
    name: String,
    shared: Arc<(Mutex<ConsumerState>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl VsyncConsumer {
    pub fn spawn(
        name: &str,
        screen_off_interval: Duration,
        sink: VsyncSink,
    ) -> std::io::Result<Arc<Self>> {
        let shared = Arc::new((
            Mutex::new(ConsumerState {
                pending: None,
                requested: false,
                continuous: false,
                screen_on: true,
                count: 0,
                stop: false,
            }),
            Condvar::new(),
        ));
        let worker = Arc::clone(&shared);
        let thread_name = format!("vsync-{}", name);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run(worker, screen_off_interval, sink))?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            shared,
            thread: Mutex::new(Some(handle)),
        }))
    }

    /// Distributor callback
    pub fn on_vsync(&self, timestamp: Nsecs) {
        let (state, cv) = &*self.shared;
        let mut state = lock(state);
        state.count += 1;
        let count = state.count;
        state.pending = Some(VsyncEvent { timestamp, count });
        cv.notify_all();
    }

    /// Deliver exactly one upcoming event
    pub fn request_next_vsync(&self) {
        let (state, cv) = &*self.shared;
        let mut state = lock(state);
        if !state.requested {
            state.requested = true;
            cv.notify_all();
        }
    }

    pub fn set_continuous(&self, enabled: bool) {
        let (state, cv) = &*self.shared;
        lock(state).continuous = enabled;
        cv.notify_all();
    }

    pub fn set_screen_on(&self, on: bool) {
        let (state, cv) = &*self.shared;
        let mut state = lock(state);
        if state.screen_on != on {
            debug!("Vsync: consumer '{}' screen {}", self.name, if on { "on" } else { "off" });
            state.screen_on = on;
            state.pending = None;
            cv.notify_all();
        }
    }

    pub fn event_count(&self) -> u64 {
        lock(&self.shared.0).count
    }

    pub fn stop(&self) {
        {
            let (state, cv) = &*self.shared;
            lock(state).stop = true;
            cv.notify_all();
        }
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<(Mutex<ConsumerState>, Condvar)>, screen_off_interval: Duration, sink: VsyncSink) {
    let (state, cv) = &*shared;
    let mut guard = lock(state);
    loop {
        if guard.stop {
            break;
        }
        if !guard.wants_event() {
            // Nobody is listening; stale events are not replayed later
            guard.pending = None;
            guard = wait(cv, guard);
            continue;
        }
        if let Some(event) = guard.pending.take() {
            guard.requested = false;
            drop(guard);
            trace!("Vsync: delivering {:?}", event);
            sink(event);
            guard = lock(state);
            continue;
        }
        if guard.screen_on {
            guard = wait(cv, guard);
            continue;
        }

        let (g, res) = wait_timeout(cv, guard, screen_off_interval);
        guard = g;
        if res.timed_out() && !guard.screen_on && guard.wants_event() && guard.pending.is_none() {
            guard.count += 1;
            guard.pending = Some(VsyncEvent {
                timestamp: now_nanos(),
                count: guard.count,
            });
        }
    }
    debug!("Vsync: consumer thread ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn consumer() -> (Arc<VsyncConsumer>, mpsc::Receiver<VsyncEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let consumer = VsyncConsumer::spawn(
            "test",
            Duration::from_millis(5),
            Arc::new(move |ev| {
                let _ = lock(&tx).send(ev);
            }),
        )
        .unwrap();
        (consumer, rx)
    }

    #[test]
    fn test_delivers_only_when_requested() {
        let (consumer, rx) = consumer();
        consumer.on_vsync(100);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        consumer.request_next_vsync();
        consumer.on_vsync(200);
        let ev = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(ev.timestamp, 200);

        // One-shot: the following vsync is not delivered
        consumer.on_vsync(300);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        consumer.stop();
    }

    #[test]
    fn test_screen_off_synthesizes_ticks() {
        let (consumer, rx) = consumer();
        consumer.set_screen_on(false);
        consumer.request_next_vsync();
        let ev = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(ev.timestamp > 0);
        consumer.stop();
    }
}
