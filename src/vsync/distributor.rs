//! Phase-shifted vsync callbacks driven by the software model.
//!
//! One thread sleeps until the earliest listener's next event, then fires
//! every listener whose event time has passed. Callbacks run outside the
//! lock.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::clock::{Nsecs, nanos_to_duration, now_nanos};
use crate::sync::{lock, wait, wait_timeout};

pub type VsyncCallback = Arc<dyn Fn(Nsecs) + Send + Sync>;

const MAX_WAKEUP_LATENCY: Nsecs = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    phase: Nsecs,
    last_event_time: Nsecs,
    callback: VsyncCallback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelSnapshot {
    pub period: Nsecs,
    pub phase: Nsecs,
    pub reference_time: Nsecs,
}

#[derive(Default)]
struct DistributorState {
    model: ModelSnapshot,
    listeners: Vec<Listener>,
    wakeup_latency: Nsecs,
    next_id: u64,
    stop: bool,
}

/// Next event for one listener at or after `base_time`
pub(crate) fn listener_next_event_time(
    model: &ModelSnapshot,
    listener_phase: Nsecs,
    last_event_time: Nsecs,
    wakeup_latency: Nsecs,
    base_time: Nsecs,
) -> Nsecs {
    let period = model.period;
    let mut base = base_time.max(last_event_time + wakeup_latency);
    base -= model.reference_time;
    let phase = model.phase + listener_phase;
    base -= phase;
    let periods = base.div_euclid(period);
    let mut t = (periods + 1) * period + phase + model.reference_time;
    // Never fire twice within one period for the same listener
    if t - last_event_time < period / 2 {
        t += period;
    }
    t - wakeup_latency
}

impl DistributorState {
    fn next_event_time(&self, now: Nsecs) -> Option<Nsecs> {
        self.listeners
            .iter()
            .map(|l| {
                listener_next_event_time(
                    &self.model,
                    l.phase,
                    l.last_event_time,
                    self.wakeup_latency,
                    now,
                )
            })
            .min()
    }

    fn gather_invocations(&mut self, now: Nsecs) -> Vec<(VsyncCallback, Nsecs)> {
        let one_period_ago = now - self.model.period;
        let model = self.model;
        let latency = self.wakeup_latency;
        let mut out = Vec::new();
        for listener in &mut self.listeners {
            let t = listener_next_event_time(
                &model,
                listener.phase,
                listener.last_event_time,
                latency,
                one_period_ago,
            );
            if t < now {
                listener.last_event_time = t;
                out.push((Arc::clone(&listener.callback), t));
            }
        }
        out
    }

    fn normalize_phase(&self, phase: Nsecs) -> Nsecs {
        if self.model.period > 0 {
            phase.rem_euclid(self.model.period)
        } else {
            phase
        }
    }
}

pub struct VsyncDistributor {
    shared: Arc<(Mutex<DistributorState>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl VsyncDistributor {
    pub fn spawn() -> std::io::Result<Arc<Self>> {
        let shared = Arc::new((Mutex::new(DistributorState::default()), Condvar::new()));
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("vsync-distributor".into())
            .spawn(move || run(worker))?;
        Ok(Arc::new(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        }))
    }

    pub fn update_model(&self, model: ModelSnapshot) {
        let (state, cv) = &*self.shared;
        let mut state = lock(state);
        if state.model != model {
            trace!("Vsync: model period={} phase={}", model.period, model.phase);
            state.model = model;
            cv.notify_all();
        }
    }

    pub fn add_listener(&self, phase: Nsecs, callback: VsyncCallback) -> ListenerId {
        let (state, cv) = &*self.shared;
        let mut state = lock(state);
        let id = ListenerId(state.next_id);
        state.next_id += 1;
        let phase = state.normalize_phase(phase);
        // Pretend the last event was half a period ago so the first one is not delayed
        let last_event_time =
            now_nanos() - state.model.period / 2 + state.model.phase - state.wakeup_latency;
        state.listeners.push(Listener {
            id,
            phase,
            last_event_time,
            callback,
        });
        cv.notify_all();
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let (state, cv) = &*self.shared;
        let mut state = lock(state);
        let before = state.listeners.len();
        state.listeners.retain(|l| l.id != id);
        cv.notify_all();
        state.listeners.len() != before
    }

    /// Move a listener to a new phase. The offset is folded into
    /// `[0, period)`; the listener keeps its last event time, so crossing
    /// the period boundary never produces a double event.
    pub fn set_listener_phase(&self, id: ListenerId, phase: Nsecs) -> bool {
        let (state, cv) = &*self.shared;
        let mut state = lock(state);
        let phase = state.normalize_phase(phase);
        let Some(listener) = state.listeners.iter_mut().find(|l| l.id == id) else {
            return false;
        };
        debug!("Vsync: listener {:?} phase {} -> {}", id, listener.phase, phase);
        listener.phase = phase;
        cv.notify_all();
        true
    }

    pub fn listener_phase(&self, id: ListenerId) -> Option<Nsecs> {
        let (state, _) = &*self.shared;
        lock(state)
            .listeners
            .iter()
            .find(|l| l.id == id)
            .map(|l| l.phase)
    }

    pub fn wakeup_latency(&self) -> Nsecs {
        lock(&self.shared.0).wakeup_latency
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

fn run(shared: Arc<(Mutex<DistributorState>, Condvar)>) {
    let (state, cv) = &*shared;
    let mut guard = lock(state);
    loop {
        if guard.stop {
            break;
        }
        if guard.model.period <= 0 {
            guard = wait(cv, guard);
            continue;
        }

        let now = now_nanos();
        let Some(target) = guard.next_event_time(now) else {
            guard = wait(cv, guard);
            continue;
        };

        if now < target {
            let (g, res) = wait_timeout(cv, guard, nanos_to_duration(target - now));
            guard = g;
            if !res.timed_out() {
                // Model or listeners changed; recompute
                continue;
            }
        }

        let now = now_nanos();
        let observed = (now - target).clamp(0, MAX_WAKEUP_LATENCY);
        guard.wakeup_latency = ((guard.wakeup_latency * 63) + observed) / 64;
        guard.wakeup_latency = guard.wakeup_latency.min(MAX_WAKEUP_LATENCY);

        let invocations = guard.gather_invocations(now);
        drop(guard);
        for (callback, t) in invocations {
            callback(t);
        }
        guard = lock(state);
    }
    debug!("Vsync: distributor thread ended");
}
