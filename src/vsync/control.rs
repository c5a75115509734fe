//! Thread that owns the hardware vsync interrupt switch.
//!
//! Enabling or disabling the interrupt can block in the driver, so callers
//! only record the desired state and this thread applies it.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::hwc::{HwComposer, HwcDisplayId};
use crate::sync::{lock, wait};

struct ControlState {
    enabled: bool,
    stop: bool,
}

pub struct EventControlThread {
    shared: Arc<(Mutex<ControlState>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventControlThread {
    pub fn spawn(hwc: Arc<dyn HwComposer>, display: HwcDisplayId) -> std::io::Result<Self> {
        let shared = Arc::new((
            Mutex::new(ControlState {
                enabled: false,
                stop: false,
            }),
            Condvar::new(),
        ));
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("vsync-control".into())
            .spawn(move || run(worker, hwc, display))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn set_vsync_enabled(&self, enabled: bool) {
        let (state, cv) = &*self.shared;
        lock(state).enabled = enabled;
        cv.notify_all();
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

fn run(shared: Arc<(Mutex<ControlState>, Condvar)>, hwc: Arc<dyn HwComposer>, display: HwcDisplayId) {
    let (state, cv) = &*shared;
    let mut applied = false;
    hwc.event_control(display, applied);

    let mut guard = lock(state);
    loop {
        while guard.enabled == applied && !guard.stop {
            guard = wait(cv, guard);
        }
        if guard.stop {
            break;
        }
        applied = guard.enabled;
        drop(guard);
        debug!("Vsync: hardware vsync {}", if applied { "on" } else { "off" });
        hwc.event_control(display, applied);
        guard = lock(state);
    }
    drop(guard);
    if applied {
        hwc.event_control(display, false);
    }
    debug!("Vsync: control thread ended");
}
