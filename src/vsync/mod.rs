//! Vsync: the clock model, its phase-shifted distribution, and the policy
//! deciding when the hardware interrupt is needed.

pub mod consumer;
pub mod control;
pub mod distributor;
pub mod model;

use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::clock::Nsecs;
use crate::hwc::PresentFence;
use crate::sync::lock;

pub use consumer::{VsyncConsumer, VsyncEvent};
pub use control::EventControlThread;
pub use distributor::{ListenerId, ModelSnapshot, VsyncDistributor};
pub use model::{DispSyncModel, VsyncModel};

#[derive(Debug, Default, Clone, Copy)]
struct HwVsyncState {
    enabled: bool,
    available: bool,
}

/// Owns the vsync model and decides when hardware vsync must run
pub struct HwVsync {
    state: Mutex<HwVsyncState>,
    model: Mutex<Box<dyn VsyncModel>>,
    distributor: Option<Arc<VsyncDistributor>>,
    control: Option<EventControlThread>,
}

impl HwVsync {
    pub fn new(
        model: Box<dyn VsyncModel>,
        distributor: Option<Arc<VsyncDistributor>>,
        control: Option<EventControlThread>,
    ) -> Self {
        Self {
            state: Mutex::new(HwVsyncState::default()),
            model: Mutex::new(model),
            distributor,
            control,
        }
    }

    fn publish(&self, model: &dyn VsyncModel) {
        if let Some(distributor) = &self.distributor {
            distributor.update_model(ModelSnapshot {
                period: model.period(),
                phase: model.phase(),
                reference_time: model.reference_time(),
            });
        }
    }

    fn set_interrupt(&self, enabled: bool) {
        if let Some(control) = &self.control {
            control.set_vsync_enabled(enabled);
        }
    }

    pub fn enable_hardware_vsync(&self) {
        let mut state = lock(&self.state);
        if !state.enabled && state.available {
            lock(&self.model).begin_resync();
            self.set_interrupt(true);
            state.enabled = true;
        }
    }

    /// Restart the model from the hardware's nominal period
    pub fn resync_to_hardware_vsync(&self, make_available: bool, period: Nsecs) {
        let mut state = lock(&self.state);
        if make_available {
            state.available = true;
        } else if !state.available {
            return;
        }
        {
            let mut model = lock(&self.model);
            model.reset();
            model.set_period(period);
            self.publish(model.as_ref());
        }
        if !state.enabled {
            lock(&self.model).begin_resync();
            self.set_interrupt(true);
            state.enabled = true;
        }
        debug!("Vsync: resync to hardware period {}", period);
    }

    pub fn disable_hardware_vsync(&self, make_unavailable: bool) {
        let mut state = lock(&self.state);
        if state.enabled {
            self.set_interrupt(false);
            lock(&self.model).end_resync();
            state.enabled = false;
        }
        if make_unavailable {
            state.available = false;
        }
    }

    /// Hardware vsync timestamp from the primary display
    pub fn on_vsync_received(&self, timestamp: Nsecs) {
        let needs_hw_vsync = {
            let state = lock(&self.state);
            if !state.enabled {
                return;
            }
            let mut model = lock(&self.model);
            let needs = model.add_resync_sample(timestamp);
            self.publish(model.as_ref());
            needs
        };
        trace!("Vsync: sample {} needs_more={}", timestamp, needs_hw_vsync);
        if needs_hw_vsync {
            self.enable_hardware_vsync();
        } else {
            self.disable_hardware_vsync(false);
        }
    }

    /// Present fence feedback after a composed frame
    pub fn add_present_fence(&self, fence: PresentFence) {
        let needs_resync = lock(&self.model).add_present_fence(fence);
        if needs_resync {
            self.enable_hardware_vsync();
        } else {
            self.disable_hardware_vsync(false);
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    pub fn period(&self) -> Nsecs {
        lock(&self.model).period()
    }

    pub fn compute_next_refresh(&self, period_offset: i32, now: Nsecs) -> Nsecs {
        lock(&self.model).compute_next_refresh(period_offset, now)
    }

    pub fn set_refresh_skip_count(&self, count: i32) {
        let mut model = lock(&self.model);
        model.set_refresh_skip_count(count);
        self.publish(model.as_ref());
    }

    pub fn dump(&self) -> String {
        let state = *lock(&self.state);
        let model = lock(&self.model);
        let latency = self
            .distributor
            .as_ref()
            .map(|d| d.wakeup_latency())
            .unwrap_or(0);
        format!(
            "vsync: hw_enabled={} available={} period={} phase={} error={} wakeup_latency={}\n",
            state.enabled,
            state.available,
            model.period(),
            model.phase(),
            model.error(),
            latency
        )
    }

    pub fn shutdown(&self) {
        if let Some(control) = &self.control {
            control.stop();
        }
        if let Some(distributor) = &self.distributor {
            distributor.stop();
        }
    }
}
