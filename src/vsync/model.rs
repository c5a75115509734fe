//! Software model of the display's refresh clock.
//!
//! Hardware vsync timestamps are sampled while resynchronizing; the model
//! derives a period and phase from them and then free-runs, checking itself
//! against present fences after every composed frame.

use std::f64::consts::PI;

use crate::clock::Nsecs;
use crate::config::VsyncConfig;
use crate::hwc::PresentFence;

/// Contract the compositor relies on; swappable for tests
pub trait VsyncModel: Send {
    /// Feed a hardware vsync timestamp. Returns true while more samples
    /// are needed.
    fn add_resync_sample(&mut self, timestamp: Nsecs) -> bool;

    /// Feed the present fence of the last composed frame. Returns true if
    /// the model has drifted and hardware vsync should be re-enabled.
    fn add_present_fence(&mut self, fence: PresentFence) -> bool;

    fn begin_resync(&mut self);

    fn end_resync(&mut self);

    /// Seed the period from the hardware's nominal refresh rate
    fn set_period(&mut self, period: Nsecs);

    fn set_refresh_skip_count(&mut self, count: i32);

    fn reset(&mut self);

    fn period(&self) -> Nsecs;

    fn phase(&self) -> Nsecs;

    fn reference_time(&self) -> Nsecs;

    fn error(&self) -> Nsecs;

    /// Predicted refresh `period_offset` periods after the next one
    fn compute_next_refresh(&self, period_offset: i32, now: Nsecs) -> Nsecs {
        let period = self.period();
        if period <= 0 {
            return now;
        }
        let phase = self.reference_time() + self.phase();
        ((now - phase).div_euclid(period) + period_offset as Nsecs + 1) * period + phase
    }
}

pub struct DispSyncModel {
    period: Nsecs,
    phase: Nsecs,
    reference_time: Nsecs,
    error: Nsecs,
    model_updated: bool,
    refresh_skip_count: i32,

    resync_samples: Vec<Nsecs>,
    first_resync_sample: usize,
    num_resync_samples: usize,
    resync_samples_since_present: usize,

    present_fences: Vec<Option<PresentFence>>,
    present_times: Vec<Nsecs>,
    present_sample_offset: usize,

    min_resync_samples: usize,
    max_samples_without_present: usize,
    error_threshold: i64,
    present_time_offset: Nsecs,
    ignore_present_fences: bool,
}

impl DispSyncModel {
    pub fn new(config: &VsyncConfig) -> Self {
        let max_samples = config.max_resync_samples.max(2);
        let present_samples = config.num_present_samples.max(1);
        Self {
            period: 0,
            phase: 0,
            reference_time: 0,
            error: 0,
            model_updated: false,
            refresh_skip_count: 0,
            resync_samples: vec![0; max_samples],
            first_resync_sample: 0,
            num_resync_samples: 0,
            resync_samples_since_present: 0,
            present_fences: vec![None; present_samples],
            present_times: vec![0; present_samples],
            present_sample_offset: 0,
            min_resync_samples: config.min_resync_samples.clamp(2, max_samples),
            max_samples_without_present: config.max_resync_samples_without_present,
            error_threshold: config.error_threshold,
            present_time_offset: config.present_time_offset_ns,
            ignore_present_fences: config.ignore_present_fences,
        }
    }

    fn needs_resync(&self) -> bool {
        !self.model_updated || self.error > self.error_threshold
    }

    fn sample(&self, i: usize) -> Nsecs {
        self.resync_samples[(self.first_resync_sample + i) % self.resync_samples.len()]
    }

    fn update_model(&mut self) {
        if self.num_resync_samples < self.min_resync_samples {
            return;
        }
        let n = self.num_resync_samples;
        let duration_sum: Nsecs = (1..n).map(|i| self.sample(i) - self.sample(i - 1)).sum();
        let period = duration_sum / (n as Nsecs - 1);
        if period <= 0 {
            return;
        }

        // Circular mean of each sample's position within the period
        let scale = 2.0 * PI / period as f64;
        let (mut x, mut y) = (0.0f64, 0.0f64);
        for i in 0..n {
            let sample = self.sample(i) - self.reference_time;
            let angle = sample.rem_euclid(period) as f64 * scale;
            x += angle.cos();
            y += angle.sin();
        }
        x /= n as f64;
        y /= n as f64;

        let mut phase = (y.atan2(x) / scale) as Nsecs;
        if phase < 0 {
            phase += period;
        }

        self.phase = phase;
        self.period = period + period * self.refresh_skip_count as Nsecs;
        self.model_updated = true;
    }

    fn update_error(&mut self) {
        if !self.model_updated {
            return;
        }
        // Fences are compared against the un-skipped period
        let period = self.period / (1 + self.refresh_skip_count as Nsecs);
        if period <= 0 {
            return;
        }
        let mut count = 0i64;
        let mut sq_sum = 0i64;
        for &present in &self.present_times {
            let sample = present - self.reference_time;
            if sample > self.phase {
                let mut err = (sample - self.phase) % period;
                if err > period / 2 {
                    err -= period;
                }
                sq_sum = sq_sum.saturating_add(err.saturating_mul(err));
                count += 1;
            }
        }
        self.error = if count > 0 { sq_sum / count } else { 0 };
    }

    fn reset_error(&mut self) {
        self.present_sample_offset = 0;
        self.error = 0;
        self.present_fences.iter_mut().for_each(|f| *f = None);
        self.present_times.iter_mut().for_each(|t| *t = 0);
    }
}

impl VsyncModel for DispSyncModel {
    fn add_resync_sample(&mut self, timestamp: Nsecs) -> bool {
        let capacity = self.resync_samples.len();
        let idx = (self.first_resync_sample + self.num_resync_samples) % capacity;
        self.resync_samples[idx] = timestamp;

        if self.num_resync_samples == 0 {
            self.phase = 0;
            self.reference_time = timestamp;
        }

        if self.num_resync_samples < capacity {
            self.num_resync_samples += 1;
        } else {
            self.first_resync_sample = (self.first_resync_sample + 1) % capacity;
        }

        self.update_model();

        let since_present = self.resync_samples_since_present;
        self.resync_samples_since_present += 1;
        if since_present > self.max_samples_without_present {
            self.reset_error();
        }

        if self.ignore_present_fences {
            return true;
        }
        self.needs_resync()
    }

    fn add_present_fence(&mut self, fence: PresentFence) -> bool {
        let slot = self.present_sample_offset;
        self.present_fences[slot] = Some(fence);
        self.present_times[slot] = 0;
        self.present_sample_offset = (slot + 1) % self.present_fences.len();
        self.resync_samples_since_present = 0;

        for i in 0..self.present_fences.len() {
            let signaled = self.present_fences[i]
                .as_ref()
                .and_then(PresentFence::signal_time);
            if let Some(t) = signaled {
                self.present_fences[i] = None;
                self.present_times[i] = t + self.present_time_offset;
            }
        }

        self.update_error();
        self.needs_resync()
    }

    fn begin_resync(&mut self) {
        self.model_updated = false;
        self.num_resync_samples = 0;
    }

    fn end_resync(&mut self) {}

    fn set_period(&mut self, period: Nsecs) {
        self.period = period;
        self.phase = 0;
        self.reference_time = 0;
    }

    fn set_refresh_skip_count(&mut self, count: i32) {
        self.refresh_skip_count = count.max(0);
        self.update_model();
    }

    fn reset(&mut self) {
        self.phase = 0;
        self.reference_time = 0;
        self.model_updated = false;
        self.num_resync_samples = 0;
        self.first_resync_sample = 0;
        self.resync_samples_since_present = 0;
        self.reset_error();
    }

    fn period(&self) -> Nsecs {
        self.period
    }

    fn phase(&self) -> Nsecs {
        self.phase
    }

    fn reference_time(&self) -> Nsecs {
        self.reference_time
    }

    fn error(&self) -> Nsecs {
        self.error
    }
}
