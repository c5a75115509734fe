// Frame timing statistics
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::Instant;

use strata_ipc::FrameStats;

use crate::clock::Nsecs;
use crate::hwc::PresentFence;

pub const NUM_BUCKETS: usize = 8;

const MAX_FRAME_HISTORY: usize = 128;

/// Histogram of time spent between presents, bucketed by whole vsync periods
#[derive(Debug, Default)]
pub struct FrameBuckets {
    buckets: [Nsecs; NUM_BUCKETS],
    total_time: Nsecs,
    last_swap_time: Nsecs,
    /// Skip the first interval after power-on; it spans the off period
    has_powered_off: bool,
}

impl FrameBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn powered_off(&mut self) {
        self.has_powered_off = true;
    }

    pub fn record_present(&mut self, now: Nsecs, period: Nsecs) {
        if self.has_powered_off {
            self.has_powered_off = false;
        } else if self.last_swap_time > 0 && period > 0 {
            let elapsed = now - self.last_swap_time;
            let periods = (elapsed / period).max(0) as usize;
            self.buckets[periods.min(NUM_BUCKETS - 1)] += elapsed;
            self.total_time += elapsed;
        }
        self.last_swap_time = now;
    }

    pub fn buckets(&self) -> &[Nsecs; NUM_BUCKETS] {
        &self.buckets
    }

    pub fn total_time(&self) -> Nsecs {
        self.total_time
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(out, "frame buckets (total {} ms):", self.total_time / 1_000_000);
        for (i, t) in self.buckets.iter().enumerate() {
            let pct = if self.total_time > 0 {
                100.0 * *t as f64 / self.total_time as f64
            } else {
                0.0
            };
            let label = if i == NUM_BUCKETS - 1 {
                format!("{}+", i)
            } else {
                i.to_string()
            };
            let _ = writeln!(out, "  {:>3} periods: {:>6.2}%", label, pct);
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FrameRecord {
    desired_present: Nsecs,
    frame_ready: Nsecs,
    actual_present: Option<Nsecs>,
    present_fence: Option<PresentFence>,
}

impl FrameRecord {
    fn actual_present_time(&self) -> Nsecs {
        if let Some(t) = self.actual_present {
            return t;
        }
        self.present_fence
            .as_ref()
            .and_then(PresentFence::signal_time)
            .unwrap_or(i64::MAX)
    }
}

/// Timing of the most recent animation frames
#[derive(Debug, Default)]
pub struct AnimFrameTracker {
    frames: VecDeque<FrameRecord>,
    pending: FrameRecord,
}

impl AnimFrameTracker {
    pub fn set_desired_present_time(&mut self, t: Nsecs) {
        self.pending.desired_present = t;
    }

    pub fn set_frame_ready_time(&mut self, t: Nsecs) {
        self.pending.frame_ready = t;
    }

    pub fn set_actual_present_time(&mut self, t: Nsecs) {
        self.pending.actual_present = Some(t);
    }

    /// The present time is read from the fence once it signals
    pub fn set_actual_present_fence(&mut self, fence: PresentFence) {
        self.pending.present_fence = Some(fence);
    }

    pub fn advance_frame(&mut self) {
        let frame = std::mem::take(&mut self.pending);
        self.frames.push_back(frame);
        while self.frames.len() > MAX_FRAME_HISTORY {
            self.frames.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.pending = FrameRecord::default();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn stats(&self, refresh_period: Nsecs) -> FrameStats {
        FrameStats {
            refresh_period_ns: refresh_period,
            desired_present_times: self.frames.iter().map(|f| f.desired_present).collect(),
            frame_ready_times: self.frames.iter().map(|f| f.frame_ready).collect(),
            actual_present_times: self
                .frames
                .iter()
                .map(FrameRecord::actual_present_time)
                .collect(),
        }
    }
}

/// Rolling page-flip rate
pub struct FlipRate {
    /// When we started counting
    last_report: Instant,
    /// Flips since last report
    flip_count: u64,
    /// Last calculated rate
    current_rate: f64,
    /// Report every this many flips (0 = never)
    report_every: u64,
}

impl FlipRate {
    pub fn new(report_every: u64) -> Self {
        Self {
            last_report: Instant::now(),
            flip_count: 0,
            current_rate: 0.0,
            report_every,
        }
    }

    /// Call after each posted frame.
    /// Returns Some(rate) when a report is due
    pub fn tick(&mut self) -> Option<f64> {
        self.flip_count += 1;
        if self.report_every == 0 || self.flip_count < self.report_every {
            return None;
        }
        let elapsed = self.last_report.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.current_rate = self.flip_count as f64 / elapsed;
        }
        self.flip_count = 0;
        self.last_report = Instant::now();
        Some(self.current_rate)
    }

    pub fn rate(&self) -> f64 {
        self.current_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Nsecs = 16_000_000;

    #[test]
    fn test_buckets_by_whole_periods() {
        let mut buckets = FrameBuckets::new();
        buckets.record_present(1_000_000_000, PERIOD);
        buckets.record_present(1_000_000_000 + PERIOD, PERIOD);
        buckets.record_present(1_000_000_000 + 3 * PERIOD, PERIOD);
        buckets.record_present(1_000_000_000 + 40 * PERIOD, PERIOD);

        assert_eq!(buckets.buckets()[1], PERIOD);
        assert_eq!(buckets.buckets()[2], 2 * PERIOD);
        assert_eq!(buckets.buckets()[NUM_BUCKETS - 1], 37 * PERIOD);
        assert_eq!(buckets.total_time(), 40 * PERIOD);
    }

    #[test]
    fn test_interval_after_power_off_is_skipped() {
        let mut buckets = FrameBuckets::new();
        buckets.record_present(1_000_000_000, PERIOD);
        buckets.powered_off();
        buckets.record_present(9_000_000_000, PERIOD);
        assert_eq!(buckets.total_time(), 0);
        buckets.record_present(9_000_000_000 + PERIOD, PERIOD);
        assert_eq!(buckets.total_time(), PERIOD);
    }

    #[test]
    fn test_tracker_resolves_fences_and_keeps_history_bounded() {
        let mut tracker = AnimFrameTracker::default();
        let fence = PresentFence::pending();
        tracker.set_desired_present_time(10);
        tracker.set_frame_ready_time(5);
        tracker.set_actual_present_fence(fence.clone());
        tracker.advance_frame();

        assert_eq!(tracker.stats(PERIOD).actual_present_times, vec![i64::MAX]);
        fence.signal(12);
        let stats = tracker.stats(PERIOD);
        assert_eq!(stats.desired_present_times, vec![10]);
        assert_eq!(stats.frame_ready_times, vec![5]);
        assert_eq!(stats.actual_present_times, vec![12]);

        for _ in 0..200 {
            tracker.advance_frame();
        }
        assert_eq!(tracker.len(), MAX_FRAME_HISTORY);
        tracker.clear();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_flip_rate_reports_on_schedule() {
        let mut rate = FlipRate::new(3);
        assert!(rate.tick().is_none());
        assert!(rate.tick().is_none());
        assert!(rate.tick().is_some());
        let mut never = FlipRate::new(0);
        assert!(never.tick().is_none());
    }
}
