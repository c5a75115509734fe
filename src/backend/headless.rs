//! Headless backend.
//!
//! A software display with one mode that keeps vsync time on its own
//! thread and accepts composition without putting pixels anywhere. Lets
//! the service run, and be poked at over IPC, on machines without a panel.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use strata_ipc::{DisplayToken, PowerMode, Rect, SurfaceId};
use tracing::{debug, trace};

use crate::clock::{NSECS_PER_SEC, Nsecs, nanos_to_duration, now_nanos};
use crate::config::DisplayConfig;
use crate::error::{HwcError, RenderError};
use crate::geometry::{Region, Transform};
use crate::hwc::{HWC_DISPLAY_PRIMARY, HwComposer, HwcDisplayConfig, HwcDisplayId, PresentFence, WorkList};
use crate::render::{Color, ColorMatrix, RenderEngine};
use crate::sync::{lock, wait, wait_timeout};

/// Receives hardware vsync timestamps
pub type HwVsyncCallback = Arc<dyn Fn(HwcDisplayId, Nsecs) + Send + Sync>;

const FIRST_VIRTUAL_ID: HwcDisplayId = 2;
const MAX_VIRTUAL_DISPLAYS: usize = 4;
const MAX_TARGET_DIMENSION: u32 = 16384;

struct GeneratorState {
    enabled: bool,
    stop: bool,
}

#[derive(Debug)]
struct PanelState {
    power: PowerMode,
    active: usize,
    present: Option<PresentFence>,
    virtuals: BTreeSet<HwcDisplayId>,
    commits: u64,
}

pub struct HeadlessHwc {
    configs: Vec<HwcDisplayConfig>,
    period: Nsecs,
    panel: Mutex<PanelState>,
    generator: Arc<(Mutex<GeneratorState>, Condvar)>,
    callback: Arc<OnceLock<HwVsyncCallback>>,
    last_vsync: Arc<AtomicI64>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HeadlessHwc {
    pub fn new(config: &DisplayConfig) -> std::io::Result<Arc<Self>> {
        let period = (NSECS_PER_SEC as f64 / f64::from(config.refresh_rate.max(1.0))) as Nsecs;
        let mode = HwcDisplayConfig {
            width: config.width,
            height: config.height,
            xdpi: config.xdpi,
            ydpi: config.ydpi,
            refresh_period: period,
        };

        let generator = Arc::new((
            Mutex::new(GeneratorState {
                enabled: false,
                stop: false,
            }),
            Condvar::new(),
        ));
        let callback: Arc<OnceLock<HwVsyncCallback>> = Arc::new(OnceLock::new());
        let last_vsync = Arc::new(AtomicI64::new(0));

        let handle = {
            let generator = Arc::clone(&generator);
            let callback = Arc::clone(&callback);
            let last_vsync = Arc::clone(&last_vsync);
            thread::Builder::new()
                .name("headless-vsync".into())
                .spawn(move || run_vsync(generator, callback, last_vsync, period))?
        };

        debug!(
            "Headless: {}x{} @ {:.1} Hz",
            config.width, config.height, config.refresh_rate
        );
        Ok(Arc::new(Self {
            configs: vec![mode],
            period,
            panel: Mutex::new(PanelState {
                power: PowerMode::Off,
                active: 0,
                present: None,
                virtuals: BTreeSet::new(),
                commits: 0,
            }),
            generator,
            callback,
            last_vsync,
            thread: Mutex::new(Some(handle)),
        }))
    }

    /// Where vsync timestamps go. Only the first callback is kept.
    pub fn set_vsync_callback(&self, callback: HwVsyncCallback) {
        let _ = self.callback.set(callback);
    }

    pub fn commits(&self) -> u64 {
        lock(&self.panel).commits
    }

    fn next_edge(&self, now: Nsecs) -> Nsecs {
        (now / self.period + 1) * self.period
    }

    pub fn stop(&self) {
        {
            let (state, cv) = &*self.generator;
            lock(state).stop = true;
            cv.notify_all();
        }
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
    }
}

fn run_vsync(
    generator: Arc<(Mutex<GeneratorState>, Condvar)>,
    callback: Arc<OnceLock<HwVsyncCallback>>,
    last_vsync: Arc<AtomicI64>,
    period: Nsecs,
) {
    let (state, cv) = &*generator;
    let mut guard = lock(state);
    loop {
        if guard.stop {
            break;
        }
        if !guard.enabled {
            guard = wait(cv, guard);
            continue;
        }
        let now = now_nanos();
        let edge = (now / period + 1) * period;
        guard = wait_timeout(cv, guard, nanos_to_duration(edge - now)).0;
        if guard.stop || !guard.enabled || now_nanos() < edge {
            continue;
        }
        drop(guard);
        last_vsync.store(edge, Ordering::Release);
        if let Some(callback) = callback.get() {
            callback(HWC_DISPLAY_PRIMARY, edge);
        }
        guard = lock(state);
    }
    debug!("Headless: vsync thread exiting");
}

impl HwComposer for HeadlessHwc {
    fn is_connected(&self, display: HwcDisplayId) -> bool {
        display == HWC_DISPLAY_PRIMARY || lock(&self.panel).virtuals.contains(&display)
    }

    fn allocate_virtual_display(&self, width: u32, height: u32) -> Option<HwcDisplayId> {
        let mut panel = lock(&self.panel);
        if panel.virtuals.len() >= MAX_VIRTUAL_DISPLAYS {
            return None;
        }
        let id = (FIRST_VIRTUAL_ID..).find(|id| !panel.virtuals.contains(id))?;
        panel.virtuals.insert(id);
        debug!("Headless: virtual display {} ({}x{})", id, width, height);
        Some(id)
    }

    fn free_display(&self, display: HwcDisplayId) {
        lock(&self.panel).virtuals.remove(&display);
    }

    fn prepare(&self, lists: &mut [WorkList]) -> Result<(), HwcError> {
        // No overlays: every layer stays with the render engine
        for list in lists.iter() {
            if !self.is_connected(list.display) {
                return Err(HwcError::NoDisplay(list.display));
            }
        }
        Ok(())
    }

    fn commit(&self, lists: &[WorkList]) -> Result<(), HwcError> {
        let edge = self.next_edge(now_nanos());
        let mut panel = lock(&self.panel);
        panel.commits += 1;
        if lists.iter().any(|l| l.display == HWC_DISPLAY_PRIMARY) {
            panel.present = Some(PresentFence::signaled(edge));
        }
        trace!("Headless: commit {} ({} lists)", panel.commits, lists.len());
        Ok(())
    }

    fn event_control(&self, display: HwcDisplayId, enabled: bool) {
        if display != HWC_DISPLAY_PRIMARY {
            return;
        }
        let (state, cv) = &*self.generator;
        lock(state).enabled = enabled;
        cv.notify_all();
    }

    fn refresh_period(&self, _display: HwcDisplayId) -> Nsecs {
        self.period
    }

    fn refresh_timestamp(&self, _display: HwcDisplayId) -> Nsecs {
        match self.last_vsync.load(Ordering::Acquire) {
            0 => (now_nanos() / self.period) * self.period,
            t => t,
        }
    }

    fn display_fence(&self, display: HwcDisplayId) -> Option<PresentFence> {
        if display != HWC_DISPLAY_PRIMARY {
            return None;
        }
        lock(&self.panel).present.clone()
    }

    fn set_power_mode(&self, display: HwcDisplayId, mode: PowerMode) -> Result<(), HwcError> {
        if display != HWC_DISPLAY_PRIMARY {
            return Err(HwcError::NoDisplay(display));
        }
        lock(&self.panel).power = mode;
        Ok(())
    }

    fn configs(&self, display: HwcDisplayId) -> Vec<HwcDisplayConfig> {
        if display == HWC_DISPLAY_PRIMARY {
            self.configs.clone()
        } else {
            Vec::new()
        }
    }

    fn active_config(&self, _display: HwcDisplayId) -> usize {
        lock(&self.panel).active
    }

    fn set_active_config(&self, display: HwcDisplayId, mode: usize) -> Result<(), HwcError> {
        if display != HWC_DISPLAY_PRIMARY {
            return Err(HwcError::NoDisplay(display));
        }
        if mode >= self.configs.len() {
            return Err(HwcError::Unsupported("display mode"));
        }
        lock(&self.panel).active = mode;
        Ok(())
    }
}

/// Render engine that tracks what would be drawn
#[derive(Debug, Default)]
pub struct HeadlessRenderEngine {
    frame: Option<DisplayToken>,
    capture: Option<(u32, u32)>,
    matrix: Option<ColorMatrix>,
    frames: u64,
    draws: u64,
}

impl HeadlessRenderEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames swapped so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }
}

fn check_target(width: u32, height: u32) -> Result<(), RenderError> {
    if width == 0 || height == 0 || width > MAX_TARGET_DIMENSION || height > MAX_TARGET_DIMENSION {
        return Err(RenderError::Context(format!("unsupported target size {}x{}", width, height)));
    }
    Ok(())
}

impl RenderEngine for HeadlessRenderEngine {
    fn begin_frame(&mut self, display: DisplayToken, width: u32, height: u32) -> Result<(), RenderError> {
        check_target(width, height)?;
        self.frame = Some(display);
        Ok(())
    }

    fn set_scissor(&mut self, _scissor: Option<Rect>) {}

    fn clear_with_color(&mut self, _color: Color) {}

    fn fill_region(&mut self, region: &Region, _color: Color) {
        trace!("Headless: fill {:?}", region.bounds());
    }

    fn draw_surface(&mut self, surface: SurfaceId, clip: &Region, alpha: u8, _transform: &Transform) {
        self.draws += 1;
        trace!("Headless: draw {:?} clip={:?} alpha={}", surface, clip.bounds(), alpha);
    }

    fn set_color_transform(&mut self, matrix: Option<ColorMatrix>) -> Option<ColorMatrix> {
        std::mem::replace(&mut self.matrix, matrix)
    }

    fn swap_buffers(&mut self, token: DisplayToken, damage: &Region) -> Result<(), RenderError> {
        if self.frame.take() != Some(token) {
            return Err(RenderError::Swap(format!("{:?} has no frame in progress", token)));
        }
        self.frames += 1;
        trace!("Headless: swap {:?} damage={:?}", token, damage.bounds());
        Ok(())
    }

    fn begin_capture(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        check_target(width, height)?;
        self.capture = Some((width, height));
        Ok(())
    }

    fn end_capture(&mut self) {
        self.capture = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> DisplayConfig {
        DisplayConfig {
            width: 64,
            height: 48,
            refresh_rate: 100.0,
            ..DisplayConfig::default()
        }
    }

    #[test]
    fn test_vsync_follows_event_control() {
        let hwc = HeadlessHwc::new(&config()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hwc.set_vsync_callback(Arc::new(move |display, t| {
            assert_eq!(display, HWC_DISPLAY_PRIMARY);
            lock(&sink).push(t);
        }));

        thread::sleep(Duration::from_millis(30));
        assert!(lock(&seen).is_empty());

        hwc.event_control(HWC_DISPLAY_PRIMARY, true);
        thread::sleep(Duration::from_millis(80));
        hwc.event_control(HWC_DISPLAY_PRIMARY, false);
        thread::sleep(Duration::from_millis(20));
        let stamps = lock(&seen).clone();
        assert!(stamps.len() >= 3, "only {} vsyncs", stamps.len());
        for pair in stamps.windows(2) {
            assert!(pair[1] > pair[0]);
            assert_eq!((pair[1] - pair[0]) % 10_000_000, 0);
        }

        thread::sleep(Duration::from_millis(50));
        assert_eq!(lock(&seen).len(), stamps.len());
        hwc.stop();
    }

    #[test]
    fn test_commit_produces_present_fence() {
        let hwc = HeadlessHwc::new(&config()).unwrap();
        assert!(hwc.display_fence(HWC_DISPLAY_PRIMARY).is_none());
        let mut lists = vec![WorkList::new(HWC_DISPLAY_PRIMARY)];
        hwc.prepare(&mut lists).unwrap();
        let before = now_nanos();
        hwc.commit(&lists).unwrap();
        let fence = hwc.display_fence(HWC_DISPLAY_PRIMARY).unwrap();
        assert!(fence.signal_time().unwrap() > before);
        assert_eq!(hwc.commits(), 1);

        let mut unknown = vec![WorkList::new(9)];
        assert_eq!(hwc.prepare(&mut unknown), Err(HwcError::NoDisplay(9)));
        hwc.stop();
    }

    #[test]
    fn test_virtual_ids_are_limited_and_reused() {
        let hwc = HeadlessHwc::new(&config()).unwrap();
        let ids: Vec<_> = (0..MAX_VIRTUAL_DISPLAYS)
            .map(|_| hwc.allocate_virtual_display(10, 10).unwrap())
            .collect();
        assert_eq!(ids[0], FIRST_VIRTUAL_ID);
        assert!(hwc.allocate_virtual_display(10, 10).is_none());
        hwc.free_display(ids[1]);
        assert_eq!(hwc.allocate_virtual_display(10, 10), Some(ids[1]));
        hwc.stop();
    }

    #[test]
    fn test_single_mode() {
        let hwc = HeadlessHwc::new(&config()).unwrap();
        let configs = hwc.configs(HWC_DISPLAY_PRIMARY);
        assert_eq!(configs.len(), 1);
        assert_eq!((configs[0].width, configs[0].height), (64, 48));
        assert_eq!(configs[0].refresh_period, 10_000_000);
        assert!(hwc.set_active_config(HWC_DISPLAY_PRIMARY, 1).is_err());
        hwc.stop();
    }

    #[test]
    fn test_render_engine_rejects_bad_targets() {
        let mut engine = HeadlessRenderEngine::new();
        assert!(engine.begin_capture(0, 10).is_err());
        assert!(engine.begin_capture(MAX_TARGET_DIMENSION + 1, 10).is_err());
        engine.begin_frame(DisplayToken(1), 10, 10).unwrap();
        engine.draw_surface(SurfaceId(1), &Region::new(), 255, &Transform::identity());
        engine.swap_buffers(DisplayToken(1), &Region::new()).unwrap();
        assert_eq!((engine.frames(), engine.draws()), (1, 1));
        assert!(engine.swap_buffers(DisplayToken(1), &Region::new()).is_err());
    }
}
