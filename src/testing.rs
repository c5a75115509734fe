//! Recording collaborators and a synchronous harness around `Compositor`.

use std::sync::{Arc, Mutex, MutexGuard};

use strata_ipc::{
    ClientId, CreateFlags, DisplayChange, DisplayToken, DisplayType, PixelFormat, PowerMode,
    SurfaceChange, SurfaceFlags, SurfaceId,
};
use tokio::sync::mpsc;

use crate::buffer::{FrameProducer, FrameQueue};
use crate::clock::{Nsecs, now_nanos};
use crate::compositor::Compositor;
use crate::config::Config;
use crate::context::ServiceContext;
use crate::error::{HwcError, RenderError};
use crate::event_loop::{Message, MessageQueue};
use crate::geometry::{Region, Transform};
use crate::hwc::{
    CompositionType, HWC_DISPLAY_PRIMARY, HwComposer, HwcDisplayConfig, HwcDisplayId, PresentFence,
    WorkList,
};
use crate::render::{Color, ColorMatrix, RenderEngine};
use crate::state::{SurfaceKind, SurfaceRecord, SurfaceState, TransactionFlags};
use crate::sync::lock;
use crate::vsync::{DispSyncModel, HwVsync};

pub const WIDTH: u32 = 100;
pub const HEIGHT: u32 = 100;
pub const PERIOD: Nsecs = 16_666_667;

#[derive(Debug, Default)]
pub struct HwcLog {
    pub prepared: Vec<Vec<WorkList>>,
    pub commits: usize,
    pub power: Vec<(HwcDisplayId, PowerMode)>,
    pub event_control: Vec<bool>,
    pub freed: Vec<HwcDisplayId>,
    pub allocated: usize,
    pub active: usize,
    /// Fail every prepare
    pub fail_prepare: bool,
    /// Put opaque, non-skipped layers on overlays
    pub use_overlays: bool,
    /// Hand out a signalled fence after each commit
    pub fences: bool,
}

pub struct RecordingHwc {
    configs: Vec<HwcDisplayConfig>,
    log: Mutex<HwcLog>,
}

impl RecordingHwc {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        let config = |width, height| HwcDisplayConfig {
            width,
            height,
            xdpi: 160.0,
            ydpi: 160.0,
            refresh_period: PERIOD,
        };
        Arc::new(Self {
            configs: vec![config(width, height), config(width / 2, height / 2)],
            log: Mutex::new(HwcLog::default()),
        })
    }

    pub fn log(&self) -> MutexGuard<'_, HwcLog> {
        lock(&self.log)
    }
}

impl HwComposer for RecordingHwc {
    fn is_connected(&self, display: HwcDisplayId) -> bool {
        display == HWC_DISPLAY_PRIMARY
    }

    fn allocate_virtual_display(&self, _width: u32, _height: u32) -> Option<HwcDisplayId> {
        let mut log = self.log();
        log.allocated += 1;
        Some(1 + log.allocated as HwcDisplayId)
    }

    fn free_display(&self, display: HwcDisplayId) {
        self.log().freed.push(display);
    }

    fn prepare(&self, lists: &mut [WorkList]) -> Result<(), HwcError> {
        let mut log = self.log();
        if log.fail_prepare {
            return Err(HwcError::Prepare {
                display: lists.first().map_or(HWC_DISPLAY_PRIMARY, |l| l.display),
                reason: "injected failure".into(),
            });
        }
        if log.use_overlays {
            for layer in lists.iter_mut().flat_map(|l| l.layers.iter_mut()) {
                if layer.opaque && !layer.skip {
                    layer.composition = CompositionType::Overlay;
                }
            }
        }
        log.prepared.push(lists.to_vec());
        Ok(())
    }

    fn commit(&self, _lists: &[WorkList]) -> Result<(), HwcError> {
        self.log().commits += 1;
        Ok(())
    }

    fn event_control(&self, _display: HwcDisplayId, enabled: bool) {
        self.log().event_control.push(enabled);
    }

    fn refresh_period(&self, _display: HwcDisplayId) -> Nsecs {
        PERIOD
    }

    fn refresh_timestamp(&self, _display: HwcDisplayId) -> Nsecs {
        now_nanos()
    }

    fn display_fence(&self, _display: HwcDisplayId) -> Option<PresentFence> {
        self.log().fences.then(|| PresentFence::signaled(now_nanos()))
    }

    fn set_power_mode(&self, display: HwcDisplayId, mode: PowerMode) -> Result<(), HwcError> {
        self.log().power.push((display, mode));
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
        self.log().active
    }

    fn set_active_config(&self, _display: HwcDisplayId, mode: usize) -> Result<(), HwcError> {
        if mode >= self.configs.len() {
            return Err(HwcError::Unsupported("display mode"));
        }
        self.log().active = mode;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderOp {
    BeginFrame(DisplayToken),
    Clear(Color),
    Fill(Region, Color),
    Draw { surface: SurfaceId, clip: Region, alpha: u8 },
    ColorTransform(Option<ColorMatrix>),
    Swap(DisplayToken, Region),
    BeginCapture(u32, u32),
    EndCapture,
}

pub type RenderLog = Arc<Mutex<Vec<RenderOp>>>;

#[derive(Default)]
pub struct RecordingEngine {
    log: RenderLog,
    matrix: Option<ColorMatrix>,
    /// Fail the next `begin_frame`
    pub fail_next_frame: bool,
}

impl RecordingEngine {
    pub fn new() -> (Box<Self>, RenderLog) {
        let engine = Box::new(Self::default());
        let log = Arc::clone(&engine.log);
        (engine, log)
    }

    fn record(&self, op: RenderOp) {
        lock(&self.log).push(op);
    }
}

impl RenderEngine for RecordingEngine {
    fn begin_frame(&mut self, display: DisplayToken, _width: u32, _height: u32) -> Result<(), RenderError> {
        if std::mem::take(&mut self.fail_next_frame) {
            return Err(RenderError::Context("injected failure".into()));
        }
        self.record(RenderOp::BeginFrame(display));
        Ok(())
    }

    fn set_scissor(&mut self, _scissor: Option<strata_ipc::Rect>) {}

    fn clear_with_color(&mut self, color: Color) {
        self.record(RenderOp::Clear(color));
    }

    fn fill_region(&mut self, region: &Region, color: Color) {
        self.record(RenderOp::Fill(region.clone(), color));
    }

    fn draw_surface(&mut self, surface: SurfaceId, clip: &Region, alpha: u8, _transform: &Transform) {
        self.record(RenderOp::Draw {
            surface,
            clip: clip.clone(),
            alpha,
        });
    }

    fn set_color_transform(&mut self, matrix: Option<ColorMatrix>) -> Option<ColorMatrix> {
        self.record(RenderOp::ColorTransform(matrix));
        std::mem::replace(&mut self.matrix, matrix)
    }

    fn swap_buffers(&mut self, display: DisplayToken, damage: &Region) -> Result<(), RenderError> {
        self.record(RenderOp::Swap(display, damage.clone()));
        Ok(())
    }

    fn begin_capture(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        self.record(RenderOp::BeginCapture(width, height));
        Ok(())
    }

    fn end_capture(&mut self) {
        self.record(RenderOp::EndCapture);
    }
}

/// Collaborators of a compositor driven by hand from the test thread
pub struct Harness {
    pub ctx: Arc<ServiceContext>,
    pub rx: mpsc::UnboundedReceiver<Message>,
    pub hwc: Arc<RecordingHwc>,
    pub render: RenderLog,
}

/// A service context with recording collaborators and no vsync threads.
/// Invalidate requests dispatch straight into the queue.
pub fn context(
    config: Config,
) -> (Arc<ServiceContext>, mpsc::UnboundedReceiver<Message>, Arc<RecordingHwc>) {
    let (queue, rx) = MessageQueue::new(None);
    let hwc = RecordingHwc::new(WIDTH, HEIGHT);
    let vsync = Arc::new(HwVsync::new(
        Box::new(DispSyncModel::new(&config.vsync)),
        None,
        None,
    ));
    let ctx = Arc::new(ServiceContext::new(
        config,
        queue,
        Arc::clone(&hwc) as Arc<dyn HwComposer>,
        vsync,
        None,
    ));
    (ctx, rx, hwc)
}

pub fn harness(config: Config) -> (Compositor, Harness) {
    let (ctx, rx, hwc) = context(config);
    let (engine, render) = RecordingEngine::new();
    let compositor = Compositor::new(Arc::clone(&ctx), engine);
    (compositor, Harness { ctx, rx, hwc, render })
}

impl Harness {
    /// Handle queued messages until none are left
    pub fn run(&mut self, compositor: &mut Compositor) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.rx.try_recv() {
            compositor.on_message_received(msg);
            handled += 1;
            assert!(handled < 256, "message loop does not settle");
        }
        handled
    }

    /// Connect the primary display and power it on
    pub fn add_primary(&mut self, compositor: &mut Compositor) -> DisplayToken {
        let token = lock(&self.ctx.state).connect_builtin_display(DisplayType::Primary);
        self.ctx.set_transaction_flags(TransactionFlags::DISPLAY_TOPOLOGY);
        self.run(compositor);
        compositor
            .set_power_mode(token, PowerMode::Normal)
            .expect("primary display is connected");
        self.run(compositor);
        token
    }

    /// Add a buffer surface to layer stack 0 and return its producer
    pub fn add_surface(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        z: i32,
        format: PixelFormat,
    ) -> (SurfaceId, FrameProducer) {
        let queue = FrameQueue::new(format);
        let producer = queue.producer();
        let (id, flags) = {
            let mut locked = lock(&self.ctx.state);
            let (id, creation_seq) = locked.alloc_surface_id();
            let mut state = SurfaceState::new(width, height, SurfaceFlags::empty());
            state.z = z;
            let flags = locked.add_surface(SurfaceRecord {
                id,
                client: ClientId(1),
                name: name.into(),
                creation_seq,
                kind: SurfaceKind::Buffer,
                format: queue.format(),
                create_flags: CreateFlags::empty(),
                state,
                content: Some(queue),
            });
            (id, flags)
        };
        self.ctx.set_transaction_flags(flags);
        (id, producer)
    }

    /// Apply edits to the current scene the way a client transaction does
    pub fn apply(&self, displays: &[DisplayChange], surfaces: &[SurfaceChange]) {
        let mut flags = TransactionFlags::empty();
        {
            let mut locked = lock(&self.ctx.state);
            for change in displays {
                flags |= locked.apply_display_change(change);
            }
            for change in surfaces {
                flags |= locked.apply_surface_change(change);
            }
        }
        if !flags.is_empty() {
            self.ctx.set_transaction_flags(flags);
        }
    }

    pub fn take_render(&self) -> Vec<RenderOp> {
        std::mem::take(&mut *lock(&self.render))
    }
}
