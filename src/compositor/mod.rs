//! Compositor Module
//!
//! Owns the drawing scene and runs the per-frame pipeline on the event
//! loop thread: commit transactions, latch new buffers, recompute
//! visibility, hand work to the hardware composer, render what it leaves
//! to the GPU, and feed timing back into the vsync model.

mod commit;
mod control;
mod latch;
mod refresh;
pub mod visibility;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use strata_ipc::SurfaceId;
use tracing::trace;

use crate::clock::Nsecs;
use crate::context::ServiceContext;
use crate::display::DisplayRegistry;
use crate::event_loop::{EventMask, Message};
use crate::geometry::Region;
use crate::render::RenderEngine;
use crate::state::SceneState;
use crate::stats::{FlipRate, FrameBuckets};

pub use control::CaptureArgs;
pub use visibility::{SurfaceFrame, VisibilityResult, compute_visible_regions};

/// Steps of one refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionPhase {
    Idle,
    PreComposing,
    RecomputingVisibility,
    BuildingHardwareWork,
    Composing,
    PostComposing,
}

pub struct Compositor {
    ctx: Arc<ServiceContext>,
    engine: Box<dyn RenderEngine>,
    drawing: SceneState,
    displays: DisplayRegistry,
    frames: HashMap<SurfaceId, SurfaceFrame>,
    /// Coverage of the last visibility pass, per layer stack
    coverage: HashMap<u32, Region>,
    visible_regions_dirty: bool,
    /// Hardware work lists must be rebuilt
    geometry_invalid: bool,
    anim_composition_pending: bool,
    previous_expected_present: Nsecs,
    last_latch_time: Nsecs,
    missed_frames: u64,
    frame_buckets: FrameBuckets,
    flip_rate: FlipRate,
    phase: CompositionPhase,
    last_cycle: Vec<CompositionPhase>,
}

impl Compositor {
    pub fn new(ctx: Arc<ServiceContext>, engine: Box<dyn RenderEngine>) -> Self {
        let flip_rate = FlipRate::new(ctx.config.composition.log_frame_stats_period);
        Self {
            ctx,
            engine,
            drawing: SceneState::default(),
            displays: DisplayRegistry::new(),
            frames: HashMap::new(),
            coverage: HashMap::new(),
            visible_regions_dirty: false,
            geometry_invalid: true,
            anim_composition_pending: false,
            previous_expected_present: 0,
            last_latch_time: 0,
            missed_frames: 0,
            frame_buckets: FrameBuckets::new(),
            flip_rate,
            phase: CompositionPhase::Idle,
            last_cycle: Vec::new(),
        }
    }

    pub fn on_message_received(&mut self, msg: Message) {
        match msg {
            Message::Transaction => {
                self.ctx.queue.mark_handled(EventMask::TRANSACTION);
                self.handle_message_transaction();
            }
            Message::Invalidate => {
                self.ctx.queue.mark_handled(EventMask::INVALIDATE);
                if self.handle_message_invalidate() {
                    self.ctx.signal_refresh();
                }
            }
            Message::Refresh => {
                self.ctx.queue.mark_handled(EventMask::REFRESH);
                self.handle_message_refresh();
            }
            Message::Task { task, done } => {
                task(self);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Message::Stop => {}
        }
    }

    fn enter(&mut self, phase: CompositionPhase) {
        trace!("Composition: {:?} -> {:?}", self.phase, phase);
        if phase == CompositionPhase::PreComposing {
            self.last_cycle.clear();
        }
        self.phase = phase;
        self.last_cycle.push(phase);
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    pub fn displays(&self) -> &DisplayRegistry {
        &self.displays
    }

    pub fn drawing(&self) -> &SceneState {
        &self.drawing
    }

    pub fn frame(&self, surface: SurfaceId) -> Option<&SurfaceFrame> {
        self.frames.get(&surface)
    }

    pub fn phase(&self) -> CompositionPhase {
        self.phase
    }

    /// Phases entered by the most recent refresh
    pub fn last_cycle(&self) -> &[CompositionPhase] {
        &self.last_cycle
    }

    pub fn visible_regions_dirty(&self) -> bool {
        self.visible_regions_dirty
    }

    pub fn missed_frames(&self) -> u64 {
        self.missed_frames
    }

    pub fn frame_buckets(&self) -> &FrameBuckets {
        &self.frame_buckets
    }

    /// Add damage to every display showing `layer_stack`
    fn invalidate_layer_stack(&mut self, layer_stack: u32, dirty: &Region) {
        for device in self.displays.iter_mut() {
            if device.layer_stack == layer_stack {
                device.dirty_region.or_self(dirty);
            }
        }
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Visible surfaces ({} in drawing state, {} displays)",
            self.drawing.surfaces.len(),
            self.displays.len()
        );
        for record in self.drawing.surfaces.iter() {
            let frame = self.frames.get(&record.id);
            let _ = writeln!(
                out,
                "+ surface {:?} '{}' stack={} z={} pos=({}, {}) size={}x{} alpha={} flags={:?} visible={:?}",
                record.id,
                record.name,
                record.state.layer_stack,
                record.state.z,
                record.state.x,
                record.state.y,
                record.state.width,
                record.state.height,
                record.state.alpha,
                record.state.flags,
                frame.map(|f| f.visible.bounds())
            );
        }
        for device in self.displays.iter() {
            device.dump(&mut out);
        }
        out.push_str(&self.ctx.vsync.dump());
        let _ = writeln!(
            out,
            "missed frames: {} flip rate: {:.1}/s",
            self.missed_frames,
            self.flip_rate.rate()
        );
        self.frame_buckets.dump(&mut out);
        out
    }
}
