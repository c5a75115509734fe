//! Hardware composer collaborator interface.
//!
//! The composer builds one `WorkList` per display each frame; the hardware
//! composer marks which layers it can take as overlays, and everything left
//! as `Framebuffer` is rendered by the `RenderEngine`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use strata_ipc::{PowerMode, Rect, SurfaceId};

use crate::clock::Nsecs;
use crate::error::HwcError;
use crate::geometry::Region;

pub type HwcDisplayId = i32;

pub const HWC_DISPLAY_PRIMARY: HwcDisplayId = 0;
pub const HWC_DISPLAY_EXTERNAL: HwcDisplayId = 1;

const FENCE_PENDING: i64 = i64::MAX;

/// Signals when a composed frame actually reached the panel
#[derive(Debug, Clone)]
pub struct PresentFence {
    signal_time: Arc<AtomicI64>,
}

impl PresentFence {
    pub fn pending() -> Self {
        Self {
            signal_time: Arc::new(AtomicI64::new(FENCE_PENDING)),
        }
    }

    pub fn signaled(at: Nsecs) -> Self {
        let fence = Self::pending();
        fence.signal(at);
        fence
    }

    pub fn signal(&self, at: Nsecs) {
        self.signal_time.store(at, Ordering::Release);
    }

    pub fn signal_time(&self) -> Option<Nsecs> {
        match self.signal_time.load(Ordering::Acquire) {
            FENCE_PENDING => None,
            t => Some(t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionType {
    /// Rendered by the GPU into the framebuffer target
    Framebuffer,
    Overlay,
    CursorOverlay,
}

/// Per-surface entry of a hardware work list, in display space
#[derive(Debug, Clone)]
pub struct HwcLayer {
    pub surface: SurfaceId,
    pub display_frame: Rect,
    pub source_crop: Rect,
    pub visible_region: Region,
    pub alpha: u8,
    pub opaque: bool,
    /// Hardware must not touch this layer
    pub skip: bool,
    pub cursor_hint: bool,
    pub composition: CompositionType,
}

#[derive(Debug, Clone)]
pub struct WorkList {
    pub display: HwcDisplayId,
    pub layers: Vec<HwcLayer>,
    pub geometry_changed: bool,
}

impl WorkList {
    pub fn new(display: HwcDisplayId) -> Self {
        Self {
            display,
            layers: Vec::new(),
            geometry_changed: true,
        }
    }

    pub fn has_framebuffer_composition(&self) -> bool {
        self.layers
            .iter()
            .any(|l| l.composition == CompositionType::Framebuffer)
    }

    pub fn has_overlay_composition(&self) -> bool {
        self.layers
            .iter()
            .any(|l| l.composition != CompositionType::Framebuffer)
    }

    pub fn composition_of(&self, surface: SurfaceId) -> Option<CompositionType> {
        self.layers
            .iter()
            .find(|l| l.surface == surface)
            .map(|l| l.composition)
    }

    /// Fall back to GPU composition for every layer
    pub fn force_framebuffer(&mut self) {
        for layer in &mut self.layers {
            layer.composition = CompositionType::Framebuffer;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HwcDisplayConfig {
    pub width: u32,
    pub height: u32,
    pub xdpi: f32,
    pub ydpi: f32,
    pub refresh_period: Nsecs,
}

pub trait HwComposer: Send + Sync {
    fn is_connected(&self, display: HwcDisplayId) -> bool;

    /// Reserve a hardware id for a virtual display, if the hardware has one
    fn allocate_virtual_display(&self, width: u32, height: u32) -> Option<HwcDisplayId>;

    fn free_display(&self, display: HwcDisplayId);

    /// Decide composition types for every layer of every list
    fn prepare(&self, lists: &mut [WorkList]) -> Result<(), HwcError>;

    /// Present the prepared lists
    fn commit(&self, lists: &[WorkList]) -> Result<(), HwcError>;

    /// Enable or disable the hardware vsync interrupt
    fn event_control(&self, display: HwcDisplayId, enabled: bool);

    fn refresh_period(&self, display: HwcDisplayId) -> Nsecs;

    /// Timestamp of the most recent refresh
    fn refresh_timestamp(&self, display: HwcDisplayId) -> Nsecs;

    /// Fence for the frame presented by the last commit
    fn display_fence(&self, display: HwcDisplayId) -> Option<PresentFence>;

    fn set_power_mode(&self, display: HwcDisplayId, mode: PowerMode) -> Result<(), HwcError>;

    fn configs(&self, display: HwcDisplayId) -> Vec<HwcDisplayConfig>;

    fn active_config(&self, display: HwcDisplayId) -> usize;

    fn set_active_config(&self, display: HwcDisplayId, mode: usize) -> Result<(), HwcError>;
}
