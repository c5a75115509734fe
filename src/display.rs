//! Live display devices owned by the event loop.
//!
//! A `DisplayDevice` is created when a display first appears in the drawing
//! scene and carries everything composition needs from frame to frame:
//! the projection, the visible-surface list, and the damage bookkeeping.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use strata_ipc::{DisplayToken, DisplayType, Orientation, PowerMode, Rect, SurfaceId};

use crate::geometry::{OrientationFlags, Region, Transform};
use crate::hwc::{HwcDisplayId, WorkList};
use crate::state::DisplayState;

/// How much of the framebuffer a swap may update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateGranularity {
    FullScreen,
    SingleRect,
    Region,
}

#[derive(Debug)]
pub struct DisplayDevice {
    pub token: DisplayToken,
    pub display_type: DisplayType,
    pub hwc_id: Option<HwcDisplayId>,
    pub name: String,
    pub secure: bool,
    pub width: u32,
    pub height: u32,
    pub layer_stack: u32,
    pub orientation: Orientation,
    pub viewport: Rect,
    pub frame: Rect,
    /// Layer-stack space to display space
    pub global_transform: Transform,
    pub scissor: Rect,
    pub power_mode: PowerMode,
    pub active_config: usize,
    pub update: UpdateGranularity,

    /// Surfaces composed on this display, bottom first
    pub visible_surfaces: Vec<SurfaceId>,
    /// Damage in layer-stack space
    pub dirty_region: Region,
    /// Accumulated damage for the next swap, display space
    pub swap_region: Region,
    /// Display area no opaque surface covers, display space
    pub undefined_region: Region,
    repaint_all: bool,
    pub last_composition_had_visible_layers: bool,
    pub must_recompose: bool,
    pub secure_layer_visible: bool,
    pub page_flip_count: u64,
    pub work_list: Option<WorkList>,
}

impl DisplayDevice {
    pub fn new(
        token: DisplayToken,
        state: &DisplayState,
        hwc_id: Option<HwcDisplayId>,
        width: u32,
        height: u32,
    ) -> Self {
        // Builtin panels start dark; virtual displays are always on
        let power_mode = if state.display_type.is_builtin() {
            PowerMode::Off
        } else {
            PowerMode::Normal
        };
        let update = if state.display_type.is_builtin() {
            UpdateGranularity::Region
        } else {
            UpdateGranularity::FullScreen
        };
        let mut device = Self {
            token,
            display_type: state.display_type,
            hwc_id,
            name: state.name.clone(),
            secure: state.secure,
            width,
            height,
            layer_stack: state.layer_stack,
            orientation: Orientation::Default,
            viewport: Rect::INVALID,
            frame: Rect::INVALID,
            global_transform: Transform::identity(),
            scissor: Rect::from_size(width as i32, height as i32),
            power_mode,
            active_config: 0,
            update,
            visible_surfaces: Vec::new(),
            dirty_region: Region::new(),
            swap_region: Region::new(),
            undefined_region: Region::new(),
            repaint_all: true,
            last_composition_had_visible_layers: false,
            must_recompose: false,
            secure_layer_visible: false,
            page_flip_count: 0,
            work_list: hwc_id.map(WorkList::new),
        };
        device.set_projection(state.orientation, state.viewport, state.frame);
        device
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width as i32, self.height as i32)
    }

    pub fn is_display_on(&self) -> bool {
        self.power_mode != PowerMode::Off
    }

    pub fn is_virtual(&self) -> bool {
        self.display_type == DisplayType::Virtual
    }

    pub fn set_layer_stack(&mut self, layer_stack: u32) {
        self.layer_stack = layer_stack;
        self.repaint_all = true;
    }

    pub fn set_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.set_projection(self.orientation, self.viewport, self.frame);
    }

    /// Map the logical viewport onto the physical frame. Invalid rects
    /// default to the whole display.
    pub fn set_projection(&mut self, orientation: Orientation, viewport: Rect, frame: Rect) {
        let (transform, viewport, frame) = Transform::for_projection(
            orientation,
            viewport,
            frame,
            self.width as i32,
            self.height as i32,
        );
        self.orientation = orientation;
        self.viewport = viewport;
        self.frame = frame;
        self.global_transform = transform;

        let bounds = self.bounds();
        let scissor = transform.map_rect(&viewport).intersect(&bounds);
        self.scissor = if scissor.is_empty() { bounds } else { scissor };
        self.repaint_all = true;
    }

    /// Orientation handed to producers as a transform hint
    pub fn orientation_hint(&self) -> OrientationFlags {
        let orientation = self.global_transform.orientation();
        if orientation.contains(OrientationFlags::ROT_INVALID) {
            OrientationFlags::ROT_0
        } else {
            orientation
        }
    }

    /// Pending damage in display space
    pub fn dirty_region_on_display(&self, repaint_everything: bool) -> Region {
        let bounds = self.bounds();
        if repaint_everything || self.repaint_all {
            return Region::from_rect(bounds);
        }
        self.global_transform
            .map_region(&self.dirty_region)
            .intersect_rect(&bounds)
    }

    /// Repaint the whole display on the next composition
    pub fn invalidate_all(&mut self) {
        self.repaint_all = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_region.clear();
        self.repaint_all = false;
    }

    pub fn flip(&mut self) {
        self.page_flip_count += 1;
        self.swap_region.clear();
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "+ display {:?} '{}' type={:?} hwc={:?} {}x{} layer_stack={} orientation={:?} power={:?} flips={}",
            self.token,
            self.name,
            self.display_type,
            self.hwc_id,
            self.width,
            self.height,
            self.layer_stack,
            self.orientation,
            self.power_mode,
            self.page_flip_count
        );
        let _ = writeln!(
            out,
            "  viewport={:?} frame={:?} scissor={:?} visible={:?} secure_visible={}",
            self.viewport, self.frame, self.scissor, self.visible_surfaces, self.secure_layer_visible
        );
    }
}

/// Active displays, keyed by token
#[derive(Debug, Default)]
pub struct DisplayRegistry {
    devices: BTreeMap<DisplayToken, DisplayDevice>,
}

impl DisplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: DisplayDevice) {
        self.devices.insert(device.token, device);
    }

    pub fn remove(&mut self, token: DisplayToken) -> Option<DisplayDevice> {
        self.devices.remove(&token)
    }

    pub fn get(&self, token: DisplayToken) -> Option<&DisplayDevice> {
        self.devices.get(&token)
    }

    pub fn get_mut(&mut self, token: DisplayToken) -> Option<&mut DisplayDevice> {
        self.devices.get_mut(&token)
    }

    pub fn contains(&self, token: DisplayToken) -> bool {
        self.devices.contains_key(&token)
    }

    pub fn tokens(&self) -> Vec<DisplayToken> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DisplayDevice> {
        self.devices.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DisplayDevice> {
        self.devices.values_mut()
    }

    pub fn primary(&self) -> Option<&DisplayDevice> {
        self.iter().find(|d| d.display_type == DisplayType::Primary)
    }

    pub fn primary_mut(&mut self) -> Option<&mut DisplayDevice> {
        self.iter_mut().find(|d| d.display_type == DisplayType::Primary)
    }

    /// The one display showing `layer_stack`. Mirrored or unshown stacks
    /// fall back to the primary display.
    pub fn display_for_layer_stack(&self, layer_stack: u32) -> Option<&DisplayDevice> {
        let mut showing = self.iter().filter(|d| d.layer_stack == layer_stack);
        match (showing.next(), showing.next()) {
            (Some(only), None) => Some(only),
            _ => self.primary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(display_type: DisplayType, layer_stack: u32) -> DisplayState {
        let mut state = DisplayState::new(display_type, "d", false);
        state.layer_stack = layer_stack;
        state
    }

    #[test]
    fn test_default_projection_covers_display() {
        let device = DisplayDevice::new(DisplayToken(1), &state(DisplayType::Primary, 0), Some(0), 800, 600);
        assert!(device.global_transform.is_identity());
        assert_eq!(device.scissor, Rect::from_size(800, 600));
        assert_eq!(device.power_mode, PowerMode::Off);
        assert!(device.work_list.is_some());
    }

    #[test]
    fn test_rotated_projection_hint() {
        let mut device = DisplayDevice::new(DisplayToken(1), &state(DisplayType::Primary, 0), Some(0), 800, 600);
        device.set_projection(Orientation::Rot90, Rect::INVALID, Rect::INVALID);
        assert_eq!(device.orientation_hint(), OrientationFlags::ROT_90);
        assert_eq!(device.viewport, Rect::from_size(600, 800));
    }

    #[test]
    fn test_dirty_region_is_clipped_and_cleared() {
        let mut device = DisplayDevice::new(DisplayToken(1), &state(DisplayType::Virtual, 0), None, 100, 100);
        assert_eq!(device.power_mode, PowerMode::Normal);
        // A fresh device repaints everything once
        assert_eq!(device.dirty_region_on_display(false), Region::from_rect(device.bounds()));
        device.clear_dirty();
        device.dirty_region = Region::from_rect(Rect::new(50, 50, 150, 150));
        assert_eq!(
            device.dirty_region_on_display(false),
            Region::from_rect(Rect::new(50, 50, 100, 100))
        );
        device.clear_dirty();
        assert!(device.dirty_region_on_display(false).is_empty());
    }

    #[test]
    fn test_mirrored_layer_stack_falls_back_to_primary() {
        let mut registry = DisplayRegistry::new();
        registry.insert(DisplayDevice::new(DisplayToken(1), &state(DisplayType::Primary, 0), Some(0), 10, 10));
        registry.insert(DisplayDevice::new(DisplayToken(2), &state(DisplayType::Virtual, 5), None, 10, 10));
        registry.insert(DisplayDevice::new(DisplayToken(3), &state(DisplayType::Virtual, 7), None, 10, 10));
        registry.insert(DisplayDevice::new(DisplayToken(4), &state(DisplayType::Virtual, 7), None, 10, 10));

        assert_eq!(registry.display_for_layer_stack(5).unwrap().token, DisplayToken(2));
        assert_eq!(registry.display_for_layer_stack(7).unwrap().token, DisplayToken(1));
        assert_eq!(registry.display_for_layer_stack(9).unwrap().token, DisplayToken(1));
    }
}
