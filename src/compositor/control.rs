//! Display control that must run on the event loop: power, modes and
//! screen capture.

use strata_ipc::{DisplayToken, DisplayType, Orientation, PowerMode, Rect};
use tracing::{debug, error, info, warn};

use super::Compositor;
use crate::error::{ComposerError, Result};
use crate::geometry::{Region, Transform};
use crate::render::BLACK;

/// A screen capture request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureArgs {
    pub display: DisplayToken,
    /// Layer-stack space; empty or invalid means the whole display
    pub crop: Rect,
    /// 0 means the display size
    pub req_width: u32,
    pub req_height: u32,
    pub min_z: i32,
    pub max_z: i32,
    pub use_identity_transform: bool,
    /// 0, 1, 2, 3 for 0, 90, 180, 270 degrees
    pub rotation: i32,
    /// The result leaves this process
    pub remote: bool,
}

impl CaptureArgs {
    pub fn full(display: DisplayToken) -> Self {
        Self {
            display,
            crop: Rect::INVALID,
            req_width: 0,
            req_height: 0,
            min_z: i32::MIN,
            max_z: i32::MAX,
            use_identity_transform: false,
            rotation: 0,
            remote: false,
        }
    }
}

fn capture_orientation(rotation: i32) -> Orientation {
    match rotation {
        0 => Orientation::Default,
        1 => Orientation::Rot90,
        2 => Orientation::Rot180,
        3 => Orientation::Rot270,
        other => {
            error!("Capture: invalid rotation {}, using 0", other);
            Orientation::Default
        }
    }
}

impl Compositor {
    pub fn set_power_mode(&mut self, token: DisplayToken, mode: PowerMode) -> Result<()> {
        let Some(device) = self.displays.get_mut(token) else {
            warn!("Power: unknown display {:?}", token);
            return Err(ComposerError::InvalidHandle(format!("display {:?}", token)));
        };
        let current = device.power_mode;
        if current == mode {
            debug!("Power: {:?} is already {:?}", token, mode);
            return Ok(());
        }
        device.power_mode = mode;
        let display_type = device.display_type;
        let Some(hwc_id) = device.hwc_id.filter(|_| display_type.is_builtin()) else {
            warn!("Power: ignoring power mode for virtual display {:?}", token);
            return Ok(());
        };
        info!("Power: {:?} {:?} -> {:?}", token, current, mode);

        let is_primary = display_type == DisplayType::Primary;
        if current == PowerMode::Off {
            self.apply_hwc_power_mode(hwc_id, mode);
            if is_primary {
                self.set_screen_on(true);
                let period = self.ctx.hwc.refresh_period(hwc_id);
                self.ctx.vsync.resync_to_hardware_vsync(true, period);
            }
            self.visible_regions_dirty = true;
            self.frame_buckets.powered_off();
            self.ctx.repaint_everything();
        } else if mode == PowerMode::Off {
            if is_primary {
                self.ctx.vsync.disable_hardware_vsync(true);
                self.set_screen_on(false);
            }
            self.apply_hwc_power_mode(hwc_id, mode);
            self.visible_regions_dirty = true;
        } else {
            self.apply_hwc_power_mode(hwc_id, mode);
        }
        Ok(())
    }

    fn apply_hwc_power_mode(&self, hwc_id: i32, mode: PowerMode) {
        if let Err(e) = self.ctx.hwc.set_power_mode(hwc_id, mode) {
            warn!("Hwc: set power mode {:?} failed: {}", mode, e);
        }
    }

    fn set_screen_on(&self, on: bool) {
        if let Some(phases) = &self.ctx.phases {
            phases.app_consumer.set_screen_on(on);
            phases.composer_consumer.set_screen_on(on);
        }
    }

    pub fn active_config(&self, token: DisplayToken) -> Result<i32> {
        self.displays
            .get(token)
            .map(|d| d.active_config as i32)
            .ok_or_else(|| ComposerError::InvalidHandle(format!("display {:?}", token)))
    }

    pub fn set_active_config(&mut self, token: DisplayToken, mode: i32) -> Result<()> {
        let Some(device) = self.displays.get_mut(token) else {
            warn!("Config: unknown display {:?}", token);
            return Err(ComposerError::InvalidHandle(format!("display {:?}", token)));
        };
        let Some(hwc_id) = device.hwc_id.filter(|_| device.display_type.is_builtin()) else {
            warn!("Config: cannot change mode of virtual display {:?}", token);
            return Err(ComposerError::BadValue("virtual display".into()));
        };
        let configs = self.ctx.hwc.configs(hwc_id);
        let index = usize::try_from(mode).ok().filter(|i| *i < configs.len());
        let Some(index) = index else {
            return Err(ComposerError::BadValue(format!("mode {} out of range", mode)));
        };
        if device.active_config == index {
            debug!("Config: {:?} already in mode {}", token, mode);
            return Ok(());
        }
        self.ctx.hwc.set_active_config(hwc_id, index)?;
        device.active_config = index;
        let config = configs[index];
        device.set_size(config.width, config.height);
        info!("Config: {:?} now mode {} ({}x{})", token, mode, config.width, config.height);
        Ok(())
    }

    pub fn page_flip_count(&self) -> u64 {
        self.displays.primary().map_or(0, |d| d.page_flip_count)
    }

    /// Render a display's layer stack into an offscreen target.
    /// Returns the captured size.
    pub fn capture_screen(&mut self, args: &CaptureArgs) -> Result<(u32, u32)> {
        self.handle_message_transaction();

        let Some(device) = self.displays.get(args.display) else {
            warn!("Capture: unknown display {:?}", args.display);
            return Err(ComposerError::InvalidHandle(format!("display {:?}", args.display)));
        };
        if device.secure_layer_visible && args.remote {
            warn!("Capture: {:?} shows secure content", args.display);
            return Err(ComposerError::PermissionDenied("secure content visible".into()));
        }

        let orientation = capture_orientation(args.rotation);
        let rotated = matches!(orientation, Orientation::Rot90 | Orientation::Rot270);
        let (mut hw_w, mut hw_h) = (device.width, device.height);
        if rotated {
            std::mem::swap(&mut hw_w, &mut hw_h);
        }
        if args.req_width > hw_w || args.req_height > hw_h {
            return Err(ComposerError::BadValue(format!(
                "capture {}x{} larger than display {}x{}",
                args.req_width, args.req_height, hw_w, hw_h
            )));
        }
        let width = if args.req_width == 0 { hw_w } else { args.req_width };
        let height = if args.req_height == 0 { hw_h } else { args.req_height };

        let bounds = device.bounds();
        let crop = if args.crop.is_valid() && !args.crop.is_empty() {
            args.crop.intersect(&bounds)
        } else {
            bounds
        };
        if crop.is_empty() {
            return Err(ComposerError::BadValue("empty capture crop".into()));
        }

        // Crop to the unrotated target, then rotate into it
        let (out_w, out_h) = if rotated { (height, width) } else { (width, height) };
        let fit = Transform::scale(
            out_w as f32 / crop.width() as f32,
            out_h as f32 / crop.height() as f32,
        ) * Transform::translation(-crop.left as f32, -crop.top as f32);
        let rotation = Transform::for_orientation(orientation, width as i32, height as i32);
        let base = if args.use_identity_transform {
            Transform::identity()
        } else {
            device.global_transform
        };
        let to_target = rotation * fit * base;
        let layer_stack = device.layer_stack;

        self.engine.begin_capture(width, height).map_err(|e| {
            warn!("Capture: no target: {}", e);
            ComposerError::ResourceExhausted(format!("capture target: {}", e))
        })?;
        self.engine.clear_with_color(BLACK);
        let target = Rect::from_size(width as i32, height as i32);
        for record in self.drawing.surfaces.in_layer_stack(layer_stack) {
            let state = &record.state;
            if state.z < args.min_z || state.z > args.max_z {
                continue;
            }
            let Some(frame) = self.frames.get(&record.id) else {
                continue;
            };
            if !frame.is_visible(record) {
                continue;
            }
            let transform = to_target * state.transform();
            let clip = Region::from_rect(transform.map_rect(&state.bounds())).intersect_rect(&target);
            if !clip.is_empty() {
                self.engine.draw_surface(record.id, &clip, state.alpha, &transform);
            }
        }
        self.engine.end_capture();
        debug!("Capture: {:?} {}x{}", args.display, width, height);
        Ok((width, height))
    }
}
