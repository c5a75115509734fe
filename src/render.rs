//! GPU render engine collaborator interface.

use strata_ipc::{DisplayToken, Rect, SurfaceId};

use crate::error::RenderError;
use crate::geometry::{Region, Transform};

/// Premultiplied RGBA
pub type Color = [f32; 4];

pub const BLACK: Color = [0.0, 0.0, 0.0, 1.0];
pub const MAGENTA: Color = [1.0, 0.0, 1.0, 1.0];

/// Row-major 4x4 color matrix
pub type ColorMatrix = [f32; 16];

pub trait RenderEngine: Send {
    /// Bind the display's output and set its viewport
    fn begin_frame(&mut self, display: DisplayToken, width: u32, height: u32)
    -> Result<(), RenderError>;

    fn set_scissor(&mut self, scissor: Option<Rect>);

    fn clear_with_color(&mut self, color: Color);

    fn fill_region(&mut self, region: &Region, color: Color);

    /// Draw a surface's latched content, clipped to `clip` (display space)
    fn draw_surface(&mut self, surface: SurfaceId, clip: &Region, alpha: u8, transform: &Transform);

    /// Returns the previous matrix
    fn set_color_transform(&mut self, matrix: Option<ColorMatrix>) -> Option<ColorMatrix>;

    fn swap_buffers(&mut self, display: DisplayToken, damage: &Region) -> Result<(), RenderError>;

    /// Redirect rendering into an offscreen capture target
    fn begin_capture(&mut self, width: u32, height: u32) -> Result<(), RenderError>;

    fn end_capture(&mut self);

    fn composition_complete(&mut self) {}
}
