//! Plain records shared between the composer service and its clients.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Opaque display token handed out by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayToken(pub u64);

/// Stable surface handle; never reused for the lifetime of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(pub u64);

/// Client connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

// ============================================================================
// Geometry
// ============================================================================

/// Integer rectangle with exclusive right/bottom edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const EMPTY: Rect = Rect::new(0, 0, 0, 0);
    /// A rect that is neither valid nor empty-but-valid; used for "no crop"
    pub const INVALID: Rect = Rect::new(0, 0, -1, -1);

    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub const fn from_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn is_valid(&self) -> bool {
        self.width() >= 0 && self.height() >= 0
    }

    /// Intersection; `Rect::EMPTY` when the two do not overlap
    pub fn intersect(&self, other: &Rect) -> Rect {
        let r = Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        if r.is_empty() { Rect::EMPTY } else { r }
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Smallest rect containing both; empty inputs are ignored
    pub fn bounding(&self, other: &Rect) -> Rect {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => Rect::EMPTY,
            (true, false) => *other,
            (false, true) => *self,
            (false, false) => Rect::new(
                self.left.min(other.left),
                self.top.min(other.top),
                self.right.max(other.right),
                self.bottom.max(other.bottom),
            ),
        }
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.is_empty()
            || (other.left >= self.left
                && other.top >= self.top
                && other.right <= self.right
                && other.bottom <= self.bottom)
    }

    pub fn offset_by(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.left + dx, self.top + dy, self.right + dx, self.bottom + dy)
    }

    /// Pieces of `self` not covered by `other`; at most four, pairwise disjoint
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        if self.is_empty() {
            return Vec::new();
        }
        let clip = self.intersect(other);
        if clip.is_empty() {
            return vec![*self];
        }
        let mut out = Vec::with_capacity(4);
        if clip.top > self.top {
            out.push(Rect::new(self.left, self.top, self.right, clip.top));
        }
        if clip.bottom < self.bottom {
            out.push(Rect::new(self.left, clip.bottom, self.right, self.bottom));
        }
        if clip.left > self.left {
            out.push(Rect::new(self.left, clip.top, clip.left, clip.bottom));
        }
        if clip.right < self.right {
            out.push(Rect::new(clip.right, clip.top, self.right, clip.bottom));
        }
        out
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width() as i64 * self.height() as i64
        }
    }
}

impl Default for Rect {
    fn default() -> Self {
        Rect::EMPTY
    }
}

/// 2x2 linear part of a surface transform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrix22 {
    pub dsdx: f32,
    pub dtdx: f32,
    pub dsdy: f32,
    pub dtdy: f32,
}

impl Default for Matrix22 {
    fn default() -> Self {
        Self { dsdx: 1.0, dtdx: 0.0, dsdy: 0.0, dtdy: 1.0 }
    }
}

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisplayType {
    Primary,
    External,
    Virtual,
}

impl DisplayType {
    pub fn is_builtin(self) -> bool {
        !matches!(self, DisplayType::Virtual)
    }
}

/// Logical orientation of a display projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Default,
    Rot90,
    Rot180,
    Rot270,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PowerMode {
    Off,
    Doze,
    #[default]
    Normal,
    DozeSuspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Alias: the service picks an opaque format
    Opaque,
    /// Alias: the service picks a format with alpha
    Translucent,
    /// Alias: the service picks a format with alpha
    Transparent,
    Rgba8888,
    Rgbx8888,
    Rgb888,
    Rgb565,
    Bgra8888,
}

impl PixelFormat {
    /// Resolve the opacity aliases to concrete formats
    pub fn resolve(self) -> PixelFormat {
        match self {
            PixelFormat::Transparent | PixelFormat::Translucent => PixelFormat::Rgba8888,
            PixelFormat::Opaque => PixelFormat::Rgbx8888,
            other => other,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(
            self.resolve(),
            PixelFormat::Rgba8888 | PixelFormat::Bgra8888
        )
    }
}

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// Which fields of a `DisplayChange` are meaningful
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DisplayChangeFlags: u32 {
        const SURFACE = 1 << 0;
        const LAYER_STACK = 1 << 1;
        const PROJECTION = 1 << 2;
        const SIZE = 1 << 3;
    }
}

bitflags! {
    /// Which fields of a `SurfaceChange` are meaningful
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SurfaceChangeFlags: u32 {
        const POSITION = 1 << 0;
        const LAYER = 1 << 1;
        const SIZE = 1 << 2;
        const ALPHA = 1 << 3;
        const MATRIX = 1 << 4;
        const TRANSPARENT_REGION = 1 << 5;
        const FLAGS = 1 << 6;
        const LAYER_STACK = 1 << 7;
        const CROP = 1 << 8;
    }
}

bitflags! {
    /// Per-surface state flags settable through transactions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SurfaceFlags: u8 {
        const HIDDEN = 1 << 0;
        const OPAQUE = 1 << 1;
        const SECURE = 1 << 7;
    }
}

bitflags! {
    /// Flags accepted by `createLayer`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CreateFlags: u32 {
        const HIDDEN = 0x0000_0004;
        const SECURE = 0x0000_0080;
        const NON_PREMULTIPLIED = 0x0000_0100;
        const OPAQUE = 0x0000_0400;
        const CURSOR_WINDOW = 0x0000_2000;
        /// Surface is a solid dim layer without buffers
        const DIM = 0x0002_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TransactionRequestFlags: u32 {
        /// Block until the transaction has been committed
        const SYNCHRONOUS = 1 << 0;
        /// Serialize behind the previous animation transaction
        const ANIMATION = 1 << 1;
    }
}

// ============================================================================
// Transaction records
// ============================================================================

/// Identifies the sink backing a virtual display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackingSurface {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

/// A display-level edit inside a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayChange {
    pub token: DisplayToken,
    pub what: DisplayChangeFlags,
    pub surface: Option<BackingSurface>,
    pub layer_stack: u32,
    pub orientation: Orientation,
    pub viewport: Rect,
    pub frame: Rect,
    pub width: u32,
    pub height: u32,
}

impl DisplayChange {
    pub fn new(token: DisplayToken) -> Self {
        Self {
            token,
            what: DisplayChangeFlags::empty(),
            surface: None,
            layer_stack: 0,
            orientation: Orientation::Default,
            viewport: Rect::INVALID,
            frame: Rect::INVALID,
            width: 0,
            height: 0,
        }
    }

    pub fn surface(mut self, surface: Option<BackingSurface>) -> Self {
        self.what |= DisplayChangeFlags::SURFACE;
        self.surface = surface;
        self
    }

    pub fn layer_stack(mut self, layer_stack: u32) -> Self {
        self.what |= DisplayChangeFlags::LAYER_STACK;
        self.layer_stack = layer_stack;
        self
    }

    pub fn projection(mut self, orientation: Orientation, viewport: Rect, frame: Rect) -> Self {
        self.what |= DisplayChangeFlags::PROJECTION;
        self.orientation = orientation;
        self.viewport = viewport;
        self.frame = frame;
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.what |= DisplayChangeFlags::SIZE;
        self.width = width;
        self.height = height;
        self
    }
}

/// A surface-level edit inside a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceChange {
    pub surface: SurfaceId,
    pub what: SurfaceChangeFlags,
    pub x: f32,
    pub y: f32,
    pub z: i32,
    pub width: u32,
    pub height: u32,
    pub alpha: f32,
    pub matrix: Matrix22,
    pub transparent_region: Vec<Rect>,
    pub flags: SurfaceFlags,
    pub mask: SurfaceFlags,
    pub crop: Rect,
    pub layer_stack: u32,
}

impl SurfaceChange {
    pub fn new(surface: SurfaceId) -> Self {
        Self {
            surface,
            what: SurfaceChangeFlags::empty(),
            x: 0.0,
            y: 0.0,
            z: 0,
            width: 0,
            height: 0,
            alpha: 1.0,
            matrix: Matrix22::default(),
            transparent_region: Vec::new(),
            flags: SurfaceFlags::empty(),
            mask: SurfaceFlags::empty(),
            crop: Rect::INVALID,
            layer_stack: 0,
        }
    }

    pub fn position(mut self, x: f32, y: f32) -> Self {
        self.what |= SurfaceChangeFlags::POSITION;
        self.x = x;
        self.y = y;
        self
    }

    pub fn z(mut self, z: i32) -> Self {
        self.what |= SurfaceChangeFlags::LAYER;
        self.z = z;
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.what |= SurfaceChangeFlags::SIZE;
        self.width = width;
        self.height = height;
        self
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.what |= SurfaceChangeFlags::ALPHA;
        self.alpha = alpha;
        self
    }

    pub fn matrix(mut self, matrix: Matrix22) -> Self {
        self.what |= SurfaceChangeFlags::MATRIX;
        self.matrix = matrix;
        self
    }

    pub fn transparent_region(mut self, rects: Vec<Rect>) -> Self {
        self.what |= SurfaceChangeFlags::TRANSPARENT_REGION;
        self.transparent_region = rects;
        self
    }

    pub fn flags(mut self, flags: SurfaceFlags, mask: SurfaceFlags) -> Self {
        self.what |= SurfaceChangeFlags::FLAGS;
        self.flags = flags;
        self.mask = mask;
        self
    }

    pub fn crop(mut self, crop: Rect) -> Self {
        self.what |= SurfaceChangeFlags::CROP;
        self.crop = crop;
        self
    }

    pub fn layer_stack(mut self, layer_stack: u32) -> Self {
        self.what |= SurfaceChangeFlags::LAYER_STACK;
        self.layer_stack = layer_stack;
        self
    }
}

// ============================================================================
// Introspection records
// ============================================================================

/// One display configuration as reported by `getDisplayConfigs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub width: u32,
    pub height: u32,
    pub xdpi: f32,
    pub ydpi: f32,
    pub fps: f32,
    pub density: f32,
    pub orientation: Orientation,
    pub secure: bool,
    pub app_vsync_offset: i64,
    pub presentation_deadline: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayStatInfo {
    pub vsync_time: i64,
    pub vsync_period: i64,
}

/// Animation frame timing history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    pub refresh_period_ns: i64,
    pub desired_present_times: Vec<i64>,
    pub frame_ready_times: Vec<i64>,
    pub actual_present_times: Vec<i64>,
}
