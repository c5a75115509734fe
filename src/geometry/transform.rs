//! 2-D affine transforms for surfaces and display projections.

use std::ops::Mul;

use bitflags::bitflags;
use strata_ipc::{Matrix22, Orientation, Rect};

use super::Region;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OrientationFlags: u32 {
        const FLIP_H = 1 << 0;
        const FLIP_V = 1 << 1;
        const ROT_90 = 1 << 2;
        const ROT_180 = Self::FLIP_H.bits() | Self::FLIP_V.bits();
        const ROT_270 = Self::ROT_180.bits() | Self::ROT_90.bits();
        const ROT_INVALID = 1 << 7;
    }
}

impl OrientationFlags {
    pub const ROT_0: OrientationFlags = OrientationFlags::empty();

    pub fn from_orientation(orientation: Orientation) -> Self {
        match orientation {
            Orientation::Default => Self::ROT_0,
            Orientation::Rot90 => Self::ROT_90,
            Orientation::Rot180 => Self::ROT_180,
            Orientation::Rot270 => Self::ROT_270,
        }
    }
}

/// x' = dsdx*x + dsdy*y + tx, y' = dtdx*x + dtdy*y + ty
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub dsdx: f32,
    pub dtdx: f32,
    pub dsdy: f32,
    pub dtdy: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub const fn identity() -> Self {
        Self { dsdx: 1.0, dtdx: 0.0, dsdy: 0.0, dtdy: 1.0, tx: 0.0, ty: 0.0 }
    }

    pub fn translation(tx: f32, ty: f32) -> Self {
        Self { tx, ty, ..Self::identity() }
    }

    pub fn scale(sx: f32, sy: f32) -> Self {
        Self { dsdx: sx, dtdy: sy, ..Self::identity() }
    }

    /// Surface transform: linear part from the client matrix, then position
    pub fn from_matrix(matrix: &Matrix22, x: f32, y: f32) -> Self {
        Self {
            dsdx: matrix.dsdx,
            dtdx: matrix.dtdx,
            dsdy: matrix.dsdy,
            dtdy: matrix.dtdy,
            tx: x,
            ty: y,
        }
    }

    /// Rotation from logical into physical space for a `width`x`height`
    /// physical display
    pub fn for_orientation(orientation: Orientation, width: i32, height: i32) -> Self {
        let (w, h) = (width as f32, height as f32);
        match orientation {
            Orientation::Default => Self::identity(),
            Orientation::Rot90 => Self { dsdx: 0.0, dtdx: 1.0, dsdy: -1.0, dtdy: 0.0, tx: w, ty: 0.0 },
            Orientation::Rot180 => Self { dsdx: -1.0, dtdx: 0.0, dsdy: 0.0, dtdy: -1.0, tx: w, ty: h },
            Orientation::Rot270 => Self { dsdx: 0.0, dtdx: -1.0, dsdy: 1.0, dtdy: 0.0, tx: 0.0, ty: h },
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// True when the linear part is a scale or a multiple of 90 degrees,
    /// so axis-aligned rects stay axis-aligned
    pub fn preserves_rects(&self) -> bool {
        (self.dtdx == 0.0 && self.dsdy == 0.0) || (self.dsdx == 0.0 && self.dtdy == 0.0)
    }

    pub fn orientation(&self) -> OrientationFlags {
        if !self.preserves_rects() {
            return OrientationFlags::ROT_INVALID;
        }
        if self.dtdx == 0.0 && self.dsdy == 0.0 {
            let mut flags = OrientationFlags::ROT_0;
            if self.dsdx < 0.0 {
                flags |= OrientationFlags::FLIP_H;
            }
            if self.dtdy < 0.0 {
                flags |= OrientationFlags::FLIP_V;
            }
            return flags;
        }
        match (self.dtdx > 0.0, self.dsdy > 0.0) {
            (true, false) => OrientationFlags::ROT_90,
            (false, true) => OrientationFlags::ROT_270,
            (true, true) => OrientationFlags::ROT_90 | OrientationFlags::FLIP_V,
            (false, false) => OrientationFlags::ROT_90 | OrientationFlags::FLIP_H,
        }
    }

    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.dsdx * x + self.dsdy * y + self.tx,
            self.dtdx * x + self.dtdy * y + self.ty,
        )
    }

    /// Bounding box of the transformed rect
    pub fn map_rect(&self, rect: &Rect) -> Rect {
        if rect.is_empty() {
            return Rect::EMPTY;
        }
        let corners = [
            self.map_point(rect.left as f32, rect.top as f32),
            self.map_point(rect.right as f32, rect.top as f32),
            self.map_point(rect.left as f32, rect.bottom as f32),
            self.map_point(rect.right as f32, rect.bottom as f32),
        ];
        let (mut l, mut t) = (f32::MAX, f32::MAX);
        let (mut r, mut b) = (f32::MIN, f32::MIN);
        for (x, y) in corners {
            l = l.min(x);
            t = t.min(y);
            r = r.max(x);
            b = b.max(y);
        }
        Rect::new(
            (l + 0.5).floor() as i32,
            (t + 0.5).floor() as i32,
            (r + 0.5).floor() as i32,
            (b + 0.5).floor() as i32,
        )
    }

    /// Exact when rects are preserved, otherwise the transformed bounds
    pub fn map_region(&self, region: &Region) -> Region {
        if self.is_identity() {
            return region.clone();
        }
        if self.preserves_rects() {
            region
                .rects()
                .iter()
                .fold(Region::new(), |acc, r| acc.union_rect(&self.map_rect(r)))
        } else {
            Region::from_rect(self.map_rect(&region.bounds()))
        }
    }

    /// Logical viewport to physical frame, then rotated into the panel's
    /// native orientation
    pub fn for_projection(
        orientation: Orientation,
        viewport: Rect,
        frame: Rect,
        width: i32,
        height: i32,
    ) -> (Self, Rect, Rect) {
        let rotation = Self::for_orientation(orientation, width, height);
        let rotated = matches!(orientation, Orientation::Rot90 | Orientation::Rot270);

        let frame = if frame.is_valid() {
            frame
        } else if rotated {
            Rect::from_size(height, width)
        } else {
            Rect::from_size(width, height)
        };
        let viewport = if viewport.is_empty() {
            if rotated {
                Rect::from_size(height, width)
            } else {
                Rect::from_size(width, height)
            }
        } else {
            viewport
        };

        let scale = if viewport.width() != frame.width() || viewport.height() != frame.height() {
            Self::scale(
                frame.width() as f32 / viewport.width() as f32,
                frame.height() as f32 / viewport.height() as f32,
            )
        } else {
            Self::identity()
        };
        let to_origin = Self::translation(-viewport.left as f32, -viewport.top as f32);
        let to_frame = Self::translation(frame.left as f32, frame.top as f32);

        (rotation * to_frame * scale * to_origin, viewport, frame)
    }
}

impl Mul for Transform {
    type Output = Transform;

    /// `(a * b)` applies `b` first
    fn mul(self, b: Transform) -> Transform {
        let a = self;
        Transform {
            dsdx: a.dsdx * b.dsdx + a.dsdy * b.dtdx,
            dtdx: a.dtdx * b.dsdx + a.dtdy * b.dtdx,
            dsdy: a.dsdx * b.dsdy + a.dsdy * b.dtdy,
            dtdy: a.dtdx * b.dsdy + a.dtdy * b.dtdy,
            tx: a.dsdx * b.tx + a.dsdy * b.ty + a.tx,
            ty: a.dtdx * b.tx + a.dtdy * b.ty + a.ty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_moves_rect() {
        let t = Transform::translation(10.0, 20.0);
        assert_eq!(t.map_rect(&Rect::from_size(5, 5)), Rect::new(10, 20, 15, 25));
        assert_eq!(t.orientation(), OrientationFlags::ROT_0);
    }

    #[test]
    fn test_rotation_maps_logical_to_physical() {
        // Portrait panel 100x200 shown in landscape
        let t = Transform::for_orientation(Orientation::Rot90, 100, 200);
        assert_eq!(t.map_rect(&Rect::from_size(200, 100)), Rect::from_size(100, 200));
        assert_eq!(t.orientation(), OrientationFlags::ROT_90);

        let t = Transform::for_orientation(Orientation::Rot270, 100, 200);
        assert_eq!(t.map_rect(&Rect::from_size(200, 100)), Rect::from_size(100, 200));
        assert_eq!(t.orientation(), OrientationFlags::ROT_270);
    }

    #[test]
    fn test_free_rotation_is_invalid_orientation() {
        let m = Matrix22 { dsdx: 0.7071, dtdx: 0.7071, dsdy: -0.7071, dtdy: 0.7071 };
        let t = Transform::from_matrix(&m, 0.0, 0.0);
        assert!(!t.preserves_rects());
        assert_eq!(t.orientation(), OrientationFlags::ROT_INVALID);
        let region = Region::from_rect(Rect::from_size(10, 10));
        assert_eq!(t.map_region(&region).rects().len(), 1);
    }

    #[test]
    fn test_composition_order() {
        let a = Transform::translation(5.0, 0.0);
        let b = Transform::scale(2.0, 2.0);
        assert_eq!((a * b).map_point(1.0, 1.0), (7.0, 2.0));
        assert_eq!((b * a).map_point(1.0, 1.0), (12.0, 2.0));
    }

    #[test]
    fn test_projection_scales_viewport_into_frame() {
        let (t, viewport, frame) = Transform::for_projection(
            Orientation::Default,
            Rect::from_size(50, 50),
            Rect::new(0, 0, 100, 100),
            100,
            100,
        );
        assert_eq!(viewport, Rect::from_size(50, 50));
        assert_eq!(frame, Rect::from_size(100, 100));
        assert_eq!(t.map_rect(&Rect::new(25, 25, 50, 50)), Rect::new(50, 50, 100, 100));
    }

    #[test]
    fn test_unset_projection_is_identity() {
        let (t, _, _) =
            Transform::for_projection(Orientation::Default, Rect::INVALID, Rect::INVALID, 64, 32);
        assert!(t.is_identity());
    }
}
