//! Visible-region computation.
//!
//! Walks one layer stack front to back, accumulating the opaque and covered
//! areas of everything above, and derives for each surface what is visible,
//! what is covered, and what has to be redrawn.

use std::collections::HashMap;

use strata_ipc::SurfaceId;

use crate::buffer::BufferFrame;
use crate::geometry::{OrientationFlags, Region};
use crate::state::{SurfaceKind, SurfaceList, SurfaceRecord};

/// Per-surface data owned by the event loop
#[derive(Debug, Clone, Default)]
pub struct SurfaceFrame {
    /// Layer-stack space
    pub visible: Region,
    pub covered: Region,
    pub visible_non_transparent: Region,
    /// Redraw the whole visible area on the next pass
    pub content_dirty: bool,
    pub active_buffer: Option<BufferFrame>,
    pub transform_hint: OrientationFlags,
}

impl SurfaceFrame {
    pub fn is_visible(&self, record: &SurfaceRecord) -> bool {
        let state = &record.state;
        if state.is_hidden() || state.alpha == 0 {
            return false;
        }
        match record.kind {
            SurfaceKind::Dim => true,
            SurfaceKind::Buffer => self.active_buffer.is_some(),
        }
    }

    pub fn is_opaque(&self, record: &SurfaceRecord) -> bool {
        match (&record.kind, &self.active_buffer) {
            (SurfaceKind::Buffer, Some(buffer)) => {
                buffer.opaque || record.state.flags.contains(strata_ipc::SurfaceFlags::OPAQUE)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibilityResult {
    /// Area to redraw, layer-stack space
    pub dirty: Region,
    /// Union of opaque surface areas
    pub opaque: Region,
    /// Union of all surface footprints
    pub coverage: Region,
}

/// Recompute visibility for every surface in `layer_stack`.
///
/// `previous_coverage` is the `coverage` of the last pass over the same
/// stack; area that was covered then and no longer is gets dirtied so the
/// exposed background is cleared.
pub fn compute_visible_regions(
    surfaces: &SurfaceList,
    frames: &mut HashMap<SurfaceId, SurfaceFrame>,
    layer_stack: u32,
    previous_coverage: &Region,
) -> VisibilityResult {
    let mut above_opaque = Region::new();
    let mut above_covered = Region::new();
    let mut out_dirty = Region::new();

    for record in surfaces.in_layer_stack(layer_stack).rev() {
        let frame = frames.entry(record.id).or_default();
        let state = &record.state;
        let transform = state.transform();

        let mut visible = Region::new();
        let mut opaque = Region::new();
        let mut transparent = Region::new();

        if frame.is_visible(record) {
            let translucent = !frame.is_opaque(record);
            visible = Region::from_rect(transform.map_rect(&state.bounds()));
            if !visible.is_empty() {
                if translucent {
                    // A rotated hint would no longer be a set of rects
                    if transform.preserves_rects() {
                        transparent = transform.map_region(&state.transparent_region);
                    }
                }
                let orientation = transform.orientation();
                if state.alpha == 0xff
                    && !translucent
                    && !orientation.contains(OrientationFlags::ROT_INVALID)
                {
                    opaque = visible.clone();
                }
            }
        }

        let covered = above_covered.intersect(&visible);
        above_covered.or_self(&visible);
        visible.subtract_self(&above_opaque);

        let mut dirty = if frame.content_dirty {
            frame.content_dirty = false;
            visible.union(&frame.visible)
        } else {
            let new_exposed = &visible - &covered;
            let old_exposed = &frame.visible - &frame.covered;
            &visible.intersect(&frame.covered) | &(&new_exposed - &old_exposed)
        };
        dirty.subtract_self(&above_opaque);
        out_dirty.or_self(&dirty);
        above_opaque.or_self(&opaque);

        frame.visible_non_transparent = &visible - &transparent;
        frame.visible = visible;
        frame.covered = covered;
    }

    out_dirty.or_self(&(previous_coverage - &above_covered));

    VisibilityResult {
        dirty: out_dirty,
        opaque: above_opaque,
        coverage: above_covered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_ipc::{ClientId, CreateFlags, PixelFormat, Rect, SurfaceFlags};

    use crate::state::SurfaceState;

    struct Scene {
        surfaces: SurfaceList,
        frames: HashMap<SurfaceId, SurfaceFrame>,
        coverage: Region,
        next: u64,
    }

    impl Scene {
        fn new() -> Self {
            Self {
                surfaces: SurfaceList::new(),
                frames: HashMap::new(),
                coverage: Region::new(),
                next: 1,
            }
        }

        fn add(&mut self, z: i32, bounds: Rect, opaque: bool) -> SurfaceId {
            let id = SurfaceId(self.next);
            self.next += 1;
            let mut state = SurfaceState::new(bounds.width() as u32, bounds.height() as u32, SurfaceFlags::empty());
            state.x = bounds.left as f32;
            state.y = bounds.top as f32;
            state.z = z;
            self.surfaces.add(Arc::new(SurfaceRecord {
                id,
                client: ClientId(1),
                name: format!("s{}", id.0),
                creation_seq: id.0,
                kind: SurfaceKind::Buffer,
                format: PixelFormat::Rgba8888,
                create_flags: CreateFlags::empty(),
                state,
                content: None,
            }));
            self.frames.insert(
                id,
                SurfaceFrame {
                    content_dirty: true,
                    active_buffer: Some(BufferFrame {
                        width: bounds.width() as u32,
                        height: bounds.height() as u32,
                        opaque,
                        timestamp: 0,
                        frame_number: 1,
                    }),
                    ..Default::default()
                },
            );
            id
        }

        fn edit(&mut self, id: SurfaceId, f: impl FnOnce(&mut SurfaceState)) {
            self.surfaces.update(id, |r| f(&mut r.state));
        }

        fn pass(&mut self) -> VisibilityResult {
            let result = compute_visible_regions(&self.surfaces, &mut self.frames, 0, &self.coverage);
            self.coverage = result.coverage.clone();
            result
        }

        fn visible(&self, id: SurfaceId) -> &Region {
            &self.frames[&id].visible
        }
    }

    const SCREEN: Rect = Rect::new(0, 0, 1080, 1920);

    #[test]
    fn test_opaque_surface_hides_everything_below() {
        let mut scene = Scene::new();
        let a = scene.add(0, SCREEN, true);
        let b = scene.add(1, SCREEN, true);
        let result = scene.pass();

        assert!(scene.visible(a).is_empty());
        assert_eq!(scene.visible(b), &Region::from_rect(SCREEN));
        assert_eq!(scene.frames[&a].covered, Region::from_rect(SCREEN));
        assert_eq!(result.opaque, Region::from_rect(SCREEN));
    }

    #[test]
    fn test_disjoint_surfaces_are_fully_visible_and_dirty() {
        let mut scene = Scene::new();
        let left = Rect::new(0, 0, 100, 100);
        let right = Rect::new(200, 0, 300, 100);
        let a = scene.add(0, left, true);
        let b = scene.add(1, right, true);
        let result = scene.pass();

        assert_eq!(scene.visible(a), &Region::from_rect(left));
        assert_eq!(scene.visible(b), &Region::from_rect(right));
        assert_eq!(result.dirty, Region::from_rects(&[left, right]));
    }

    #[test]
    fn test_shrink_dirties_the_exposed_area() {
        let mut scene = Scene::new();
        let a = scene.add(0, Rect::from_size(100, 100), false);
        scene.pass();

        scene.edit(a, |s| {
            s.width = 50;
            s.height = 50;
        });
        assert!(!scene.frames[&a].content_dirty);
        let result = scene.pass();

        let exposed = &Region::from_rect(Rect::from_size(100, 100)) - &Region::from_rect(Rect::from_size(50, 50));
        assert!(!result.dirty.is_empty());
        assert_eq!(result.dirty.intersect(&exposed), exposed);
    }

    #[test]
    fn test_uncovered_area_becomes_dirty() {
        let mut scene = Scene::new();
        let a = scene.add(0, Rect::from_size(100, 100), true);
        let b = scene.add(1, Rect::from_size(50, 50), true);
        scene.pass();
        assert_eq!(scene.frames[&a].covered, Region::from_rect(Rect::from_size(50, 50)));

        scene.edit(b, |s| s.x = 200.0);
        let result = scene.pass();
        assert!(result.dirty.intersect_rect(&Rect::from_size(50, 50)) == Region::from_rect(Rect::from_size(50, 50)));
    }

    #[test]
    fn test_translucent_hint_and_alpha() {
        let mut scene = Scene::new();
        let below = scene.add(0, Rect::from_size(100, 100), true);
        let top = scene.add(1, Rect::from_size(100, 100), false);
        scene.edit(top, |s| s.transparent_region = Region::from_rect(Rect::new(0, 0, 100, 50)));
        scene.pass();

        // Translucent surfaces do not occlude
        assert_eq!(scene.visible(below), &Region::from_rect(Rect::from_size(100, 100)));
        assert_eq!(
            scene.frames[&top].visible_non_transparent,
            Region::from_rect(Rect::new(0, 50, 100, 100))
        );

        // Partial alpha on an opaque buffer does not occlude either
        let mut scene = Scene::new();
        let below = scene.add(0, Rect::from_size(100, 100), true);
        let top = scene.add(1, Rect::from_size(100, 100), true);
        scene.edit(top, |s| s.alpha = 0x80);
        let result = scene.pass();
        assert!(!scene.visible(below).is_empty());
        assert!(result.opaque.intersect(&Region::from_rect(Rect::from_size(100, 100))) == Region::from_rect(Rect::from_size(100, 100)));
    }

    #[test]
    fn test_visible_never_intersects_opaque_above() {
        let mut scene = Scene::new();
        let rects = [
            Rect::new(0, 0, 400, 400),
            Rect::new(100, 100, 300, 600),
            Rect::new(250, 0, 500, 200),
            Rect::new(50, 350, 450, 450),
            Rect::new(0, 0, 120, 120),
        ];
        let ids: Vec<_> = rects
            .iter()
            .enumerate()
            .map(|(i, r)| scene.add(i as i32, *r, i % 2 == 0))
            .collect();
        scene.edit(ids[3], |s| s.flags = SurfaceFlags::HIDDEN);
        scene.pass();

        for (i, id) in ids.iter().enumerate() {
            let mut opaque_above = Region::new();
            for (j, above) in ids.iter().enumerate().skip(i + 1) {
                let record = scene.surfaces.get(*above).unwrap();
                let frame = &scene.frames[above];
                if frame.is_visible(record) && frame.is_opaque(record) && j % 2 == 0 {
                    opaque_above.or_self(&Region::from_rect(rects[j]));
                }
            }
            assert!(
                !scene.visible(*id).intersects(&opaque_above),
                "surface {} visible under an opaque surface",
                i
            );
        }
        assert!(scene.visible(ids[3]).is_empty());
    }

    #[test]
    fn test_repeat_pass_is_stable() {
        let mut scene = Scene::new();
        let a = scene.add(0, Rect::from_size(300, 300), true);
        let b = scene.add(1, Rect::new(100, 100, 200, 200), false);
        scene.pass();
        let visible = (scene.visible(a).clone(), scene.visible(b).clone());
        let covered = (scene.frames[&a].covered.clone(), scene.frames[&b].covered.clone());

        let second = scene.pass();
        let third = scene.pass();
        assert_eq!((scene.visible(a).clone(), scene.visible(b).clone()), visible);
        assert_eq!((scene.frames[&a].covered.clone(), scene.frames[&b].covered.clone()), covered);
        assert_eq!(second, third);
        assert!(!scene.frames[&a].content_dirty);
    }

    #[test]
    fn test_other_layer_stacks_are_ignored() {
        let mut scene = Scene::new();
        let a = scene.add(0, Rect::from_size(10, 10), true);
        let b = scene.add(1, Rect::from_size(10, 10), true);
        scene.edit(b, |s| s.layer_stack = 1);
        scene.pass();
        assert_eq!(scene.visible(a), &Region::from_rect(Rect::from_size(10, 10)));
        assert!(scene.visible(b).is_empty());
    }
}
