//! Transaction commit: fold the current scene into the drawing scene.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_ipc::{DisplayToken, DisplayType};
use tracing::{debug, info, warn};

use super::Compositor;
use crate::context::ComposerEvent;
use crate::display::DisplayDevice;
use crate::geometry::OrientationFlags;
use crate::hwc::{HWC_DISPLAY_EXTERNAL, HWC_DISPLAY_PRIMARY};
use crate::state::{DisplayState, LockedState, SceneState, TransactionFlags};
use crate::sync::lock;

impl Compositor {
    /// Commit if anything is pending. Returns whether a commit happened.
    pub fn handle_message_transaction(&mut self) -> bool {
        if self.ctx.flags.peek().is_empty() {
            return false;
        }
        self.handle_transaction();
        true
    }

    fn handle_transaction(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        let mut locked = lock(&ctx.state);
        // Taken under the lock so no edit lands between reading and copying
        let flags = ctx.flags.take(TransactionFlags::all());
        self.handle_transaction_locked(&mut locked, flags);
        self.commit_transaction(&mut locked);
        drop(locked);
        ctx.transaction_cv.notify_all();
    }

    fn handle_transaction_locked(&mut self, locked: &mut LockedState, flags: TransactionFlags) {
        if flags.contains(TransactionFlags::TRAVERSAL) {
            self.apply_surface_changes(&locked.current);
        }

        if flags.contains(TransactionFlags::DISPLAY_TOPOLOGY) {
            self.process_display_changes(&locked.current.displays);
        }

        if flags.intersects(TransactionFlags::TRAVERSAL | TransactionFlags::DISPLAY_TOPOLOGY)
            && !self.ctx.debug.transform_hint_disabled()
        {
            self.update_transform_hints(&locked.current);
        }

        if locked.layers_added {
            locked.layers_added = false;
            self.visible_regions_dirty = true;
        }

        if locked.layers_removed {
            locked.layers_removed = false;
            self.visible_regions_dirty = true;
            // What a removed surface showed must be repainted
            let removed: Vec<_> = locked
                .pending_removal
                .iter()
                .filter_map(|record| {
                    let stack = self
                        .drawing
                        .surfaces
                        .get(record.id)
                        .map_or(record.state.layer_stack, |r| r.state.layer_stack);
                    self.frames.get(&record.id).map(|f| (stack, f.visible.clone()))
                })
                .collect();
            for (stack, visible) in removed {
                self.invalidate_layer_stack(stack, &visible);
            }
        }
    }

    fn apply_surface_changes(&mut self, current: &SceneState) {
        for record in current.surfaces.iter() {
            let Some(previous) = self.drawing.surfaces.get(record.id) else {
                continue;
            };
            if Arc::ptr_eq(previous, record) || previous.state == record.state {
                continue;
            }
            let old_stack = previous.state.layer_stack;
            let content_changed = previous.state.sequence != record.state.sequence;

            let frame = self.frames.entry(record.id).or_default();
            if content_changed {
                frame.content_dirty = true;
            }
            if old_stack != record.state.layer_stack {
                let old_visible = frame.visible.clone();
                self.invalidate_layer_stack(old_stack, &old_visible);
            }
            self.visible_regions_dirty = true;
        }
    }

    fn process_display_changes(&mut self, current: &BTreeMap<DisplayToken, DisplayState>) {
        if *current == self.drawing.displays {
            return;
        }
        self.visible_regions_dirty = true;

        let removed: Vec<DisplayToken> = self
            .drawing
            .displays
            .keys()
            .filter(|token| !current.contains_key(token))
            .copied()
            .collect();
        for token in removed {
            self.disconnect_display(token);
        }

        for (token, state) in current {
            let previous = self.drawing.displays.get(token).cloned();
            match previous {
                None => self.connect_display(*token, state),
                Some(previous) if previous == *state => {}
                Some(previous) if previous.surface != state.surface => {
                    // A new sink means a new device
                    self.disconnect_display(*token);
                    self.connect_display(*token, state);
                }
                Some(previous) => {
                    let Some(device) = self.displays.get_mut(*token) else {
                        continue;
                    };
                    if previous.layer_stack != state.layer_stack {
                        device.set_layer_stack(state.layer_stack);
                    }
                    if (previous.width != state.width || previous.height != state.height)
                        && state.width > 0
                        && state.height > 0
                    {
                        device.set_size(state.width, state.height);
                    }
                    if !previous.projection_eq(state) {
                        device.set_projection(state.orientation, state.viewport, state.frame);
                    }
                }
            }
        }
    }

    fn connect_display(&mut self, token: DisplayToken, state: &DisplayState) {
        let device = if state.is_virtual() {
            let Some(surface) = state.surface else {
                debug!("Display: {:?} '{}' has no surface, staying dormant", token, state.name);
                return;
            };
            let (width, height) = if state.width > 0 && state.height > 0 {
                (state.width, state.height)
            } else {
                (surface.width, surface.height)
            };
            let max = self.ctx.config.composition.max_virtual_display_dimension;
            let hwc_id = if max == 0 || (width <= max && height <= max) {
                self.ctx.hwc.allocate_virtual_display(width, height)
            } else {
                None
            };
            DisplayDevice::new(token, state, hwc_id, width, height)
        } else {
            let hwc_id = match state.display_type {
                DisplayType::External => HWC_DISPLAY_EXTERNAL,
                _ => HWC_DISPLAY_PRIMARY,
            };
            let configs = self.ctx.hwc.configs(hwc_id);
            let active = self.ctx.hwc.active_config(hwc_id);
            let Some(config) = configs.get(active) else {
                warn!("Display: no configuration for hardware display {}", hwc_id);
                return;
            };
            let mut device = DisplayDevice::new(token, state, Some(hwc_id), config.width, config.height);
            device.active_config = active;
            device
        };

        info!(
            "Display: connected {:?} '{}' {:?} {}x{} hwc={:?}",
            token, device.name, device.display_type, device.width, device.height, device.hwc_id
        );
        self.displays.insert(device);
    }

    fn disconnect_display(&mut self, token: DisplayToken) {
        let Some(device) = self.displays.remove(token) else {
            return;
        };
        if device.is_virtual() {
            if let Some(hwc_id) = device.hwc_id {
                self.ctx.hwc.free_display(hwc_id);
            }
        }
        self.coverage.retain(|stack, _| self.displays.iter().any(|d| d.layer_stack == *stack));
        info!("Display: disconnected {:?} '{}'", token, device.name);
    }

    /// Tell producers which orientation their content will be shown in
    fn update_transform_hints(&mut self, current: &SceneState) {
        for record in current.surfaces.iter() {
            let hint = self
                .displays
                .display_for_layer_stack(record.state.layer_stack)
                .map_or(OrientationFlags::ROT_0, |d| d.orientation_hint());
            let frame = self.frames.entry(record.id).or_default();
            if frame.transform_hint != hint {
                frame.transform_hint = hint;
                if let Some(content) = &record.content {
                    content.set_transform_hint(hint);
                }
            }
        }
    }

    fn commit_transaction(&mut self, locked: &mut LockedState) {
        for record in locked.pending_removal.drain(..) {
            if let Some(content) = &record.content {
                content.on_removed();
            }
            self.frames.remove(&record.id);
            debug!("Surface: removed {:?} '{}'", record.id, record.name);
            self.ctx.notify(ComposerEvent::SurfaceRemoved { surface: record.id });
        }

        self.anim_composition_pending = locked.anim_transaction_pending;
        self.drawing = locked.current.clone();
        locked.transaction_pending = false;
        locked.anim_transaction_pending = false;
        self.geometry_invalid = true;
    }
}

#[cfg(test)]
mod tests {
    use strata_ipc::{BackingSurface, DisplayChange, Orientation, PixelFormat, Rect, SurfaceChange};

    use super::*;
    use crate::config::Config;
    use crate::testing::{HEIGHT, WIDTH, harness};

    fn add_virtual(ctx: &crate::context::ServiceContext, name: &str) -> DisplayToken {
        let token = {
            let mut locked = lock(&ctx.state);
            let token = locked.alloc_display_token();
            locked
                .current
                .displays
                .insert(token, DisplayState::new(DisplayType::Virtual, name, false));
            token
        };
        ctx.set_transaction_flags(TransactionFlags::DISPLAY_TOPOLOGY);
        token
    }

    #[test]
    fn test_drawing_scene_changes_only_at_commit() {
        let (mut c, mut h) = harness(Config::default());
        h.add_primary(&mut c);
        let (id, _producer) = h.add_surface("app", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        assert!(c.drawing().surfaces.get(id).is_none());

        h.apply(&[], &[SurfaceChange::new(id).z(5).position(3.0, 4.0)]);
        assert!(c.drawing().surfaces.get(id).is_none());

        assert!(c.handle_message_transaction());
        let state = &c.drawing().surfaces.get(id).unwrap().state;
        assert_eq!((state.z, state.x, state.y), (5, 3.0, 4.0));
        assert!(!c.handle_message_transaction());
    }

    #[test]
    fn test_resize_does_not_mark_content_dirty() {
        let (mut c, mut h) = harness(Config::default());
        h.add_primary(&mut c);
        let (id, producer) = h.add_surface("app", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        producer.queue_frame(WIDTH, HEIGHT, 0).unwrap();
        h.run(&mut c);
        assert!(!c.frame(id).unwrap().content_dirty);

        h.apply(&[], &[SurfaceChange::new(id).size(WIDTH / 2, HEIGHT / 2)]);
        assert!(c.handle_message_transaction());
        assert!(!c.frame(id).unwrap().content_dirty);

        h.apply(&[], &[SurfaceChange::new(id).position(1.0, 0.0)]);
        assert!(c.handle_message_transaction());
        assert!(c.frame(id).unwrap().content_dirty);
    }

    #[test]
    fn test_virtual_display_is_dormant_without_surface() {
        let (mut c, mut h) = harness(Config::default());
        h.add_primary(&mut c);
        let token = add_virtual(&h.ctx, "cast");
        h.run(&mut c);
        assert!(!c.displays().contains(token));

        let sink = BackingSurface { id: 9, width: 64, height: 48 };
        h.apply(&[DisplayChange::new(token).surface(Some(sink)).layer_stack(0)], &[]);
        h.run(&mut c);
        let device = c.displays().get(token).unwrap();
        assert_eq!((device.width, device.height), (64, 48));
        assert!(device.hwc_id.is_some());

        h.apply(&[DisplayChange::new(token).surface(None)], &[]);
        h.run(&mut c);
        assert!(!c.displays().contains(token));
        assert_eq!(h.hwc.log().freed.len(), 1);
    }

    #[test]
    fn test_oversized_virtual_display_gets_no_hardware() {
        let mut config = Config::default();
        config.composition.max_virtual_display_dimension = 32;
        let (mut c, mut h) = harness(config);
        let token = add_virtual(&h.ctx, "big");
        let sink = BackingSurface { id: 1, width: 64, height: 16 };
        h.apply(&[DisplayChange::new(token).surface(Some(sink))], &[]);
        h.run(&mut c);
        assert_eq!(c.displays().get(token).unwrap().hwc_id, None);
    }

    #[test]
    fn test_removed_surface_is_dropped_at_commit() {
        let (mut c, mut h) = harness(Config::default());
        h.add_primary(&mut c);
        let mut events = h.ctx.events.subscribe();
        let (id, producer) = h.add_surface("app", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        producer.queue_frame(WIDTH, HEIGHT, 0).unwrap();
        h.run(&mut c);

        let flags = lock(&h.ctx.state).remove_surface(id).unwrap();
        assert!(c.drawing().surfaces.contains(id));
        assert!(events.try_recv().is_err());

        h.ctx.set_transaction_flags(flags);
        h.run(&mut c);
        assert!(!c.drawing().surfaces.contains(id));
        assert!(c.frame(id).is_none());
        assert!(producer.is_abandoned());
        assert_eq!(
            events.try_recv().unwrap(),
            ComposerEvent::SurfaceRemoved { surface: id }
        );
    }

    #[test]
    fn test_transform_hint_follows_display_rotation() {
        let (mut c, mut h) = harness(Config::default());
        let primary = h.add_primary(&mut c);
        let (id, producer) = h.add_surface("app", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        h.run(&mut c);
        assert_eq!(producer.transform_hint(), OrientationFlags::ROT_0);

        h.apply(
            &[DisplayChange::new(primary).projection(Orientation::Rot90, Rect::INVALID, Rect::INVALID)],
            &[],
        );
        h.run(&mut c);
        assert_eq!(producer.transform_hint(), OrientationFlags::ROT_90);
        assert_eq!(c.frame(id).unwrap().transform_hint, OrientationFlags::ROT_90);
    }

    #[test]
    fn test_layer_stack_move_dirties_old_stack() {
        let (mut c, mut h) = harness(Config::default());
        let primary = h.add_primary(&mut c);
        let (id, producer) = h.add_surface("app", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        producer.queue_frame(WIDTH, HEIGHT, 0).unwrap();
        h.run(&mut c);
        h.take_render();

        h.apply(&[], &[SurfaceChange::new(id).layer_stack(3)]);
        h.run(&mut c);
        let device = c.displays().get(primary).unwrap();
        assert!(device.visible_surfaces.is_empty());
        assert_eq!(
            device.undefined_region,
            crate::geometry::Region::from_rect(Rect::from_size(WIDTH as i32, HEIGHT as i32))
        );
        // The old footprint is cleared to black
        assert!(!h.take_render().is_empty());
        assert_eq!(c.drawing().surfaces.get(id).unwrap().state.layer_stack, 3);
    }
}
