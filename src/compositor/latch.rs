use std::sync::Arc;

use tracing::trace;

use super::Compositor;
use crate::buffer::SurfaceContent;
use crate::clock::{NSECS_PER_SEC, Nsecs, now_nanos};
use crate::geometry::Region;

/// Frames are held back until the vsync they asked for; a timestamp more
/// than a second out is treated as bogus and shown right away
fn should_present_now(content: &dyn SurfaceContent, expected_present: Nsecs) -> bool {
    let Some(timestamp) = content.head_timestamp() else {
        return false;
    };
    if timestamp == 0 {
        return true;
    }
    let is_due = timestamp < expected_present;
    let is_plausible = timestamp < expected_present + NSECS_PER_SEC;
    is_due || !is_plausible
}

impl Compositor {
    /// Latch the next buffer of every surface whose frame is due.
    /// Returns whether anything was latched.
    pub(super) fn handle_page_flip(&mut self) -> bool {
        let now = now_nanos();
        let expected_present = self.ctx.vsync.compute_next_refresh(0, now);

        let mut frame_queued = false;
        let mut due = Vec::new();
        for record in self.drawing.surfaces.iter() {
            let Some(content) = &record.content else {
                continue;
            };
            if !content.has_queued_frame() {
                continue;
            }
            frame_queued = true;
            if should_present_now(content.as_ref(), expected_present) {
                due.push(Arc::clone(record));
            }
        }

        let full_damage = self.ctx.debug.full_damage();
        let mut latched = false;
        for record in due {
            let Some(buffer) = record.content.as_ref().and_then(|c| c.latch_next_buffer()) else {
                continue;
            };
            trace!("Latch: {:?} frame {}", record.id, buffer.frame_number);

            let frame = self.frames.entry(record.id).or_default();
            let reshaped = frame.active_buffer.as_ref().is_none_or(|old| {
                old.width != buffer.width || old.height != buffer.height || old.opaque != buffer.opaque
            });
            frame.active_buffer = Some(buffer);
            if reshaped {
                self.visible_regions_dirty = true;
            }

            let state = &record.state;
            let dirty = Region::from_rect(state.transform().map_rect(&state.bounds()));
            self.invalidate_layer_stack(state.layer_stack, &dirty);
            if full_damage {
                for device in self.displays.iter_mut() {
                    if device.layer_stack == state.layer_stack {
                        device.invalidate_all();
                    }
                }
            }
            latched = true;
        }

        if latched {
            self.last_latch_time = now;
        } else if frame_queued {
            // Something is queued for a later vsync
            self.ctx.signal_layer_update();
        }
        latched
    }
}
