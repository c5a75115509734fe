//! One refresh cycle, from pre-composition to present feedback.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::time::Duration;

use strata_ipc::SurfaceId;
use tracing::{debug, info, warn};

use super::visibility::{SurfaceFrame, compute_visible_regions};
use super::{CompositionPhase, Compositor};
use crate::clock::{Nsecs, now_nanos};
use crate::display::{DisplayDevice, UpdateGranularity};
use crate::error::RenderError;
use crate::geometry::{Region, Transform};
use crate::hwc::{CompositionType, HWC_DISPLAY_PRIMARY, HwcLayer, WorkList};
use crate::render::{BLACK, ColorMatrix, MAGENTA, RenderEngine};
use crate::state::{SceneState, SurfaceKind, SurfaceRecord};
use crate::sync::lock;

const TRANSPARENT: [f32; 4] = [0.0, 0.0, 0.0, 0.0];

impl Compositor {
    /// Commit, then latch. Returns whether a refresh should follow.
    pub(super) fn handle_message_invalidate(&mut self) -> bool {
        let mut refresh_needed = self.handle_message_transaction();
        refresh_needed |= self.handle_page_flip();
        refresh_needed |= self.ctx.repaint_everything.load(Ordering::Acquire);
        refresh_needed
    }

    pub fn handle_message_refresh(&mut self) {
        let composition = &self.ctx.config.composition;
        let expected_present = self.ctx.vsync.compute_next_refresh(0, now_nanos());
        let frame_missed = self.previous_expected_present != 0
            && (expected_present - self.previous_expected_present).abs()
                <= composition.missed_frame_slack_ns;
        let drop_missed = composition.drop_missed_frames;

        self.pre_composition();

        if frame_missed {
            self.missed_frames += 1;
            if drop_missed {
                debug!("Composition: missed frame, skipping submission");
                self.ctx.repaint_everything();
                self.sample_expected_present();
                self.enter(CompositionPhase::Idle);
                return;
            }
        }

        self.rebuild_layer_stacks();
        self.set_up_hw_composer();
        self.do_debug_flash_regions();
        self.do_composition();
        self.post_composition(expected_present);
        self.sample_expected_present();
        self.enter(CompositionPhase::Idle);
    }

    /// Next vsync as seen at the end of the cycle
    fn sample_expected_present(&mut self) {
        self.previous_expected_present = self.ctx.vsync.compute_next_refresh(0, now_nanos());
    }

    fn pre_composition(&mut self) {
        self.enter(CompositionPhase::PreComposing);
        let needs_extra_invalidate = self
            .drawing
            .surfaces
            .iter()
            .any(|r| r.content.as_ref().is_some_and(|c| c.has_queued_frame()));
        if needs_extra_invalidate {
            self.ctx.signal_layer_update();
        }
    }

    fn rebuild_layer_stacks(&mut self) {
        if !self.visible_regions_dirty {
            return;
        }
        self.enter(CompositionPhase::RecomputingVisibility);
        self.visible_regions_dirty = false;
        self.geometry_invalid = true;

        // Mirrored displays share one pass per layer stack
        let stacks: BTreeSet<u32> = self
            .displays
            .iter()
            .filter(|d| d.is_display_on())
            .map(|d| d.layer_stack)
            .collect();
        let mut results = HashMap::new();
        for stack in stacks {
            let previous = self.coverage.remove(&stack).unwrap_or_default();
            let result =
                compute_visible_regions(&self.drawing.surfaces, &mut self.frames, stack, &previous);
            self.coverage.insert(stack, result.coverage.clone());
            results.insert(stack, result);
        }

        for device in self.displays.iter_mut() {
            let Some(result) = results.get(&device.layer_stack).filter(|_| device.is_display_on())
            else {
                device.visible_surfaces.clear();
                device.secure_layer_visible = false;
                continue;
            };
            let tr = device.global_transform;
            let bounds = device.bounds();

            let mut visible = Vec::new();
            let mut secure = false;
            for record in self.drawing.surfaces.in_layer_stack(device.layer_stack) {
                let Some(frame) = self.frames.get(&record.id) else {
                    continue;
                };
                let drawn = tr
                    .map_region(&frame.visible_non_transparent)
                    .intersect_rect(&bounds);
                if !drawn.is_empty() {
                    visible.push(record.id);
                    secure |= record.is_secure();
                }
            }
            device.visible_surfaces = visible;
            device.secure_layer_visible = secure;
            device.undefined_region = Region::from_rect(bounds).subtract(&tr.map_region(&result.opaque));
            device.dirty_region.or_self(&result.dirty);
        }
    }

    fn set_up_hw_composer(&mut self) {
        self.enter(CompositionPhase::BuildingHardwareWork);
        let repaint_everything = self.ctx.repaint_everything.load(Ordering::Acquire);

        for device in self.displays.iter_mut() {
            let dirty = !device.dirty_region_on_display(repaint_everything).is_empty();
            let empty = device.visible_surfaces.is_empty();
            let was_empty = !device.last_composition_had_visible_layers;
            device.must_recompose = dirty && !(empty && was_empty);
            if device.must_recompose {
                device.last_composition_had_visible_layers = !empty;
            }
        }

        let debug = &self.ctx.debug;
        let skip_all =
            debug.hwc_disabled() || debug.show_updates() > 0 || debug.color_matrix().is_some();
        let geometry_changed = std::mem::take(&mut self.geometry_invalid);

        let mut lists = Vec::new();
        for device in self.displays.iter_mut() {
            let Some(mut list) = device.work_list.take() else {
                continue;
            };
            list.geometry_changed = geometry_changed;
            list.layers = if device.is_display_on() {
                build_hwc_layers(device, &self.drawing, &self.frames, skip_all)
            } else {
                Vec::new()
            };
            // At most one cursor overlay per display
            if let Some(layer) = list.layers.iter_mut().find(|l| {
                self.drawing
                    .surfaces
                    .get(l.surface)
                    .is_some_and(|r| r.is_potential_cursor())
            }) {
                layer.cursor_hint = true;
            }
            lists.push((device.token, list));
        }

        if !lists.is_empty() {
            let mut work: Vec<WorkList> = lists.iter().map(|(_, l)| l.clone()).collect();
            match self.ctx.hwc.prepare(&mut work) {
                Ok(()) => {
                    for ((_, list), prepared) in lists.iter_mut().zip(work) {
                        *list = prepared;
                    }
                }
                Err(e) => {
                    warn!("Hwc: prepare failed, composing on the GPU: {}", e);
                    for (_, list) in &mut lists {
                        list.force_framebuffer();
                    }
                }
            }
        }

        for (token, list) in lists {
            if let Some(device) = self.displays.get_mut(token) {
                device.work_list = Some(list);
            }
        }
    }

    fn do_debug_flash_regions(&mut self) {
        let show_updates = self.ctx.debug.show_updates();
        if show_updates == 0 {
            return;
        }
        let repaint_everything = self.ctx.repaint_everything.load(Ordering::Acquire);
        for device in self.displays.iter() {
            if !device.is_display_on() || !device.must_recompose {
                continue;
            }
            let dirty = device.dirty_region_on_display(repaint_everything);
            if dirty.is_empty() {
                continue;
            }
            let flashed = self
                .engine
                .begin_frame(device.token, device.width, device.height)
                .and_then(|()| {
                    self.engine.fill_region(&dirty, MAGENTA);
                    self.engine.swap_buffers(device.token, &dirty)
                });
            if let Err(e) = flashed {
                warn!("Render: debug flash failed on {:?}: {}", device.token, e);
            }
        }
        if show_updates > 1 {
            std::thread::sleep(Duration::from_millis(show_updates as u64));
        }
    }

    fn do_composition(&mut self) {
        self.enter(CompositionPhase::Composing);
        let repaint_everything = self.ctx.repaint_everything.swap(false, Ordering::AcqRel);
        let color_matrix = self.ctx.debug.color_matrix();

        for token in self.displays.tokens() {
            let Some(device) = self.displays.get_mut(token) else {
                continue;
            };
            if !device.is_display_on() {
                continue;
            }
            let dirty = device.dirty_region_on_display(repaint_everything);
            do_display_composition(
                self.engine.as_mut(),
                device,
                &self.drawing,
                &self.frames,
                color_matrix,
                dirty,
            );
            device.clear_dirty();
            device.flip();
        }
        self.engine.composition_complete();
        self.post_framebuffer();
    }

    fn post_framebuffer(&mut self) {
        let lists: Vec<WorkList> = self
            .displays
            .iter()
            .filter(|d| d.is_display_on())
            .filter_map(|d| d.work_list.clone())
            .collect();
        if !lists.is_empty() {
            if let Err(e) = self.ctx.hwc.commit(&lists) {
                warn!("Hwc: commit failed: {}", e);
            }
        }
        if let Some(rate) = self.flip_rate.tick() {
            info!("Composition: {:.1} flips/s, {} missed", rate, self.missed_frames);
        }
    }

    fn post_composition(&mut self, expected_present: Nsecs) {
        self.enter(CompositionPhase::PostComposing);
        let (primary_hwc, primary_on) = self
            .displays
            .primary()
            .map_or((None, false), |d| (d.hwc_id, d.is_display_on()));
        let fence = primary_hwc.and_then(|id| self.ctx.hwc.display_fence(id));

        for record in self.drawing.surfaces.iter() {
            if let Some(content) = &record.content {
                content.on_post_composition(fence.as_ref());
            }
        }

        if self.ctx.config.vsync.ignore_present_fences {
            if primary_on {
                self.ctx.vsync.enable_hardware_vsync();
            }
        } else if let Some(fence) = fence.clone() {
            self.ctx.vsync.add_present_fence(fence);
        }

        if self.anim_composition_pending {
            self.anim_composition_pending = false;
            let mut locked = lock(&self.ctx.state);
            let tracker = &mut locked.anim_frames;
            tracker.set_desired_present_time(expected_present);
            tracker.set_frame_ready_time(self.last_latch_time);
            match fence {
                Some(fence) => tracker.set_actual_present_fence(fence),
                None => tracker.set_actual_present_time(
                    self.ctx
                        .hwc
                        .refresh_timestamp(primary_hwc.unwrap_or(HWC_DISPLAY_PRIMARY)),
                ),
            }
            tracker.advance_frame();
        }

        if !primary_on {
            return;
        }
        self.frame_buckets
            .record_present(now_nanos(), self.ctx.vsync.period());
    }
}

fn build_hwc_layers(
    device: &DisplayDevice,
    drawing: &SceneState,
    frames: &HashMap<SurfaceId, SurfaceFrame>,
    skip_all: bool,
) -> Vec<HwcLayer> {
    let tr = device.global_transform;
    device
        .visible_surfaces
        .iter()
        .filter_map(|id| {
            let record = drawing.surfaces.get(*id)?;
            let frame = frames.get(id)?;
            Some(hwc_layer(record, frame, &tr, skip_all))
        })
        .collect()
}

fn hwc_layer(record: &SurfaceRecord, frame: &SurfaceFrame, tr: &Transform, skip_all: bool) -> HwcLayer {
    let state = &record.state;
    let to_display = *tr * state.transform();
    HwcLayer {
        surface: record.id,
        display_frame: to_display.map_rect(&state.bounds()),
        source_crop: state.bounds(),
        visible_region: tr.map_region(&frame.visible),
        alpha: state.alpha,
        opaque: frame.is_opaque(record),
        skip: skip_all || record.kind == SurfaceKind::Dim,
        cursor_hint: false,
        composition: CompositionType::Framebuffer,
    }
}

/// Work out the redraw area for the display's update granularity, render
/// it, and swap. Render failures are logged and the frame is dropped.
fn do_display_composition(
    engine: &mut dyn RenderEngine,
    device: &mut DisplayDevice,
    drawing: &SceneState,
    frames: &HashMap<SurfaceId, SurfaceFrame>,
    color_matrix: Option<ColorMatrix>,
    in_dirty: Region,
) {
    if !device.must_recompose {
        return;
    }
    let is_hwc = device.hwc_id.is_some();
    if !is_hwc && in_dirty.is_empty() {
        return;
    }

    device.swap_region.or_self(&in_dirty);
    let dirty = match device.update {
        UpdateGranularity::FullScreen => {
            let full = Region::from_rect(device.bounds());
            device.swap_region = full.clone();
            full
        }
        UpdateGranularity::SingleRect => {
            let rect = Region::from_rect(device.swap_region.bounds());
            device.swap_region = rect.clone();
            rect
        }
        UpdateGranularity::Region => device.swap_region.clone(),
    };

    let result = compose_surfaces(engine, device, drawing, frames, color_matrix, &dirty)
        .and_then(|()| engine.swap_buffers(device.token, &device.swap_region));
    if let Err(e) = result {
        warn!("Render: composition failed on {:?}: {}", device.token, e);
    }
}

fn compose_surfaces(
    engine: &mut dyn RenderEngine,
    device: &DisplayDevice,
    drawing: &SceneState,
    frames: &HashMap<SurfaceId, SurfaceFrame>,
    color_matrix: Option<ColorMatrix>,
    dirty: &Region,
) -> Result<(), RenderError> {
    engine.begin_frame(device.token, device.width, device.height)?;
    let previous_matrix = color_matrix.map(|m| engine.set_color_transform(Some(m)));

    let bounds = device.bounds();
    let tr = device.global_transform;
    let list = device.work_list.as_ref();
    let has_gles = list.is_none_or(|l| l.layers.is_empty() || l.has_framebuffer_composition());
    let has_overlays = list.is_some_and(|l| l.has_overlay_composition());

    if has_gles {
        if has_overlays {
            // Overlays show through wherever the GPU draws nothing
            engine.clear_with_color(TRANSPARENT);
        } else {
            let letterbox = Region::from_rect(bounds).subtract_rect(&device.scissor);
            let wormhole = (&device.undefined_region | &letterbox).intersect(dirty);
            if !wormhole.is_empty() {
                engine.fill_region(&wormhole, BLACK);
            }
        }

        if device.scissor != bounds {
            engine.set_scissor(Some(device.scissor));
        }
        for id in &device.visible_surfaces {
            let (Some(record), Some(frame)) = (drawing.surfaces.get(*id), frames.get(id)) else {
                continue;
            };
            let clip = tr.map_region(&frame.visible).intersect(dirty);
            if clip.is_empty() {
                continue;
            }
            let composition = list
                .and_then(|l| l.composition_of(*id))
                .unwrap_or(CompositionType::Framebuffer);
            if composition == CompositionType::Framebuffer {
                engine.draw_surface(*id, &clip, record.state.alpha, &(tr * record.state.transform()));
            }
        }
        engine.set_scissor(None);
    }

    if let Some(previous) = previous_matrix {
        engine.set_color_transform(previous);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ipc::{DisplayToken, DisplayType, PixelFormat, PowerMode, Rect, SurfaceChange};

    use crate::clock::NSECS_PER_SEC;
    use crate::config::Config;
    use crate::event_loop::Message;
    use crate::state::TransactionFlags;
    use crate::testing::{HEIGHT, Harness, RenderOp, WIDTH, harness};
    use CompositionPhase::*;

    fn full() -> Region {
        Region::from_rect(Rect::from_size(WIDTH as i32, HEIGHT as i32))
    }

    /// Primary display on, one opaque full-screen surface with a frame latched
    fn one_surface(config: Config) -> (Compositor, Harness, DisplayToken, SurfaceId) {
        let (mut c, mut h) = harness(config);
        let token = h.add_primary(&mut c);
        h.take_render();
        let (id, producer) = h.add_surface("app", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        producer.queue_frame(WIDTH, HEIGHT, 0).unwrap();
        h.run(&mut c);
        (c, h, token, id)
    }

    #[test]
    fn test_refresh_composes_latched_surface() {
        let (c, h, token, id) = one_surface(Config::default());
        assert_eq!(
            c.last_cycle(),
            &[PreComposing, RecomputingVisibility, BuildingHardwareWork, Composing, PostComposing, Idle]
        );
        assert_eq!(
            h.take_render(),
            vec![
                RenderOp::BeginFrame(token),
                RenderOp::Draw { surface: id, clip: full(), alpha: 0xff },
                RenderOp::Swap(token, full()),
            ]
        );
        assert_eq!(c.displays().get(token).unwrap().visible_surfaces, vec![id]);
        assert!(h.hwc.log().commits > 0);
    }

    #[test]
    fn test_idle_refresh_draws_nothing() {
        let (mut c, mut h, token, _) = one_surface(Config::default());
        h.take_render();
        let flips = c.displays().get(token).unwrap().page_flip_count;

        h.ctx.signal_refresh();
        h.run(&mut c);
        assert!(h.take_render().is_empty());
        assert_eq!(
            c.last_cycle(),
            &[PreComposing, BuildingHardwareWork, Composing, PostComposing, Idle]
        );
        assert_eq!(c.displays().get(token).unwrap().page_flip_count, flips + 1);
    }

    #[test]
    fn test_shrunk_surface_clears_exposed_background() {
        let (mut c, mut h, token, id) = one_surface(Config::default());
        h.take_render();

        h.apply(&[], &[SurfaceChange::new(id).size(WIDTH / 2, HEIGHT)]);
        h.run(&mut c);

        let right = Region::from_rect(Rect::new(50, 0, 100, 100));
        assert_eq!(
            h.take_render(),
            vec![
                RenderOp::BeginFrame(token),
                RenderOp::Fill(right.clone(), BLACK),
                RenderOp::Swap(token, right.clone()),
            ]
        );
        assert_eq!(c.displays().get(token).unwrap().undefined_region, right);
    }

    #[test]
    fn test_overlay_layers_are_left_to_hardware() {
        let (mut c, mut h) = harness(Config::default());
        h.hwc.log().use_overlays = true;
        let token = h.add_primary(&mut c);
        let (_, producer) = h.add_surface("video", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        producer.queue_frame(WIDTH, HEIGHT, 0).unwrap();
        h.take_render();
        h.run(&mut c);

        assert_eq!(
            h.take_render(),
            vec![RenderOp::BeginFrame(token), RenderOp::Swap(token, full())]
        );
    }

    #[test]
    fn test_prepare_failure_falls_back_to_gpu() {
        let (mut c, mut h) = harness(Config::default());
        {
            let mut log = h.hwc.log();
            log.use_overlays = true;
            log.fail_prepare = true;
        }
        h.add_primary(&mut c);
        let (id, producer) = h.add_surface("video", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        producer.queue_frame(WIDTH, HEIGHT, 0).unwrap();
        h.take_render();
        h.run(&mut c);

        let ops = h.take_render();
        assert!(ops.contains(&RenderOp::Draw { surface: id, clip: full(), alpha: 0xff }));
        assert!(h.hwc.log().prepared.is_empty());
    }

    #[test]
    fn test_color_matrix_forces_gpu_composition() {
        let (mut c, mut h) = harness(Config::default());
        h.hwc.log().use_overlays = true;
        let token = h.add_primary(&mut c);
        let mut matrix = [0.0; 16];
        for i in 0..4 {
            matrix[i * 5] = 0.5;
        }
        *lock(&h.ctx.debug.color_matrix) = Some(matrix);

        let (id, producer) = h.add_surface("app", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        producer.queue_frame(WIDTH, HEIGHT, 0).unwrap();
        h.take_render();
        h.run(&mut c);

        assert_eq!(
            h.take_render(),
            vec![
                RenderOp::BeginFrame(token),
                RenderOp::ColorTransform(Some(matrix)),
                RenderOp::Draw { surface: id, clip: full(), alpha: 0xff },
                RenderOp::ColorTransform(None),
                RenderOp::Swap(token, full()),
            ]
        );
        let log = h.hwc.log();
        assert!(log.prepared.last().unwrap()[0].layers[0].skip);
    }

    #[test]
    fn test_show_updates_flashes_dirty_area_first() {
        let (mut c, mut h) = harness(Config::default());
        h.ctx.debug.show_updates.store(1, Ordering::Relaxed);
        let token = h.add_primary(&mut c);
        let (id, producer) = h.add_surface("app", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        producer.queue_frame(WIDTH, HEIGHT, 0).unwrap();
        h.take_render();
        h.run(&mut c);

        assert_eq!(
            h.take_render(),
            vec![
                RenderOp::BeginFrame(token),
                RenderOp::Fill(full(), MAGENTA),
                RenderOp::Swap(token, full()),
                RenderOp::BeginFrame(token),
                RenderOp::Draw { surface: id, clip: full(), alpha: 0xff },
                RenderOp::Swap(token, full()),
            ]
        );
    }

    #[test]
    fn test_missed_frame_is_dropped_when_configured() {
        let mut config = Config::default();
        config.composition.drop_missed_frames = true;
        config.composition.missed_frame_slack_ns = NSECS_PER_SEC;
        let (mut c, mut h) = harness(config);

        let token = lock(&h.ctx.state).connect_builtin_display(DisplayType::Primary);
        h.ctx.set_transaction_flags(TransactionFlags::DISPLAY_TOPOLOGY);
        let (id, producer) = h.add_surface("app", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        producer.queue_frame(WIDTH, HEIGHT, 0).unwrap();
        c.handle_message_transaction();
        c.set_power_mode(token, PowerMode::Normal).unwrap();
        // Drive the loop by hand; a dropped frame re-arms itself
        while h.rx.try_recv().is_ok() {}

        c.on_message_received(Message::Invalidate);
        let refresh = h.rx.try_recv().unwrap();
        assert!(matches!(refresh, Message::Refresh));
        c.on_message_received(refresh);
        assert!(h
            .take_render()
            .contains(&RenderOp::Draw { surface: id, clip: full(), alpha: 0xff }));
        let commits = h.hwc.log().commits;

        c.handle_message_refresh();
        assert!(h.take_render().is_empty());
        assert_eq!(h.hwc.log().commits, commits);
        assert_eq!(c.missed_frames(), 1);
        assert_eq!(c.last_cycle(), &[PreComposing, Idle]);
        assert!(h.ctx.repaint_everything.load(Ordering::Acquire));
    }

    #[test]
    fn test_overrunning_refresh_counts_as_missed() {
        let mut config = Config::default();
        config.composition.drop_missed_frames = true;
        let (mut c, mut h, _, _) = one_surface(config);
        let period = Duration::from_nanos(crate::testing::PERIOD as u64);

        // An on-time cycle sees a fresh vsync
        std::thread::sleep(period * 2);
        let missed = c.missed_frames();
        c.handle_message_refresh();
        assert_eq!(c.missed_frames(), missed);

        // This one holds the loop for more than two periods
        std::thread::sleep(period * 2);
        h.ctx.debug.show_updates.store(40, Ordering::Relaxed);
        c.handle_message_refresh();
        assert_eq!(c.missed_frames(), missed);
        h.ctx.debug.show_updates.store(0, Ordering::Relaxed);
        h.take_render();

        let commits = h.hwc.log().commits;
        c.handle_message_refresh();
        assert_eq!(c.missed_frames(), missed + 1);
        assert_eq!(c.last_cycle(), &[PreComposing, Idle]);
        assert_eq!(h.hwc.log().commits, commits);
    }

    #[test]
    fn test_surfaces_learn_which_frame_was_presented() {
        let (mut c, mut h) = harness(Config::default());
        h.hwc.log().fences = true;
        h.add_primary(&mut c);
        let (_, producer) = h.add_surface("app", WIDTH, HEIGHT, 0, PixelFormat::Opaque);
        let (_, idle) = h.add_surface("idle", 10, 10, 1, PixelFormat::Opaque);
        let frame = producer.queue_frame(WIDTH, HEIGHT, 0).unwrap();
        h.run(&mut c);

        let presented = producer.last_presented().unwrap();
        assert_eq!(presented.frame_number, frame);
        assert!(presented.fence.unwrap().signal_time().is_some());
        assert!(idle.last_presented().is_none());
    }

    #[test]
    fn test_animation_frame_is_tracked_after_commit() {
        let (mut c, mut h, _, id) = one_surface(Config::default());
        lock(&h.ctx.state).anim_transaction_pending = true;
        h.apply(&[], &[SurfaceChange::new(id).position(1.0, 0.0)]);
        h.run(&mut c);

        let locked = lock(&h.ctx.state);
        assert_eq!(locked.anim_frames.len(), 1);
        assert!(!locked.anim_transaction_pending);
    }

    #[test]
    fn test_powered_off_display_is_not_composed() {
        let (mut c, mut h, token, id) = one_surface(Config::default());
        c.set_power_mode(token, PowerMode::Off).unwrap();
        h.run(&mut c);
        h.take_render();

        h.apply(&[], &[SurfaceChange::new(id).position(10.0, 10.0)]);
        h.run(&mut c);
        assert!(h.take_render().is_empty());
        assert!(c.displays().get(token).unwrap().visible_surfaces.is_empty());
    }
}
