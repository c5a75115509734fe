//! The composer service as clients see it.
//!
//! `Composer` owns the service context and the event loop thread. Every
//! client-facing operation lives here: permission checks and handle
//! validation happen at this boundary, edits go into the current scene
//! under the state lock, and anything that needs the drawing scene is
//! handed to the event loop.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use strata_ipc::{
    ClientId, CreateFlags, DebugCommand, DebugReply, DisplayChange, DisplayInfo, DisplayStatInfo,
    DisplayToken, DisplayType, FrameStats, Orientation, PixelFormat, PowerMode, Rect, SurfaceChange,
    SurfaceFlags, SurfaceId, TransactionRequestFlags,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::buffer::{FrameProducer, FrameQueue, SurfaceContent};
use crate::clock::{NSECS_PER_MSEC, NSECS_PER_SEC, Nsecs, now_nanos};
use crate::compositor::CaptureArgs;
use crate::config::Config;
use crate::context::{Caller, Capability, ComposerEvent, ServiceContext, VsyncPhases};
use crate::error::{ComposerError, Result};
use crate::event_loop::{EngineFactory, EventLoop, MessageQueue};
use crate::hwc::{HWC_DISPLAY_EXTERNAL, HWC_DISPLAY_PRIMARY, HwComposer, HwcDisplayId};
use crate::state::{
    ClientRecord, DisplayState, SurfaceKind, SurfaceRecord, SurfaceState, TransactionFlags,
};
use crate::sync::{lock, wait_timeout};
use crate::vsync::{
    DispSyncModel, EventControlThread, HwVsync, VsyncConsumer, VsyncDistributor, VsyncEvent,
};

pub struct Composer {
    ctx: Arc<ServiceContext>,
    event_loop: Mutex<Option<EventLoop>>,
}

fn spawn_failed(what: &str, err: std::io::Error) -> ComposerError {
    ComposerError::Fatal(format!("failed to spawn {} thread: {}", what, err))
}

fn hwc_display_id(display_type: DisplayType) -> Option<HwcDisplayId> {
    match display_type {
        DisplayType::Primary => Some(HWC_DISPLAY_PRIMARY),
        DisplayType::External => Some(HWC_DISPLAY_EXTERNAL),
        DisplayType::Virtual => None,
    }
}

fn event_loop_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| ComposerError::Fatal(format!("failed to build event loop runtime: {}", e)))
}

impl Composer {
    /// Start the service: vsync threads, the event loop, and the primary
    /// display powered on.
    pub fn start(
        config: Config,
        hwc: Arc<dyn HwComposer>,
        engine_factory: EngineFactory,
    ) -> Result<Self> {
        let runtime = event_loop_runtime()?;
        let (queue, rx) = MessageQueue::new(Some(runtime.handle().clone()));
        let (events, _) = broadcast::channel(256);

        let distributor = VsyncDistributor::spawn().map_err(|e| spawn_failed("vsync", e))?;
        let control = EventControlThread::spawn(Arc::clone(&hwc), HWC_DISPLAY_PRIMARY)
            .map_err(|e| spawn_failed("vsync control", e))?;
        let vsync = Arc::new(HwVsync::new(
            Box::new(DispSyncModel::new(&config.vsync)),
            Some(Arc::clone(&distributor)),
            Some(control),
        ));

        let screen_off = config.vsync.screen_off_interval();
        let app_events = events.clone();
        let app_consumer = VsyncConsumer::spawn(
            "app",
            screen_off,
            Arc::new(move |event: VsyncEvent| {
                let _ = app_events.send(ComposerEvent::AppVsync {
                    timestamp: event.timestamp,
                    count: event.count,
                });
            }),
        )
        .map_err(|e| spawn_failed("app vsync", e))?;

        // The queue reaches the consumer through its requester, so the
        // consumer only holds it weakly
        let weak_queue: Weak<MessageQueue> = Arc::downgrade(&queue);
        let composer_consumer = VsyncConsumer::spawn(
            "composer",
            screen_off,
            Arc::new(move |_| {
                if let Some(queue) = weak_queue.upgrade() {
                    queue.dispatch_invalidate();
                }
            }),
        )
        .map_err(|e| spawn_failed("composer vsync", e))?;

        let app_listener = {
            let consumer = Arc::clone(&app_consumer);
            distributor.add_listener(
                config.vsync.app_phase_offset_ns,
                Arc::new(move |t| consumer.on_vsync(t)),
            )
        };
        let composer_listener = {
            let consumer = Arc::clone(&composer_consumer);
            distributor.add_listener(
                config.vsync.composer_phase_offset_ns,
                Arc::new(move |t| consumer.on_vsync(t)),
            )
        };
        let requester = Arc::clone(&composer_consumer);
        queue.set_vsync_requester(Arc::new(move || requester.request_next_vsync()));

        let phases = VsyncPhases {
            distributor,
            app_listener,
            composer_listener,
            app_consumer,
            composer_consumer,
        };
        let ctx = ServiceContext::new(config, queue, hwc, vsync, Some(phases)).with_events(events);
        Self::launch(Arc::new(ctx), rx, runtime, engine_factory)
    }

    /// Start without vsync threads; every invalidate is dispatched at once
    pub fn start_unpaced(
        config: Config,
        hwc: Arc<dyn HwComposer>,
        engine_factory: EngineFactory,
    ) -> Result<Self> {
        let runtime = event_loop_runtime()?;
        let (queue, rx) = MessageQueue::new(Some(runtime.handle().clone()));
        let vsync = Arc::new(HwVsync::new(
            Box::new(DispSyncModel::new(&config.vsync)),
            None,
            None,
        ));
        let ctx = ServiceContext::new(config, queue, hwc, vsync, None);
        Self::launch(Arc::new(ctx), rx, runtime, engine_factory)
    }

    fn launch(
        ctx: Arc<ServiceContext>,
        rx: tokio::sync::mpsc::UnboundedReceiver<crate::event_loop::Message>,
        runtime: tokio::runtime::Runtime,
        engine_factory: EngineFactory,
    ) -> Result<Self> {
        let event_loop = EventLoop::spawn(Arc::clone(&ctx), rx, runtime, engine_factory)?;
        let composer = Self {
            ctx,
            event_loop: Mutex::new(Some(event_loop)),
        };
        composer.on_hotplug_received(DisplayType::Primary, true);
        composer.initialize_displays()?;
        info!("Composer: started");
        Ok(composer)
    }

    /// Give the primary display its layer stack and projection, then turn it on
    fn initialize_displays(&self) -> Result<()> {
        let token = lock(&self.ctx.state)
            .builtin_display(DisplayType::Primary)
            .ok_or_else(|| ComposerError::Fatal("no primary display".into()))?;
        let change = DisplayChange::new(token).layer_stack(0).projection(
            Orientation::Default,
            Rect::INVALID,
            Rect::INVALID,
        );
        let flags = lock(&self.ctx.state).apply_display_change(&change);
        self.ctx
            .set_transaction_flags(flags | TransactionFlags::DISPLAY_TOPOLOGY);

        self.ctx.queue.post_sync(
            Box::new(move |compositor| {
                compositor.handle_message_transaction();
                if let Err(e) = compositor.set_power_mode(token, PowerMode::Normal) {
                    warn!("Composer: could not power on primary display: {}", e);
                }
            }),
            Duration::ZERO,
        )
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ComposerEvent> {
        self.ctx.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    /// Register a client. `None` when the client table is full.
    pub fn create_connection(&self, caller: &Caller) -> Result<Option<ClientId>> {
        self.ctx.check_permission(caller, Capability::AccessComposer)?;
        let mut locked = lock(&self.ctx.state);
        if locked.clients.len() >= self.ctx.config.composition.max_clients {
            warn!("Composer: client limit reached, refusing pid {}", caller.pid);
            return Ok(None);
        }
        let id = locked.alloc_client_id();
        locked.clients.insert(
            id,
            ClientRecord {
                pid: caller.pid,
                uid: caller.uid,
                surfaces: Default::default(),
            },
        );
        debug!("Composer: client {:?} connected (pid {})", id, caller.pid);
        Ok(Some(id))
    }

    /// Drop a client and every surface it created
    pub fn disconnect_client(&self, client: ClientId) {
        let mut flags = TransactionFlags::empty();
        {
            let mut locked = lock(&self.ctx.state);
            let Some(record) = locked.clients.remove(&client) else {
                return;
            };
            for surface in record.surfaces {
                if let Some(f) = locked.remove_surface(surface) {
                    flags |= f;
                }
            }
        }
        debug!("Composer: client {:?} disconnected", client);
        if !flags.is_empty() {
            self.ctx.set_transaction_flags(flags);
        }
    }

    // ------------------------------------------------------------------
    // Displays
    // ------------------------------------------------------------------

    pub fn create_display(&self, caller: &Caller, name: &str, secure: bool) -> Result<DisplayToken> {
        self.ctx.check_permission(caller, Capability::AccessComposer)?;
        let token = {
            let mut locked = lock(&self.ctx.state);
            let token = locked.alloc_display_token();
            locked
                .current
                .displays
                .insert(token, DisplayState::new(DisplayType::Virtual, name, secure));
            token
        };
        info!("Display: created virtual display {:?} '{}'", token, name);
        self.ctx
            .set_transaction_flags(TransactionFlags::DISPLAY_TOPOLOGY);
        Ok(token)
    }

    /// Only virtual displays can be destroyed
    pub fn destroy_display(&self, caller: &Caller, token: DisplayToken) -> Result<()> {
        self.ctx.check_permission(caller, Capability::AccessComposer)?;
        {
            let mut locked = lock(&self.ctx.state);
            let is_virtual = locked.current.displays.get(&token).map(DisplayState::is_virtual);
            if is_virtual != Some(true) {
                warn!("Display: destroy_display called for non-virtual display {:?}", token);
                return Err(ComposerError::InvalidHandle(format!("display {:?}", token)));
            }
            locked.current.displays.remove(&token);
        }
        info!("Display: destroyed virtual display {:?}", token);
        self.ctx
            .set_transaction_flags(TransactionFlags::DISPLAY_TOPOLOGY);
        Ok(())
    }

    pub fn get_builtin_display(&self, display_type: DisplayType) -> Option<DisplayToken> {
        lock(&self.ctx.state).builtin_display(display_type)
    }

    /// A builtin display appeared or went away
    pub fn on_hotplug_received(&self, display_type: DisplayType, connected: bool) {
        let token = {
            let mut locked = lock(&self.ctx.state);
            if connected {
                if locked.builtin_display(display_type).is_some() {
                    return;
                }
                Some(locked.connect_builtin_display(display_type))
            } else {
                locked.disconnect_builtin_display(display_type)
            }
        };
        let Some(token) = token else {
            return;
        };
        info!(
            "Display: hotplug {:?} {}",
            display_type,
            if connected { "connected" } else { "disconnected" }
        );
        self.ctx.notify(if connected {
            ComposerEvent::DisplayConnected { token, display_type }
        } else {
            ComposerEvent::DisplayDisconnected { token, display_type }
        });
        self.ctx
            .set_transaction_flags(TransactionFlags::DISPLAY_TOPOLOGY);
    }

    pub fn get_display_configs(&self, token: DisplayToken) -> Result<Vec<DisplayInfo>> {
        let (display_type, secure) = {
            let locked = lock(&self.ctx.state);
            let state = locked
                .current
                .displays
                .get(&token)
                .ok_or_else(|| ComposerError::InvalidHandle(format!("display {:?}", token)))?;
            (state.display_type, state.secure)
        };
        let Some(hwc_id) = hwc_display_id(display_type) else {
            return Err(ComposerError::BadValue("virtual displays have no configs".into()));
        };

        let vsync = &self.ctx.config.vsync;
        let density = self.ctx.config.display.density;
        let configs = self
            .ctx
            .hwc
            .configs(hwc_id)
            .into_iter()
            .map(|config| {
                let density = if display_type == DisplayType::Primary && density > 0 {
                    density as f32 / 160.0
                } else {
                    config.xdpi / 160.0
                };
                DisplayInfo {
                    width: config.width,
                    height: config.height,
                    xdpi: config.xdpi,
                    ydpi: config.ydpi,
                    fps: NSECS_PER_SEC as f32 / config.refresh_period.max(1) as f32,
                    density,
                    orientation: Orientation::Default,
                    secure,
                    app_vsync_offset: vsync.app_phase_offset_ns,
                    presentation_deadline: config.refresh_period - vsync.composer_phase_offset_ns
                        + NSECS_PER_MSEC,
                }
            })
            .collect();
        Ok(configs)
    }

    pub fn get_display_stats(&self, token: DisplayToken) -> Result<DisplayStatInfo> {
        if !lock(&self.ctx.state).current.displays.contains_key(&token) {
            return Err(ComposerError::InvalidHandle(format!("display {:?}", token)));
        }
        Ok(DisplayStatInfo {
            vsync_time: self.ctx.vsync.compute_next_refresh(0, now_nanos()),
            vsync_period: self.ctx.vsync.period(),
        })
    }

    pub fn get_active_config(&self, token: DisplayToken) -> Result<i32> {
        self.ctx.queue.call(move |c| c.active_config(token))?
    }

    pub fn set_active_config(&self, token: DisplayToken, mode: i32) -> Result<()> {
        self.ctx.queue.call(move |c| c.set_active_config(token, mode))?
    }

    pub fn set_power_mode(&self, caller: &Caller, token: DisplayToken, mode: PowerMode) -> Result<()> {
        self.ctx.check_permission(caller, Capability::AccessComposer)?;
        self.ctx.queue.call(move |c| c.set_power_mode(token, mode))?
    }

    // ------------------------------------------------------------------
    // Surfaces
    // ------------------------------------------------------------------

    /// Create a surface owned by `client`. Dim surfaces have no producer.
    pub fn create_layer(
        &self,
        client: ClientId,
        name: &str,
        width: i32,
        height: i32,
        format: PixelFormat,
        flags: CreateFlags,
    ) -> Result<(SurfaceId, Option<FrameProducer>)> {
        if width < 0 || height < 0 {
            return Err(ComposerError::BadValue(format!(
                "negative size {}x{} for '{}'",
                width, height, name
            )));
        }

        let mut state_flags = SurfaceFlags::empty();
        if flags.contains(CreateFlags::HIDDEN) {
            state_flags |= SurfaceFlags::HIDDEN;
        }
        if flags.contains(CreateFlags::OPAQUE) {
            state_flags |= SurfaceFlags::OPAQUE;
        }
        if flags.contains(CreateFlags::SECURE) {
            state_flags |= SurfaceFlags::SECURE;
        }

        let (kind, queue) = if flags.contains(CreateFlags::DIM) {
            (SurfaceKind::Dim, None)
        } else {
            let queue = FrameQueue::new(format);
            let ctx = Arc::downgrade(&self.ctx);
            queue.set_frame_listener(Arc::new(move || {
                if let Some(ctx) = ctx.upgrade() {
                    ctx.signal_layer_update();
                }
            }));
            (SurfaceKind::Buffer, Some(queue))
        };

        let (id, transaction) = {
            let mut locked = lock(&self.ctx.state);
            if !locked.clients.contains_key(&client) {
                warn!("Surface: unknown client {:?}", client);
                return Err(ComposerError::InvalidHandle(format!("client {:?}", client)));
            }
            let max = self.ctx.config.composition.max_surfaces;
            if locked.current.surfaces.len() >= max {
                warn!("Surface: limit of {} surfaces reached, refusing '{}'", max, name);
                return Err(ComposerError::ResourceExhausted(format!(
                    "surface limit {} reached",
                    max
                )));
            }
            let (id, creation_seq) = locked.alloc_surface_id();
            let record = SurfaceRecord {
                id,
                client,
                name: name.to_string(),
                creation_seq,
                kind,
                format: format.resolve(),
                create_flags: flags,
                state: SurfaceState::new(width as u32, height as u32, state_flags),
                content: queue
                    .as_ref()
                    .map(|q| Arc::clone(q) as Arc<dyn SurfaceContent>),
            };
            (id, locked.add_surface(record))
        };
        debug!("Surface: created {:?} '{}' {}x{} {:?}", id, name, width, height, kind);
        self.ctx.set_transaction_flags(transaction);
        Ok((id, queue.map(|q| q.producer())))
    }

    pub fn remove_layer(&self, client: ClientId, surface: SurfaceId) -> Result<()> {
        let flags = {
            let mut locked = lock(&self.ctx.state);
            let owned = locked
                .clients
                .get(&client)
                .is_some_and(|c| c.surfaces.contains(&surface));
            if !owned {
                warn!("Surface: {:?} is not owned by {:?}", surface, client);
                return Err(ComposerError::InvalidHandle(format!("surface {:?}", surface)));
            }
            locked.remove_surface(surface)
        };
        match flags {
            Some(flags) => {
                self.ctx.set_transaction_flags(flags);
                Ok(())
            }
            None => Err(ComposerError::InvalidHandle(format!("surface {:?}", surface))),
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Apply a batch of edits to the current scene. Synchronous batches
    /// wait for the commit; an animation batch first waits for the previous
    /// one to be latched.
    pub fn set_transaction_state(
        &self,
        caller: &Caller,
        displays: &[DisplayChange],
        surfaces: &[SurfaceChange],
        flags: TransactionRequestFlags,
    ) -> Result<()> {
        self.ctx.check_permission(caller, Capability::AccessComposer)?;
        let ctx = &self.ctx;
        let synchronous = flags.contains(TransactionRequestFlags::SYNCHRONOUS);
        let animation = flags.contains(TransactionRequestFlags::ANIMATION);

        let mut locked = lock(&ctx.state);

        if animation && locked.anim_transaction_pending {
            let timeout = ctx.config.transactions.animation_timeout();
            let deadline = Instant::now() + timeout;
            while locked.anim_transaction_pending {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!(
                        "Transaction: previous animation frame not latched after {} ms",
                        timeout.as_millis()
                    );
                    locked.anim_transaction_pending = false;
                    break;
                }
                locked = wait_timeout(&ctx.transaction_cv, locked, remaining).0;
            }
        }

        let mut changed = TransactionFlags::empty();
        for change in displays {
            changed |= locked.apply_display_change(change);
        }
        for change in surfaces {
            changed |= locked.apply_surface_change(change);
        }
        if changed.is_empty() {
            return Ok(());
        }

        if synchronous {
            locked.transaction_pending = true;
        }
        if animation {
            locked.anim_transaction_pending = true;
        }
        ctx.set_transaction_flags(changed);

        if !synchronous {
            return Ok(());
        }
        let timeout = ctx.config.transactions.sync_timeout();
        let deadline = Instant::now() + timeout;
        while locked.transaction_pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // The edit stays queued; only the caller gives up waiting
                warn!("Transaction: commit timed out after {} ms", timeout.as_millis());
                locked.transaction_pending = false;
                return Err(ComposerError::TimedOut {
                    what: "transaction commit",
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            locked = wait_timeout(&ctx.transaction_cv, locked, remaining).0;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Capture, stats and diagnostics
    // ------------------------------------------------------------------

    /// Render a display into `target`, or just report the size without one
    pub fn capture_screen(
        &self,
        caller: &Caller,
        args: CaptureArgs,
        target: Option<&FrameProducer>,
    ) -> Result<(u32, u32)> {
        self.ctx.check_permission(caller, Capability::ReadFrameBuffer)?;
        let (width, height) = self.ctx.queue.call(move |c| c.capture_screen(&args))??;
        if let Some(target) = target {
            target.queue_frame(width, height, 0)?;
        }
        Ok((width, height))
    }

    pub fn clear_animation_frame_stats(&self, caller: &Caller) -> Result<()> {
        self.ctx.check_permission(caller, Capability::AccessComposer)?;
        lock(&self.ctx.state).anim_frames.clear();
        Ok(())
    }

    pub fn get_animation_frame_stats(&self, caller: &Caller) -> Result<FrameStats> {
        self.ctx.check_permission(caller, Capability::AccessComposer)?;
        let period: Nsecs = self.ctx.hwc.refresh_period(HWC_DISPLAY_PRIMARY);
        Ok(lock(&self.ctx.state).anim_frames.stats(period))
    }

    pub fn debug_command(&self, caller: &Caller, command: DebugCommand) -> Result<DebugReply> {
        self.ctx.check_permission(caller, Capability::HardwareTest)?;
        crate::debug::execute(&self.ctx, command)
    }

    /// Deliver one app-phase vsync event to subscribers
    pub fn request_next_app_vsync(&self) {
        if let Some(phases) = &self.ctx.phases {
            phases.app_consumer.request_next_vsync();
        }
    }

    /// Hardware vsync interrupt from the display backend
    pub fn on_vsync_received(&self, display: HwcDisplayId, timestamp: Nsecs) {
        if display == HWC_DISPLAY_PRIMARY {
            self.ctx.vsync.on_vsync_received(timestamp);
        }
    }

    pub fn dump(&self) -> Result<String> {
        self.ctx.queue.call(|c| c.dump())
    }

    /// Stop the event loop and the vsync threads. Safe to call twice.
    pub fn shutdown(&self) {
        let Some(mut event_loop) = lock(&self.event_loop).take() else {
            return;
        };
        self.ctx.queue.stop();
        event_loop.join();
        if let Some(phases) = &self.ctx.phases {
            phases.app_consumer.stop();
            phases.composer_consumer.stop();
        }
        self.ctx.vsync.shutdown();
        info!("Composer: stopped");
    }
}

impl Drop for Composer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
