//! The service context shared by client threads and the event loop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use strata_ipc::{DisplayToken, DisplayType, SurfaceId};
use tokio::sync::broadcast;
use tracing::warn;

use crate::clock::Nsecs;
use crate::config::{Config, DebugConfig};
use crate::error::{ComposerError, Result};
use crate::event_loop::MessageQueue;
use crate::hwc::HwComposer;
use crate::render::ColorMatrix;
use crate::state::{AtomicTransactionFlags, LockedState, TransactionFlags};
use crate::sync::lock;
use crate::vsync::{HwVsync, ListenerId, VsyncConsumer, VsyncDistributor};

/// Notifications for connected clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposerEvent {
    SurfaceRemoved { surface: SurfaceId },
    DisplayConnected { token: DisplayToken, display_type: DisplayType },
    DisplayDisconnected { token: DisplayToken, display_type: DisplayType },
    AppVsync { timestamp: Nsecs, count: u64 },
}

/// Identity of the process behind a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub pid: u32,
    pub uid: u32,
}

impl Caller {
    /// This process
    pub fn local() -> Self {
        Self {
            pid: std::process::id(),
            // SAFETY: getuid has no preconditions and cannot fail
            uid: unsafe { libc::getuid() },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Display management, power, animation stats
    AccessComposer,
    /// Screen capture
    ReadFrameBuffer,
    /// Debug commands
    HardwareTest,
}

/// Runtime diagnostic switches
#[derive(Debug, Default)]
pub struct DebugSettings {
    pub show_updates: AtomicU32,
    pub disable_hwc: AtomicBool,
    pub force_full_damage: AtomicBool,
    pub disable_transform_hint: AtomicBool,
    pub color_matrix: Mutex<Option<ColorMatrix>>,
}

impl DebugSettings {
    pub fn from_config(config: &DebugConfig) -> Self {
        Self {
            show_updates: AtomicU32::new(config.show_updates),
            disable_hwc: AtomicBool::new(config.disable_hwc),
            force_full_damage: AtomicBool::new(config.force_full_damage),
            disable_transform_hint: AtomicBool::new(config.disable_transform_hint),
            color_matrix: Mutex::new(None),
        }
    }

    pub fn show_updates(&self) -> u32 {
        self.show_updates.load(Ordering::Relaxed)
    }

    pub fn hwc_disabled(&self) -> bool {
        self.disable_hwc.load(Ordering::Relaxed)
    }

    pub fn full_damage(&self) -> bool {
        self.force_full_damage.load(Ordering::Relaxed)
    }

    pub fn transform_hint_disabled(&self) -> bool {
        self.disable_transform_hint.load(Ordering::Relaxed)
    }

    pub fn color_matrix(&self) -> Option<ColorMatrix> {
        *lock(&self.color_matrix)
    }
}

/// Vsync consumers and their distributor registrations
pub struct VsyncPhases {
    pub distributor: Arc<VsyncDistributor>,
    pub app_listener: ListenerId,
    pub composer_listener: ListenerId,
    pub app_consumer: Arc<VsyncConsumer>,
    pub composer_consumer: Arc<VsyncConsumer>,
}

pub struct ServiceContext {
    pub config: Config,
    pub state: Mutex<LockedState>,
    /// Signalled after every commit
    pub transaction_cv: Condvar,
    pub flags: AtomicTransactionFlags,
    pub repaint_everything: AtomicBool,
    pub queue: Arc<MessageQueue>,
    pub hwc: Arc<dyn HwComposer>,
    pub vsync: Arc<HwVsync>,
    pub events: broadcast::Sender<ComposerEvent>,
    pub debug: DebugSettings,
    pub phases: Option<VsyncPhases>,
    /// Uid of the service process; always trusted
    pub service_uid: u32,
}

impl ServiceContext {
    pub fn new(
        config: Config,
        queue: Arc<MessageQueue>,
        hwc: Arc<dyn HwComposer>,
        vsync: Arc<HwVsync>,
        phases: Option<VsyncPhases>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let debug = DebugSettings::from_config(&config.debug);
        Self {
            config,
            state: Mutex::new(LockedState::new()),
            transaction_cv: Condvar::new(),
            flags: AtomicTransactionFlags::new(),
            repaint_everything: AtomicBool::new(false),
            queue,
            hwc,
            vsync,
            events,
            debug,
            phases,
            service_uid: Caller::local().uid,
        }
    }

    /// Use an event channel created before the context, so vsync sinks
    /// built earlier can publish on it
    pub fn with_events(mut self, events: broadcast::Sender<ComposerEvent>) -> Self {
        self.events = events;
        self
    }

    /// Mark transaction work pending and wake the loop if it was idle
    pub fn set_transaction_flags(&self, flags: TransactionFlags) -> TransactionFlags {
        let old = self.flags.set(flags);
        if (old & flags).is_empty() {
            self.queue.invalidate();
        }
        old
    }

    pub fn signal_transaction(&self) {
        self.queue.invalidate();
    }

    /// A surface has new content queued
    pub fn signal_layer_update(&self) {
        self.queue.invalidate();
    }

    pub fn signal_refresh(&self) {
        self.queue.refresh();
    }

    pub fn repaint_everything(&self) {
        self.repaint_everything.store(true, Ordering::Release);
        self.signal_transaction();
    }

    pub fn notify(&self, event: ComposerEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    pub fn check_permission(&self, caller: &Caller, capability: Capability) -> Result<()> {
        if caller.uid == self.service_uid || caller.uid == 0 {
            return Ok(());
        }
        let security = &self.config.security;
        let allowed = match capability {
            Capability::AccessComposer => &security.trusted_uids,
            Capability::ReadFrameBuffer => &security.capture_uids,
            Capability::HardwareTest => &security.debug_uids,
        };
        if allowed.contains(&caller.uid) {
            return Ok(());
        }
        warn!(
            "Permission denial: pid={} uid={} lacks {:?}",
            caller.pid, caller.uid, capability
        );
        Err(ComposerError::PermissionDenied(format!(
            "uid {} lacks {:?}",
            caller.uid, capability
        )))
    }
}
