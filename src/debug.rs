//! Runtime diagnostics reachable through the debug command channel.

use std::sync::atomic::Ordering;

use strata_ipc::{DebugCommand, DebugReply};
use tracing::info;

use crate::context::ServiceContext;
use crate::error::{ComposerError, Result};
use crate::state::TransactionFlags;
use crate::sync::lock;

pub fn execute(ctx: &ServiceContext, command: DebugCommand) -> Result<DebugReply> {
    info!("Debug: {:?}", command);
    let debug = &ctx.debug;
    match command {
        DebugCommand::ShowUpdates { value } => {
            // 0 or no value toggles
            let next = match value {
                Some(n) if n != 0 => n,
                _ if debug.show_updates() != 0 => 0,
                _ => 1,
            };
            debug.show_updates.store(next, Ordering::Relaxed);
            ctx.repaint_everything();
        }
        DebugCommand::RepaintEverything => ctx.repaint_everything(),
        DebugCommand::ForceTransaction => {
            ctx.set_transaction_flags(TransactionFlags::all());
        }
        DebugCommand::SendRefresh => ctx.signal_refresh(),
        DebugCommand::DisableHwc { disable } => {
            debug.disable_hwc.store(disable, Ordering::Relaxed);
            ctx.repaint_everything();
        }
        DebugCommand::DisableTransformHint { disable } => {
            debug.disable_transform_hint.store(disable, Ordering::Relaxed);
        }
        DebugCommand::Interrogate => {
            return Ok(DebugReply::Interrogate {
                show_updates: debug.show_updates(),
                disable_hwc: debug.hwc_disabled(),
                disable_transform_hint: debug.transform_hint_disabled(),
                force_full_damage: debug.full_damage(),
            });
        }
        DebugCommand::PageFlipCount => {
            let count = ctx.queue.call(|c| c.page_flip_count())?;
            return Ok(DebugReply::PageFlipCount { count });
        }
        DebugCommand::ColorMatrix { matrix } => {
            *lock(&debug.color_matrix) = matrix;
            ctx.repaint_everything();
        }
        DebugCommand::RefreshSkipCount { count } => {
            ctx.vsync.set_refresh_skip_count(count.max(0));
        }
        DebugCommand::ForceFullDamage { enabled } => {
            debug.force_full_damage.store(enabled, Ordering::Relaxed);
        }
        DebugCommand::AppPhaseOffset { offset_ns } => {
            let phases = ctx
                .phases
                .as_ref()
                .ok_or_else(|| ComposerError::BadValue("vsync phases are not running".into()))?;
            phases
                .distributor
                .set_listener_phase(phases.app_listener, offset_ns);
        }
        DebugCommand::ComposerPhaseOffset { offset_ns } => {
            let phases = ctx
                .phases
                .as_ref()
                .ok_or_else(|| ComposerError::BadValue("vsync phases are not running".into()))?;
            phases
                .distributor
                .set_listener_phase(phases.composer_listener, offset_ns);
        }
        DebugCommand::Dump => {
            let text = ctx.queue.call(|c| c.dump())?;
            return Ok(DebugReply::Dump { text });
        }
    }
    Ok(DebugReply::Done)
}
