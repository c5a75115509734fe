//! Scene state shared between client threads and the event loop.
//!
//! Clients edit the *current* scene under the state lock; the event loop
//! copies it into its private *drawing* scene when it commits a transaction.

pub mod display;
pub mod flags;
pub mod surface;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use strata_ipc::{
    ClientId, DisplayChange, DisplayToken, DisplayType, SurfaceChange, SurfaceChangeFlags, SurfaceId,
};
use tracing::{debug, warn};

use crate::geometry::Region;
use crate::stats::AnimFrameTracker;

pub use display::{DisplayState, NO_LAYER_STACK};
pub use flags::{AtomicTransactionFlags, TransactionFlags};
pub use surface::{SurfaceKind, SurfaceList, SurfaceRecord, SurfaceState};

#[derive(Debug, Clone, Default)]
pub struct SceneState {
    pub surfaces: SurfaceList,
    pub displays: BTreeMap<DisplayToken, DisplayState>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientRecord {
    pub pid: u32,
    pub uid: u32,
    pub surfaces: BTreeSet<SurfaceId>,
}

/// Everything guarded by the state lock
#[derive(Debug, Default)]
pub struct LockedState {
    pub current: SceneState,
    /// A synchronous transaction is waiting for commit
    pub transaction_pending: bool,
    /// An animation transaction is waiting for commit
    pub anim_transaction_pending: bool,
    pub layers_added: bool,
    pub layers_removed: bool,
    /// Removed from `current` but still in the drawing scene
    pub pending_removal: Vec<Arc<SurfaceRecord>>,
    pub clients: HashMap<ClientId, ClientRecord>,
    /// Tokens for the primary and external displays while connected
    pub builtin_displays: [Option<DisplayToken>; 2],
    pub anim_frames: AnimFrameTracker,
    next_surface_id: u64,
    next_creation_seq: u64,
    next_display_token: u64,
    next_client_id: u64,
}

fn builtin_index(display_type: DisplayType) -> Option<usize> {
    match display_type {
        DisplayType::Primary => Some(0),
        DisplayType::External => Some(1),
        DisplayType::Virtual => None,
    }
}

impl LockedState {
    pub fn new() -> Self {
        Self {
            next_surface_id: 1,
            next_display_token: 1,
            next_client_id: 1,
            ..Default::default()
        }
    }

    pub fn alloc_surface_id(&mut self) -> (SurfaceId, u64) {
        let id = SurfaceId(self.next_surface_id);
        self.next_surface_id += 1;
        let seq = self.next_creation_seq;
        self.next_creation_seq += 1;
        (id, seq)
    }

    pub fn alloc_display_token(&mut self) -> DisplayToken {
        let token = DisplayToken(self.next_display_token);
        self.next_display_token += 1;
        token
    }

    pub fn alloc_client_id(&mut self) -> ClientId {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        id
    }

    pub fn builtin_display(&self, display_type: DisplayType) -> Option<DisplayToken> {
        builtin_index(display_type).and_then(|i| self.builtin_displays[i])
    }

    pub fn set_builtin_display(&mut self, display_type: DisplayType, token: Option<DisplayToken>) {
        if let Some(i) = builtin_index(display_type) {
            self.builtin_displays[i] = token;
        }
    }

    /// Add the record for a builtin display that just appeared
    pub fn connect_builtin_display(&mut self, display_type: DisplayType) -> DisplayToken {
        if let Some(token) = self.builtin_display(display_type) {
            return token;
        }
        let name = match display_type {
            DisplayType::Primary => "Built-in Screen",
            _ => "HDMI Screen",
        };
        let token = self.alloc_display_token();
        let mut state = DisplayState::new(display_type, name, true);
        if display_type == DisplayType::Primary {
            state.layer_stack = 0;
        }
        self.current.displays.insert(token, state);
        self.set_builtin_display(display_type, Some(token));
        token
    }

    /// Drop the record of a builtin display that went away. The primary
    /// display is never removed.
    pub fn disconnect_builtin_display(&mut self, display_type: DisplayType) -> Option<DisplayToken> {
        if display_type == DisplayType::Primary {
            warn!("Display: ignoring disconnect of the primary display");
            return None;
        }
        let token = self.builtin_display(display_type)?;
        self.current.displays.remove(&token);
        self.set_builtin_display(display_type, None);
        Some(token)
    }

    pub fn add_surface(&mut self, record: SurfaceRecord) -> TransactionFlags {
        if let Some(client) = self.clients.get_mut(&record.client) {
            client.surfaces.insert(record.id);
        }
        self.current.surfaces.add(Arc::new(record));
        self.layers_added = true;
        TransactionFlags::TRANSACTION
    }

    /// Take a surface out of the current scene. It stays in the drawing
    /// scene until the next commit.
    pub fn remove_surface(&mut self, id: SurfaceId) -> Option<TransactionFlags> {
        let record = self.current.surfaces.remove(id)?;
        if let Some(client) = self.clients.get_mut(&record.client) {
            client.surfaces.remove(&id);
        }
        self.pending_removal.push(record);
        self.layers_removed = true;
        Some(TransactionFlags::TRANSACTION)
    }

    pub fn apply_display_change(&mut self, change: &DisplayChange) -> TransactionFlags {
        match self.current.displays.get_mut(&change.token) {
            Some(display) => display.apply(change),
            None => {
                debug!("Transaction: ignoring change for unknown display {:?}", change.token);
                TransactionFlags::empty()
            }
        }
    }

    pub fn apply_surface_change(&mut self, change: &SurfaceChange) -> TransactionFlags {
        let what = change.what;
        let surfaces = &mut self.current.surfaces;
        let Some(existing) = surfaces.get(change.surface) else {
            warn!("Transaction: ignoring change for unknown surface {:?}", change.surface);
            return TransactionFlags::empty();
        };

        let mut flags = TransactionFlags::empty();

        // Edits that move the surface in the sort order
        let restack = (what.contains(SurfaceChangeFlags::LAYER) && existing.state.z != change.z)
            || (what.contains(SurfaceChangeFlags::LAYER_STACK)
                && existing.state.layer_stack != change.layer_stack);
        if restack {
            surfaces.update(change.surface, |record| {
                if what.contains(SurfaceChangeFlags::LAYER) {
                    record.state.z = change.z;
                }
                if what.contains(SurfaceChangeFlags::LAYER_STACK) {
                    record.state.layer_stack = change.layer_stack;
                }
                record.state.sequence = record.state.sequence.wrapping_add(1);
            });
            flags |= TransactionFlags::TRANSACTION | TransactionFlags::TRAVERSAL;
        }

        let Some(record) = surfaces.get(change.surface) else {
            return flags;
        };
        let mut next = record.state.clone();
        if what.contains(SurfaceChangeFlags::POSITION) {
            next.x = change.x;
            next.y = change.y;
        }
        if what.contains(SurfaceChangeFlags::SIZE) {
            next.width = change.width;
            next.height = change.height;
        }
        if what.contains(SurfaceChangeFlags::ALPHA) {
            next.alpha = (change.alpha.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
        if what.contains(SurfaceChangeFlags::MATRIX) {
            next.matrix = change.matrix;
        }
        if what.contains(SurfaceChangeFlags::TRANSPARENT_REGION) {
            next.transparent_region = Region::from_rects(&change.transparent_region);
        }
        if what.contains(SurfaceChangeFlags::FLAGS) {
            next.flags = (next.flags & !change.mask) | (change.flags & change.mask);
        }
        if what.contains(SurfaceChangeFlags::CROP) {
            next.crop = change.crop;
        }

        if next != record.state {
            // Size and transparent-region hints leave the content sequence alone
            let old = &record.state;
            let sequenced = next.x != old.x
                || next.y != old.y
                || next.alpha != old.alpha
                || next.matrix != old.matrix
                || next.flags != old.flags
                || next.crop != old.crop;
            if sequenced {
                next.sequence = next.sequence.wrapping_add(1);
            }
            if let Some(record) = surfaces.get_mut(change.surface) {
                record.state = next;
            }
            flags |= TransactionFlags::TRAVERSAL;
        }
        flags
    }
}
