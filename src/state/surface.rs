//! Surface records and the z-ordered surface list.

use std::fmt;
use std::sync::Arc;

use strata_ipc::{ClientId, CreateFlags, Matrix22, PixelFormat, Rect, SurfaceFlags, SurfaceId};

use crate::buffer::SurfaceContent;
use crate::geometry::{Region, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    /// Content comes from a buffer queue
    Buffer,
    /// Solid black at the surface's alpha
    Dim,
}

/// Geometry and attributes editable through transactions
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceState {
    pub layer_stack: u32,
    pub z: i32,
    pub x: f32,
    pub y: f32,
    pub width: u32,
    pub height: u32,
    /// Surface-local crop; an empty or invalid crop means none
    pub crop: Rect,
    pub alpha: u8,
    pub flags: SurfaceFlags,
    pub matrix: Matrix22,
    /// Surface-local region the client promises is fully transparent
    pub transparent_region: Region,
    /// Bumped on every edit that changes the surface's content
    pub sequence: u32,
}

impl SurfaceState {
    pub fn new(width: u32, height: u32, flags: SurfaceFlags) -> Self {
        Self {
            layer_stack: 0,
            z: 0,
            x: 0.0,
            y: 0.0,
            width,
            height,
            crop: Rect::INVALID,
            alpha: 0xff,
            flags,
            matrix: Matrix22::default(),
            transparent_region: Region::new(),
            sequence: 0,
        }
    }

    pub fn transform(&self) -> Transform {
        Transform::from_matrix(&self.matrix, self.x, self.y)
    }

    /// Surface-local bounds after cropping
    pub fn bounds(&self) -> Rect {
        let win = Rect::from_size(self.width as i32, self.height as i32);
        if self.crop.is_empty() {
            win
        } else {
            win.intersect(&self.crop)
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.flags.contains(SurfaceFlags::HIDDEN)
    }
}

#[derive(Clone)]
pub struct SurfaceRecord {
    pub id: SurfaceId,
    pub client: ClientId,
    pub name: String,
    /// Creation order; breaks z ties
    pub creation_seq: u64,
    pub kind: SurfaceKind,
    pub format: PixelFormat,
    pub create_flags: CreateFlags,
    pub state: SurfaceState,
    /// Buffer queue consumer; dim surfaces have none
    pub content: Option<Arc<dyn SurfaceContent>>,
}

impl fmt::Debug for SurfaceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceRecord")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SurfaceRecord {
    fn sort_key(&self) -> (u32, i32, u64) {
        (self.state.layer_stack, self.state.z, self.creation_seq)
    }

    pub fn is_secure(&self) -> bool {
        self.state.flags.contains(SurfaceFlags::SECURE)
    }

    pub fn is_potential_cursor(&self) -> bool {
        self.create_flags.contains(CreateFlags::CURSOR_WINDOW)
    }
}

/// Surfaces ordered by `(layer_stack, z, creation order)`, bottom first.
///
/// Records are shared between the current and drawing scene; editing one
/// through `get_mut` copies it first, so the other side never observes a
/// partial edit.
#[derive(Debug, Clone, Default)]
pub struct SurfaceList {
    surfaces: Vec<Arc<SurfaceRecord>>,
}

impl SurfaceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<SurfaceRecord>> {
        self.surfaces.iter()
    }

    pub fn add(&mut self, record: Arc<SurfaceRecord>) {
        let key = record.sort_key();
        let at = self.surfaces.partition_point(|s| s.sort_key() <= key);
        self.surfaces.insert(at, record);
    }

    pub fn remove(&mut self, id: SurfaceId) -> Option<Arc<SurfaceRecord>> {
        let index = self.surfaces.iter().position(|s| s.id == id)?;
        Some(self.surfaces.remove(index))
    }

    pub fn get(&self, id: SurfaceId) -> Option<&Arc<SurfaceRecord>> {
        self.surfaces.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.get(id).is_some()
    }

    /// Edit a record without changing its sort key
    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut SurfaceRecord> {
        self.surfaces
            .iter_mut()
            .find(|s| s.id == id)
            .map(Arc::make_mut)
    }

    /// Edit a record whose layer stack or z may change
    pub fn update<F>(&mut self, id: SurfaceId, edit: F) -> bool
    where
        F: FnOnce(&mut SurfaceRecord),
    {
        let Some(mut record) = self.remove(id) else {
            return false;
        };
        edit(Arc::make_mut(&mut record));
        self.add(record);
        true
    }

    pub fn in_layer_stack(&self, layer_stack: u32) -> impl DoubleEndedIterator<Item = &Arc<SurfaceRecord>> {
        self.surfaces
            .iter()
            .filter(move |s| s.state.layer_stack == layer_stack)
    }
}
