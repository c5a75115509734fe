//! Requested per-display configuration, as clients see it.

use strata_ipc::{BackingSurface, DisplayChange, DisplayChangeFlags, DisplayType, Orientation, Rect};

use super::flags::TransactionFlags;

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayState {
    pub display_type: DisplayType,
    pub name: String,
    pub secure: bool,
    /// Sink of a virtual display; `None` leaves it dormant
    pub surface: Option<BackingSurface>,
    pub layer_stack: u32,
    pub orientation: Orientation,
    pub viewport: Rect,
    pub frame: Rect,
    pub width: u32,
    pub height: u32,
}

/// No surfaces are shown until a layer stack is assigned
pub const NO_LAYER_STACK: u32 = u32::MAX;

impl DisplayState {
    pub fn new(display_type: DisplayType, name: impl Into<String>, secure: bool) -> Self {
        Self {
            display_type,
            name: name.into(),
            secure,
            surface: None,
            layer_stack: NO_LAYER_STACK,
            orientation: Orientation::Default,
            viewport: Rect::INVALID,
            frame: Rect::INVALID,
            width: 0,
            height: 0,
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.display_type == DisplayType::Virtual
    }

    /// Apply one display edit; reports whether anything changed
    pub fn apply(&mut self, change: &DisplayChange) -> TransactionFlags {
        let mut changed = false;
        let what = change.what;

        if what.contains(DisplayChangeFlags::SURFACE) && self.surface != change.surface {
            self.surface = change.surface;
            changed = true;
        }
        if what.contains(DisplayChangeFlags::LAYER_STACK) && self.layer_stack != change.layer_stack {
            self.layer_stack = change.layer_stack;
            changed = true;
        }
        if what.contains(DisplayChangeFlags::PROJECTION) {
            if self.orientation != change.orientation {
                self.orientation = change.orientation;
                changed = true;
            }
            if self.frame != change.frame {
                self.frame = change.frame;
                changed = true;
            }
            if self.viewport != change.viewport {
                self.viewport = change.viewport;
                changed = true;
            }
        }
        if what.contains(DisplayChangeFlags::SIZE)
            && (self.width != change.width || self.height != change.height)
        {
            self.width = change.width;
            self.height = change.height;
            changed = true;
        }

        if changed {
            TransactionFlags::DISPLAY_TOPOLOGY
        } else {
            TransactionFlags::empty()
        }
    }

    pub fn projection_eq(&self, other: &DisplayState) -> bool {
        self.orientation == other.orientation
            && self.viewport == other.viewport
            && self.frame == other.frame
            && self.width == other.width
            && self.height == other.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ipc::DisplayToken;

    #[test]
    fn test_apply_reads_back_every_field() {
        let mut state = DisplayState::new(DisplayType::Virtual, "v", false);
        let surface = BackingSurface {
            id: 7,
            width: 640,
            height: 480,
        };
        let change = DisplayChange::new(DisplayToken(1))
            .surface(Some(surface))
            .layer_stack(3)
            .projection(Orientation::Rot90, Rect::from_size(480, 640), Rect::from_size(640, 480))
            .size(640, 480);

        assert_eq!(state.apply(&change), TransactionFlags::DISPLAY_TOPOLOGY);
        assert_eq!(state.surface, Some(surface));
        assert_eq!(state.layer_stack, 3);
        assert_eq!(state.orientation, Orientation::Rot90);
        assert_eq!(state.viewport, Rect::from_size(480, 640));
        assert_eq!(state.frame, Rect::from_size(640, 480));
        assert_eq!((state.width, state.height), (640, 480));

        // Re-applying the same edit is not a change
        assert!(state.apply(&change).is_empty());
    }

    #[test]
    fn test_unflagged_fields_are_ignored() {
        let mut state = DisplayState::new(DisplayType::Primary, "p", true);
        let mut change = DisplayChange::new(DisplayToken(0));
        change.layer_stack = 9;
        assert!(state.apply(&change).is_empty());
        assert_eq!(state.layer_stack, NO_LAYER_STACK);
    }
}
