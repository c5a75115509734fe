//! Region and transform math used by the visible-region engine.

pub mod region;
pub mod transform;

pub use region::Region;
pub use strata_ipc::Rect;
pub use transform::{OrientationFlags, Transform};
