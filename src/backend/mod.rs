//! Display backends implementing the hardware composer and render engine
//! collaborators.

pub mod headless;

pub use headless::{HeadlessHwc, HeadlessRenderEngine};
