//! Strata - per-device display composer service
//!
//! Accepts surfaces from client processes, applies their transactions
//! atomically, and composes the visible ones onto each display paced by
//! vsync.

pub mod backend;
pub mod buffer;
pub mod clock;
pub mod compositor;
pub mod config;
pub mod context;
pub mod debug;
pub mod display;
pub mod error;
pub mod event_loop;
pub mod geometry;
pub mod hwc;
pub mod ipc;
pub mod render;
pub mod service;
pub mod state;
pub mod stats;
pub mod sync;
pub mod vsync;

#[cfg(test)]
mod testing;
