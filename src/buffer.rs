//! Minimal in-process buffer transport.
//!
//! Producers queue frame descriptors; the compositor consumes them through
//! the `SurfaceContent` trait when it latches. Pixel data is owned by the
//! render engine and never passes through here.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use strata_ipc::PixelFormat;

use crate::clock::Nsecs;
use crate::error::{ComposerError, Result};
use crate::geometry::OrientationFlags;
use crate::hwc::PresentFence;
use crate::sync::lock;

#[derive(Debug, Clone, PartialEq)]
pub struct BufferFrame {
    pub width: u32,
    pub height: u32,
    pub opaque: bool,
    /// Desired present time; 0 means "as soon as possible"
    pub timestamp: Nsecs,
    pub frame_number: u64,
}

/// Consumer side of a surface's buffer queue
pub trait SurfaceContent: Send + Sync {
    fn queued_frame_count(&self) -> usize;

    fn has_queued_frame(&self) -> bool {
        self.queued_frame_count() > 0
    }

    /// Desired present time of the oldest queued frame
    fn head_timestamp(&self) -> Option<Nsecs>;

    fn latch_next_buffer(&self) -> Option<BufferFrame>;

    fn set_transform_hint(&self, hint: OrientationFlags);

    /// The surface left the scene; further frames are rejected
    fn on_removed(&self);

    /// A composition containing the scene finished; `present` signals when
    /// it reached the primary panel
    fn on_post_composition(&self, _present: Option<&PresentFence>) {}
}

/// The last latched frame that went through a composition
#[derive(Debug, Clone)]
pub struct PresentedFrame {
    pub frame_number: u64,
    pub fence: Option<PresentFence>,
}

pub type FrameListener = Arc<dyn Fn() + Send + Sync>;

struct QueueInner {
    frames: VecDeque<BufferFrame>,
    next_frame_number: u64,
    transform_hint: OrientationFlags,
    abandoned: bool,
    /// Latched but not yet through a composition
    latched: Option<u64>,
    presented: Option<PresentedFrame>,
}

pub struct FrameQueue {
    format: PixelFormat,
    inner: Mutex<QueueInner>,
    listener: Mutex<Option<FrameListener>>,
}

impl fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("FrameQueue")
            .field("format", &self.format)
            .field("queued", &inner.frames.len())
            .field("abandoned", &inner.abandoned)
            .finish()
    }
}

impl FrameQueue {
    pub fn new(format: PixelFormat) -> Arc<Self> {
        Arc::new(Self {
            format: format.resolve(),
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                next_frame_number: 1,
                transform_hint: OrientationFlags::ROT_0,
                abandoned: false,
                latched: None,
                presented: None,
            }),
            listener: Mutex::new(None),
        })
    }

    /// Called (outside the queue lock) whenever a frame is queued
    pub fn set_frame_listener(&self, listener: FrameListener) {
        *lock(&self.listener) = Some(listener);
    }

    pub fn producer(self: &Arc<Self>) -> FrameProducer {
        FrameProducer {
            queue: Arc::clone(self),
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }
}

impl SurfaceContent for FrameQueue {
    fn queued_frame_count(&self) -> usize {
        lock(&self.inner).frames.len()
    }

    fn head_timestamp(&self) -> Option<Nsecs> {
        lock(&self.inner).frames.front().map(|f| f.timestamp)
    }

    fn latch_next_buffer(&self) -> Option<BufferFrame> {
        let mut inner = lock(&self.inner);
        let frame = inner.frames.pop_front()?;
        inner.latched = Some(frame.frame_number);
        Some(frame)
    }

    fn set_transform_hint(&self, hint: OrientationFlags) {
        lock(&self.inner).transform_hint = hint;
    }

    fn on_removed(&self) {
        let mut inner = lock(&self.inner);
        inner.abandoned = true;
        inner.frames.clear();
    }

    fn on_post_composition(&self, present: Option<&PresentFence>) {
        let mut inner = lock(&self.inner);
        if let Some(frame_number) = inner.latched.take() {
            inner.presented = Some(PresentedFrame {
                frame_number,
                fence: present.cloned(),
            });
        }
    }
}

/// Client handle for submitting frames to one surface
#[derive(Debug, Clone)]
pub struct FrameProducer {
    queue: Arc<FrameQueue>,
}

impl FrameProducer {
    pub fn queue_frame(&self, width: u32, height: u32, timestamp: Nsecs) -> Result<u64> {
        let frame_number = {
            let mut inner = lock(&self.queue.inner);
            if inner.abandoned {
                return Err(ComposerError::InvalidHandle(
                    "buffer queue has been abandoned".into(),
                ));
            }
            let frame_number = inner.next_frame_number;
            inner.next_frame_number += 1;
            inner.frames.push_back(BufferFrame {
                width,
                height,
                opaque: !self.queue.format.has_alpha(),
                timestamp,
                frame_number,
            });
            frame_number
        };
        let listener = lock(&self.queue.listener).clone();
        if let Some(listener) = listener {
            listener();
        }
        Ok(frame_number)
    }

    /// Orientation the compositor would like content produced in
    pub fn transform_hint(&self) -> OrientationFlags {
        lock(&self.queue.inner).transform_hint
    }

    /// The most recent frame that made it into a composition
    pub fn last_presented(&self) -> Option<PresentedFrame> {
        lock(&self.queue.inner).presented.clone()
    }

    pub fn is_abandoned(&self) -> bool {
        lock(&self.queue.inner).abandoned
    }

    /// Consumer view of the same queue
    pub fn consumer(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.queue)
    }
}
