//! The composer's event loop.
//!
//! One thread owns the `Compositor` and runs every state mutation. Other
//! threads talk to it only through the `MessageQueue`: the three composition
//! messages are coalesced through an event mask so that at most one of each
//! is ever in flight, and arbitrary work can be posted as a closure.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitflags::bitflags;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

use crate::compositor::Compositor;
use crate::context::ServiceContext;
use crate::error::{ComposerError, Result};
use crate::render::RenderEngine;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u8 {
        const TRANSACTION = 1 << 0;
        const INVALIDATE = 1 << 1;
        const REFRESH = 1 << 2;
    }
}

pub type Task = Box<dyn FnOnce(&mut Compositor) + Send>;

pub enum Message {
    Transaction,
    Invalidate,
    Refresh,
    Task {
        task: Task,
        done: Option<oneshot::Sender<()>>,
    },
    Stop,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Transaction => write!(f, "Transaction"),
            Message::Invalidate => write!(f, "Invalidate"),
            Message::Refresh => write!(f, "Refresh"),
            Message::Task { done, .. } => write!(f, "Task(sync={})", done.is_some()),
            Message::Stop => write!(f, "Stop"),
        }
    }
}

pub type VsyncRequester = Arc<dyn Fn() + Send + Sync>;

pub struct MessageQueue {
    tx: mpsc::UnboundedSender<Message>,
    pending: AtomicU8,
    /// Runtime of the loop thread; used for delayed posts
    runtime: Option<tokio::runtime::Handle>,
    vsync_requester: OnceLock<VsyncRequester>,
}

impl MessageQueue {
    pub fn new(
        runtime: Option<tokio::runtime::Handle>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            tx,
            pending: AtomicU8::new(0),
            runtime,
            vsync_requester: OnceLock::new(),
        });
        (queue, rx)
    }

    /// Route `invalidate` through the compositor-phase vsync
    pub fn set_vsync_requester(&self, requester: VsyncRequester) {
        let _ = self.vsync_requester.set(requester);
    }

    /// Schedule an INVALIDATE for the next compositor vsync
    pub fn invalidate(&self) {
        match self.vsync_requester.get() {
            Some(request) => request(),
            None => self.dispatch_invalidate(),
        }
    }

    /// Schedule a REFRESH right away
    pub fn refresh(&self) {
        self.dispatch(EventMask::REFRESH, Message::Refresh);
    }

    pub fn invalidate_transaction_now(&self) {
        self.dispatch(EventMask::TRANSACTION, Message::Transaction);
    }

    pub fn dispatch_invalidate(&self) {
        self.dispatch(EventMask::INVALIDATE, Message::Invalidate);
    }

    fn dispatch(&self, bit: EventMask, msg: Message) {
        let old = self.pending.fetch_or(bit.bits(), Ordering::AcqRel);
        if old & bit.bits() == 0 {
            trace!("Queue: dispatch {:?}", msg);
            let _ = self.tx.send(msg);
        }
    }

    /// Clear the bit before handling so a new dispatch during handling queues again
    pub(crate) fn mark_handled(&self, bit: EventMask) {
        self.pending.fetch_and(!bit.bits(), Ordering::AcqRel);
    }

    pub fn pending(&self) -> EventMask {
        EventMask::from_bits_truncate(self.pending.load(Ordering::Acquire))
    }

    fn send(&self, msg: Message, delay: Duration) -> Result<()> {
        match (&self.runtime, delay.is_zero()) {
            (Some(runtime), false) => {
                let tx = self.tx.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(msg);
                });
                Ok(())
            }
            _ => self.tx.send(msg).map_err(|_| stopped()),
        }
    }

    /// Enqueue work without waiting for it
    pub fn post_async(&self, task: Task, delay: Duration) -> Result<()> {
        self.send(Message::Task { task, done: None }, delay)
    }

    /// Enqueue work and block until the loop has run it. Must not be called
    /// from the loop thread itself.
    pub fn post_sync(&self, task: Task, delay: Duration) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(
            Message::Task {
                task,
                done: Some(done_tx),
            },
            delay,
        )?;
        done_rx.blocking_recv().map_err(|_| stopped())
    }

    /// Run a closure on the loop and hand its result back
    pub fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Compositor) -> T + Send + 'static,
    {
        let slot = Arc::new(std::sync::Mutex::new(None));
        let out = Arc::clone(&slot);
        self.post_sync(
            Box::new(move |c| {
                *crate::sync::lock(&out) = Some(f(c));
            }),
            Duration::ZERO,
        )?;
        let value = crate::sync::lock(&slot).take();
        value.ok_or_else(stopped)
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
    }
}

fn stopped() -> ComposerError {
    ComposerError::Fatal("event loop is not running".into())
}

pub type EngineFactory =
    Box<dyn FnOnce() -> std::result::Result<Box<dyn RenderEngine>, crate::error::RenderError> + Send>;

/// Handle to the loop thread
pub struct EventLoop {
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Start the loop thread. The render engine is created on that thread;
    /// failure to create it is fatal and reported here.
    pub fn spawn(
        ctx: Arc<ServiceContext>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        runtime: tokio::runtime::Runtime,
        engine_factory: EngineFactory,
    ) -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);

        let thread = thread::Builder::new()
            .name("composer-main".into())
            .spawn(move || {
                let engine = match engine_factory() {
                    Ok(engine) => engine,
                    Err(e) => {
                        error!("Composer: failed to create render engine: {}", e);
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                let mut compositor = Compositor::new(ctx, engine);
                let _ = ready_tx.send(Ok(()));
                info!("Composer: event loop running");

                runtime.block_on(async move {
                    while let Some(msg) = rx.recv().await {
                        if matches!(msg, Message::Stop) {
                            break;
                        }
                        compositor.on_message_received(msg);
                    }
                });
                debug!("Composer: event loop ended");
            })
            .map_err(|e| ComposerError::Fatal(format!("failed to spawn event loop: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(ComposerError::Fatal("event loop exited during startup".into())),
        }
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
