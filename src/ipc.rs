//! IPC server for composer clients
//!
//! Each connection is one client: it is registered when the socket is
//! accepted and all of its surfaces go away when the socket closes.
//! Requests are length-prefixed JSON and run on the blocking pool, since
//! most of them take the state lock or wait on the event loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use strata_ipc::{ClientId, ComposerReply, ComposerRequest, FramedMessage, SurfaceId, socket_path};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::FrameProducer;
use crate::compositor::CaptureArgs;
use crate::context::Caller;
use crate::error::ComposerError;
use crate::service::Composer;

/// Accepts client connections for a running composer
pub struct IpcServer {
    composer: Arc<Composer>,
    path: PathBuf,
    max_message_bytes: usize,
}

impl IpcServer {
    pub fn new(composer: Arc<Composer>) -> Self {
        let ipc = &composer.context().config.ipc;
        let path = socket_path(&ipc.socket_name);
        let max_message_bytes = ipc.max_message_bytes;
        Self {
            composer,
            path,
            max_message_bytes,
        }
    }

    /// Listen somewhere other than the runtime directory
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Bind the socket and spawn the acceptor task
    pub async fn start(self) -> Result<IpcHandle> {
        // Remove existing socket if present
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove stale socket")?;
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }

        let listener = UnixListener::bind(&self.path)
            .with_context(|| format!("Failed to bind {:?}", self.path))?;
        info!("IPC server listening on {:?}", self.path);

        let composer = self.composer;
        let max_message_bytes = self.max_message_bytes;
        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let composer = Arc::clone(&composer);
                        tokio::spawn(handle_client(stream, composer, max_message_bytes));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(IpcHandle {
            path: self.path,
            acceptor,
        })
    }
}

/// Handle for a listening server
pub struct IpcHandle {
    path: PathBuf,
    acceptor: JoinHandle<()>,
}

impl IpcHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and remove the socket file
    pub fn close(self) {
        self.acceptor.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("IPC: could not remove {:?}: {}", self.path, e);
        }
    }
}

/// Per-connection state: who is calling and the producers they own
pub struct Session {
    composer: Arc<Composer>,
    caller: Caller,
    client: Option<ClientId>,
    producers: HashMap<SurfaceId, FrameProducer>,
}

impl Session {
    /// Register the caller as a client. Returns `None` when the service
    /// has no room for another client.
    pub fn open(composer: Arc<Composer>, caller: Caller) -> Option<Self> {
        let client = match composer.create_connection(&caller) {
            Ok(Some(client)) => Some(client),
            Ok(None) => return None,
            // Untrusted callers may still capture or query
            Err(e) => {
                debug!("IPC: pid {} has no client: {}", caller.pid, e);
                None
            }
        };
        Some(Self {
            composer,
            caller,
            client,
            producers: HashMap::new(),
        })
    }

    pub fn handle(&mut self, request: ComposerRequest) -> ComposerReply {
        match self.dispatch(request) {
            Ok(reply) => reply,
            Err(e) => ComposerReply::Error {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }

    fn client(&self) -> crate::error::Result<ClientId> {
        self.client
            .ok_or_else(|| ComposerError::PermissionDenied("connection is not a client".into()))
    }

    fn dispatch(&mut self, request: ComposerRequest) -> crate::error::Result<ComposerReply> {
        let composer = &self.composer;
        let caller = &self.caller;
        let reply = match request {
            ComposerRequest::CreateDisplay { name, secure } => ComposerReply::Display {
                token: Some(composer.create_display(caller, &name, secure)?),
            },
            ComposerRequest::DestroyDisplay { token } => {
                composer.destroy_display(caller, token)?;
                ComposerReply::Ok
            }
            ComposerRequest::GetBuiltinDisplay { display_type } => ComposerReply::Display {
                token: composer.get_builtin_display(display_type),
            },
            ComposerRequest::CreateLayer {
                name,
                width,
                height,
                format,
                flags,
            } => {
                let client = self.client()?;
                let (surface, producer) =
                    composer.create_layer(client, &name, width, height, format, flags)?;
                if let Some(producer) = producer {
                    self.producers.insert(surface, producer);
                }
                ComposerReply::Layer { surface }
            }
            ComposerRequest::RemoveLayer { surface } => {
                composer.remove_layer(self.client()?, surface)?;
                self.producers.remove(&surface);
                ComposerReply::Ok
            }
            ComposerRequest::QueueFrame {
                surface,
                width,
                height,
                timestamp,
            } => {
                let producer = self
                    .producers
                    .get(&surface)
                    .ok_or_else(|| ComposerError::InvalidHandle(format!("surface {:?}", surface)))?;
                producer.queue_frame(width, height, timestamp)?;
                ComposerReply::Ok
            }
            ComposerRequest::SetTransactionState {
                displays,
                surfaces,
                flags,
            } => {
                composer.set_transaction_state(caller, &displays, &surfaces, flags)?;
                ComposerReply::Ok
            }
            ComposerRequest::CaptureScreen {
                display,
                crop,
                req_width,
                req_height,
                min_z,
                max_z,
                use_identity_transform,
                rotation,
            } => {
                let args = CaptureArgs {
                    display,
                    crop,
                    req_width,
                    req_height,
                    min_z,
                    max_z,
                    use_identity_transform,
                    rotation,
                    remote: caller.pid != std::process::id(),
                };
                let (width, height) = composer.capture_screen(caller, args, None)?;
                ComposerReply::Capture { width, height }
            }
            ComposerRequest::GetDisplayConfigs { display } => ComposerReply::Configs {
                configs: composer.get_display_configs(display)?,
            },
            ComposerRequest::GetDisplayStats { display } => ComposerReply::Stats {
                stats: composer.get_display_stats(display)?,
            },
            ComposerRequest::GetActiveConfig { display } => ComposerReply::ActiveConfig {
                mode: composer.get_active_config(display)?,
            },
            ComposerRequest::SetActiveConfig { display, mode } => {
                composer.set_active_config(display, mode)?;
                ComposerReply::Ok
            }
            ComposerRequest::SetPowerMode { display, mode } => {
                composer.set_power_mode(caller, display, mode)?;
                ComposerReply::Ok
            }
            ComposerRequest::ClearAnimationFrameStats => {
                composer.clear_animation_frame_stats(caller)?;
                ComposerReply::Ok
            }
            ComposerRequest::GetAnimationFrameStats => ComposerReply::FrameStats {
                stats: composer.get_animation_frame_stats(caller)?,
            },
            ComposerRequest::Debug { command } => ComposerReply::Debug {
                reply: composer.debug_command(caller, command)?,
            },
        };
        Ok(reply)
    }

    /// The peer is gone
    pub fn close(self) {
        if let Some(client) = self.client {
            self.composer.disconnect_client(client);
        }
    }
}

async fn read_request(
    stream: &mut UnixStream,
    max_message_bytes: usize,
) -> Option<ComposerRequest> {
    let mut len_buf = [0u8; 4];
    loop {
        // Read length prefix
        stream.read_exact(&mut len_buf).await.ok()?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > max_message_bytes {
            warn!("Message too large: {} bytes", len);
            return None;
        }

        let mut msg_buf = vec![0u8; len];
        stream.read_exact(&mut msg_buf).await.ok()?;

        match FramedMessage::decode_request(&msg_buf) {
            Ok(request) => return Some(request),
            Err(e) => warn!("Failed to decode request: {}", e),
        }
    }
}

/// Handle a connected client
async fn handle_client(mut stream: UnixStream, composer: Arc<Composer>, max_message_bytes: usize) {
    let caller = match stream.peer_cred() {
        Ok(cred) => Caller {
            pid: cred.pid().map_or(0, |pid| pid as u32),
            uid: cred.uid(),
        },
        Err(e) => {
            warn!("IPC: no peer credentials: {}", e);
            return;
        }
    };

    let opened = tokio::task::spawn_blocking(move || Session::open(composer, caller)).await;
    let mut session = match opened {
        Ok(Some(session)) => session,
        Ok(None) => {
            warn!("IPC: refusing pid {}", caller.pid);
            return;
        }
        Err(e) => {
            error!("IPC: session setup panicked: {}", e);
            return;
        }
    };
    info!("Client connected (pid {}, uid {})", caller.pid, caller.uid);

    while let Some(request) = read_request(&mut stream, max_message_bytes).await {
        debug!("Received request: {:?}", request);
        let handled = tokio::task::spawn_blocking(move || {
            let reply = session.handle(request);
            (session, reply)
        })
        .await;
        let (returned, reply) = match handled {
            Ok(result) => result,
            Err(e) => {
                error!("IPC: request handler panicked: {}", e);
                return;
            }
        };
        session = returned;

        match FramedMessage::new(&reply) {
            Ok(msg) => {
                if stream.write_all(&msg.encode()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to encode reply: {}", e);
            }
        }
    }

    if let Err(e) = tokio::task::spawn_blocking(move || session.close()).await {
        error!("IPC: client cleanup panicked: {}", e);
    }
    info!("Client disconnected (pid {})", caller.pid);
}

#[cfg(test)]
mod tests {
    use strata_ipc::{
        CreateFlags, DisplayType, ErrorKind, PixelFormat, SurfaceChange, TransactionRequestFlags,
    };

    use super::*;
    use crate::config::Config;
    use crate::render::RenderEngine;
    use crate::sync::lock;
    use crate::testing::{HEIGHT, RecordingEngine, RecordingHwc, WIDTH};

    fn composer() -> Arc<Composer> {
        let (engine, _) = RecordingEngine::new();
        let composer = Composer::start_unpaced(
            Config::default(),
            RecordingHwc::new(WIDTH, HEIGHT),
            Box::new(move || Ok(engine as Box<dyn RenderEngine>)),
        )
        .unwrap();
        Arc::new(composer)
    }

    #[test]
    fn test_session_runs_requests_and_cleans_up() {
        let composer = composer();
        let mut session = Session::open(Arc::clone(&composer), Caller::local()).unwrap();

        let ComposerReply::Layer { surface } = session.handle(ComposerRequest::CreateLayer {
            name: "s".into(),
            width: 8,
            height: 8,
            format: PixelFormat::Opaque,
            flags: CreateFlags::empty(),
        }) else {
            panic!("Wrong reply type");
        };
        assert_eq!(
            session.handle(ComposerRequest::QueueFrame {
                surface,
                width: 8,
                height: 8,
                timestamp: 0,
            }),
            ComposerReply::Ok
        );
        assert_eq!(
            session.handle(ComposerRequest::SetTransactionState {
                displays: vec![],
                surfaces: vec![SurfaceChange::new(surface).z(3)],
                flags: TransactionRequestFlags::SYNCHRONOUS,
            }),
            ComposerReply::Ok
        );

        let reply = session.handle(ComposerRequest::QueueFrame {
            surface: SurfaceId(999),
            width: 1,
            height: 1,
            timestamp: 0,
        });
        assert!(matches!(
            reply,
            ComposerReply::Error {
                kind: ErrorKind::InvalidHandle,
                ..
            }
        ));

        session.close();
        let locked = lock(&composer.context().state);
        assert!(locked.clients.is_empty());
        assert!(!locked.current.surfaces.contains(surface));
    }

    #[test]
    fn test_requests_over_socket() {
        let composer = composer();
        let path = std::env::temp_dir().join(format!("strata-test-{}.sock", std::process::id()));
        let runtime = tokio::runtime::Runtime::new().unwrap();

        runtime.block_on(async {
            let handle = IpcServer::new(Arc::clone(&composer))
                .with_path(&path)
                .start()
                .await
                .unwrap();

            let mut stream = UnixStream::connect(handle.path()).await.unwrap();
            let request = ComposerRequest::GetBuiltinDisplay {
                display_type: DisplayType::Primary,
            };
            stream
                .write_all(&FramedMessage::new(&request).unwrap().encode())
                .await
                .unwrap();

            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let reply = FramedMessage::decode_reply(&buf).unwrap();
            assert_eq!(
                reply,
                ComposerReply::Display {
                    token: composer.get_builtin_display(DisplayType::Primary)
                }
            );
            handle.close();
        });
        assert!(!path.exists());
    }
}
