//! Strata IPC Protocol
//!
//! Shared message types for communication between the `strata` composer
//! service and its clients.

pub mod types;

pub use types::*;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Socket path for IPC communication
pub fn socket_path(name: &str) -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    std::path::PathBuf::from(runtime_dir).join(name)
}

// ============================================================================
// Debug channel
// ============================================================================

/// Diagnostic commands; not part of the stable client contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DebugCommand {
    /// Flash updated regions; `None` toggles
    ShowUpdates { value: Option<u32> },
    /// Repaint every display on the next refresh
    RepaintEverything,
    /// Raise every transaction flag
    ForceTransaction,
    /// Schedule a refresh without any change
    SendRefresh,
    DisableHwc { disable: bool },
    DisableTransformHint { disable: bool },
    Interrogate,
    PageFlipCount,
    /// Row-major 4x4 color matrix; `None` restores identity
    ColorMatrix { matrix: Option<[f32; 16]> },
    RefreshSkipCount { count: i32 },
    ForceFullDamage { enabled: bool },
    AppPhaseOffset { offset_ns: i64 },
    ComposerPhaseOffset { offset_ns: i64 },
    Dump,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DebugReply {
    Done,
    Interrogate {
        show_updates: u32,
        disable_hwc: bool,
        disable_transform_hint: bool,
        force_full_damage: bool,
    },
    PageFlipCount { count: u64 },
    Dump { text: String },
}

// ============================================================================
// Client → Service Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ComposerRequest {
    CreateDisplay {
        name: String,
        secure: bool,
    },
    DestroyDisplay {
        token: DisplayToken,
    },
    GetBuiltinDisplay {
        display_type: DisplayType,
    },
    CreateLayer {
        name: String,
        width: i32,
        height: i32,
        format: PixelFormat,
        flags: CreateFlags,
    },
    RemoveLayer {
        surface: SurfaceId,
    },
    /// Minimal buffer hand-off for remote clients
    QueueFrame {
        surface: SurfaceId,
        width: u32,
        height: u32,
        timestamp: i64,
    },
    SetTransactionState {
        displays: Vec<DisplayChange>,
        surfaces: Vec<SurfaceChange>,
        flags: TransactionRequestFlags,
    },
    CaptureScreen {
        display: DisplayToken,
        crop: Rect,
        req_width: u32,
        req_height: u32,
        min_z: i32,
        max_z: i32,
        use_identity_transform: bool,
        rotation: i32,
    },
    GetDisplayConfigs {
        display: DisplayToken,
    },
    GetDisplayStats {
        display: DisplayToken,
    },
    GetActiveConfig {
        display: DisplayToken,
    },
    SetActiveConfig {
        display: DisplayToken,
        mode: i32,
    },
    SetPowerMode {
        display: DisplayToken,
        mode: PowerMode,
    },
    ClearAnimationFrameStats,
    GetAnimationFrameStats,
    Debug {
        command: DebugCommand,
    },
}

// ============================================================================
// Service → Client Replies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PermissionDenied,
    InvalidHandle,
    BadValue,
    ResourceExhausted,
    TimedOut,
    HardwareDegraded,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ComposerReply {
    Ok,
    Display { token: Option<DisplayToken> },
    Layer { surface: SurfaceId },
    Configs { configs: Vec<DisplayInfo> },
    Stats { stats: DisplayStatInfo },
    ActiveConfig { mode: i32 },
    Capture { width: u32, height: u32 },
    FrameStats { stats: FrameStats },
    Debug { reply: DebugReply },
    Error { kind: ErrorKind, message: String },
}

// ============================================================================
// Binary Protocol (length-prefixed JSON)
// ============================================================================

/// Framed message for socket communication
/// Format: [4 bytes length (big-endian)] [JSON payload]
pub struct FramedMessage {
    pub data: Vec<u8>,
}

impl FramedMessage {
    /// Create a new framed message from serializable data
    pub fn new<T: Serialize>(msg: &T) -> anyhow::Result<Self> {
        let data = serde_json::to_vec(msg)?;
        Ok(Self { data })
    }

    /// Encode message with length prefix (4 bytes, big-endian)
    pub fn encode(&self) -> Vec<u8> {
        let len = self.data.len() as u32;
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode<T: DeserializeOwned>(data: &[u8]) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Decode a client request from bytes
    pub fn decode_request(data: &[u8]) -> anyhow::Result<ComposerRequest> {
        Self::decode(data)
    }

    /// Decode a service reply from bytes
    pub fn decode_reply(data: &[u8]) -> anyhow::Result<ComposerReply> {
        Self::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_request_survives_framing() {
        let req = ComposerRequest::SetTransactionState {
            displays: vec![DisplayChange::new(DisplayToken(1)).layer_stack(3)],
            surfaces: vec![
                SurfaceChange::new(SurfaceId(7))
                    .z(12)
                    .flags(SurfaceFlags::HIDDEN, SurfaceFlags::HIDDEN),
            ],
            flags: TransactionRequestFlags::SYNCHRONOUS,
        };

        let msg = FramedMessage::new(&req).unwrap();
        let encoded = msg.encode();
        assert_eq!(
            u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize,
            msg.data.len()
        );

        let decoded = FramedMessage::decode_request(&encoded[4..]).unwrap();
        match decoded {
            ComposerRequest::SetTransactionState { displays, surfaces, flags } => {
                assert_eq!(displays[0].what, DisplayChangeFlags::LAYER_STACK);
                assert_eq!(displays[0].layer_stack, 3);
                assert_eq!(surfaces[0].what, SurfaceChangeFlags::LAYER | SurfaceChangeFlags::FLAGS);
                assert_eq!(surfaces[0].z, 12);
                assert_eq!(flags, TransactionRequestFlags::SYNCHRONOUS);
            }
            _ => panic!("Wrong request type"),
        }
    }

    #[test]
    fn test_error_reply_decodes() {
        let reply = ComposerReply::Error {
            kind: ErrorKind::ResourceExhausted,
            message: "surface limit reached".into(),
        };
        let msg = FramedMessage::new(&reply).unwrap();
        match FramedMessage::decode_reply(&msg.data).unwrap() {
            ComposerReply::Error { kind, .. } => assert_eq!(kind, ErrorKind::ResourceExhausted),
            _ => panic!("Wrong reply type"),
        }
    }

    #[test]
    fn test_rect_subtract_pieces_are_disjoint() {
        let outer = Rect::new(0, 0, 10, 10);
        let hole = Rect::new(3, 3, 6, 6);
        let pieces = outer.subtract(&hole);
        assert_eq!(pieces.len(), 4);
        let total: i64 = pieces.iter().map(Rect::area).sum();
        assert_eq!(total, 100 - 9);
        for (i, a) in pieces.iter().enumerate() {
            assert!(!a.intersects(&hole));
            for b in &pieces[i + 1..] {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn test_invalid_rect_is_not_valid() {
        assert!(!Rect::INVALID.is_valid());
        assert!(Rect::INVALID.is_empty());
        assert!(Rect::EMPTY.is_valid());
    }

    #[test]
    fn test_pixel_format_aliases() {
        assert_eq!(PixelFormat::Opaque.resolve(), PixelFormat::Rgbx8888);
        assert!(PixelFormat::Translucent.has_alpha());
        assert!(!PixelFormat::Rgb565.has_alpha());
    }
}
