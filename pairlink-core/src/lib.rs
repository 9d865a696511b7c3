//! Phone/watch peer session core.
//! Host-driven: no I/O; host passes link, session and UI events and receives actions.

pub mod error;
pub mod integrity;
pub mod link;
pub mod manager;
pub mod message;
pub mod pending;
pub mod session;
pub mod sink;
pub mod wire;

pub use error::{LinkError, LogPullError, ProtocolError};
pub use link::{ActivationState, LinkEvent, LinkStatus};
pub use manager::{
    ManagerConfig, OutboundAction, PeerSessionManager, ProtocolMode, Received, Role,
    DEFAULT_LOG_PULL_DEADLINE_TICKS, DEFAULT_REQUEST_TIMEOUT_TICKS,
};
pub use message::{Command, MessageKind, PeerMessage, Value};
pub use pending::{ErrorCallback, LogPullCallback, ReplyCallback};
pub use session::{
    ExternalSession, SessionConfig, SessionError, SessionId, SessionSource, SessionState,
};
pub use sink::LogSink;
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};
