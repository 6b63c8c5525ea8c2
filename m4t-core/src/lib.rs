//! M4T protocol reference implementation.
//! Host-driven: no I/O; host passes datagrams and receives actions.

pub mod core;
pub mod dedup;
pub mod identity;
pub mod notify;
pub mod semaphore;
pub mod session;
pub mod wire;

pub use crate::core::{HubCore, OutboundAction, Outgoing, PeerCore};
pub use dedup::DedupWindow;
pub use identity::IdentityToken;
pub use notify::Notification;
pub use semaphore::{classify, Semaphore, SemaphoreError, SemaphoreProtocol};
pub use session::{Session, SessionRegistry};
pub use wire::{Frame, FrameDecodeError, HeaderLayout, PayloadCodec};
