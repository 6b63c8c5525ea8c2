//! Keyed protocol events surfaced to the front-end.

use std::fmt;
use std::net::SocketAddr;

/// Protocol and lifecycle events. `topic()` gives the stable key a front-end can switch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    PeerOnline {
        from: SocketAddr,
    },
    MalformedHandshake {
        content: String,
    },
    MalformedHandshakeSession {
        session_part: String,
    },
    AckMissingSeparator,
    AckMissingSessionOrContent {
        message_id: String,
    },
    AckInvalidIdOrSession {
        message_id: String,
        session: String,
    },
    AutomaticPortAssignment {
        port: u16,
    },
    StartupNotice {
        peer: SocketAddr,
    },
    BindFailed {
        port: u16,
        reason: String,
    },
    ReceiveFailed {
        reason: String,
    },
    SessionJoined {
        addr: SocketAddr,
    },
    SessionRenamed {
        addr: SocketAddr,
        old: String,
        new: String,
    },
    SessionExpired {
        addr: SocketAddr,
        name: String,
    },
    UnknownLocalCommand {
        command: String,
    },
    PushText {
        text: String,
    },
}

impl Notification {
    pub fn topic(&self) -> &'static str {
        match self {
            Notification::PeerOnline { .. } => "TARGET_PEER_ONLINE",
            Notification::MalformedHandshake { .. } => "MALFORMED_ETTUSALVE",
            Notification::MalformedHandshakeSession { .. } => {
                "MALFORMED_ETTUSALVE_INVALID_SESSION"
            }
            Notification::AckMissingSeparator => "MALFORMED_ACK_MISSING_SPACE_SEPARATOR",
            Notification::AckMissingSessionOrContent { .. } => {
                "MALFORMED_ACK_MISSING_SESSION_OR_MESSAGE"
            }
            Notification::AckInvalidIdOrSession { .. } => "MALFORMED_ACK_INVALID_ID_OR_SESSION",
            Notification::AutomaticPortAssignment { .. } => "AUTOMATIC_PORT_ASSIGNMENT",
            Notification::StartupNotice { .. } => "STARTUP_NOTICE",
            Notification::BindFailed { .. } => "BIND_FAILED",
            Notification::ReceiveFailed { .. } => "RECEIVE_FAILED",
            Notification::SessionJoined { .. } => "SESSION_JOINED",
            Notification::SessionRenamed { .. } => "SESSION_RENAMED",
            Notification::SessionExpired { .. } => "SESSION_EXPIRED",
            Notification::UnknownLocalCommand { .. } => "UNKNOWN_LOCAL_COMMAND",
            Notification::PushText { .. } => "PUSH_TEXT",
        }
    }

    /// True for the malformed-ACK family.
    pub fn is_malformed_ack(&self) -> bool {
        matches!(
            self,
            Notification::AckMissingSeparator
                | Notification::AckMissingSessionOrContent { .. }
                | Notification::AckInvalidIdOrSession { .. }
        )
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::PeerOnline { from } => write!(f, "Peer {from} is online!"),
            Notification::MalformedHandshake { content } => {
                write!(f, "Received malformed handshake: {content:?}")
            }
            Notification::MalformedHandshakeSession { session_part } => write!(
                f,
                "Received handshake with invalid session discriminator {session_part:?}"
            ),
            Notification::AckMissingSeparator => {
                write!(f, "Received malformed ACK: missing space separator.")
            }
            Notification::AckMissingSessionOrContent { message_id } => write!(
                f,
                "Received malformed ACK for {message_id}: missing session or message."
            ),
            Notification::AckInvalidIdOrSession {
                message_id,
                session,
            } => write!(
                f,
                "Received malformed ACK: invalid message ID {message_id:?} or session {session:?}"
            ),
            Notification::AutomaticPortAssignment { port } => {
                write!(f, "Automatic port assigned: {port}")
            }
            Notification::StartupNotice { peer } => write!(
                f,
                "Starting communication to {peer}\n\
                 Due to the nature of delivery via UDP, the delivery of messages between you and your peer is not guaranteed.\n\n\
                 RECEIVED MESSAGES ARE NOT GUARANTEED TO ORIGINATE FROM YOUR INTENDED COMMUNICATION TARGET.\n\
                 YOUR MESSAGES ARE NOT ENCRYPTED.\n\n\
                 To stop communication, do enter .exit"
            ),
            Notification::BindFailed { port, reason } => {
                write!(f, "Failed to bind to port {port}: {reason}")
            }
            Notification::ReceiveFailed { reason } => {
                write!(f, "Receiver encountered an I/O error: {reason}")
            }
            Notification::SessionJoined { addr } => write!(f, "{addr} joined"),
            Notification::SessionRenamed { addr, old, new } => {
                write!(f, "{old} ({addr}) is now known as {new}")
            }
            Notification::SessionExpired { addr, name } => {
                write!(f, "{name} ({addr}) timed out")
            }
            Notification::UnknownLocalCommand { command } => {
                write!(f, "Unknown local command: {command}")
            }
            Notification::PushText { text } => f.write_str(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_stable_keys() {
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(
            Notification::PeerOnline { from }.topic(),
            "TARGET_PEER_ONLINE"
        );
        assert_eq!(
            Notification::AckMissingSeparator.topic(),
            "MALFORMED_ACK_MISSING_SPACE_SEPARATOR"
        );
        assert!(Notification::AckMissingSeparator.is_malformed_ack());
        assert!(!Notification::PeerOnline { from }.is_malformed_ack());
    }
}
