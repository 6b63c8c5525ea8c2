//! Semaphore exchange: control tokens carried in frame content (handshake, keep-alive, ACK).
//!
//! A token matches only as an exact word: the content is the token itself, or the token
//! followed by a space. Anything else, including text that merely starts with `|^~`, is an
//! ordinary chat message.

use std::net::SocketAddr;

use rand::Rng;

use crate::identity::IdentityToken;
use crate::notify::Notification;
use crate::wire::Frame;

/// General message acknowledgement.
pub const ACK: &str = "|^~ACK";
/// Liveness announcement; carries the sender's identity token.
pub const SALVE: &str = "|^~SALVE";
/// Echo of a SALVE; may carry a session discriminator for the receiver to adopt.
pub const E2SALVE: &str = "|^~E2SALVE";
/// Keep-alive pulse.
pub const KA: &str = "|^~KA";

/// Stand-in identity echoed back when a SALVE carries none.
const ANONYMOUS: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Ack,
    Salve,
    EchoSalve,
    KeepAlive,
}

impl Token {
    const TABLE: [(Token, &'static str); 4] = [
        (Token::Ack, ACK),
        (Token::Salve, SALVE),
        (Token::EchoSalve, E2SALVE),
        (Token::KeepAlive, KA),
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Token::Ack => ACK,
            Token::Salve => SALVE,
            Token::EchoSalve => E2SALVE,
            Token::KeepAlive => KA,
        }
    }

    /// Split `content` into token and the text after the separating space.
    pub fn match_prefix(content: &str) -> Option<(Token, &str)> {
        Self::TABLE.iter().find_map(|&(token, text)| {
            let rest = content.strip_prefix(text)?;
            if rest.is_empty() {
                Some((token, rest))
            } else {
                rest.strip_prefix(' ').map(|fields| (token, fields))
            }
        })
    }
}

/// A parsed control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Semaphore<'a> {
    Ack {
        message_id: u16,
        discriminator: u16,
        content: &'a str,
    },
    Salve {
        identity: &'a str,
    },
    EchoSalve {
        acknowledged: &'a str,
        responder: &'a str,
        discriminator: Option<u16>,
    },
    KeepAlive,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SemaphoreError {
    #[error("malformed E2SALVE: {content:?}")]
    MalformedHandshake { content: String },
    #[error("malformed E2SALVE session discriminator: {session_part:?}")]
    MalformedHandshakeSession { session_part: String },
    #[error("malformed ACK: missing space separator")]
    AckMissingSeparator,
    #[error("malformed ACK for {message_id}: missing session or message")]
    AckMissingSessionOrContent { message_id: String },
    #[error("malformed ACK: invalid message id {message_id:?} or session {session:?}")]
    AckInvalidIdOrSession { message_id: String, session: String },
}

impl From<SemaphoreError> for Notification {
    fn from(err: SemaphoreError) -> Self {
        match err {
            SemaphoreError::MalformedHandshake { content } => {
                Notification::MalformedHandshake { content }
            }
            SemaphoreError::MalformedHandshakeSession { session_part } => {
                Notification::MalformedHandshakeSession { session_part }
            }
            SemaphoreError::AckMissingSeparator => Notification::AckMissingSeparator,
            SemaphoreError::AckMissingSessionOrContent { message_id } => {
                Notification::AckMissingSessionOrContent { message_id }
            }
            SemaphoreError::AckInvalidIdOrSession {
                message_id,
                session,
            } => Notification::AckInvalidIdOrSession {
                message_id,
                session,
            },
        }
    }
}

/// Parse a 16-bit wire number. Unsigned decimal, or the signed form older peers print.
pub fn parse_wire_u16(s: &str) -> Option<u16> {
    s.parse::<u16>()
        .ok()
        .or_else(|| s.parse::<i16>().ok().map(|v| v as u16))
}

/// Classify frame content. `Ok(None)` means an ordinary message.
pub fn classify(content: &str) -> Result<Option<Semaphore<'_>>, SemaphoreError> {
    let Some((token, fields)) = Token::match_prefix(content) else {
        return Ok(None);
    };
    let semaphore = match token {
        Token::Ack => parse_ack(fields)?,
        Token::Salve => Semaphore::Salve {
            identity: fields.trim(),
        },
        Token::EchoSalve => parse_echo_salve(fields)?,
        Token::KeepAlive => Semaphore::KeepAlive,
    };
    Ok(Some(semaphore))
}

fn parse_ack(fields: &str) -> Result<Semaphore<'_>, SemaphoreError> {
    let (id_part, rest) = fields
        .split_once(' ')
        .ok_or(SemaphoreError::AckMissingSeparator)?;
    let (session_part, content) =
        rest.split_once(' ')
            .ok_or_else(|| SemaphoreError::AckMissingSessionOrContent {
                message_id: id_part.to_string(),
            })?;
    match (parse_wire_u16(id_part), parse_wire_u16(session_part)) {
        (Some(message_id), Some(discriminator)) => Ok(Semaphore::Ack {
            message_id,
            discriminator,
            content,
        }),
        _ => Err(SemaphoreError::AckInvalidIdOrSession {
            message_id: id_part.to_string(),
            session: session_part.to_string(),
        }),
    }
}

fn parse_echo_salve(fields: &str) -> Result<Semaphore<'_>, SemaphoreError> {
    let parts: Vec<&str> = fields.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(SemaphoreError::MalformedHandshake {
            content: fields.trim().to_string(),
        });
    }
    let discriminator = match parts.get(2) {
        Some(part) => Some(parse_wire_u16(part).ok_or_else(|| {
            SemaphoreError::MalformedHandshakeSession {
                session_part: part.to_string(),
            }
        })?),
        None => None,
    };
    Ok(Semaphore::EchoSalve {
        acknowledged: parts[0],
        responder: parts[1],
        discriminator,
    })
}

/// Whether a SALVE reply hands the sender a discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscriminatorPolicy {
    /// Two-party peers: reply without a discriminator.
    None,
    /// Hubs: pick a fresh non-zero discriminator for each SALVE.
    Assign,
}

/// What the host must do after a control frame was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send this content back to the frame's sender.
    Reply(String),
    Notify(Notification),
    /// The sender told us which discriminator to attach from now on. Last write wins.
    AdoptDiscriminator(u16),
    /// We told the sender to attach this discriminator.
    AssignedDiscriminator(u16),
    /// Informational; no delivery tracking exists.
    Acknowledged { message_id: u16, discriminator: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not a control frame: acknowledge it and display or relay it.
    Ordinary,
    Control(Vec<Effect>),
}

impl Verdict {
    pub fn is_ordinary(&self) -> bool {
        matches!(self, Verdict::Ordinary)
    }
}

/// Handles control frames for one protocol instance.
#[derive(Debug, Clone)]
pub struct SemaphoreProtocol {
    identity: IdentityToken,
    policy: DiscriminatorPolicy,
}

impl SemaphoreProtocol {
    pub fn new(identity: IdentityToken, policy: DiscriminatorPolicy) -> Self {
        Self { identity, policy }
    }

    pub fn identity(&self) -> &IdentityToken {
        &self.identity
    }

    /// `|^~SALVE <our-identity>`
    pub fn salve(&self) -> String {
        format!("{SALVE} {}", self.identity)
    }

    pub fn keep_alive(&self) -> &'static str {
        KA
    }

    /// `|^~ACK <id> <discriminator> <content>` for a received ordinary frame.
    pub fn ack(&self, frame: &Frame) -> String {
        format!(
            "{ACK} {} {} {}",
            frame.message_id,
            frame.discriminator.unwrap_or(0),
            frame.content
        )
    }

    /// Classify and handle one frame's content received from `from`.
    pub fn handle(&self, from: SocketAddr, content: &str) -> Verdict {
        let semaphore = match classify(content) {
            Ok(Some(s)) => s,
            Ok(None) => return Verdict::Ordinary,
            Err(err) => {
                tracing::debug!(%from, error = %err, "dropping malformed control frame");
                return Verdict::Control(vec![Effect::Notify(err.into())]);
            }
        };

        let effects = match semaphore {
            Semaphore::Salve { identity } => {
                let identity = if identity.is_empty() {
                    ANONYMOUS
                } else {
                    identity
                };
                let mut reply = format!("{E2SALVE} {identity} {}", self.identity);
                let mut effects = vec![Effect::Notify(Notification::PeerOnline { from })];
                if self.policy == DiscriminatorPolicy::Assign {
                    let discriminator = rand::thread_rng().gen_range(1..=u16::MAX);
                    reply.push_str(&format!(" {discriminator}"));
                    effects.push(Effect::AssignedDiscriminator(discriminator));
                }
                effects.push(Effect::Reply(reply));
                effects
            }
            Semaphore::EchoSalve { discriminator, .. } => {
                let mut effects = vec![Effect::Notify(Notification::PeerOnline { from })];
                if let Some(d) = discriminator {
                    effects.push(Effect::AdoptDiscriminator(d));
                }
                effects
            }
            Semaphore::Ack {
                message_id,
                discriminator,
                ..
            } => vec![Effect::Acknowledged {
                message_id,
                discriminator,
            }],
            Semaphore::KeepAlive => Vec::new(),
        };
        Verdict::Control(effects)
    }
}
