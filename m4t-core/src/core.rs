//! Host-driven API: the cores receive datagrams from the host and return actions.
//! Neither core touches a socket; the host performs every `SendTo`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::dedup::DedupWindow;
use crate::identity::IdentityToken;
use crate::notify::Notification;
use crate::semaphore::{DiscriminatorPolicy, Effect, SemaphoreProtocol, Verdict};
use crate::session::{Session, SessionRegistry};
use crate::wire::{Frame, PayloadCodec};

/// Hub command a session uses to change its own display name: `.NAME <new name>`.
pub const RENAME_COMMAND: &str = ".NAME";

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    SendTo(SocketAddr, Vec<u8>),
    /// An ordinary message for the front-end.
    Display {
        from: SocketAddr,
        message_id: u16,
        text: String,
    },
    Notify(Notification),
}

/// One encoded outbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub message_id: u16,
    pub bytes: Vec<u8>,
}

fn random_message_id() -> u16 {
    rand::random()
}

/// `Some(rest)` when `content` is a rename command.
fn parse_rename(content: &str) -> Option<&str> {
    let word = content.split_whitespace().next()?;
    if !word.eq_ignore_ascii_case(RENAME_COMMAND) {
        return None;
    }
    let start = content.find(word)? + word.len();
    Some(content[start..].trim())
}

/// Multi-peer relay. Every ordinary message is acknowledged to its sender and relayed to
/// every other known session.
pub struct HubCore {
    codec: PayloadCodec,
    protocol: SemaphoreProtocol,
    dedup: Mutex<DedupWindow>,
    registry: Arc<SessionRegistry>,
}

impl HubCore {
    pub fn new(codec: PayloadCodec, identity: IdentityToken, registry: Arc<SessionRegistry>) -> Self {
        Self {
            codec,
            protocol: SemaphoreProtocol::new(identity, DiscriminatorPolicy::Assign),
            dedup: Mutex::new(DedupWindow::new()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &IdentityToken {
        self.protocol.identity()
    }

    pub fn on_datagram(&self, from: SocketAddr, bytes: &[u8]) -> Vec<OutboundAction> {
        self.on_datagram_at(from, bytes, Instant::now())
    }

    /// Decode, register contact, suppress duplicates, then handle control or ordinary content.
    pub fn on_datagram_at(
        &self,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Vec<OutboundAction> {
        let frame = match self.codec.decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%from, error = %err, "dropping datagram");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        let (session, created) = self.registry.get_or_create_at(from, now);
        if created {
            actions.push(OutboundAction::Notify(Notification::SessionJoined { addr: from }));
        }

        if self
            .dedup
            .lock()
            .check_and_record_at(frame.message_id, now)
        {
            trace!(%from, message_id = frame.message_id, "duplicate suppressed");
            return actions;
        }

        match self.protocol.handle(from, &frame.content) {
            Verdict::Control(effects) => self.apply(from, effects, &mut actions),
            Verdict::Ordinary => self.on_ordinary(&session, &frame, &mut actions),
        }
        actions
    }

    fn apply(&self, from: SocketAddr, effects: Vec<Effect>, actions: &mut Vec<OutboundAction>) {
        for effect in effects {
            match effect {
                Effect::Reply(content) => {
                    let discriminator = self
                        .registry
                        .get(from)
                        .and_then(|s| s.peer_discriminator);
                    actions.push(self.send(from, discriminator, &content));
                }
                Effect::Notify(notification) => actions.push(OutboundAction::Notify(notification)),
                Effect::AdoptDiscriminator(d) => {
                    self.registry.set_peer_discriminator(from, d);
                }
                Effect::AssignedDiscriminator(d) => {
                    self.registry.set_assigned_discriminator(from, d);
                }
                Effect::Acknowledged {
                    message_id,
                    discriminator,
                } => trace!(%from, message_id, discriminator, "ack received"),
            }
        }
    }

    fn on_ordinary(&self, session: &Session, frame: &Frame, actions: &mut Vec<OutboundAction>) {
        let from = session.addr;
        actions.push(self.send(from, session.peer_discriminator, &self.protocol.ack(frame)));

        if let Some(name) = parse_rename(&frame.content) {
            match self.registry.rename(from, name) {
                Ok(old) => {
                    let new = name.to_string();
                    self.relay(from, &format!("* {old} is now known as {new}"), actions);
                    actions.push(OutboundAction::Notify(Notification::SessionRenamed {
                        addr: from,
                        old,
                        new,
                    }));
                }
                Err(err) => debug!(%from, error = %err, "rename rejected"),
            }
            return;
        }

        self.relay(from, &format!("{}: {}", session.name, frame.content), actions);
    }

    /// Fan out to every session except the sender.
    fn relay(&self, from: SocketAddr, text: &str, actions: &mut Vec<OutboundAction>) {
        for peer in self.registry.snapshot() {
            if peer.addr == from {
                continue;
            }
            actions.push(self.send(peer.addr, peer.peer_discriminator, text));
        }
    }

    fn send(&self, to: SocketAddr, discriminator: Option<u16>, content: &str) -> OutboundAction {
        let encoded = self
            .codec
            .encode(random_message_id(), discriminator, content);
        if encoded.unsent > 0 {
            debug!(%to, unsent = encoded.unsent, "outbound content truncated");
        }
        OutboundAction::SendTo(to, encoded.bytes)
    }
}

/// Two-party endpoint state. The session discriminator and last-received time are atomics:
/// the receive task writes them, any task reads them.
pub struct PeerCore {
    peer: SocketAddr,
    codec: PayloadCodec,
    protocol: SemaphoreProtocol,
    dedup: Mutex<DedupWindow>,
    /// 0 = none learned.
    discriminator: AtomicU16,
    epoch: Instant,
    /// Millis since `epoch` plus one; 0 = nothing received yet.
    last_received: AtomicU64,
}

impl PeerCore {
    pub fn new(peer: SocketAddr, codec: PayloadCodec, identity: IdentityToken) -> Self {
        Self {
            peer,
            codec,
            protocol: SemaphoreProtocol::new(identity, DiscriminatorPolicy::None),
            dedup: Mutex::new(DedupWindow::new()),
            discriminator: AtomicU16::new(0),
            epoch: Instant::now(),
            last_received: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn identity(&self) -> &IdentityToken {
        self.protocol.identity()
    }

    pub fn discriminator(&self) -> Option<u16> {
        match self.discriminator.load(Ordering::Acquire) {
            0 => None,
            d => Some(d),
        }
    }

    pub fn last_received(&self) -> Option<Instant> {
        match self.last_received.load(Ordering::Acquire) {
            0 => None,
            v => Some(self.epoch + Duration::from_millis(v - 1)),
        }
    }

    fn mark_received(&self) {
        let millis = self.epoch.elapsed().as_millis() as u64;
        self.last_received.store(millis + 1, Ordering::Release);
    }

    /// Handle one datagram. Replies and ACKs go back to the datagram's sender.
    pub fn on_datagram(&self, from: SocketAddr, bytes: &[u8]) -> Vec<OutboundAction> {
        let frame = match self.codec.decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%from, error = %err, "dropping datagram");
                return Vec::new();
            }
        };
        self.mark_received();

        if self.dedup.lock().check_and_record(frame.message_id) {
            trace!(%from, message_id = frame.message_id, "duplicate suppressed");
            return Vec::new();
        }

        let mut actions = Vec::new();
        match self.protocol.handle(from, &frame.content) {
            Verdict::Control(effects) => {
                for effect in effects {
                    match effect {
                        Effect::Reply(content) => {
                            actions.push(OutboundAction::SendTo(from, self.encode(&content).bytes))
                        }
                        Effect::Notify(n) => actions.push(OutboundAction::Notify(n)),
                        Effect::AdoptDiscriminator(d) => {
                            debug!(%from, discriminator = d, "session discriminator adopted");
                            self.discriminator.store(d, Ordering::Release);
                        }
                        Effect::AssignedDiscriminator(_) => {}
                        Effect::Acknowledged {
                            message_id,
                            discriminator,
                        } => trace!(%from, message_id, discriminator, "ack received"),
                    }
                }
            }
            Verdict::Ordinary => {
                let ack = self.protocol.ack(&frame);
                actions.push(OutboundAction::SendTo(from, self.encode(&ack).bytes));
                actions.push(OutboundAction::Display {
                    from,
                    message_id: frame.message_id,
                    text: frame.content,
                });
            }
        }
        actions
    }

    fn encode(&self, content: &str) -> Outgoing {
        let message_id = random_message_id();
        let encoded = self.codec.encode(message_id, self.discriminator(), content);
        Outgoing {
            message_id,
            bytes: encoded.bytes,
        }
    }

    /// Frames for a chat message. Content that does not fit one datagram continues in
    /// follow-up frames, each with its own id.
    pub fn outgoing(&self, content: &str) -> Vec<Outgoing> {
        let mut frames = Vec::new();
        let mut rest = content;
        loop {
            let message_id = random_message_id();
            let encoded = self.codec.encode(message_id, self.discriminator(), rest);
            if encoded.unsent == rest.len() && !rest.is_empty() {
                debug!(unsent = rest.len(), "content does not fit a single frame");
                break;
            }
            let next = encoded.remainder(rest);
            frames.push(Outgoing {
                message_id,
                bytes: encoded.bytes,
            });
            if next.is_empty() {
                break;
            }
            rest = next;
        }
        frames
    }

    pub fn salve(&self) -> Outgoing {
        self.encode(&self.protocol.salve())
    }

    pub fn keep_alive(&self) -> Outgoing {
        self.encode(self.protocol.keep_alive())
    }

    /// Human-readable state dump.
    pub fn describe(&self) -> String {
        let discriminator = self
            .discriminator()
            .map_or_else(|| "none".to_string(), |d| d.to_string());
        let last = self.last_received().map_or_else(
            || "never".to_string(),
            |t| format!("{:.1}s ago", t.elapsed().as_secs_f32()),
        );
        format!(
            "peer: {}\nidentity: {}\nsession discriminator: {}\nlast received: {}\nheader: {:?}\nbuffer size: {}",
            self.peer,
            self.identity(),
            discriminator,
            last,
            self.codec.layout(),
            self.codec.buffer_size(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::HeaderLayout;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn token() -> IdentityToken {
        IdentityToken::from_parts(b"hw", "tester", 7, "salt")
    }

    fn hub() -> HubCore {
        HubCore::new(
            PayloadCodec::default(),
            token(),
            Arc::new(SessionRegistry::default()),
        )
    }

    fn frame(id: u16, discriminator: Option<u16>, content: &str) -> Vec<u8> {
        PayloadCodec::default()
            .encode(id, discriminator, content)
            .bytes
    }

    fn sends(actions: &[OutboundAction]) -> Vec<(SocketAddr, Frame)> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::SendTo(to, bytes) => {
                    Some((*to, PayloadCodec::default().decode(bytes).unwrap()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn hub_fan_out_relays_to_others_and_acks_sender() {
        let hub = hub();
        for (i, port) in [1u16, 2, 3].into_iter().enumerate() {
            hub.on_datagram(addr(port), &frame(100 + i as u16, None, "|^~KA"));
        }
        assert_eq!(hub.registry().len(), 3);

        let actions = hub.on_datagram(addr(1), &frame(5, None, "hello all"));
        let sent = sends(&actions);
        let to_sender: Vec<_> = sent.iter().filter(|(to, _)| *to == addr(1)).collect();
        assert_eq!(to_sender.len(), 1);
        assert_eq!(to_sender[0].1.content, "|^~ACK 5 0 hello all");

        let mut relayed: Vec<_> = sent
            .iter()
            .filter(|(to, _)| *to != addr(1))
            .map(|(to, f)| (*to, f.content.clone()))
            .collect();
        relayed.sort();
        assert_eq!(
            relayed,
            vec![
                (addr(2), "127.0.0.1:1: hello all".to_string()),
                (addr(3), "127.0.0.1:1: hello all".to_string()),
            ]
        );
    }

    #[test]
    fn hub_suppresses_duplicate_ids() {
        let hub = hub();
        hub.on_datagram(addr(2), &frame(1, None, "|^~KA"));
        let bytes = frame(9, None, "once");
        assert_eq!(sends(&hub.on_datagram(addr(1), &bytes)).len(), 2);
        assert!(sends(&hub.on_datagram(addr(1), &bytes)).is_empty());
    }

    #[test]
    fn hub_handshake_assigns_and_adopts_discriminators() {
        let hub = hub();
        let actions = hub.on_datagram(addr(1), &frame(1, None, "|^~SALVE peerToken"));
        assert!(actions.contains(&OutboundAction::Notify(Notification::SessionJoined {
            addr: addr(1)
        })));
        assert!(actions.contains(&OutboundAction::Notify(Notification::PeerOnline {
            from: addr(1)
        })));
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        let parts: Vec<&str> = sent[0].1.content.split(' ').collect();
        assert_eq!(parts[0], "|^~E2SALVE");
        assert_eq!(parts[1], "peerToken");
        assert_eq!(parts[2], hub.identity().as_str());
        let assigned: u16 = parts[3].parse().unwrap();
        assert_eq!(
            hub.registry().get(addr(1)).unwrap().assigned_discriminator,
            Some(assigned)
        );

        hub.on_datagram(addr(1), &frame(2, Some(assigned), "|^~E2SALVE x y 4242"));
        assert_eq!(
            hub.registry().get(addr(1)).unwrap().peer_discriminator,
            Some(4242)
        );

        let actions = hub.on_datagram(addr(2), &frame(3, None, "hi"));
        let relayed: Vec<_> = sends(&actions)
            .into_iter()
            .filter(|(to, _)| *to == addr(1))
            .collect();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].1.discriminator, Some(4242));
    }

    #[test]
    fn hub_malformed_ack_changes_nothing() {
        let hub = hub();
        hub.on_datagram(addr(1), &frame(1, None, "|^~KA"));
        let before = hub.registry().get(addr(1)).unwrap();
        let actions = hub.on_datagram(addr(1), &frame(2, None, "|^~ACK"));
        assert!(sends(&actions).is_empty());
        assert!(actions
            .iter()
            .any(|a| matches!(a, OutboundAction::Notify(n) if n.is_malformed_ack())));
        let after = hub.registry().get(addr(1)).unwrap();
        assert_eq!(before.name, after.name);
        assert_eq!(before.peer_discriminator, after.peer_discriminator);
        assert_eq!(before.assigned_discriminator, after.assigned_discriminator);
    }

    #[test]
    fn hub_rename_applies_only_to_sender() {
        let hub = hub();
        hub.on_datagram(addr(2), &frame(1, None, "|^~KA"));
        let actions = hub.on_datagram(addr(1), &frame(2, None, ".name alice"));
        assert_eq!(hub.registry().get(addr(1)).unwrap().name, "alice");
        assert_eq!(hub.registry().get(addr(2)).unwrap().name, "127.0.0.1:2");
        let notice: Vec<_> = sends(&actions)
            .into_iter()
            .filter(|(to, _)| *to == addr(2))
            .map(|(_, f)| f.content)
            .collect();
        assert_eq!(notice, vec!["* 127.0.0.1:1 is now known as alice".to_string()]);

        let actions = hub.on_datagram(addr(1), &frame(3, None, "hi"));
        let relayed: Vec<_> = sends(&actions)
            .into_iter()
            .filter(|(to, _)| *to == addr(2))
            .map(|(_, f)| f.content)
            .collect();
        assert_eq!(relayed, vec!["alice: hi".to_string()]);
    }

    #[test]
    fn hub_drops_undersized_datagram() {
        let hub = hub();
        assert!(hub.on_datagram(addr(1), &[1, 2, 3]).is_empty());
        assert!(hub.registry().is_empty());
    }

    #[test]
    fn parse_rename_variants() {
        assert_eq!(parse_rename(".NAME bob"), Some("bob"));
        assert_eq!(parse_rename("  .name   bob smith "), Some("bob smith"));
        assert_eq!(parse_rename(".NAME"), Some(""));
        assert_eq!(parse_rename(".NAMES bob"), None);
        assert_eq!(parse_rename("hello"), None);
    }

    #[test]
    fn peer_answers_salve_once() {
        let core = PeerCore::new(addr(9), PayloadCodec::default(), token());
        let actions = core.on_datagram(addr(9), &frame(1, None, "|^~SALVE tokenA"));
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(9));
        assert_eq!(
            sent[0].1.content,
            format!("|^~E2SALVE tokenA {}", core.identity())
        );
        assert!(actions.contains(&OutboundAction::Notify(Notification::PeerOnline {
            from: addr(9)
        })));
    }

    #[test]
    fn peer_adopts_discriminator_and_echoes_it() {
        let core = PeerCore::new(addr(9), PayloadCodec::default(), token());
        assert_eq!(core.discriminator(), None);
        core.on_datagram(addr(9), &frame(1, None, "|^~E2SALVE mine theirs 77"));
        assert_eq!(core.discriminator(), Some(77));
        core.on_datagram(addr(9), &frame(2, None, "|^~E2SALVE mine theirs 78"));
        assert_eq!(core.discriminator(), Some(78));
        core.on_datagram(addr(9), &frame(3, None, "|^~E2SALVE mine theirs bad"));
        assert_eq!(core.discriminator(), Some(78));

        let out = core.outgoing("hello");
        assert_eq!(out.len(), 1);
        let decoded = PayloadCodec::default().decode(&out[0].bytes).unwrap();
        assert_eq!(decoded.discriminator, Some(78));
        assert_eq!(decoded.message_id, out[0].message_id);
    }

    #[test]
    fn peer_acks_and_displays_ordinary_messages() {
        let core = PeerCore::new(addr(9), PayloadCodec::default(), token());
        assert!(core.last_received().is_none());
        let actions = core.on_datagram(addr(9), &frame(40, Some(3), "hey"));
        assert!(core.last_received().is_some());
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.content, "|^~ACK 40 3 hey");
        assert!(actions.contains(&OutboundAction::Display {
            from: addr(9),
            message_id: 40,
            text: "hey".into(),
        }));
        // Same id again is suppressed.
        assert!(core.on_datagram(addr(9), &frame(40, Some(3), "hey")).is_empty());
    }

    #[test]
    fn peer_keep_alive_is_silent() {
        let core = PeerCore::new(addr(9), PayloadCodec::default(), token());
        assert!(core.on_datagram(addr(9), &frame(1, None, "|^~KA")).is_empty());
        assert!(core.last_received().is_some());
    }

    #[test]
    fn long_messages_continue_in_follow_up_frames() {
        let codec = PayloadCodec::new(HeaderLayout::Session, 10).unwrap();
        let core = PeerCore::new(addr(9), codec, token());
        let out = core.outgoing("abcdefghijklmnop");
        let parts: Vec<String> = out
            .iter()
            .map(|o| codec.decode(&o.bytes).unwrap().content)
            .collect();
        assert_eq!(parts, vec!["abcdef", "ghijkl", "mnop"]);
        assert_eq!(core.outgoing("").len(), 1);
    }
}
