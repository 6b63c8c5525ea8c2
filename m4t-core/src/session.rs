//! Session registry: one entry per remote address, refreshed on contact, reaped when idle.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Hub default idle timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Longest accepted display name, in characters.
pub const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub addr: SocketAddr,
    pub name: String,
    pub last_seen: Instant,
    /// Discriminator we handed this peer in our E2SALVE.
    pub assigned_discriminator: Option<u16>,
    /// Discriminator this peer handed us; attached to every frame we send it.
    pub peer_discriminator: Option<u16>,
}

impl Session {
    fn new(addr: SocketAddr, now: Instant) -> Self {
        Self {
            addr,
            name: addr.to_string(),
            last_seen: now,
            assigned_discriminator: None,
            peer_discriminator: None,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenameError {
    #[error("unknown session {0}")]
    UnknownSession(SocketAddr),
    #[error("display name must be 1 to {} characters", MAX_NAME_LEN)]
    InvalidName,
}

/// Concurrent directory of known peers.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SocketAddr, Session>,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get_or_create(&self, addr: SocketAddr) -> (Session, bool) {
        self.get_or_create_at(addr, Instant::now())
    }

    /// Find-or-insert under the shard lock. Returns a copy and whether it was just created.
    pub fn get_or_create_at(&self, addr: SocketAddr, now: Instant) -> (Session, bool) {
        match self.sessions.entry(addr) {
            Entry::Occupied(mut e) => {
                let session = e.get_mut();
                session.last_seen = now;
                (session.clone(), false)
            }
            Entry::Vacant(e) => {
                let session = Session::new(addr, now);
                e.insert(session.clone());
                (session, true)
            }
        }
    }

    pub fn touch(&self, addr: SocketAddr) -> bool {
        self.touch_at(addr, Instant::now())
    }

    pub fn touch_at(&self, addr: SocketAddr, now: Instant) -> bool {
        match self.sessions.get_mut(&addr) {
            Some(mut session) => {
                session.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Session> {
        self.sessions.get(&addr).map(|s| s.value().clone())
    }

    /// Point-in-time copy of every session, for fan-out.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Change the display name of `addr`. Returns the previous name.
    pub fn rename(&self, addr: SocketAddr, name: &str) -> Result<String, RenameError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(RenameError::InvalidName);
        }
        let mut session = self
            .sessions
            .get_mut(&addr)
            .ok_or(RenameError::UnknownSession(addr))?;
        Ok(std::mem::replace(&mut session.name, name.to_string()))
    }

    pub fn set_assigned_discriminator(&self, addr: SocketAddr, discriminator: u16) -> bool {
        self.update(addr, |s| s.assigned_discriminator = Some(discriminator))
    }

    pub fn set_peer_discriminator(&self, addr: SocketAddr, discriminator: u16) -> bool {
        self.update(addr, |s| s.peer_discriminator = Some(discriminator))
    }

    fn update(&self, addr: SocketAddr, f: impl FnOnce(&mut Session)) -> bool {
        match self.sessions.get_mut(&addr) {
            Some(mut session) => {
                f(&mut session);
                true
            }
            None => false,
        }
    }

    pub fn reap(&self) -> Vec<Session> {
        self.reap_at(Instant::now())
    }

    /// Remove every session idle for longer than the timeout. A session touched between the
    /// scan and the removal is kept.
    pub fn reap_at(&self, now: Instant) -> Vec<Session> {
        let stale: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|s| s.age(now) > self.timeout)
            .map(|s| *s.key())
            .collect();
        stale
            .into_iter()
            .filter_map(|addr| {
                self.sessions
                    .remove_if(&addr, |_, s| s.age(now) > self.timeout)
                    .map(|(_, s)| s)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn first_contact_creates_then_refreshes() {
        let registry = SessionRegistry::default();
        let t0 = Instant::now();
        let (session, created) = registry.get_or_create_at(addr(1), t0);
        assert!(created);
        assert_eq!(session.name, "127.0.0.1:1");

        let t1 = t0 + Duration::from_secs(5);
        let (session, created) = registry.get_or_create_at(addr(1), t1);
        assert!(!created);
        assert_eq!(session.last_seen, t1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn touch_does_not_create() {
        let registry = SessionRegistry::default();
        assert!(!registry.touch(addr(1)));
        assert!(registry.is_empty());
        registry.get_or_create(addr(1));
        assert!(registry.touch(addr(1)));
    }

    #[test]
    fn reap_respects_timeout_edge() {
        let timeout = Duration::from_secs(60);
        let registry = SessionRegistry::new(timeout);
        let t = Instant::now();
        registry.get_or_create_at(addr(1), t);
        let eps = Duration::from_millis(1);

        assert!(registry.reap_at(t + timeout - eps).is_empty());
        assert!(registry.get(addr(1)).is_some());

        let reaped = registry.reap_at(t + timeout + eps);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].addr, addr(1));
        assert!(registry.get(addr(1)).is_none());
    }

    #[test]
    fn reap_keeps_fresh_sessions() {
        let timeout = Duration::from_secs(10);
        let registry = SessionRegistry::new(timeout);
        let t = Instant::now();
        registry.get_or_create_at(addr(1), t);
        registry.get_or_create_at(addr(2), t);
        registry.touch_at(addr(2), t + Duration::from_secs(8));

        let reaped = registry.reap_at(t + Duration::from_secs(12));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].addr, addr(1));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn rename_validates_and_returns_previous() {
        let registry = SessionRegistry::default();
        registry.get_or_create(addr(1));
        assert_eq!(registry.rename(addr(1), "  alice "), Ok("127.0.0.1:1".into()));
        assert_eq!(registry.get(addr(1)).unwrap().name, "alice");
        assert_eq!(registry.rename(addr(1), "   "), Err(RenameError::InvalidName));
        assert_eq!(
            registry.rename(addr(1), &"x".repeat(MAX_NAME_LEN + 1)),
            Err(RenameError::InvalidName)
        );
        assert_eq!(
            registry.rename(addr(2), "bob"),
            Err(RenameError::UnknownSession(addr(2)))
        );
    }

    #[test]
    fn discriminators_are_stored_per_session() {
        let registry = SessionRegistry::default();
        assert!(!registry.set_peer_discriminator(addr(1), 5));
        registry.get_or_create(addr(1));
        assert!(registry.set_peer_discriminator(addr(1), 5));
        assert!(registry.set_assigned_discriminator(addr(1), 6));
        let s = registry.get(addr(1)).unwrap();
        assert_eq!(s.peer_discriminator, Some(5));
        assert_eq!(s.assigned_discriminator, Some(6));
    }
}
