//! Server-side conditional-update sessions.
//!
//! A session is strictly single-threaded: each RPC reserves it for the
//! duration of the request, and a second reservation attempt fails rather
//! than queue. Invalidation is the client's unknown-status fence: once
//! [`SessionManager::invalidate`] returns, no request on that session can
//! ever apply another mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tabletdb_common::Authorizations;
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tokio::time::Instant;
use tracing::{debug, info};

struct SessionEntry {
    authorizations: Authorizations,
    last_access: Instant,
    reserved: bool,
    invalidated: bool,
}

/// The server's conditional-session table.
pub struct SessionManager {
    sessions: DashMap<u64, SessionEntry, ahash::RandomState>,
    ttl: Duration,
    next_id: AtomicU64,
}

impl SessionManager {
    /// A manager whose sessions idle out after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        SessionManager {
            sessions: DashMap::with_hasher(ahash::RandomState::new()),
            ttl,
            next_id: AtomicU64::new(1),
        }
    }

    /// The advertised idle lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Open a session.
    pub fn create(&self, authorizations: Authorizations) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(
            id,
            SessionEntry {
                authorizations,
                last_access: Instant::now(),
                reserved: false,
                invalidated: false,
            },
        );
        debug!(session = id, "conditional session opened");
        id
    }

    /// Reserve a session for one request, returning its authorizations.
    /// Fails with `NoSuchSession` for unknown or invalidated sessions and
    /// with `InvalidArgument` if the session is already serving a request
    /// (sessions are never pipelined).
    pub fn reserve(&self, id: u64) -> TabletDbResult<Authorizations> {
        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or(TabletDbError::NoSuchSession(id))?;
        if entry.invalidated {
            return Err(TabletDbError::NoSuchSession(id));
        }
        if entry.reserved {
            return Err(TabletDbError::InvalidArgument(format!(
                "session {id} is already serving a request"
            )));
        }
        entry.reserved = true;
        entry.last_access = Instant::now();
        Ok(entry.authorizations.clone())
    }

    /// Release a reservation taken by [`Self::reserve`].
    pub fn unreserve(&self, id: u64) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.reserved = false;
            entry.last_access = Instant::now();
        }
    }

    /// The fence: mark the session invalid and wait for any in-flight
    /// request on it to finish. After this returns, every future reserve
    /// fails, so no further mutation from the session can be applied.
    pub async fn invalidate(&self, id: u64) -> TabletDbResult<()> {
        {
            let mut entry = self
                .sessions
                .get_mut(&id)
                .ok_or(TabletDbError::NoSuchSession(id))?;
            entry.invalidated = true;
        }
        loop {
            let reserved = self
                .sessions
                .get(&id)
                .map(|entry| entry.reserved)
                .unwrap_or(false);
            if !reserved {
                info!(session = id, "conditional session invalidated");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drop a session outright (client close).
    pub fn remove(&self, id: u64) {
        self.sessions.remove(&id);
    }

    /// Sweep sessions idle past the TTL. Reserved sessions are never
    /// swept. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| entry.reserved || entry.last_access.elapsed() < ttl);
        before - self.sessions.len()
    }
}
