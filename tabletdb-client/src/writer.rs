//! The conditional writer: compare-and-set writes from the client side.
//!
//! Mutations are binned by current tablet location and sent over a
//! per-server session. The delicate part is failure: an RPC that dies
//! mid-flight may or may not have applied its mutations, and the writer may
//! only report `UNKNOWN` once it is *sure* the server will never apply them
//! later. That fence is the session-invalidation protocol in
//! [`ConditionalWriter::fence_session`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tabletdb_common::{
    Authorizations, ConditionalMutation, ConditionalWriteStatus, KeyExtent, TableId,
};
use tabletdb_coordination::lock::is_lock_held;
use tabletdb_coordination::store::CoordinationStore;
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::rpc::{ConditionalSessionInfo, ServerConnector, TabletLocator, TabletServerService};

/// Writer tuning.
#[derive(Debug, Clone)]
pub struct ConditionalWriterConfig {
    /// Overall deadline for each `write` call; mutations still unresolved
    /// at the deadline are reported as timed out.
    pub timeout: Duration,
    /// Pause between rounds when nothing could be resolved (tablets not
    /// hosted, rows contended).
    pub retry_pause: Duration,
}

impl Default for ConditionalWriterConfig {
    fn default() -> Self {
        ConditionalWriterConfig {
            // effectively unbounded by default
            timeout: Duration::from_secs(u64::MAX / 1_000),
            retry_pause: Duration::from_millis(100),
        }
    }
}

/// The outcome of one conditional mutation.
#[derive(Debug)]
pub struct ConditionalWriteResult {
    /// The mutation as submitted
    pub mutation: ConditionalMutation,
    /// Its final status, or the error that ended it (timeout, bad input)
    pub status: TabletDbResult<ConditionalWriteStatus>,
}

struct Session {
    info: ConditionalSessionInfo,
    last_used: Instant,
}

impl Session {
    fn reusable(&self) -> bool {
        self.last_used.elapsed() < self.info.ttl.mul_f64(0.95)
    }
}

enum ServerOutcome {
    /// Statuses came back; `Ignored` entries will be requeued by the caller.
    Results(Vec<(u64, ConditionalWriteStatus)>),
    /// The batch should be retried from scratch (stale session, no
    /// connection); nothing was applied under the session.
    Requeue,
    /// The fence ran (or the server is dead): outcomes are unknowable and
    /// final.
    Unknown,
}

/// A conditional writer for one table.
pub struct ConditionalWriter {
    table: TableId,
    authorizations: Authorizations,
    locator: Arc<dyn TabletLocator>,
    connector: Arc<dyn ServerConnector>,
    coordination: Arc<dyn CoordinationStore>,
    config: ConditionalWriterConfig,
    /// One session per server; a session is removed from the map while a
    /// request is in flight so it is never pipelined.
    sessions: tokio::sync::Mutex<HashMap<String, Session>>,
}

impl ConditionalWriter {
    /// Build a writer over the given table.
    pub fn new(
        table: TableId,
        authorizations: Authorizations,
        locator: Arc<dyn TabletLocator>,
        connector: Arc<dyn ServerConnector>,
        coordination: Arc<dyn CoordinationStore>,
        config: ConditionalWriterConfig,
    ) -> Self {
        ConditionalWriter {
            table,
            authorizations,
            locator,
            connector,
            coordination,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Submit conditional mutations and drive each to a final outcome.
    /// Results come back in submission order.
    pub async fn write(
        &self,
        mutations: Vec<ConditionalMutation>,
    ) -> TabletDbResult<Vec<ConditionalWriteResult>> {
        let start = Instant::now();
        let mut outcomes: HashMap<u64, TabletDbResult<ConditionalWriteStatus>> = HashMap::new();
        let mut originals: HashMap<u64, ConditionalMutation> = HashMap::new();
        let mut pending: VecDeque<(u64, ConditionalMutation)> = VecDeque::new();

        for (i, mut cm) in mutations.into_iter().enumerate() {
            let id = i as u64;
            originals.insert(id, cm.clone());
            if cm.conditions.is_empty() {
                outcomes.insert(
                    id,
                    Err(TabletDbError::InvalidArgument(
                        "conditional mutation requires at least one condition".into(),
                    )),
                );
                continue;
            }
            // sorted client-side so the server's row scan has locality
            cm.sort_conditions();
            pending.push_back((id, cm));
        }

        while !pending.is_empty() {
            if start.elapsed() > self.config.timeout {
                for (id, _) in pending.drain(..) {
                    outcomes.insert(id, Err(TabletDbError::TimedOut(start.elapsed())));
                }
                break;
            }

            // bin by current location
            let mut bins: HashMap<String, HashMap<KeyExtent, Vec<(u64, ConditionalMutation)>>> =
                HashMap::new();
            let mut unlocated = Vec::new();
            for (id, cm) in pending.drain(..) {
                match self.locator.locate(&self.table, cm.row()).await? {
                    Some(location) => bins
                        .entry(location.server)
                        .or_default()
                        .entry(location.extent)
                        .or_default()
                        .push((id, cm)),
                    None => unlocated.push((id, cm)),
                }
            }

            let mut progressed = false;
            for (server, batch) in bins {
                let ids: Vec<u64> = batch.values().flatten().map(|(id, _)| *id).collect();
                match self.write_to_server(&server, &batch, start).await {
                    ServerOutcome::Results(statuses) => {
                        for (id, status) in statuses {
                            if status == ConditionalWriteStatus::Ignored {
                                // the tablet moved, closed, or is overloaded;
                                // refresh the locator and try again
                                let extent = cm_extent_of(&batch, id);
                                self.locator.invalidate(&extent);
                                let cm = batch
                                    .get(&extent)
                                    .and_then(|ms| ms.iter().find(|(mid, _)| *mid == id))
                                    .expect("status id came from this batch");
                                pending.push_back(cm.clone());
                            } else {
                                progressed = true;
                                outcomes.insert(id, Ok(status));
                            }
                        }
                    }
                    ServerOutcome::Requeue => {
                        for (extent, ms) in &batch {
                            self.locator.invalidate(extent);
                            for (id, cm) in ms {
                                pending.push_back((*id, cm.clone()));
                            }
                        }
                    }
                    ServerOutcome::Unknown => {
                        progressed = true;
                        for id in ids {
                            outcomes.insert(id, Ok(ConditionalWriteStatus::Unknown));
                        }
                    }
                }
            }

            pending.extend(unlocated);
            if !progressed && !pending.is_empty() {
                tokio::time::sleep(self.config.retry_pause).await;
            }
        }

        let mut results: Vec<ConditionalWriteResult> = Vec::with_capacity(originals.len());
        let mut ids: Vec<u64> = originals.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            results.push(ConditionalWriteResult {
                mutation: originals.remove(&id).expect("id enumerated from map"),
                status: outcomes
                    .remove(&id)
                    .unwrap_or(Err(TabletDbError::Unknown("mutation never resolved".into()))),
            });
        }
        Ok(results)
    }

    async fn write_to_server(
        &self,
        server: &str,
        batch: &HashMap<KeyExtent, Vec<(u64, ConditionalMutation)>>,
        start: Instant,
    ) -> ServerOutcome {
        let Some(service) = self.connector.connect(server) else {
            debug!(server, "no connection; rebinning");
            return ServerOutcome::Requeue;
        };
        let session = match self.take_session(server, service.as_ref()).await {
            Ok(session) => session,
            Err(e) => {
                warn!(server, %e, "could not open conditional session");
                return ServerOutcome::Requeue;
            }
        };

        let request: HashMap<KeyExtent, Vec<(u64, ConditionalMutation)>> = batch.clone();
        match service
            .conditional_update(session.info.session_id, request)
            .await
        {
            Ok(result) => {
                self.return_session(server, session).await;
                ServerOutcome::Results(result.statuses)
            }
            Err(TabletDbError::NoSuchSession(_)) => {
                // session expired server-side; nothing under it can be in
                // flight, safe to just retry on a fresh one
                ServerOutcome::Requeue
            }
            Err(e) => {
                warn!(server, %e, "conditional update failed; fencing session");
                self.fence_session(server, &session, start).await
            }
        }
    }

    /// The correctness hinge. The RPC failed with the session possibly
    /// still live on the server, so its mutations may yet be applied. Poll
    /// the server's lock: a dead server can never apply them (`UNKNOWN` is
    /// safe); a live one must acknowledge
    /// `invalidate_conditional_update`, after which it guarantees no
    /// further mutation from the session will be applied. Only then is
    /// `UNKNOWN` reported.
    async fn fence_session(
        &self,
        server: &str,
        session: &Session,
        start: Instant,
    ) -> ServerOutcome {
        loop {
            match is_lock_held(self.coordination.as_ref(), &session.info.lock_id).await {
                Ok(false) => return ServerOutcome::Unknown,
                Ok(true) => {
                    if let Some(service) = self.connector.connect(server) {
                        if service
                            .invalidate_conditional_update(session.info.session_id)
                            .await
                            .is_ok()
                        {
                            return ServerOutcome::Unknown;
                        }
                    }
                }
                Err(e) => {
                    warn!(%e, "cannot read server lock while fencing");
                }
            }
            if start.elapsed() > self.config.timeout {
                // deadline passed without a fence; the caller reports
                // timeouts, not unknowns, for whatever is still pending
                return ServerOutcome::Requeue;
            }
            tokio::time::sleep(self.config.retry_pause).await;
        }
    }

    async fn take_session(
        &self,
        server: &str,
        service: &dyn TabletServerService,
    ) -> TabletDbResult<Session> {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.remove(server) {
                if session.reusable() {
                    return Ok(session);
                }
                // stale; let the server's cleaner collect it
            }
        }
        let info = service
            .start_conditional_session(self.authorizations.clone())
            .await?;
        debug!(server, session = info.session_id, "opened conditional session");
        Ok(Session {
            info,
            last_used: Instant::now(),
        })
    }

    async fn return_session(&self, server: &str, mut session: Session) {
        session.last_used = Instant::now();
        self.sessions
            .lock()
            .await
            .insert(server.to_string(), session);
    }
}

fn cm_extent_of(
    batch: &HashMap<KeyExtent, Vec<(u64, ConditionalMutation)>>,
    id: u64,
) -> KeyExtent {
    batch
        .iter()
        .find(|(_, ms)| ms.iter().any(|(mid, _)| *mid == id))
        .map(|(e, _)| e.clone())
        .expect("status id came from this batch")
}
