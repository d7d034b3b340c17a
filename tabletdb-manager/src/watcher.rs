//! The tablet-group watcher: one per data level.
//!
//! A full-scan loop walks every tablet of the level while an event-driven
//! partial loop re-examines just the tablets named by load/unload/state
//! events. Both funnel into the same core routine: compute the tablet's
//! state and goal, dispatch on the pair, and batch the resulting work until
//! [`flush_changes`] pushes it out. `flush_changes` runs under a
//! single-instance lock because the balancer and the dead-log handling are
//! not thread-safe.
//!
//! [`flush_changes`]: TabletGroupWatcher::flush_changes

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use metrics::{counter, histogram};
use tabletdb_client::rpc::UnloadGoal;
use tabletdb_common::metrics::recorded;
use tabletdb_common::{DataLevel, KeyExtent, TServerInstance};
use tabletdb_errors::TabletDbResult;
use tabletdb_metadata::{ConditionalStatus, TabletMetadata, TabletState, WalRef};
use tabletdb_util::shutdown::{ShutdownReceiver, ShutdownSender};
use tabletdb_wal::WalMarkers;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::balancer::Balancer;
use crate::env::ManagerEnv;
use crate::live_servers::LiveTServerSet;
use crate::state::TabletGoalState;
use crate::tables::{TableState, TableStateSource};
use crate::volume;

/// Cap on queued volume replacements before a forced flush.
const MAX_VOLUME_REPLACEMENT_BATCH: usize = 1000;

/// Size of the event queue; overflow demotes to a full scan.
const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(Default)]
struct TabletLists {
    /// Unassigned tablets whose goal is hosted; balancer picks servers
    to_assign: Vec<TabletMetadata>,
    /// Tablets with a live `future` location that needs an assign reminder
    reminders: Vec<(TServerInstance, KeyExtent)>,
    /// Tablets whose location points at a dead server and must be cleared
    to_unassign: Vec<TabletMetadata>,
    /// As above, but recording a suspension instead of plain clearing
    to_suspend: Vec<TabletMetadata>,
    /// Suspended tablets whose suspension should be cleared
    to_unsuspend: Vec<TabletMetadata>,
    /// Hosted tablets that must be unloaded, with how
    to_unload: Vec<(TServerInstance, KeyExtent, UnloadGoal)>,
    /// Dead servers' WAL references, grouped by server
    dead_logs: HashMap<String, Vec<WalRef>>,
    /// Tablets with paths on decommissioned volumes, eligible for rewrite
    volume_replacements: Vec<TabletMetadata>,
    /// Hosted-tablet counts observed this scan, for the balancer
    current_load: HashMap<TServerInstance, usize>,
}

impl TabletLists {
    fn pending_work(&self) -> usize {
        self.to_assign.len()
            + self.to_unassign.len()
            + self.to_suspend.len()
            + self.to_unload.len()
    }
}

/// The watcher for one data level.
pub struct TabletGroupWatcher {
    level: DataLevel,
    env: Arc<ManagerEnv>,
    live: LiveTServerSet,
    balancer: Arc<dyn Balancer>,
    event_tx: mpsc::Sender<Vec<KeyExtent>>,
    full_scan_needed: Arc<AtomicBool>,
    /// Serializes flush_changes across the full and partial scan loops
    flush_lock: tokio::sync::Mutex<()>,
    shutdown: ShutdownSender,
}

impl TabletGroupWatcher {
    /// Create the watcher and spawn its two loops.
    pub fn start(
        level: DataLevel,
        env: Arc<ManagerEnv>,
        balancer: Arc<dyn Balancer>,
        scan_interval: Duration,
    ) -> Arc<TabletGroupWatcher> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = tabletdb_util::shutdown::channel();
        let watcher = Arc::new(TabletGroupWatcher {
            level,
            live: LiveTServerSet::new(Arc::clone(&env.coordination)),
            env,
            balancer,
            event_tx,
            full_scan_needed: Arc::new(AtomicBool::new(true)),
            flush_lock: tokio::sync::Mutex::new(()),
            shutdown,
        });
        tokio::spawn(Self::full_scan_loop(
            Arc::clone(&watcher),
            scan_interval,
            shutdown_rx.clone(),
        ));
        tokio::spawn(Self::event_loop(Arc::clone(&watcher), event_rx, shutdown_rx));
        watcher
    }

    /// The level this watcher manages.
    pub fn level(&self) -> DataLevel {
        self.level
    }

    /// Feed tablet ranges that need re-examination (tablet load/unload,
    /// table state change). A full queue demotes the event to "full scan
    /// needed".
    pub fn notify(&self, ranges: Vec<KeyExtent>) {
        if let Err(e) = self.event_tx.try_send(ranges) {
            debug!(level = %self.level, %e, "event queue full, demoting to full scan");
            self.full_scan_needed.store(true, Ordering::SeqCst);
        }
    }

    /// Stop both loops.
    pub fn stop(&self) {
        self.shutdown.signal();
    }

    async fn full_scan_loop(
        watcher: Arc<TabletGroupWatcher>,
        interval: Duration,
        mut shutdown: ShutdownReceiver,
    ) {
        loop {
            if let Err(e) = watcher.scan_once().await {
                error!(level = %watcher.level, %e, "full tablet scan failed");
            }
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn event_loop(
        watcher: Arc<TabletGroupWatcher>,
        mut event_rx: mpsc::Receiver<Vec<KeyExtent>>,
        mut shutdown: ShutdownReceiver,
    ) {
        loop {
            let ranges = tokio::select! {
                _ = shutdown.recv() => return,
                ranges = event_rx.recv() => match ranges {
                    Some(ranges) => ranges,
                    None => return,
                },
            };
            if let Err(e) = watcher.process_ranges(&ranges).await {
                error!(level = %watcher.level, %e, "partial tablet scan failed");
            }
        }
    }

    /// One full pass over the level.
    pub async fn scan_once(&self) -> TabletDbResult<()> {
        self.full_scan_needed.store(false, Ordering::SeqCst);
        let started = tokio::time::Instant::now();
        let tablets = self.env.ample.read_tablets(self.level).fetch_all().await?;
        self.process_tablets(tablets).await?;
        histogram!(recorded::WATCHER_SCAN_DURATION, "level" => self.level.to_string())
            .record(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Re-examine just the given tablets.
    pub async fn process_ranges(&self, ranges: &[KeyExtent]) -> TabletDbResult<()> {
        let mut tablets = Vec::with_capacity(ranges.len());
        for extent in ranges {
            if extent.level() != self.level {
                continue;
            }
            if let Some(tm) = self.env.ample.read_tablet(extent).await? {
                tablets.push(tm);
            }
        }
        self.process_tablets(tablets).await
    }

    async fn process_tablets(&self, tablets: Vec<TabletMetadata>) -> TabletDbResult<()> {
        let mut live = self.live.snapshot().await?;
        let mut lists = TabletLists::default();
        let suspension_enabled = self.env.config.table_suspend_duration > Duration::ZERO;

        for tm in tablets {
            let table_state = self.env.table_states.state(tm.extent().table()).await;
            if table_state == TableState::Unknown {
                continue;
            }
            // tablets held by a multi-step operation are off limits; the
            // operation advances them
            if tm.operation_id().is_some() {
                continue;
            }
            if tm.location_anomaly() {
                error!(
                    extent = %tm.extent(),
                    current = ?tm.current(),
                    future = ?tm.future(),
                    "tablet has both current and future locations; skipping"
                );
                continue;
            }

            let state = self.compute_state_with_dead_guard(&tm, &mut live).await?;
            if state == TabletState::Hosted {
                if let Some(current) = tm.current() {
                    *lists.current_load.entry(current.clone()).or_insert(0) += 1;
                }
            }
            let goal = TabletGoalState::compute(&tm, state, table_state, suspension_enabled);
            self.dispatch(tm, state, goal, &live, &mut lists);

            let work_cap = self.env.config.max_tserver_work_chunk * live.len().max(1);
            if lists.pending_work() >= work_cap
                || lists.volume_replacements.len() > MAX_VOLUME_REPLACEMENT_BATCH
            {
                self.flush_changes(&mut lists, &live).await;
            }
        }
        self.flush_changes(&mut lists, &live).await;
        Ok(())
    }

    /// Compute a tablet's state, recomputing once against a fresh live
    /// snapshot when it looks dead-assigned. A concurrent partial scan may
    /// have hosted the tablet on a server this thread's snapshot predates;
    /// without the recompute the tablet would be wrongly torn down.
    pub async fn compute_state_with_dead_guard(
        &self,
        tm: &TabletMetadata,
        live: &mut HashSet<TServerInstance>,
    ) -> TabletDbResult<TabletState> {
        let state = TabletState::compute(tm, live);
        if state != TabletState::AssignedToDeadServer {
            return Ok(state);
        }
        *live = self.live.snapshot().await?;
        let recomputed = TabletState::compute(tm, live);
        if recomputed != state {
            debug!(
                extent = %tm.extent(),
                ?recomputed,
                "dead-server verdict overturned by fresh snapshot"
            );
        }
        Ok(recomputed)
    }

    fn dispatch(
        &self,
        tm: TabletMetadata,
        state: TabletState,
        goal: TabletGoalState,
        live: &HashSet<TServerInstance>,
        lists: &mut TabletLists,
    ) {
        // volume replacement is deferred until the tablet is at rest
        if matches!(state, TabletState::Unassigned | TabletState::Suspended)
            && volume::references_decommissioned_volume(&tm, &self.env.config)
        {
            lists.volume_replacements.push(tm.clone());
        }

        if goal == TabletGoalState::Hosted {
            match state {
                TabletState::Unassigned => lists.to_assign.push(tm),
                TabletState::Assigned => {
                    if let Some(future) = tm.future() {
                        lists.reminders.push((future.clone(), tm.extent().clone()));
                    }
                }
                TabletState::AssignedToDeadServer => {
                    Self::collect_dead_logs(&tm, lists);
                    if self.env.config.table_suspend_duration > Duration::ZERO {
                        lists.to_suspend.push(tm);
                    } else {
                        lists.to_unassign.push(tm);
                    }
                }
                TabletState::Suspended => {
                    let suspend = tm.suspend().expect("suspended state implies record");
                    let age = SystemTime::now()
                        .duration_since(suspend.suspension_time)
                        .unwrap_or(Duration::ZERO);
                    let owner_back = live
                        .iter()
                        .any(|s| s.location == suspend.server.location);
                    if owner_back && age < self.env.config.table_suspend_duration {
                        // prior owner reappeared in time; assignment will
                        // prefer it through `last`
                        lists.to_unsuspend.push(tm);
                    } else if age >= self.env.config.table_suspend_duration {
                        lists.to_unsuspend.push(tm);
                    }
                    // otherwise: still waiting for the owner to return
                }
                TabletState::Hosted => {}
            }
        } else {
            match state {
                TabletState::Hosted => {
                    if let Some(current) = tm.current() {
                        lists
                            .to_unload
                            .push((current.clone(), tm.extent().clone(), goal.how_unload()));
                    }
                }
                TabletState::Suspended => lists.to_unsuspend.push(tm),
                TabletState::AssignedToDeadServer => {
                    Self::collect_dead_logs(&tm, lists);
                    lists.to_unassign.push(tm);
                }
                TabletState::Assigned => lists.to_unassign.push(tm),
                TabletState::Unassigned => {}
            }
        }
    }

    fn collect_dead_logs(tm: &TabletMetadata, lists: &mut TabletLists) {
        for log in tm.logs() {
            lists
                .dead_logs
                .entry(log.server.clone())
                .or_default()
                .push(log.clone());
        }
    }

    /// Push every batched change out. Serialized across the two scan
    /// loops; the balancer and the dead-log handling rely on it.
    async fn flush_changes(&self, lists: &mut TabletLists, live: &HashSet<TServerInstance>) {
        let _guard = self.flush_lock.lock().await;
        let lists = std::mem::take(lists);

        // 1. dead tablets first: their locations must clear before the
        // balancer hands the tablets out again
        for tm in &lists.to_unassign {
            self.clear_location(tm, false).await;
        }
        for tm in &lists.to_suspend {
            self.clear_location(tm, true).await;
        }
        for tm in &lists.to_unsuspend {
            self.clear_suspension(tm).await;
        }

        // 2. a dead server's WALs must all be CLOSED before anything
        // recovers from them
        for server in lists.dead_logs.keys() {
            let markers = WalMarkers::new(Arc::clone(&self.env.coordination), server);
            match markers.close_all().await {
                Ok(closed) if closed > 0 => {
                    info!(server, closed, "closed dead server's write-ahead logs")
                }
                Ok(_) => {}
                Err(e) => warn!(server, %e, "could not close dead server's logs"),
            }
        }

        // 3. balancer picks destinations for the unassigned
        let mut load: HashMap<TServerInstance, usize> = live
            .iter()
            .map(|s| (s.clone(), 0))
            .collect();
        for (server, count) in &lists.current_load {
            if let Some(entry) = load.get_mut(server) {
                *entry = *count;
            }
        }
        let mut assignments = self.balancer.assign(&lists.to_assign, &load);
        // pinned migrations override the balancer
        for tm in &lists.to_assign {
            if let Some(target) = tm.migration() {
                if live.contains(target) {
                    assignments.insert(tm.extent().clone(), target.clone());
                }
            }
        }

        // 4. write future locations, then send the assign RPCs
        for tm in &lists.to_assign {
            let Some(dest) = assignments.get(tm.extent()) else {
                continue;
            };
            if self.set_future_location(tm, dest).await {
                counter!(recorded::TABLETS_ASSIGNED).increment(1);
                self.send_load_rpc(dest, tm.extent()).await;
            }
        }
        for (server, extent) in &lists.reminders {
            self.send_load_rpc(server, extent).await;
        }
        for (server, extent, goal) in &lists.to_unload {
            if let Some(service) = self.env.connector.connect(&server.location) {
                if let Err(e) = service.unload_tablet(extent.clone(), *goal).await {
                    warn!(%extent, server = %server, %e, "unload rpc failed");
                }
            }
        }

        // 5. volume replacements, already capped per batch
        for tm in &lists.volume_replacements {
            if let Err(e) = volume::replace_volumes(&self.env, tm).await {
                warn!(extent = %tm.extent(), %e, "volume replacement failed");
            }
        }
    }

    async fn clear_location(&self, tm: &TabletMetadata, suspend: bool) {
        let extent = tm.extent().clone();
        let dead = tm.current().or(tm.future()).cloned();
        let mut mutator = self.env.ample.conditionally_mutate_tablets();
        {
            let mut m = mutator.mutate_tablet(extent.clone());
            m.require_absent_operation();
            if let Some(current) = tm.current() {
                m.require_current(current.clone());
                m.set_last(current.clone());
            }
            if let Some(future) = tm.future() {
                m.require_future(future.clone());
            }
            m.delete_current().delete_future();
            if suspend {
                if let Some(dead) = dead {
                    m.set_suspend(tabletdb_metadata::SuspendingTServer {
                        server: dead,
                        suspension_time: SystemTime::now(),
                    });
                }
            }
            if m.submit(|tm| tm.current().is_none() && tm.future().is_none(), "clear dead location")
                .is_err()
            {
                return;
            }
        }
        match mutator.process().await {
            Ok(results) => {
                if let Some(result) = results.get(&extent) {
                    if result.status != ConditionalStatus::Accepted {
                        debug!(%extent, "location clear rejected; next scan re-examines");
                    }
                }
            }
            Err(e) => warn!(%extent, %e, "location clear failed"),
        }
    }

    async fn clear_suspension(&self, tm: &TabletMetadata) {
        let extent = tm.extent().clone();
        let mut mutator = self.env.ample.conditionally_mutate_tablets();
        {
            let mut m = mutator.mutate_tablet(extent.clone());
            m.require_absent_operation().require_absent_location().delete_suspend();
            if m.submit(|tm| tm.suspend().is_none(), "clear suspension").is_err() {
                return;
            }
        }
        if let Err(e) = mutator.process().await {
            warn!(%extent, %e, "suspension clear failed");
        }
    }

    async fn set_future_location(&self, tm: &TabletMetadata, dest: &TServerInstance) -> bool {
        let extent = tm.extent().clone();
        let mut mutator = self.env.ample.conditionally_mutate_tablets();
        {
            let mut m = mutator.mutate_tablet(extent.clone());
            m.require_absent_operation()
                .require_absent_location()
                .set_future(dest.clone());
            let dest2 = dest.clone();
            if m.submit(move |tm| tm.future() == Some(&dest2), "set future location")
                .is_err()
            {
                return false;
            }
        }
        match mutator.process().await {
            Ok(results) => matches!(
                results.get(&extent).map(|r| r.status),
                Some(ConditionalStatus::Accepted)
            ),
            Err(e) => {
                warn!(%extent, %e, "setting future location failed");
                false
            }
        }
    }

    async fn send_load_rpc(&self, server: &TServerInstance, extent: &KeyExtent) {
        match self.env.connector.connect(&server.location) {
            Some(service) => {
                if let Err(e) = service.load_tablet(extent.clone()).await {
                    warn!(%extent, server = %server, %e, "assign rpc failed");
                }
            }
            None => debug!(%extent, server = %server, "assign rpc skipped; no connection"),
        }
    }
}
