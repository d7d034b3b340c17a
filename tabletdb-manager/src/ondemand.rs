//! On-demand hosting requests.

use std::collections::HashSet;

use parking_lot::Mutex;
use tabletdb_common::{KeyExtent, TabletAvailability};
use tabletdb_errors::TabletDbResult;
use tracing::debug;

use crate::env::ManagerEnv;

/// Marks `hosting_requested` on on-demand tablets so the watcher hosts
/// them. An in-process set suppresses duplicate concurrent submissions for
/// the same extent (scan-side callers hammer this for the same tablets).
#[derive(Default)]
pub struct OndemandHostingRequests {
    in_flight: Mutex<HashSet<KeyExtent>>,
}

impl OndemandHostingRequests {
    /// An empty request tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request hosting for the given tablets. Returns how many conditional
    /// mutations were actually submitted.
    pub async fn host_ondemand(
        &self,
        env: &ManagerEnv,
        extents: Vec<KeyExtent>,
    ) -> TabletDbResult<usize> {
        let mine: Vec<KeyExtent> = {
            let mut in_flight = self.in_flight.lock();
            extents
                .into_iter()
                .filter(|e| in_flight.insert(e.clone()))
                .collect()
        };
        if mine.is_empty() {
            return Ok(0);
        }

        let result = self.submit(env, &mine).await;
        let mut in_flight = self.in_flight.lock();
        for extent in &mine {
            in_flight.remove(extent);
        }
        result
    }

    async fn submit(&self, env: &ManagerEnv, extents: &[KeyExtent]) -> TabletDbResult<usize> {
        let mut mutator = env.ample.conditionally_mutate_tablets();
        let mut submitted = 0;
        for extent in extents {
            let mut m = mutator.mutate_tablet(extent.clone());
            m.require_absent_operation()
                .require_absent_location()
                .require_availability(TabletAvailability::Ondemand)
                .set_hosting_requested(true);
            if m.submit(|tm| tm.hosting_requested(), "request on-demand hosting")
                .is_ok()
            {
                submitted += 1;
            }
        }
        if submitted > 0 {
            mutator.process().await?;
            debug!(submitted, "on-demand hosting requested");
        }
        Ok(submitted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tabletdb_client::rpc::{ServerConnector, TabletServerService};
    use tabletdb_common::{SystemConfig, TableId};
    use tabletdb_coordination::LocalStore;
    use tabletdb_metadata::{Ample, InMemoryAmple, TabletMetadata};

    use super::*;

    struct NoConnector;

    impl ServerConnector for NoConnector {
        fn connect(&self, _location: &str) -> Option<Arc<dyn TabletServerService>> {
            None
        }
    }

    async fn env() -> (Arc<ManagerEnv>, KeyExtent) {
        let ample = Ample::new(Arc::new(InMemoryAmple::new()));
        let extent = KeyExtent::new(TableId::new("t"), None::<&str>, None::<&str>);
        let mut mutator = ample.conditionally_mutate_tablets();
        mutator
            .mutate_tablet(extent.clone())
            .require_absent_tablet()
            .insert_tablet(
                TabletMetadata::builder(extent.clone())
                    .availability(TabletAvailability::Ondemand)
                    .build(),
            )
            .submit(|_| false, "seed")
            .unwrap();
        mutator.process().await.unwrap();
        let env = ManagerEnv::new(
            ample,
            Arc::new(LocalStore::new()),
            Arc::new(NoConnector),
            SystemConfig {
                table_suspend_duration: Duration::ZERO,
                ..SystemConfig::default()
            },
        );
        (env, extent)
    }

    #[tokio::test]
    async fn sets_hosting_requested_under_guards() {
        let (env, extent) = env().await;
        let requests = OndemandHostingRequests::new();
        let submitted = requests
            .host_ondemand(&env, vec![extent.clone()])
            .await
            .unwrap();
        assert_eq!(submitted, 1);
        let tm = env.ample.read_tablet(&extent).await.unwrap().unwrap();
        assert!(tm.hosting_requested());
    }
}
