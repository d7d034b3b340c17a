//! Flush coordination: waiting until every tablet of a table has flushed.

use std::time::Duration;

use bytes::Bytes;
use tabletdb_common::TableId;
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tracing::debug;

use crate::env::ManagerEnv;

/// Wait until every tablet of `table` in `(start, end]` reports a flush id
/// of at least `flush_id`, or `timeout` passes. Unhosted tablets have
/// nothing in memory and do not count as waiting.
pub async fn wait_for_flush(
    env: &ManagerEnv,
    table: &TableId,
    flush_id: u64,
    start: Option<Bytes>,
    end: Option<Bytes>,
    timeout: Duration,
) -> TabletDbResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let tablets = env
            .ample
            .read_tablets(table.level())
            .for_table(table.clone())
            .overlapping(start.clone(), end.clone())
            .fetch_all()
            .await?;

        let mut waiting = 0usize;
        for tm in &tablets {
            if tm.extent().table().as_str() == TableId::ROOT {
                // The root tablet is exempt: its flush-id tracking has a
                // known unresolved issue and waiting on it can hang, so the
                // wait breaks out without confirming. Do not tighten this
                // until that issue is settled.
                continue;
            }
            let hosted = tm.current().is_some();
            let flushed = tm.flush_id().unwrap_or(0) >= flush_id;
            if hosted && !flushed {
                waiting += 1;
            }
        }
        if waiting == 0 {
            return Ok(());
        }
        debug!(%table, waiting, "waiting for flush");
        if tokio::time::Instant::now() >= deadline {
            return Err(TabletDbError::TimedOut(timeout));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tabletdb_client::rpc::{ServerConnector, TabletServerService};
    use tabletdb_common::{KeyExtent, SystemConfig, TServerInstance};
    use tabletdb_coordination::LocalStore;
    use tabletdb_metadata::{Ample, InMemoryAmple, TabletMetadata};

    use super::*;

    struct NoConnector;

    impl ServerConnector for NoConnector {
        fn connect(&self, _location: &str) -> Option<Arc<dyn TabletServerService>> {
            None
        }
    }

    async fn seed(ample: &Ample, extent: &KeyExtent, flush_id: Option<u64>, hosted: bool) {
        let mut mutator = ample.conditionally_mutate_tablets();
        {
            let mut m = mutator.mutate_tablet(extent.clone());
            m.require_absent_tablet()
                .insert_tablet(TabletMetadata::builder(extent.clone()).build());
            if let Some(id) = flush_id {
                m.set_flush_id(id);
            }
            if hosted {
                m.set_current(TServerInstance::new("ts1:9997", 1));
            }
            m.submit(|_| false, "seed").unwrap();
        }
        mutator.process().await.unwrap();
    }

    fn env(ample: Ample) -> Arc<ManagerEnv> {
        ManagerEnv::new(
            ample,
            Arc::new(LocalStore::new()),
            Arc::new(NoConnector),
            SystemConfig::default(),
        )
    }

    #[tokio::test]
    async fn returns_once_flush_ids_advance() {
        let ample = Ample::new(Arc::new(InMemoryAmple::new()));
        let extent = KeyExtent::new(TableId::new("t"), None::<&str>, None::<&str>);
        seed(&ample, &extent, Some(5), true).await;
        let env = env(ample);
        wait_for_flush(
            &env,
            &TableId::new("t"),
            5,
            None,
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn times_out_when_hosted_tablet_lags() {
        let ample = Ample::new(Arc::new(InMemoryAmple::new()));
        let extent = KeyExtent::new(TableId::new("t"), None::<&str>, None::<&str>);
        seed(&ample, &extent, Some(1), true).await;
        let env = env(ample);
        let err = wait_for_flush(
            &env,
            &TableId::new("t"),
            2,
            None,
            None,
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TabletDbError::TimedOut(_)));
    }

    #[tokio::test]
    async fn root_tablet_is_carved_out() {
        let ample = Ample::new(Arc::new(InMemoryAmple::new()));
        let root = KeyExtent::root();
        // hosted, lagging flush id: would wait forever were it any other
        // tablet
        seed(&ample, &root, Some(0), true).await;
        let env = env(ample);
        wait_for_flush(
            &env,
            &TableId::root(),
            10,
            None,
            None,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
    }
}
