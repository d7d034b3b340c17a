//! Implementations of the admin commands, decoupled from process wiring so
//! tests drive them against in-process stores.

use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tabletdb_common::{FateId, FateInstanceType};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_fate::{FateAdmin, FateStore, FateTxnSummary, TStatus};

use crate::cli::FateArgs;

/// What a fate admin invocation decided to do, with its exit code.
#[derive(Debug, PartialEq, Eq)]
pub struct AdminOutcome {
    /// Process exit code
    pub exit_code: i32,
    /// Lines to print
    pub output: Vec<String>,
}

fn parse_states(states: &[String]) -> TabletDbResult<Vec<TStatus>> {
    states
        .iter()
        .map(|s| {
            TStatus::from_str(s)
                .map_err(|_| TabletDbError::InvalidArgument(format!("unknown state: {s}")))
        })
        .collect()
}

fn parse_ids(ids: &[String], instance_type: FateInstanceType) -> TabletDbResult<Vec<FateId>> {
    ids.iter()
        .map(|s| s.parse::<FateId>())
        .filter(|parsed| match parsed {
            Ok(id) => id.instance_type == instance_type,
            Err(_) => true,
        })
        .collect()
}

/// Run `admin fate` against one store. Call once per store the filter
/// admits and merge the outputs.
pub async fn run_fate<R>(args: &FateArgs, store: &FateStore<R>) -> TabletDbResult<AdminOutcome>
where
    R: Serialize + DeserializeOwned,
{
    let admin = FateAdmin::new(store);
    let states = parse_states(&args.states)?;
    let ids = parse_ids(&args.fate_ids, store.instance_type())?;
    let mut output = Vec::new();

    if args.cancel || args.fail || args.delete {
        if ids.is_empty() {
            return Err(TabletDbError::InvalidArgument(
                "cancel/fail/delete require transaction ids".into(),
            ));
        }
        for id in &ids {
            if args.cancel {
                if admin.cancel(id).await? {
                    output.push(format!("cancelled {id}"));
                } else {
                    output.push(format!("{id} is not NEW; not cancelled"));
                }
            } else if args.fail {
                if admin.fail(id).await? {
                    output.push(format!("failed {id}"));
                } else {
                    // busy transactions are reported, not errored
                    output.push(format!("could not fail {id} in a reasonable time"));
                }
            } else if args.delete {
                if admin.delete(id).await? {
                    output.push(format!("deleted {id}"));
                } else {
                    output.push(format!("could not delete {id} in a reasonable time"));
                }
            }
        }
        return Ok(AdminOutcome {
            exit_code: 0,
            output,
        });
    }

    // --summary / --print
    let report = admin.summary(&ids, &states).await?;
    if args.json {
        output.push(serde_json::to_string_pretty(&report).map_err(|e| {
            TabletDbError::Serialization(format!("summary json: {e}"))
        })?);
    } else if args.summary {
        for (status, count) in &report.status_counts {
            output.push(format!("{status:>20}: {count}"));
        }
        output.push(format!("{:>20}: {}", "TOTAL", report.txns.len()));
    } else {
        for txn in &report.txns {
            output.push(format_txn(txn));
        }
        output.push(format!("{} transaction(s)", report.txns.len()));
    }
    Ok(AdminOutcome {
        exit_code: 0,
        output,
    })
}

fn format_txn(txn: &FateTxnSummary) -> String {
    format!(
        "{} status: {} op: {} created: {} locked: {}",
        txn.fate_id,
        txn.status,
        txn.fate_op.as_deref().unwrap_or("?"),
        txn.time_created,
        txn.reservation.as_deref().unwrap_or("-"),
    )
}

/// Whether a store of `instance_type` is admitted by the `-t` filter.
pub fn store_admitted(filter: Option<&str>, instance_type: FateInstanceType) -> bool {
    match filter {
        None => true,
        Some(f) => f.eq_ignore_ascii_case(&instance_type.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_metadata::InMemoryAmple;

    use super::*;
    use crate::cli::{Cli, Command, AdminCommand};
    use clap::Parser;

    fn fate_args(argv: &[&str]) -> FateArgs {
        let mut full = vec!["tabletdb", "admin", "fate"];
        full.extend_from_slice(argv);
        match Cli::parse_from(full).command {
            Command::Admin(admin) => match admin.command {
                AdminCommand::Fate(args) => args,
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    fn store() -> FateStore<Vec<u8>> {
        FateStore::new(InMemoryAmple::new().system_kv(), FateInstanceType::User)
    }

    #[tokio::test]
    async fn summary_counts_by_status() {
        let store = store();
        let a = store.create().await.unwrap();
        store.seed("OP", &a, &vec![1], false).await.unwrap();
        store.create().await.unwrap();

        let outcome = run_fate(&fate_args(&["--summary"]), &store).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        let text = outcome.output.join("\n");
        assert!(text.contains("NEW"));
        assert!(text.contains("SUBMITTED"));
        assert!(text.contains("TOTAL"));
    }

    #[tokio::test]
    async fn busy_fail_exits_zero_with_notice() {
        let store = store();
        let id = store.create().await.unwrap();
        store.seed("OP", &id, &vec![1], false).await.unwrap();
        let busy = tabletdb_fate::FateReservation::new(tabletdb_coordination::lock::LockId {
            path: "/locks/manager".into(),
            uuid: uuid::Uuid::new_v4(),
            seq: 1,
        });
        store.reserve(&id, &busy).await.unwrap();

        // the admin wait is bounded; a reserved txn produces the notice
        // and a zero exit, not an error
        let admin = FateAdmin::new(&store).with_admin_wait(std::time::Duration::from_millis(50));
        assert!(!admin.fail(&id).await.unwrap());

        let mut args = fate_args(&["--cancel"]);
        args.fate_ids = vec![id.to_string()];
        let outcome = run_fate(&args, &store).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.output[0].contains("not NEW"));
    }

    #[tokio::test]
    async fn type_filter() {
        assert!(store_admitted(None, FateInstanceType::Meta));
        assert!(store_admitted(Some("META"), FateInstanceType::Meta));
        assert!(!store_admitted(Some("USER"), FateInstanceType::Meta));
    }
}
