use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tabletdb::admin::{run_fate, store_admitted};
use tabletdb::cli::{AdminCommand, Cli, Command};
use tabletdb::standalone::{open_stores, persist_stores, StandaloneInstance};
use tabletdb_common::{FateInstanceType, SystemConfig};
use tabletdb_coordination::paths;
use tabletdb_fate::{FateStore, ZooKv};
use tabletdb_manager::upgrade::prepare_upgrade;
use tabletdb_manager::Step;
use tracing::info;

fn init_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command {
        Command::Standalone(args) => {
            let instance = StandaloneInstance::start(
                &PathBuf::from(&args.data_dir),
                args.servers,
                SystemConfig {
                    table_suspend_duration: Duration::from_secs(30),
                    ..SystemConfig::default()
                },
            )
            .await
            .context("starting standalone instance")?;
            info!(
                servers = instance.servers.len(),
                data_dir = %args.data_dir,
                "standalone instance running; ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await?;
            for server in &instance.servers {
                server.stop().await.context("stopping tablet server")?;
            }
            // persist before the manager goes away so the admin CLI (and
            // the next instance) can open the same state
            instance.persist().context("persisting instance state")?;
            instance.manager.stop().await.context("stopping manager")?;
            Ok(())
        }
        Command::Admin(admin) => {
            // The admin operates on the instance state persisted under
            // --data-dir: the same stores a standalone instance saves on
            // shutdown (and that the next instance reopens). Administering
            // a live remote instance goes through a wire transport in
            // front of the same service traits, which is the deployment's
            // concern.
            let data_dir = PathBuf::from(&admin.data_dir);
            let (coordination, ample) =
                open_stores(&data_dir).context("opening instance state")?;
            let meta_store: FateStore<Step> = FateStore::new(
                Arc::new(ZooKv::new(Arc::new(coordination.clone()), paths::FATE_ROOT)),
                FateInstanceType::Meta,
            );
            let user_store: FateStore<Step> =
                FateStore::new(ample.system_kv(), FateInstanceType::User);

            match admin.command {
                AdminCommand::Fate(args) => {
                    let mut exit_code = 0;
                    if store_admitted(args.instance_type.as_deref(), FateInstanceType::Meta) {
                        let outcome = run_fate(&args, &meta_store).await?;
                        for line in outcome.output {
                            println!("{line}");
                        }
                        exit_code = exit_code.max(outcome.exit_code);
                    }
                    if store_admitted(args.instance_type.as_deref(), FateInstanceType::User) {
                        let outcome = run_fate(&args, &user_store).await?;
                        for line in outcome.output {
                            println!("{line}");
                        }
                        exit_code = exit_code.max(outcome.exit_code);
                    }
                    if args.cancel || args.fail || args.delete {
                        save_state(&data_dir, &coordination, &ample)?;
                    }
                    std::process::exit(exit_code);
                }
                AdminCommand::Upgrade(args) => {
                    if args.prepare {
                        prepare_upgrade(Arc::new(coordination.clone()), &meta_store, &user_store)
                            .await
                            .context("preparing for upgrade")?;
                        save_state(&data_dir, &coordination, &ample)?;
                        println!("prepare-for-upgrade marker written");
                    }
                    Ok(())
                }
            }
        }
    }
}

fn save_state(
    data_dir: &Path,
    coordination: &tabletdb_coordination::LocalStore,
    ample: &tabletdb_metadata::InMemoryAmple,
) -> anyhow::Result<()> {
    persist_stores(data_dir, coordination, ample).context("persisting instance state")
}
