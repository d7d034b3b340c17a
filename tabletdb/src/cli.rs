//! The command-line surface.

use clap::{Args, Parser, Subcommand};

/// The TabletDB distributed sorted key/value store.
#[derive(Debug, Parser)]
#[command(name = "tabletdb", version, about)]
pub struct Cli {
    /// Log filter, e.g. `info` or `tabletdb=debug`
    #[arg(long, env = "TABLETDB_LOG", default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a complete single-process instance.
    Standalone(StandaloneArgs),
    /// Administrative operations.
    Admin(AdminArgs),
}

/// Arguments for standalone mode.
#[derive(Debug, Args)]
pub struct StandaloneArgs {
    /// How many tablet servers to run in-process
    #[arg(long, default_value_t = 2)]
    pub servers: usize,

    /// Directory for write-ahead logs
    #[arg(long, default_value = "./tabletdb-data")]
    pub data_dir: String,
}

/// `tabletdb admin ...`
#[derive(Debug, Args)]
pub struct AdminArgs {
    /// Data directory of the instance to administer (where a standalone
    /// instance persisted its state)
    #[arg(long, default_value = "./tabletdb-data")]
    pub data_dir: String,

    #[command(subcommand)]
    pub command: AdminCommand,
}

/// Admin subcommands.
#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    /// Inspect or mutate FATE transactions.
    Fate(FateArgs),
    /// Upgrade management.
    Upgrade(UpgradeArgs),
}

/// `tabletdb admin fate ...`
#[derive(Debug, Args)]
pub struct FateArgs {
    /// Print a summary of transactions
    #[arg(long, conflicts_with_all = ["print", "cancel", "fail", "delete"])]
    pub summary: bool,

    /// Print transaction details
    #[arg(long, conflicts_with_all = ["cancel", "fail", "delete"])]
    pub print: bool,

    /// Emit JSON instead of a table
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Only show transactions in these states
    #[arg(short = 's', long = "state")]
    pub states: Vec<String>,

    /// Restrict to one store
    #[arg(short = 't', long = "type", value_parser = ["META", "USER"])]
    pub instance_type: Option<String>,

    /// Cancel the named transactions (NEW only)
    #[arg(long)]
    pub cancel: bool,

    /// Fail the named transactions
    #[arg(long)]
    pub fail: bool,

    /// Delete the named transactions
    #[arg(long)]
    pub delete: bool,

    /// Transaction ids, `FATE:<type>:<uuid>`
    pub fate_ids: Vec<String>,
}

/// `tabletdb admin upgrade ...`
#[derive(Debug, Args)]
pub struct UpgradeArgs {
    /// Write the prepare-for-upgrade marker; fails if a manager is running
    /// or any FATE transaction exists
    #[arg(long)]
    pub prepare: bool,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_parses() {
        Cli::command().debug_assert();
        let cli = Cli::parse_from([
            "tabletdb", "admin", "fate", "--summary", "-j", "-s", "NEW", "-t", "META",
        ]);
        match cli.command {
            Command::Admin(admin) => match admin.command {
                AdminCommand::Fate(fate) => {
                    assert!(fate.summary);
                    assert!(fate.json);
                    assert_eq!(fate.states, vec!["NEW"]);
                    assert_eq!(fate.instance_type.as_deref(), Some("META"));
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fate_ids_are_positional() {
        let cli = Cli::parse_from([
            "tabletdb",
            "admin",
            "fate",
            "FATE:USER:ba4ac8e2-9f91-4a14-b2cc-4d67b147b4a5",
            "--cancel",
        ]);
        match cli.command {
            Command::Admin(admin) => match admin.command {
                AdminCommand::Fate(fate) => {
                    assert!(fate.cancel);
                    assert_eq!(fate.fate_ids.len(), 1);
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }
}
