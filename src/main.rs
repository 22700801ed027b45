use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dockup::config::DaemonArgs;
use dockup::{cli, daemon};

#[derive(Parser, Debug)]
#[command(
    name = "dockup",
    version,
    about = "Label-driven backup daemon for Docker containers"
)]
struct Cli {
    /// Unix socket path of the control API
    #[arg(
        long,
        global = true,
        env = "DOCKER_BACKUP_SOCKET",
        default_value = dockup::config::DEFAULT_SOCKET_PATH
    )]
    socket: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "DOCKER_BACKUP_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the backup daemon
    Daemon(DaemonArgs),

    /// Backup management commands against a running daemon
    #[command(subcommand)]
    Backup(BackupCommand),
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Trigger an immediate backup
    Run {
        container: String,
        /// Run only this backup config instead of all of them
        #[arg(long)]
        config: Option<String>,
    },

    /// List backups for a container
    #[command(alias = "ls")]
    List { container: String },

    /// Delete a specific backup by key
    Delete { container: String, key: String },

    /// Restore a backup into a running container
    Restore { container: String, key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env feeds the env-backed flags, so it loads before parsing.
    let _ = dotenvy::dotenv();
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    match args.command {
        Command::Daemon(daemon_args) => daemon::run(daemon_args, args.socket).await,
        Command::Backup(command) => match command {
            BackupCommand::Run { container, config } => {
                cli::run(args.socket, &container, config.as_deref()).await
            }
            BackupCommand::List { container } => cli::list(args.socket, &container).await,
            BackupCommand::Delete { container, key } => {
                cli::delete(args.socket, &container, &key).await
            }
            BackupCommand::Restore { container, key } => {
                cli::restore(args.socket, &container, &key).await
            }
        },
    }
}
