use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "kanban")]
#[command(version, about = "Multi-user Kanban board with a realtime change feed")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write logs to daily-rolling files in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Path to kanban.toml. Falls back to $KANBAN_CONFIG, then ./kanban.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the board server (REST API + change feed)
    Serve {
        /// Port to serve on (overrides kanban.toml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides kanban.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Create or migrate the database, then exit
    InitDb {
        /// Database path (overrides kanban.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Subscribe to a project's change feed and print events
    Watch {
        /// Server base URL
        #[arg(long, default_value = "http://127.0.0.1:3141")]
        url: String,

        /// Project to watch
        #[arg(long)]
        project: i64,

        /// Profile id to connect as
        #[arg(long)]
        actor: String,

        /// Only these tables (comma-separated, e.g. "items,columns")
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default kanban.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let _log_guard = kanban::logging::init_tracing(cli.verbose, cli.log_json, cli.log_dir.as_deref())?;
    let work_dir = std::env::current_dir().context("Failed to get current directory")?;

    match &cli.command {
        Commands::Serve { port, db_path, dev } => {
            let config = kanban::config::KanbanToml::resolve(cli.config.as_deref(), &work_dir)?;
            cmd::cmd_serve(config, *port, db_path.clone(), *dev).await?;
        }
        Commands::InitDb { db_path } => {
            let config = kanban::config::KanbanToml::resolve(cli.config.as_deref(), &work_dir)?;
            cmd::cmd_init_db(&config, db_path.clone())?;
        }
        Commands::Watch {
            url,
            project,
            actor,
            tables,
        } => {
            let config = kanban::config::KanbanToml::resolve(cli.config.as_deref(), &work_dir)?;
            cmd::cmd_watch(&config, url, *project, actor, tables).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&work_dir, cli.config.as_deref(), command.clone())?;
        }
    }

    Ok(())
}
