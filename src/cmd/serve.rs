//! Board server commands: `kanban serve` and `kanban init-db`.

use std::path::PathBuf;

use anyhow::Result;
use kanban::board::db::BoardDb;
use kanban::config::KanbanToml;

pub async fn cmd_serve(config: KanbanToml, port: Option<u16>, db_path: Option<PathBuf>, dev: bool) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    let mut server = config.server_config();
    if let Some(port) = port {
        server.port = port;
    }
    if let Some(db_path) = db_path {
        server.db_path = db_path;
    }
    server.dev_mode |= dev;

    kanban::board::server::start_server(server).await
}

pub fn cmd_init_db(config: &KanbanToml, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    BoardDb::new(&db_path)?;
    println!("Board database initialized at {}", db_path.display());
    Ok(())
}
