//! Change feed monitor: `kanban watch`.

use std::sync::Arc;

use anyhow::{Context, Result};
use kanban::board::changes::{ChangeEvent, Table};
use kanban::client::BoardClient;
use kanban::config::KanbanToml;
use kanban::realtime::{SubscriptionManager, WsChangeFeed};
use kanban::sync::{ApplyOutcome, BoardSession, event_sink};

const PURPOSE: &str = "watch";

pub async fn cmd_watch(
    config: &KanbanToml,
    url: &str,
    project_id: i64,
    actor: &str,
    tables: &[String],
) -> Result<()> {
    let tables = tables
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| t.parse::<Table>())
        .collect::<Result<Vec<_>>>()?;

    let client = Arc::new(BoardClient::new(url, actor)?);
    let mut session = BoardSession::new(
        project_id,
        client.clone(),
        client,
        config.realtime.retry_policy(),
        config.sync.pending_timeout(),
    );
    session
        .refresh()
        .await
        .with_context(|| format!("Failed to load board for project {}", project_id))?;
    print_board(&session);

    let feed = Arc::new(WsChangeFeed::from_base_url(url, config.realtime.subscribe_timeout()).with_actor(actor));
    println!("Watching project {} via {}", project_id, feed.url());
    let manager = SubscriptionManager::new(feed, config.realtime.retry_policy());
    let (on_change, mut events) = event_sink();
    let handle = manager.open(project_id, PURPOSE, &tables, on_change).await;
    let mut status = handle.status_receiver();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                println!("[status] {}", current);
                session.on_status(current, handle.reconnect_count()).await;
            }
            Some(event) = events.recv() => {
                print_event(&event);
                if session.handle_event(&event).await == ApplyOutcome::Applied {
                    print_board(&session);
                }
            }
        }
    }

    manager.close_all().await;
    println!("Stopped watching project {}", project_id);
    Ok(())
}

fn print_event(event: &ChangeEvent) {
    let id = event
        .row_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let actor = event.actor_id.as_deref().unwrap_or("-");
    println!(
        "[{}] {} {:?} id={} by {}",
        event.emitted_at, event.table, event.operation, id, actor
    );
}

fn print_board(session: &BoardSession) {
    let state = session.state();
    for column in state.columns() {
        let items = state.items_in(column.id);
        let names: Vec<String> = items
            .iter()
            .map(|i| format!("#{} {}", i.number, i.name))
            .collect();
        println!("  {:<14} {:>3}  {}", column.name, items.len(), names.join(", "));
    }
}
