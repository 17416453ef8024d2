//! crm-sync: watch a reconciled list from the command line.
//!
//! ```text
//! crm-sync watch <contact|message> [field=value ...] [--search term] [--pages n]
//! crm-sync demo
//! ```
//!
//! `watch` follows a list stored in PostgreSQL (`DATABASE_URL`). `demo` runs
//! a scripted session against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use crm_sync_client::db::{self, PgRemoteStore};
use crm_sync_client::{Config, ListView, MemoryStore, MutationGateway, Reconciler, SyncConfig};
use crm_sync_engine::{ChangeEvent, EntityKind, ListFilter, ListScope, Record};
use serde_json::json;

const USAGE: &str = "usage: crm-sync watch <contact|message> [field=value ...] [--search term] [--pages n]\n       crm-sync demo";

enum Command {
    Watch { scope: ListScope, pages: usize },
    Demo,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command, String> {
    match args.next().as_deref() {
        Some("watch") => {
            let kind: EntityKind = args
                .next()
                .ok_or("missing entity kind")?
                .parse()
                .map_err(|e: crm_sync_engine::Error| e.to_string())?;

            let mut filter = ListFilter::new();
            let mut pages = 1;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--search" => {
                        let term = args.next().ok_or("--search needs a term")?;
                        filter = filter.with_search(term);
                    }
                    "--pages" => {
                        pages = args
                            .next()
                            .and_then(|n| n.parse().ok())
                            .ok_or("--pages needs a number")?;
                    }
                    pair => {
                        let (field, value) =
                            ListFilter::parse_pair(pair).map_err(|e| e.to_string())?;
                        filter = filter.with_eq(field, value);
                    }
                }
            }

            Ok(Command::Watch {
                scope: ListScope::new(kind, filter),
                pages,
            })
        }
        Some("demo") => Ok(Command::Demo),
        Some(other) => Err(format!("unknown command '{other}'")),
        None => Err("missing command".into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    crm_sync_client::init_tracing();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("{err}\n{USAGE}");
            std::process::exit(2);
        }
    };

    match command {
        Command::Watch { scope, pages } => watch(&config, scope, pages).await,
        Command::Demo => demo(&config).await,
    }
}

async fn watch(
    config: &Config,
    scope: ListScope,
    pages: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let database_url = config.require_database_url()?;

    // Create database pool
    let pool = db::create_pool(database_url, config.db_max_connections).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    let store = Arc::new(PgRemoteStore::new(pool));
    let reconciler = Reconciler::spawn(store, scope.clone(), config.sync.clone())?;

    for _ in 0..pages {
        reconciler.load_next_page().await?;
        if !reconciler.has_next_page() {
            break;
        }
    }

    tracing::info!(scope = %scope, "Watching list, press Ctrl-C to stop");
    let mut views = reconciler.subscribe_view();
    render(&views.borrow_and_update());

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                render(&view);
                if let Some(err) = view.feed_error() {
                    tracing::error!(error = %err, "Change feed lost, refreshing");
                    reconciler.refresh().await?;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    reconciler.shutdown();
    Ok(())
}

async fn demo(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = MemoryStore::new_shared();
    store.seed((1..=30).map(|i| {
        let org = if i % 3 == 0 { "B" } else { "A" };
        Record::contact(
            format!("c{i}"),
            1_000 + i,
            json!({"org_id": org, "name": format!("Lead {i}"), "status": "lead"}),
        )
    }));

    let sync = SyncConfig {
        debounce: Duration::from_millis(200),
        ..config.sync.clone()
    };
    let scope = ListScope::new(
        EntityKind::Contact,
        ListFilter::new().with_eq("org_id", "A"),
    );
    let contacts = Reconciler::spawn(store.clone(), scope, sync.clone())?;

    contacts.load_next_page().await?;
    contacts.wait_for(|view| view.feed == crm_sync_client::FeedStatus::Live).await?;
    render(&contacts.current());

    // Another user adds a lead; it lands at the head after the debounce
    store.insert_remote(Record::contact(
        "c99",
        5_000,
        json!({"org_id": "A", "name": "Walk-in", "status": "lead"}),
    ));
    contacts.wait_for(|view| view.list.get("c99").is_some()).await?;
    render(&contacts.current());

    // Status moves: one confirmed, one rejected and rolled back
    let gateway = MutationGateway::new(contacts.clone(), store.clone());
    gateway.set_fields("c1", json!({"status": "client"})).await?;

    store.fail_writes(1);
    if let Err(err) = gateway.set_fields("c2", json!({"status": "client"})).await {
        tracing::warn!(error = %err, "Status move rejected");
    }
    render(&contacts.current());

    // A message delivered over two channels is shown once
    let chat = Reconciler::spawn(
        store.clone(),
        ListScope::new(EntityKind::Message, ListFilter::new()),
        sync.clone(),
    )?;
    chat.load_next_page().await?;
    chat.wait_for(|view| view.feed == crm_sync_client::FeedStatus::Live).await?;

    let message = |id: &str| {
        Record::message(id, 2_000, json!({"content": "hello"})).with_secondary_key("wamid_99")
    };
    store.emit(EntityKind::Message, ChangeEvent::inserted(message("m5")));
    store.emit(EntityKind::Message, ChangeEvent::inserted(message("m7")));
    tokio::time::sleep(sync.debounce * 2).await;
    render(&chat.current());

    contacts.shutdown();
    chat.shutdown();
    Ok(())
}

fn render(view: &ListView) {
    println!(
        "-- {} gen={} phase={:?} feed={:?} more={} ({} records)",
        view.scope,
        view.generation,
        view.phase,
        view.feed,
        view.has_next_page(),
        view.list.len()
    );
    for record in view.records().iter().take(10) {
        let sort_key = record
            .sort_key
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".into());
        println!("   {:<40} {:>14}  {}", record.id, sort_key, record.fields);
    }
    if view.list.len() > 10 {
        println!("   ...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> impl Iterator<Item = String> + '_ {
        line.split_whitespace().map(String::from)
    }

    #[test]
    fn test_parse_watch() {
        let Ok(Command::Watch { scope, pages }) =
            parse_args(args("watch contacts org_id=A --search ann --pages 3"))
        else {
            panic!("expected watch");
        };
        assert_eq!(scope.kind, EntityKind::Contact);
        assert_eq!(scope.filter.equals["org_id"], "A");
        assert_eq!(scope.filter.search.as_deref(), Some("ann"));
        assert_eq!(pages, 3);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(args("watch invoices")).is_err());
        assert!(parse_args(args("watch contact noequals")).is_err());
        assert!(parse_args(args("frobnicate")).is_err());
        assert!(matches!(parse_args(args("demo")), Ok(Command::Demo)));
    }
}
