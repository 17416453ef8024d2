//! Integration tests for the PostgreSQL remote store.
//!
//! These tests require a running PostgreSQL database.
//! Set DATABASE_URL environment variable before running:
//!
//! ```text
//! cargo test -p crm-sync-client --test postgres_test -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use crm_sync_client::db::{self, PgRemoteStore};
use crm_sync_client::{
    FeedStatus, LoadOutcome, MutationGateway, PageFetcher, Reconciler, RemoteWriter, SyncConfig,
};
use crm_sync_engine::{EntityKind, ListFilter, ListScope, PageRequest, Record};
use serde_json::json;

async fn store() -> Arc<PgRemoteStore> {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = db::create_pool(&url, 5).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    Arc::new(PgRemoteStore::new(pool))
}

/// A fresh org id so tests never see each other's rows.
fn org() -> String {
    format!("org-{}", uuid::Uuid::new_v4())
}

fn contact(org: &str, id: &str, sort_key: Option<i64>, name: &str) -> Record {
    Record::new(
        EntityKind::Contact,
        format!("{org}-{id}"),
        sort_key,
        json!({"org_id": org, "name": name}),
    )
}

#[tokio::test]
#[ignore]
async fn test_pages_follow_engine_order() {
    let store = store().await;
    let org = org();

    for record in [
        contact(&org, "b", Some(100), "Bea"),
        contact(&org, "a", Some(100), "Al"),
        contact(&org, "c", Some(50), "Cy"),
        contact(&org, "n", None, "New"),
    ] {
        store.insert(&record).await.unwrap();
    }

    let scope = ListScope::new(EntityKind::Contact, ListFilter::new().with_eq("org_id", org.as_str()));
    let page = store
        .fetch_page(&scope, PageRequest::new(0, 3).unwrap())
        .await
        .unwrap();

    // Unsent first, equal keys by id, then older
    let ids: Vec<_> = page.records.iter().map(|r| r.id.clone()).collect();
    assert_eq!(
        ids,
        vec![format!("{org}-n"), format!("{org}-a"), format!("{org}-b")]
    );
    assert!(page.has_more);

    let rest = store
        .fetch_page(&scope, PageRequest::new(3, 3).unwrap())
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert!(!rest.has_more);
}

#[tokio::test]
#[ignore]
async fn test_search_matches_name_case_insensitively() {
    let store = store().await;
    let org = org();
    store.insert(&contact(&org, "1", Some(1), "Joanna")).await.unwrap();
    store.insert(&contact(&org, "2", Some(2), "Bob")).await.unwrap();
    store.insert(&contact(&org, "3", Some(3), "100% Ann")).await.unwrap();

    let scope = ListScope::new(
        EntityKind::Contact,
        ListFilter::new().with_eq("org_id", org.as_str()).with_search("ANN"),
    );
    let page = store
        .fetch_page(&scope, PageRequest::new(0, 10).unwrap())
        .await
        .unwrap();
    assert_eq!(page.len(), 2);

    let literal = ListScope::new(
        EntityKind::Contact,
        ListFilter::new().with_eq("org_id", org.as_str()).with_search("0%"),
    );
    let page = store
        .fetch_page(&literal, PageRequest::new(0, 10).unwrap())
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
}

#[tokio::test]
#[ignore]
async fn test_provisional_insert_gets_server_id() {
    let store = store().await;
    let org = org();

    let draft = Record::new(
        EntityKind::Contact,
        crm_sync_client::remote::provisional_id(),
        None,
        json!({"org_id": org, "name": "Draft"}),
    );
    let stored = store.insert(&draft).await.unwrap();

    assert!(!crm_sync_client::remote::is_provisional(&stored.id));
    assert!(stored.sort_key.is_some());
}

#[tokio::test]
#[ignore]
async fn test_reconciler_follows_table_changes() {
    let store = store().await;
    let org = org();
    store.insert(&contact(&org, "1", Some(100), "Ann")).await.unwrap();

    let config = SyncConfig {
        debounce: Duration::from_millis(50),
        ..SyncConfig::default()
    };
    let scope = ListScope::new(EntityKind::Contact, ListFilter::new().with_eq("org_id", org.as_str()));
    let contacts = Reconciler::spawn(store.clone(), scope, config).unwrap();

    assert!(matches!(
        contacts.load_next_page().await.unwrap(),
        LoadOutcome::Merged(_)
    ));
    contacts
        .wait_for(|view| view.feed == FeedStatus::Live)
        .await
        .unwrap();

    store.insert(&contact(&org, "2", Some(200), "Bob")).await.unwrap();
    let expected = format!("{org}-2");
    let view = tokio::time::timeout(
        Duration::from_secs(5),
        contacts.wait_for(|view| view.list.get(&expected).is_some()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(view.records()[0].id, expected);

    // Moving out of the filter removes it from the list
    store
        .update_fields(EntityKind::Contact, &expected, &json!({"org_id": "elsewhere"}))
        .await
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        contacts.wait_for(|view| view.list.get(&expected).is_none()),
    )
    .await
    .unwrap()
    .unwrap();

    contacts.shutdown();
}

#[tokio::test]
#[ignore]
async fn test_gateway_round_trip() {
    let store = store().await;
    let org = org();
    store.insert(&contact(&org, "1", Some(100), "Ann")).await.unwrap();

    let scope = ListScope::new(EntityKind::Contact, ListFilter::new().with_eq("org_id", org.as_str()));
    let contacts = Reconciler::spawn(store.clone(), scope, SyncConfig::default()).unwrap();
    contacts.load_next_page().await.unwrap();

    let gateway = MutationGateway::new(contacts.clone(), store.clone());
    let id = format!("{org}-1");

    let updated = gateway
        .set_fields(&id, json!({"status": "client"}))
        .await
        .unwrap();
    assert_eq!(updated.fields["status"], "client");
    assert_eq!(updated.fields["name"], "Ann");

    gateway.remove(&id).await.unwrap();
    assert!(contacts.current().list.is_empty());

    // The row is gone, so a second delete is rejected
    assert!(gateway.remove(&id).await.is_err());

    contacts.shutdown();
}
