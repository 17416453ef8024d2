//! Edge case tests for crm-sync-engine
//!
//! These tests cover the worked scenarios and boundary conditions of list
//! reconciliation.

use crm_sync_engine::{
    CanonicalList, ChangeEvent, EntityKind, Error, EventBatch, ListFilter, LocalMutation, Page,
    PageRequest, Record,
};
use serde_json::json;

fn ids(list: &CanonicalList) -> Vec<&str> {
    list.records().iter().map(|r| r.id.as_str()).collect()
}

// ============================================================================
// Worked Scenarios
// ============================================================================

#[test]
fn realtime_insert_lands_at_head() {
    let mut list = CanonicalList::new(EntityKind::Contact);

    list.merge_page(Page {
        records: vec![
            Record::contact("1", 100, json!({"org_id": "A"})),
            Record::contact("2", 90, json!({"org_id": "A"})),
        ],
        has_more: false,
    })
    .unwrap();

    list.apply_event(ChangeEvent::inserted(Record::contact(
        "3",
        120,
        json!({"org_id": "A"}),
    )));

    assert_eq!(ids(&list), vec!["3", "1", "2"]);
}

#[test]
fn failed_status_move_rolls_back() {
    let mut list = CanonicalList::new(EntityKind::Contact);
    list.merge_page(Page {
        records: vec![Record::contact("1", 100, json!({"status": "lead"}))],
        has_more: false,
    })
    .unwrap();

    let snapshot = list
        .apply_local(LocalMutation::patch("1", json!({"status": "client"})))
        .unwrap();
    assert_eq!(list.get("1").unwrap().fields["status"], "client");

    // Remote write rejected
    list.restore(snapshot);

    assert_eq!(list.len(), 1);
    assert_eq!(list.get("1").unwrap().fields, json!({"status": "lead"}));
}

#[test]
fn same_message_over_two_channels_is_kept_once() {
    let mut list = CanonicalList::new(EntityKind::Message);

    list.apply_event(ChangeEvent::inserted(
        Record::message("5", 1000, json!({"content": "hello"})).with_secondary_key("wamid_99"),
    ));
    list.apply_event(ChangeEvent::inserted(
        Record::message("7", 1000, json!({"content": "hello"})).with_secondary_key("wamid_99"),
    ));

    assert_eq!(list.len(), 1);
    assert_eq!(list.get_by_secondary("wamid_99").unwrap().id, "5");
}

// ============================================================================
// Ordering Edge Cases
// ============================================================================

#[test]
fn equal_sort_keys_order_by_id() {
    let mut list = CanonicalList::new(EntityKind::Contact);
    list.merge_page(Page {
        records: vec![
            Record::contact("b", 100, json!({})),
            Record::contact("c", 100, json!({})),
        ],
        has_more: false,
    })
    .unwrap();

    // Realtime record with the same timestamp slots in by id
    list.apply_event(ChangeEvent::inserted(Record::contact("a", 100, json!({}))));
    assert_eq!(ids(&list), vec!["a", "b", "c"]);

    // Chat transcripts are the exact reverse
    let mut chat = CanonicalList::new(EntityKind::Message);
    for id in ["b", "a", "c"] {
        chat.apply_event(ChangeEvent::inserted(Record::message(id, 100, json!({}))));
    }
    assert_eq!(ids(&chat), vec!["c", "b", "a"]);
}

#[test]
fn unsent_message_sorts_last_in_transcript() {
    let mut chat = CanonicalList::new(EntityKind::Message);
    chat.merge_page(Page {
        records: vec![
            Record::message("m2", 200, json!({"content": "second"})),
            Record::message("m1", 100, json!({"content": "first"})),
        ],
        has_more: true,
    })
    .unwrap();

    let draft = Record::new(EntityKind::Message, "tmp", None, json!({"content": "sending"}));
    let _pending = chat.apply_local(LocalMutation::insert(draft)).unwrap();

    assert_eq!(ids(&chat), vec!["m1", "m2", "tmp"]);
}

#[test]
fn older_pages_extend_transcript_upwards() {
    let mut chat = CanonicalList::new(EntityKind::Message);
    chat.merge_page(Page {
        records: vec![
            Record::message("m4", 400, json!({})),
            Record::message("m3", 300, json!({})),
        ],
        has_more: true,
    })
    .unwrap();
    chat.merge_page(Page {
        records: vec![
            Record::message("m2", 200, json!({})),
            Record::message("m1", 100, json!({})),
        ],
        has_more: false,
    })
    .unwrap();

    assert_eq!(ids(&chat), vec!["m1", "m2", "m3", "m4"]);
    assert_eq!(chat.next_offset(), 4);
}

// ============================================================================
// Batching Edge Cases
// ============================================================================

#[test]
fn burst_of_events_applies_as_one_batch() {
    let mut list = CanonicalList::new(EntityKind::Contact);
    list.merge_page(Page::empty()).unwrap();

    let mut batch = EventBatch::new();
    for i in 0..100 {
        batch.push(ChangeEvent::inserted(Record::contact(
            format!("c{i}"),
            i,
            json!({"name": format!("Import {i}")}),
        )));
    }
    // Re-delivery inside the same burst
    batch.push(ChangeEvent::inserted(Record::contact("c5", 5, json!({}))));
    batch.push(ChangeEvent::deleted("c7"));

    assert_eq!(batch.received(), 102);
    assert_eq!(batch.len(), 100);

    let report = list.apply_batch(batch.drain());
    assert_eq!(report.inserted, 99);
    assert_eq!(report.ignored, 1);
    assert_eq!(list.len(), 99);
    assert_eq!(list.records()[0].id, "c99");
    assert!(!list.contains("c7"));
}

#[test]
fn deleted_record_is_not_revived_by_stale_page() {
    let mut list = CanonicalList::new(EntityKind::Contact);
    list.merge_page(Page {
        records: vec![Record::contact("1", 100, json!({}))],
        has_more: true,
    })
    .unwrap();

    list.begin_page(25).unwrap();
    list.apply_event(ChangeEvent::deleted("2"));

    // A page fetched before the delete still carries "2"
    list.merge_page(Page {
        records: vec![
            Record::contact("2", 90, json!({})),
            Record::contact("3", 80, json!({})),
        ],
        has_more: false,
    })
    .unwrap();

    assert_eq!(ids(&list), vec!["1", "3"]);
}

// ============================================================================
// Input Edge Cases
// ============================================================================

#[test]
fn zero_page_size_is_rejected() {
    let list = CanonicalList::new(EntityKind::Contact);
    assert!(matches!(
        list.next_page_request(0),
        Err(Error::InvalidPage(_))
    ));
    assert_eq!(
        list.next_page_request(25).unwrap(),
        PageRequest {
            offset: 0,
            page_size: 25
        }
    );
}

#[test]
fn events_of_other_kind_are_ignored() {
    let mut list = CanonicalList::new(EntityKind::Contact);
    list.merge_page(Page::empty()).unwrap();

    list.apply_event(ChangeEvent::inserted(Record::message("m", 1, json!({}))));
    assert!(list.is_empty());
}

#[test]
fn malformed_payload_is_ignored() {
    let mut list = CanonicalList::new(EntityKind::Contact);
    list.merge_page(Page::empty()).unwrap();

    list.apply_event(ChangeEvent::inserted(Record::contact("1", 1, json!("oops"))));
    assert!(list.is_empty());
}

#[test]
fn unicode_payloads_survive_merge() {
    let mut list = CanonicalList::new(EntityKind::Contact);
    let names = ["日本語テスト", "Привет мир", "🎉🚀💯", "Hello\nWorld\tTab"];

    list.merge_page(Page {
        records: names
            .iter()
            .enumerate()
            .map(|(i, name)| Record::contact(format!("c{i}"), 100 - i as i64, json!({"name": name})))
            .collect(),
        has_more: false,
    })
    .unwrap();

    for (i, name) in names.iter().enumerate() {
        assert_eq!(list.get(&format!("c{i}")).unwrap().fields["name"], *name);
    }
}

#[test]
fn filter_scopes_search_results() {
    let filter = ListFilter::new().with_eq("org_id", "A").with_search("ann");
    let ann = Record::contact("1", 1, json!({"org_id": "A", "name": "Joanna"}));
    let bob = Record::contact("2", 1, json!({"org_id": "A", "name": "Bob"}));
    let other_org = Record::contact("3", 1, json!({"org_id": "B", "name": "Anna"}));

    assert!(filter.matches(EntityKind::Contact, &ann));
    assert!(!filter.matches(EntityKind::Contact, &bob));
    assert!(!filter.matches(EntityKind::Contact, &other_org));
}
