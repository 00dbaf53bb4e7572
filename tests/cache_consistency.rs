//! Cache behavior under reads, writes, and races: snapshot reuse, the
//! negative sentinel, coalesced refreshes, and two-phase invalidation.

mod support;

use std::time::Duration;

use futures::future::join_all;

use ateneo::application::repos::{RecordsRepo, UpsertEntry};
use ateneo::cache::CacheKey;
use ateneo::domain::records::{DomainRecord, HistoryRecord, SeatTimeslot};
use ateneo::domain::types::{Scope, Term};

use support::{harness, subject};

fn courses() -> Scope {
    Scope::Courses {
        year: 2025,
        term: Term::First,
    }
}

fn manual_seat() -> UpsertEntry {
    UpsertEntry {
        record: DomainRecord::Seat(SeatTimeslot {
            area: "East Wing".to_string(),
            floor: 3,
            seat_no: 41,
            date: "2025-03-02".to_string(),
            start: "09:00".to_string(),
            end: "11:00".to_string(),
        }),
        manual: true,
        note: Some("usual spot".to_string()),
        credit: None,
    }
}

#[tokio::test]
async fn second_read_is_answered_from_the_snapshot() {
    let h = harness().await;

    let first = h
        .records
        .get_records(&subject(), &courses(), false)
        .await
        .expect("first read refreshes");
    let second = h
        .records
        .get_records(&subject(), &courses(), false)
        .await
        .expect("second read hits the cache");

    assert_eq!(first, second);
    assert_eq!(h.portal.count("timetable"), 1);
    assert_eq!(h.portal.count("login_post"), 1);
}

#[tokio::test]
async fn confirmed_empty_scopes_do_not_hammer_the_portal() {
    let h = harness().await;

    let first = h
        .records
        .get_records(&subject(), &Scope::Seats, false)
        .await
        .expect("first read confirms the scope is empty");
    assert!(first.is_empty());

    let second = h
        .records
        .get_records(&subject(), &Scope::Seats, false)
        .await
        .expect("second read is answered by the sentinel");
    assert!(second.is_empty());

    // One portal round trip; the confirmed-empty answer was cached.
    assert_eq!(h.portal.count("seats.json"), 1);
}

#[tokio::test]
async fn racy_repopulation_is_wiped_by_the_trailing_delete() {
    let h = harness().await;
    let key = CacheKey::records(&subject(), &Scope::Seats);

    h.records
        .save(&subject(), &Scope::Seats, &[manual_seat()])
        .await
        .expect("manual save");
    assert_eq!(h.kv.get(key.as_str()).await.expect("kv read"), None);

    // A reader that loaded just before the save sneaks its stale
    // snapshot back in.
    h.kv.set(key.as_str(), "stale", Duration::from_secs(60))
        .await
        .expect("kv write");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.kv.get(key.as_str()).await.expect("kv read"), None);
}

#[tokio::test]
async fn concurrent_misses_collapse_into_one_fetch() {
    let h = harness().await;
    h.portal.set_fetch_latency(Duration::from_millis(100));

    let subj = subject();
    let scope = courses();
    let calls = (0..8).map(|_| h.records.get_records(&subj, &scope, false));
    let results = join_all(calls).await;

    for result in results {
        assert_eq!(result.expect("every caller gets the answer").len(), 2);
    }
    assert_eq!(h.portal.count("timetable"), 1);
    assert_eq!(h.portal.count("login_post"), 1);
}

#[tokio::test]
async fn miss_with_history_serves_stale_and_revalidates_behind() {
    let h = harness().await;

    let imported = UpsertEntry::scraped(DomainRecord::History(HistoryRecord {
        action: "imported".to_string(),
        target: "seat A-1".to_string(),
        occurred_at: "2024-11-30T08:00:00".to_string(),
    }));
    h.repo
        .replace_scope(&subject(), &Scope::History, &[imported])
        .await
        .expect("seed the store");

    let stale = h
        .records
        .get_records(&subject(), &Scope::History, false)
        .await
        .expect("persisted history answers the miss");
    assert_eq!(stale.len(), 1);
    match &stale[0] {
        DomainRecord::History(entry) => assert_eq!(entry.action, "imported"),
        other => panic!("expected a history record, got {other:?}"),
    }

    // The background refresh replaces the seed with the portal's two
    // entries and brings the snapshot up to date.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let fresh = h
        .records
        .get_records(&subject(), &Scope::History, false)
        .await
        .expect("refreshed snapshot");
    assert_eq!(fresh.len(), 2);
    assert_eq!(h.portal.count("history.json"), 1);
}
