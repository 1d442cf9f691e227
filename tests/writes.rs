//! Event creation, background propagation and fast reads

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use agenda_sync::{Cache, Event, EventTime, Provider, TimeWindow};
use agenda_sync::calendar::CalendarId;
use agenda_sync::config::SyncSettings;
use agenda_sync::item::SyncStatus;
use agenda_sync::mirror::{MirrorCalendar, MirrorObject, MirrorSnapshot, SnapshotMirror};
use agenda_sync::mock::MockRemote;
use agenda_sync::provider::CreateOutcome;
use agenda_sync::traits::LocalStore;

const WORK: &str = "https://mock.example.com/alice/work/";

fn settings() -> SyncSettings {
    SyncSettings {
        retry_base_delay_ms: 1,
        confirm_attempts: 3,
        confirm_delay_ms: 1,
        ..SyncSettings::default()
    }
}

fn dinner(uid: &str) -> Event {
    let start = EventTime::utc(Utc.with_ymd_and_hms(2026, 4, 10, 19, 0, 0).unwrap());
    let end = EventTime::utc(Utc.with_ymd_and_hms(2026, 4, 10, 21, 0, 0).unwrap());
    Event::with_uid(uid.to_string(), "Dinner".to_string(), start, end)
}

fn setup() -> (Provider<Cache, MockRemote>, CalendarId) {
    let remote = MockRemote::new();
    let work = remote.add_collection(WORK, "Work").unwrap();
    (Provider::new(remote, Cache::in_memory("alice"), settings()), work)
}


#[tokio::test]
async fn created_events_are_confirmed() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (provider, work) = setup();
    // Writes show up after one read
    provider.remote().delay_visibility(1).unwrap();

    let row = match provider.create_event(&work, dinner("dinner-1")).await.unwrap() {
        CreateOutcome::Confirmed { row, resource } => {
            assert_eq!(resource.href().as_str(), "https://mock.example.com/alice/work/dinner-1.ics");
            row
        },
        other => panic!("unexpected {:?}", other),
    };

    let local = provider.local().await;
    let stored = local.row(row).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Synced);
    assert_eq!(stored.event.title(), "Dinner");
    assert!(local.sync_record(row).await.unwrap().unwrap().remote_change_token.is_some());
}

#[tokio::test]
async fn slow_servers_only_accept_creations() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (provider, work) = setup();
    provider.remote().delay_visibility(10).unwrap();

    match provider.create_event(&work, dinner("dinner-2")).await.unwrap() {
        CreateOutcome::Accepted { uid, href } => {
            assert_eq!(uid, "dinner-2");
            assert!(href.as_str().ends_with("/dinner-2.ics"));
        },
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(provider.remote().fetch_count(), 3);
    assert_eq!(provider.remote().resource_count(&work).unwrap(), 1);
    assert!(provider.local().await.find_row(&work, "dinner-2").is_none());
}

#[tokio::test]
async fn retried_creations_do_not_duplicate_events() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (provider, work) = setup();
    provider.remote().lose_put_responses(1).unwrap();

    let outcome = provider.create_event(&work, dinner("dinner-3")).await.unwrap();
    assert!(matches!(outcome, CreateOutcome::Confirmed { .. }));
    assert_eq!(provider.remote().put_count(), 2);
    assert_eq!(provider.remote().resource_count(&work).unwrap(), 1);

    // A sync has nothing to do
    let report = provider.sync().await.unwrap();
    assert_eq!(report.fetches, 0);
    assert_eq!(report.pushed, 0);
}

#[tokio::test]
async fn edits_propagate_in_the_background() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (provider, work) = setup();
    let propagator = provider.propagator();

    let rows: Vec<_> = {
        let mut local = provider.local().await;
        (0..4).map(|i| local.create_local_event(&work, dinner(&format!("bg-{}", i))).unwrap()).collect()
    };
    for row in &rows {
        propagator.enqueue(*row).unwrap();
    }
    propagator.shutdown().await;

    assert_eq!(provider.remote().resource_count(&work).unwrap(), 4);
    assert!(provider.local().await.list_dirty_rows(&work).await.unwrap().is_empty());
}

#[tokio::test]
async fn reads_go_through_the_mirror() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (provider, work) = setup();
    let written = provider.remote().insert_event(&work, &dinner("dinner-4")).unwrap();
    let body = provider.remote().resource(written.href()).unwrap().unwrap().body;

    let start = Utc.with_ymd_and_hms(2026, 4, 10, 19, 0, 0).unwrap();
    let snapshot = MirrorSnapshot {
        calendars: vec![MirrorCalendar {
            id: 1,
            uri: "work".to_string(),
            displayname: Some("Work".to_string()),
            calendarcolor: Some("#ff0000".to_string()),
            synctoken: Some(12),
            components: Some("VEVENT".to_string()),
        }],
        objects: vec![MirrorObject {
            calendarid: 1,
            uri: "dinner-4.ics".to_string(),
            uid: "dinner-4".to_string(),
            etag: Some("abc".to_string()),
            componenttype: Some("VEVENT".to_string()),
            firstoccurence: Some(start.timestamp()),
            lastoccurence: Some((start + Duration::hours(2)).timestamp()),
            calendardata: body,
        }],
    };
    let mirror = SnapshotMirror::new("https://mock.example.com/alice/".parse().unwrap(), snapshot);
    let provider = provider.with_mirror(Arc::new(mirror));

    let april = TimeWindow::new(
        Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
    ).unwrap();
    let events = provider.events_in(&april).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, work);
    assert_eq!(events[0].1.uid(), "dinner-4");

    let may = TimeWindow::new(
        Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
    ).unwrap();
    assert!(provider.events_in(&may).await.unwrap().is_empty());

    // The server has not been asked anything
    assert_eq!(provider.remote().fetch_count(), 0);
}
